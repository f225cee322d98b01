// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Scheduled work, produced by timers (and by handlers that need a
//! follow-up action) and drained by the driver at the end of each loop
//! iteration.

use std::{collections::VecDeque, net::SocketAddr};

use burrow_protocol::NodeId;

/// One unit of scheduled work.
#[derive(Clone, Debug)]
pub enum Event {
    /// Send a ping query. The node id is unknown for bootstrap addresses.
    PingNode {
        id: Option<NodeId>,
        addr: SocketAddr,
    },
    /// Walk the routing table and probe for fresher contacts.
    RefreshRoutes,
    /// Read the persisted bootstrap addresses and schedule pings for them.
    Bootstrap,
}

pub(crate) type EventQueue = VecDeque<Event>;
