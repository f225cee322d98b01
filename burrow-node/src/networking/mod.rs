// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Networking internals of the node.
//!
//! One driver task owns everything here: the UDP control plane feeds the
//! [`kad`] RPC context, accepted TCP peers live in [`peers`], and scheduled
//! work flows from [`timers`] through the [`event`] queue back into outbound
//! datagrams.

pub mod driver;
pub mod event;
pub mod kad;
pub mod peers;
pub mod timers;

/// Number of nodes a refresh round queries.
pub(crate) const ALPHA: usize = 3;

pub use driver::{Driver, DriverConfig};
pub use event::Event;
