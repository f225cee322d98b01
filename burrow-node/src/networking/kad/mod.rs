// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The DHT side of the node: the k-bucket routing table and the KRPC
//! request/response machinery on top of it.

pub mod kbucket;
pub mod rpc;

pub use kbucket::{InsertOutcome, RoutingTable, UpdateOutcome};
pub use rpc::{HandleOutcome, OutstandingQuery, RpcContext};
