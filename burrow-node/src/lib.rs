// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The Burrow node: a Kademlia-style DHT participant over UDP together with
//! a framed TCP endpoint for application messaging, driven by one
//! single-threaded event loop.

#[macro_use]
extern crate tracing;

pub mod error;
pub mod networking;

pub use error::{Error, Result};
