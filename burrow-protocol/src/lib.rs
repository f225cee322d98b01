// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Wire-level types shared by the Burrow node: the 160-bit node identifier
//! and its XOR metric, the KRPC message model with its bencode codec, and
//! the typed length-prefixed TCP framing.
//!
//! Nodes (DHT, UDP) are not peers (framed stream, TCP). Everything in this
//! crate is plain data: no sockets, no clocks, no tasks.

pub mod error;
pub mod krpc;
pub mod stream;

use std::{
    fmt::{self, Debug, Display},
    net::SocketAddr,
};

use rand::Rng;

pub use error::{Error, Result};

/// Number of bytes in a node id.
pub const NODE_ID_LEN: usize = 20;

/// Size of the id space in bits, i.e. the number of routing buckets.
pub const NODE_ID_BITS: usize = 8 * NODE_ID_LEN;

/// Bucket capacity ("k" in the Kademlia paper).
pub const K_VALUE: usize = 8;

/// A 160-bit DHT node identifier.
///
/// Stored as a byte array, so unaffected by host endianness. Ids are
/// self-assigned at startup and live only for the process lifetime.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    pub const fn new(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh random id from the thread rng.
    pub fn random() -> Self {
        Self(rand::thread_rng().gen())
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; NODE_ID_LEN] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    /// XOR distance to another id.
    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut bytes = [0u8; NODE_ID_LEN];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = self.0[i] ^ other.0[i];
        }
        Distance(bytes)
    }

    /// Index of the routing bucket `other` falls into relative to `self`:
    /// the position of the highest-order differing bit, so that the distance
    /// lies in `[2^i, 2^{i+1})`. `None` when the ids are equal.
    pub fn bucket_index(&self, other: &NodeId) -> Option<usize> {
        let zeros = self.distance(other).leading_zeros() as usize;
        if zeros == NODE_ID_BITS {
            None
        } else {
            Some(NODE_ID_BITS - 1 - zeros)
        }
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Full ids drown the logs; the leading bytes identify a node well enough.
        write!(f, "NodeId({}..)", hex::encode(&self.0[..4]))
    }
}

/// XOR distance between two node ids. Compares as a 160-bit big-endian
/// unsigned integer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Distance(pub [u8; NODE_ID_LEN]);

impl Distance {
    pub fn leading_zeros(&self) -> u32 {
        let mut zeros = 0;
        for byte in &self.0 {
            if *byte == 0 {
                zeros += 8;
            } else {
                zeros += byte.leading_zeros();
                break;
            }
        }
        zeros
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

/// Contact information for a DHT node.
///
/// On the wire the address travels as two byte strings, a numeric host and a
/// decimal port, per the flat node-info encoding in [`krpc`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct NodeInfo {
    pub id: NodeId,
    pub addr: SocketAddr,
}

impl NodeInfo {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self { id, addr }
    }
}

impl Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}@{}", self.id, self.addr)
    }
}
