// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! K-bucket routing table.
//!
//! One bucket per bit of the id space, holding up to [`K_VALUE`] nodes whose
//! XOR distance to the local id falls in `[2^i, 2^{i+1})`. Buckets are
//! ordered least-recently seen at the front, most-recently seen at the
//! back; a node heard from again moves to the back.
//!
//! When a message arrives from an unknown node whose bucket is full, the
//! front node is pinged: if it answers it moves to the back (through the
//! ordinary update path) and the newcomer is discarded; only a node known to
//! be gone is removed. No bucket is mutated before that outcome is known.

use std::{
    collections::VecDeque,
    net::SocketAddr,
    time::Instant,
};

use burrow_protocol::{NodeId, NodeInfo, K_VALUE, NODE_ID_BITS};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("routing table operations exclude the local node id")]
pub struct SelfEntry;

/// A routed node together with when we last heard from it.
#[derive(Clone, Debug)]
pub struct BucketEntry {
    pub info: NodeInfo,
    pub last_seen: Instant,
}

#[derive(Debug, Default)]
struct Bucket {
    entries: VecDeque<BucketEntry>,
}

impl Bucket {
    fn position(&self, id: &NodeId) -> Option<usize> {
        self.entries.iter().position(|entry| entry.info.id == *id)
    }
}

/// Outcome of [`RoutingTable::update`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum UpdateOutcome {
    /// The node was known; it moved to the most-recently-seen position.
    Updated,
    /// The node is new; the caller decides whether to insert it.
    NeedsInsert,
}

/// Outcome of [`RoutingTable::insert`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InsertOutcome {
    Inserted,
    Full,
}

pub struct RoutingTable {
    self_id: NodeId,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(self_id: NodeId) -> Self {
        Self {
            self_id,
            buckets: (0..NODE_ID_BITS).map(|_| Bucket::default()).collect(),
        }
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|bucket| bucket.entries.is_empty())
    }

    fn bucket_of(&self, id: &NodeId) -> Result<usize, SelfEntry> {
        self.self_id.bucket_index(id).ok_or(SelfEntry)
    }

    /// Refresh a node we just heard from.
    ///
    /// A known node moves to the back of its bucket with a fresh last-seen
    /// stamp (and its address refreshed, should it have moved). An unknown
    /// node is left to the caller: `can_insert` then `insert`.
    pub fn update(&mut self, info: &NodeInfo) -> Result<UpdateOutcome, SelfEntry> {
        let index = self.bucket_of(&info.id)?;
        let bucket = &mut self.buckets[index];

        match bucket.position(&info.id) {
            Some(position) => {
                if let Some(mut entry) = bucket.entries.remove(position) {
                    entry.info = *info;
                    entry.last_seen = Instant::now();
                    bucket.entries.push_back(entry);
                }
                Ok(UpdateOutcome::Updated)
            }
            None => Ok(UpdateOutcome::NeedsInsert),
        }
    }

    /// `None` when the destination bucket has room; otherwise the
    /// least-recently-seen node, which the caller is expected to ping to
    /// decide eviction.
    pub fn can_insert(&self, id: &NodeId) -> Result<Option<NodeInfo>, SelfEntry> {
        let index = self.bucket_of(id)?;
        let bucket = &self.buckets[index];
        if bucket.entries.len() < K_VALUE {
            Ok(None)
        } else {
            Ok(bucket.entries.front().map(|entry| entry.info))
        }
    }

    /// Append a new node at the most-recently-seen position.
    pub fn insert(&mut self, info: NodeInfo) -> Result<InsertOutcome, SelfEntry> {
        let index = self.bucket_of(&info.id)?;

        if self.buckets[index].position(&info.id).is_some() {
            // no duplicates: a known id is a refresh, not a second entry
            let outcome = self.update(&info)?;
            debug_assert_eq!(outcome, UpdateOutcome::Updated);
            return Ok(InsertOutcome::Inserted);
        }
        let bucket = &mut self.buckets[index];
        if bucket.entries.len() >= K_VALUE {
            return Ok(InsertOutcome::Full);
        }
        bucket.entries.push_back(BucketEntry {
            info,
            last_seen: Instant::now(),
        });
        Ok(InsertOutcome::Inserted)
    }

    pub fn remove(&mut self, id: &NodeId) -> Result<bool, SelfEntry> {
        let index = self.bucket_of(id)?;
        let bucket = &mut self.buckets[index];
        match bucket.position(id) {
            Some(position) => {
                bucket.entries.remove(position);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// The `n` known nodes closest to `target` by XOR distance.
    pub fn closest(&self, target: &NodeId, n: usize) -> Vec<NodeInfo> {
        let mut nodes: Vec<NodeInfo> = self
            .buckets
            .iter()
            .flat_map(|bucket| bucket.entries.iter())
            .map(|entry| entry.info)
            .collect();
        nodes.sort_by(|a, b| target.distance(&a.id).cmp(&target.distance(&b.id)));
        nodes.truncate(n);
        nodes
    }

    /// Every routed address, front-to-back per bucket. Used to persist
    /// `nodes.dat` at shutdown.
    pub fn node_addrs(&self) -> Vec<SocketAddr> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.entries.iter())
            .map(|entry| entry.info.addr)
            .collect()
    }

    /// Node infos of one bucket in least-recently-seen-first order.
    pub fn bucket_nodes(&self, index: usize) -> Vec<NodeInfo> {
        self.buckets
            .get(index)
            .map(|bucket| bucket.entries.iter().map(|entry| entry.info).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_protocol::NODE_ID_LEN;

    fn id_with_last(last: u8) -> NodeId {
        let mut bytes = [0u8; NODE_ID_LEN];
        bytes[NODE_ID_LEN - 1] = last;
        NodeId::new(bytes)
    }

    fn node(last: u8) -> NodeInfo {
        NodeInfo::new(
            id_with_last(last),
            format!("10.0.0.{last}:6881").parse().unwrap(),
        )
    }

    fn origin_table() -> RoutingTable {
        RoutingTable::new(NodeId::new([0u8; NODE_ID_LEN]))
    }

    /// Eight ids all landing in bucket 4 of the origin table (distance in
    /// `[16, 32)`), plus a ninth.
    fn bucket4_nodes() -> Vec<NodeInfo> {
        (16..=24).map(node).collect()
    }

    #[test]
    fn new_nodes_need_an_insert_and_land_at_the_tail() {
        let mut table = origin_table();
        let n1 = node(16);

        assert_eq!(table.update(&n1), Ok(UpdateOutcome::NeedsInsert));
        assert_eq!(table.can_insert(&n1.id), Ok(None));
        assert_eq!(table.insert(n1), Ok(InsertOutcome::Inserted));

        let n2 = node(17);
        assert_eq!(table.insert(n2), Ok(InsertOutcome::Inserted));
        assert_eq!(table.bucket_nodes(4), vec![n1, n2]);
    }

    #[test]
    fn update_moves_a_known_node_to_the_tail() {
        let mut table = origin_table();
        let nodes = &bucket4_nodes()[..8];
        for info in nodes {
            table.insert(*info).unwrap();
        }

        // hearing from n3 reorders to n1,n2,n4..n8,n3
        assert_eq!(table.update(&nodes[2]), Ok(UpdateOutcome::Updated));
        let mut expected: Vec<NodeInfo> = nodes.to_vec();
        let n3 = expected.remove(2);
        expected.push(n3);
        assert_eq!(table.bucket_nodes(4), expected);
    }

    #[test]
    fn full_bucket_names_the_least_recently_seen_node() {
        let mut table = origin_table();
        let nodes = bucket4_nodes();
        for info in &nodes[..8] {
            table.insert(*info).unwrap();
        }

        let n9 = nodes[8];
        assert_eq!(table.update(&n9), Ok(UpdateOutcome::NeedsInsert));
        // the head (n1) is the eviction candidate; nothing mutated yet
        assert_eq!(table.can_insert(&n9.id), Ok(Some(nodes[0])));
        assert_eq!(table.insert(n9), Ok(InsertOutcome::Full));
        assert_eq!(table.bucket_nodes(4), nodes[..8].to_vec());
    }

    #[test]
    fn eviction_then_insert_appends_the_newcomer() {
        let mut table = origin_table();
        let nodes = bucket4_nodes();
        for info in &nodes[..8] {
            table.insert(*info).unwrap();
        }

        assert_eq!(table.remove(&nodes[0].id), Ok(true));
        assert_eq!(table.insert(nodes[8]), Ok(InsertOutcome::Inserted));

        let mut expected = nodes[1..8].to_vec();
        expected.push(nodes[8]);
        assert_eq!(table.bucket_nodes(4), expected);
    }

    #[test]
    fn update_refreshes_a_changed_address() {
        let mut table = origin_table();
        let mut n1 = node(16);
        table.insert(n1).unwrap();

        n1.addr = "10.0.9.9:7000".parse().unwrap();
        assert_eq!(table.update(&n1), Ok(UpdateOutcome::Updated));
        assert_eq!(table.bucket_nodes(4)[0].addr, n1.addr);
    }

    #[test]
    fn the_local_id_is_rejected() {
        let mut table = origin_table();
        let own = NodeInfo::new(table.self_id(), "127.0.0.1:1".parse().unwrap());
        assert_eq!(table.update(&own), Err(SelfEntry));
        assert_eq!(table.insert(own), Err(SelfEntry));
        assert_eq!(table.can_insert(&own.id), Err(SelfEntry));
    }

    #[test]
    fn bucket_members_share_their_bucket_index() {
        let mut table = origin_table();
        for last in [1u8, 2, 3, 16, 17, 0x80] {
            table.insert(node(last)).unwrap();
        }
        for index in 0..NODE_ID_BITS {
            for info in table.bucket_nodes(index) {
                assert_eq!(table.self_id().bucket_index(&info.id), Some(index));
            }
        }
    }

    #[test]
    fn closest_sorts_by_distance_to_the_target() {
        let mut table = origin_table();
        for last in [1u8, 2, 4, 8] {
            table.insert(node(last)).unwrap();
        }

        let closest = table.closest(&id_with_last(3), 2);
        assert_eq!(closest.len(), 2);
        assert_eq!(closest[0].id, id_with_last(2)); // distance 1
        assert_eq!(closest[1].id, id_with_last(1)); // distance 2
    }

    #[test]
    fn closest_is_capped_at_the_requested_count() {
        let mut table = origin_table();
        for info in &bucket4_nodes()[..8] {
            table.insert(*info).unwrap();
        }
        assert_eq!(table.closest(&id_with_last(1), K_VALUE).len(), 8);
        assert_eq!(table.closest(&id_with_last(1), 3).len(), 3);
    }
}
