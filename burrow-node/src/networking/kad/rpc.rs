// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! KRPC request/response handling.
//!
//! The [`RpcContext`] owns the routing table and the set of queries we have
//! sent and not yet heard back about. Incoming datagrams flow through
//! [`RpcContext::handle`]; outgoing queries are minted by the `query_*`
//! methods, which register the outstanding entry the response will be
//! matched against.

use std::{
    collections::HashMap,
    net::SocketAddr,
    time::Instant,
};

use burrow_protocol::{
    krpc::{
        code, KrpcError, KrpcMessage, KrpcMethod, Query, QueryMethod, Response, TxId,
    },
    NodeId, NodeInfo, K_VALUE,
};

use super::kbucket::{RoutingTable, UpdateOutcome};
use crate::error::Result;

/// A query sent and awaiting its response, keyed by transaction id.
///
/// Bootstrap pings go to an address before we know the node behind it, so
/// the id is optional.
#[derive(Clone, Debug)]
pub struct OutstandingQuery {
    pub tx_id: TxId,
    pub id: Option<NodeId>,
    pub addr: SocketAddr,
    pub method: KrpcMethod,
    pub sent_at: Instant,
}

/// What [`RpcContext::handle`] asks of the caller.
#[derive(Debug, Default)]
pub struct HandleOutcome {
    /// Datagram to send back to the source, if any.
    pub reply: Option<Vec<u8>>,
    /// Least-recently-seen node of a full bucket, to be pinged so its
    /// eviction can be decided. The newcomer is not stored.
    pub evict_check: Option<NodeInfo>,
}

pub struct RpcContext {
    table: RoutingTable,
    outstanding: HashMap<TxId, OutstandingQuery>,
}

impl RpcContext {
    pub fn new(self_id: NodeId) -> Self {
        debug!("DHT initialized with node_id={self_id}.");
        Self {
            table: RoutingTable::new(self_id),
            outstanding: HashMap::new(),
        }
    }

    pub fn self_id(&self) -> NodeId {
        self.table.self_id()
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    #[cfg(test)]
    pub(crate) fn table_mut(&mut self) -> &mut RoutingTable {
        &mut self.table
    }

    pub fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }

    /// The `n` known nodes closest to `target`.
    pub fn closest_nodes(&self, target: &NodeId, n: usize) -> Vec<NodeInfo> {
        self.table.closest(target, n)
    }

    /// Process one incoming datagram.
    ///
    /// Malformed input is answered with a KRPC error (code 203), echoing the
    /// sender's transaction id when one could be recovered. Well-formed
    /// messages first refresh the routing table for their sender, then
    /// dispatch on the message type. `Err` is reserved for internal
    /// failures; per-datagram problems never kill the loop.
    pub fn handle(&mut self, datagram: &[u8], src: SocketAddr) -> Result<HandleOutcome> {
        let msg = match KrpcMessage::decode(datagram) {
            Ok(msg) => msg,
            Err(err) => {
                warn!("Invalid message from {src}: {err}");
                let tx_id = err
                    .tx_id
                    .filter(|tx| !tx.is_none())
                    .unwrap_or_else(TxId::random);
                let reply = KrpcMessage::Error(KrpcError {
                    tx_id,
                    code: code::PROTOCOL,
                    message: "Protocol Error".to_string(),
                })
                .encode()?;
                return Ok(HandleOutcome {
                    reply: Some(reply),
                    evict_check: None,
                });
            }
        };

        // any message refreshes the sender's bucket
        let evict_check = match msg.node_id() {
            Some(id) => self.touch_sender(NodeInfo::new(id, src)),
            None => None,
        };

        let reply = match msg {
            KrpcMessage::Query(query) => Some(self.handle_query(&query, src)?),
            KrpcMessage::Response(response) => {
                self.handle_response(&response, src);
                None
            }
            KrpcMessage::Error(err) => {
                warn!(
                    "Got error message from {src}: {} {:?} (tx {}).",
                    err.code, err.message, err.tx_id
                );
                None
            }
        };

        Ok(HandleOutcome { reply, evict_check })
    }

    fn handle_query(&self, query: &Query, src: SocketAddr) -> Result<Vec<u8>> {
        debug!(
            "Got {} query from {src} (tx {}).",
            query.method.method(),
            query.tx_id
        );
        let response = match query.method {
            QueryMethod::Ping => Response {
                tx_id: query.tx_id,
                node_id: self.self_id(),
                nodes: vec![],
            },
            QueryMethod::FindNode { target } => Response {
                tx_id: query.tx_id,
                node_id: self.self_id(),
                nodes: self.table.closest(&target, K_VALUE),
            },
        };
        Ok(KrpcMessage::Response(response).encode()?)
    }

    fn handle_response(&mut self, response: &Response, src: SocketAddr) {
        match self.outstanding.remove(&response.tx_id) {
            Some(query) => {
                debug!(
                    "Got {} response from {src} (tx {}), node {} alive.",
                    query.method, response.tx_id, response.node_id
                );
            }
            None => {
                debug!(
                    "Dropping response from {src} with unknown tx {}.",
                    response.tx_id
                );
            }
        }
    }

    /// Routing-table upkeep for a node we just heard from. Returns the
    /// stale head of a full bucket, if the sender could not be stored.
    fn touch_sender(&mut self, info: NodeInfo) -> Option<NodeInfo> {
        let Ok(outcome) = self.table.update(&info) else {
            debug!("Ignoring message carrying our own node id.");
            return None;
        };
        if outcome == UpdateOutcome::Updated {
            return None;
        }

        // update() succeeded above, so these cannot see the local id
        match self.table.can_insert(&info.id) {
            Ok(None) => {
                let _ = self.table.insert(info);
                None
            }
            Ok(Some(stale)) => {
                debug!("Bucket full for {info}; probing stale head {stale}.");
                Some(stale)
            }
            Err(_) => None,
        }
    }

    /// Build a ping query for `addr` and register it as outstanding.
    pub fn query_ping(&mut self, id: Option<NodeId>, addr: SocketAddr) -> Result<(TxId, Vec<u8>)> {
        self.make_query(id, addr, QueryMethod::Ping)
    }

    /// Build a find_node query for `addr` and register it as outstanding.
    pub fn query_find_node(
        &mut self,
        id: Option<NodeId>,
        addr: SocketAddr,
        target: NodeId,
    ) -> Result<(TxId, Vec<u8>)> {
        self.make_query(id, addr, QueryMethod::FindNode { target })
    }

    /// Drop an outstanding query whose datagram never left the socket.
    pub fn cancel_query(&mut self, tx_id: &TxId) {
        if self.outstanding.remove(tx_id).is_some() {
            debug!("Query (tx {tx_id}) cancelled.");
        }
    }

    fn make_query(
        &mut self,
        id: Option<NodeId>,
        addr: SocketAddr,
        method: QueryMethod,
    ) -> Result<(TxId, Vec<u8>)> {
        let tx_id = self.fresh_tx_id();
        let datagram = KrpcMessage::Query(Query {
            tx_id,
            node_id: self.self_id(),
            method,
        })
        .encode()?;

        self.outstanding.insert(
            tx_id,
            OutstandingQuery {
                tx_id,
                id,
                addr,
                method: method.method(),
                sent_at: Instant::now(),
            },
        );
        debug!("Query (tx {tx_id}) saved.");
        Ok((tx_id, datagram))
    }

    /// A random tx id not colliding with any outstanding query.
    fn fresh_tx_id(&self) -> TxId {
        loop {
            let tx_id = TxId::random();
            if !self.outstanding.contains_key(&tx_id) {
                return tx_id;
            }
        }
    }
}
