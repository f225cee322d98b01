// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The event loop.
//!
//! One task owns every mutable piece of the node and multiplexes, in
//! priority order: the SIGINT signal, the UDP control socket, the TCP
//! listener, every accepted peer, and the timer deadline. After the ready
//! source is serviced, due timers fire into the event queue and the queue
//! is drained, so within one iteration the ordering is always
//! source -> timers -> events.
//!
//! Per-datagram and per-peer failures are recovered locally. Anything that
//! breaks a shared invariant (an unknown peer key turning up ready, a
//! bootstrap file that exists but cannot be parsed) ends the loop.

use std::{
    io,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    time::{Duration, Instant},
};

use burrow_bootstrap::BootstrapStore;
use burrow_protocol::{
    krpc::{MAX_UDP_PAYLOAD, TxId},
    stream::FrameKind,
    NodeId,
};
use bytes::Bytes;
use futures::FutureExt;
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream, UdpSocket},
    time::{sleep_until, Instant as TokioInstant},
};

use super::{
    event::{Event, EventQueue},
    kad::rpc::RpcContext,
    peers::{PeerRegistry, REJECT_BANNER},
    timers::{clock_res_is_millis, TimerList},
    ALPHA,
};
use crate::error::{Error, Result};

/// Period of the routing-table refresh timer.
pub const ROUTE_REFRESH_INTERVAL: Duration = Duration::from_secs(300);

/// Wait deadline used when no timer is armed.
const IDLE_TIMEOUT: Duration = Duration::from_secs(3600);

const PARSE_ERROR_NOTICE: &[u8] = b"Could not parse chunk.";

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub conf_dir: PathBuf,
    pub bind_addr: IpAddr,
    pub bind_port: u16,
    pub max_peers: usize,
}

pub struct Driver {
    udp: UdpSocket,
    listener: TcpListener,
    rpc: RpcContext,
    peers: PeerRegistry,
    timers: TimerList,
    events: EventQueue,
    bootstrap: BootstrapStore,
    udp_buf: Vec<u8>,
}

impl Driver {
    /// Bind both sockets and arm the startup timers.
    ///
    /// Fails when either socket cannot bind or the platform clock is too
    /// coarse for the timer wheel.
    pub async fn new(config: DriverConfig) -> Result<Self> {
        if !clock_res_is_millis() {
            error!("Time resolution is greater than millisecond. Aborting.");
            return Err(Error::ClockResolution);
        }

        let bind = SocketAddr::new(config.bind_addr, config.bind_port);
        let listener = TcpListener::bind(bind).await?;
        // both planes share one port, whichever the listener actually got
        let udp = UdpSocket::bind(SocketAddr::new(
            config.bind_addr,
            listener.local_addr()?.port(),
        ))
        .await?;
        info!(
            "Server started. Listening on [{}]:{} tcp and udp.",
            config.bind_addr,
            listener.local_addr()?.port()
        );

        let rpc = RpcContext::new(NodeId::random());
        info!("Own node id {}.", rpc.self_id());

        let mut timers = TimerList::new();
        timers.schedule_periodic("route-refresh", ROUTE_REFRESH_INTERVAL, Event::RefreshRoutes);
        timers.schedule_once("bootstrap", Duration::ZERO, Event::Bootstrap);

        Ok(Self {
            udp,
            listener,
            rpc,
            peers: PeerRegistry::new(config.max_peers),
            timers,
            events: EventQueue::new(),
            bootstrap: BootstrapStore::new(config.conf_dir),
            udp_buf: vec![0u8; MAX_UDP_PAYLOAD],
        })
    }

    pub fn self_id(&self) -> NodeId {
        self.rpc.self_id()
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.udp.local_addr()?)
    }

    /// Run until SIGINT or a fatal error. Cleanup happens on both paths.
    pub async fn run(&mut self) -> Result<()> {
        let result = self.run_loop().await;
        self.shutdown();
        result
    }

    async fn run_loop(&mut self) -> Result<()> {
        loop {
            let deadline = self
                .timers
                .soonest()
                .unwrap_or_else(|| Instant::now() + IDLE_TIMEOUT);

            tokio::select! {
                biased;

                res = tokio::signal::ctrl_c() => {
                    match res {
                        Ok(()) => info!("Caught SIGINT. Shutting down."),
                        Err(err) => error!("Failed to listen for SIGINT: {err}. Shutting down."),
                    }
                    break;
                }
                res = self.udp.recv_from(&mut self.udp_buf) => {
                    self.on_datagram(res).await?;
                }
                res = self.listener.accept() => {
                    self.on_accepted(res).await?;
                }
                Some((key, chunk)) = self.peers.next_chunk(), if !self.peers.is_empty() => {
                    self.on_peer_chunk(key, chunk).await?;
                }
                () = sleep_until(TokioInstant::from_std(deadline)) => {}
            }

            for event in self.timers.fire_due(Instant::now()) {
                self.events.push_back(event);
            }
            while let Some(event) = self.events.pop_front() {
                self.on_event(event).await?;
            }
        }
        Ok(())
    }

    /// One UDP datagram: decode, handle, send back whatever the RPC layer
    /// produced. Transient socket errors never end the loop.
    async fn on_datagram(&mut self, res: io::Result<(usize, SocketAddr)>) -> Result<()> {
        let (len, src) = match res {
            Ok(received) => received,
            Err(err) => {
                warn!("Failed recv: {err}");
                return Ok(());
            }
        };
        debug!("Received {len} bytes from {src}.");

        let outcome = self.rpc.handle(&self.udp_buf[..len], src)?;
        if let Some(reply) = outcome.reply {
            if reply.len() > MAX_UDP_PAYLOAD {
                error!("Response too long. Not responding.");
            } else {
                match self.udp.send_to(&reply, src).await {
                    Ok(sent) => debug!("Sent {sent} bytes to {src}."),
                    Err(err) => warn!("Failed sendto: {err}"),
                }
            }
        }
        if let Some(stale) = outcome.evict_check {
            self.events.push_back(Event::PingNode {
                id: Some(stale.id),
                addr: stale.addr,
            });
        }
        Ok(())
    }

    /// Drain every connection the listener has ready.
    async fn on_accepted(&mut self, res: io::Result<(TcpStream, SocketAddr)>) -> Result<()> {
        let (stream, addr) = res.inspect_err(|err| error!("Failed accept: {err}"))?;
        self.admit_peer(stream, addr).await;

        loop {
            let Some(next) = self.listener.accept().now_or_never() else {
                break;
            };
            let (stream, addr) = next.inspect_err(|err| error!("Failed accept: {err}"))?;
            self.admit_peer(stream, addr).await;
        }
        Ok(())
    }

    async fn admit_peer(&mut self, mut stream: TcpStream, addr: SocketAddr) {
        debug!("Incoming connection...");
        if self.peers.is_full() {
            error!(
                "Can't accept new connections: maximum number of peers reached ({}).",
                self.peers.len()
            );
            let _ = stream.write_all(REJECT_BANNER).await;
            let _ = stream.shutdown().await;
            return;
        }
        self.peers.register(stream, addr);
        info!("Accepted connection from peer {addr}.");
    }

    /// One chunk from a connected peer, fed through its frame parser.
    async fn on_peer_chunk(&mut self, key: u64, chunk: io::Result<Bytes>) -> Result<()> {
        let peer_addr = self
            .peers
            .get_mut(key)
            .ok_or(Error::UnknownPeer(key))?
            .addr;

        let chunk = match chunk {
            Ok(chunk) if chunk.is_empty() => {
                info!("Peer {peer_addr} closed connection.");
                self.close_peer(key);
                return Ok(());
            }
            Ok(chunk) => chunk,
            Err(err) => {
                warn!("Failed recv from peer {peer_addr}: {err}");
                self.close_peer(key);
                return Ok(());
            }
        };
        debug!("Received {} bytes from peer {peer_addr}.", chunk.len());

        let peer = self.peers.get_mut(key).ok_or(Error::UnknownPeer(key))?;
        match peer.parser.feed(&chunk) {
            Ok(frames) => {
                for frame in frames {
                    // application dispatch hangs off here
                    info!(
                        "Got {:?} msg ({} bytes) from peer {peer_addr}.",
                        frame.kind,
                        frame.payload.len()
                    );
                }
            }
            Err(err) => {
                error!("Parsing error from peer {peer_addr}: {err}");
                match peer.send_frame(FrameKind::Error, PARSE_ERROR_NOTICE).await {
                    Ok(()) => info!("Notified peer {peer_addr} of error state."),
                    Err(err) => warn!("Failed to notify peer {peer_addr} of error state: {err}"),
                }
                self.close_peer(key);
            }
        }
        Ok(())
    }

    fn close_peer(&mut self, key: u64) {
        if let Some(peer) = self.peers.unregister(key) {
            info!("Closing connection with peer {}.", peer.addr);
        }
    }

    async fn on_event(&mut self, event: Event) -> Result<()> {
        match event {
            Event::PingNode { id, addr } => self.ping_node(id, addr).await,
            Event::RefreshRoutes => self.refresh_routes().await,
            Event::Bootstrap => self.bootstrap_from_store(),
        }
    }

    async fn ping_node(&mut self, id: Option<NodeId>, addr: SocketAddr) -> Result<()> {
        info!("Kad pinging {addr}.");
        let (tx_id, datagram) = self.rpc.query_ping(id, addr)?;
        self.send_query(tx_id, datagram, addr).await;
        Ok(())
    }

    /// Probe the neighbourhood of a random target to keep buckets fresh.
    async fn refresh_routes(&mut self) -> Result<()> {
        if self.rpc.table().is_empty() {
            debug!("Routing table empty, nothing to refresh.");
            return Ok(());
        }
        let target = NodeId::random();
        for node in self.rpc.closest_nodes(&target, ALPHA) {
            let (tx_id, datagram) = self.rpc.query_find_node(Some(node.id), node.addr, target)?;
            self.send_query(tx_id, datagram, node.addr).await;
        }
        Ok(())
    }

    /// An undeliverable query is unregistered again: a response can never
    /// arrive for a datagram that never left.
    async fn send_query(&mut self, tx_id: TxId, datagram: Vec<u8>, addr: SocketAddr) {
        match self.udp.send_to(&datagram, addr).await {
            Ok(sent) => debug!("Sent {sent} bytes to {addr}."),
            Err(err) => {
                warn!("Failed sendto {addr}: {err}");
                self.rpc.cancel_query(&tx_id);
            }
        }
    }

    fn bootstrap_from_store(&mut self) -> Result<()> {
        let addrs = match self.bootstrap.load() {
            Ok(addrs) => addrs,
            Err(err) => {
                error!("Failed to read bootstrap nodes.");
                return Err(err.into());
            }
        };
        info!("{} bootstrap nodes read.", addrs.len());
        if addrs.is_empty() {
            warn!("No bootstrap nodes read.");
        }
        for addr in addrs {
            self.events.push_back(Event::PingNode { id: None, addr });
        }
        Ok(())
    }

    /// Close every peer and persist the routing table addresses for the
    /// next run.
    fn shutdown(&mut self) {
        self.peers.unregister_all();
        let addrs = self.rpc.table().node_addrs();
        if let Err(err) = self.bootstrap.save(&addrs) {
            warn!("Failed to persist bootstrap nodes: {err}");
        }
        info!("Server stopped.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_protocol::{
        krpc::{KrpcMessage, Query, QueryMethod, Response, TxId},
        NodeInfo, NODE_ID_LEN,
    };
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn test_config(conf_dir: PathBuf) -> DriverConfig {
        DriverConfig {
            conf_dir,
            bind_addr: "127.0.0.1".parse().unwrap(),
            bind_port: 0,
            max_peers: 2,
        }
    }

    async fn test_driver(conf_dir: &TempDir) -> Driver {
        Driver::new(test_config(conf_dir.path().to_path_buf()))
            .await
            .unwrap()
    }

    fn id_with_last(last: u8) -> NodeId {
        let mut bytes = [0u8; NODE_ID_LEN];
        bytes[NODE_ID_LEN - 1] = last;
        NodeId::new(bytes)
    }

    /// Stuff a datagram into the receive buffer, as the ready socket would.
    fn prime_udp_buf(driver: &mut Driver, datagram: &[u8]) -> usize {
        driver.udp_buf[..datagram.len()].copy_from_slice(datagram);
        datagram.len()
    }

    #[tokio::test]
    async fn ping_query_is_answered_and_routed() {
        let dir = TempDir::new().unwrap();
        let mut driver = test_driver(&dir).await;

        let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let remote_addr = remote.local_addr().unwrap();
        let query = KrpcMessage::Query(Query {
            tx_id: TxId::new([0xaa, 0xbb]),
            node_id: id_with_last(1),
            method: QueryMethod::Ping,
        })
        .encode()
        .unwrap();

        let len = prime_udp_buf(&mut driver, &query);
        driver.on_datagram(Ok((len, remote_addr))).await.unwrap();

        let mut buf = [0u8; MAX_UDP_PAYLOAD];
        let (len, _) = remote.recv_from(&mut buf).await.unwrap();
        let reply = KrpcMessage::decode(&buf[..len]).unwrap();
        match reply {
            KrpcMessage::Response(response) => {
                assert_eq!(response.tx_id, TxId::new([0xaa, 0xbb]));
                assert_eq!(response.node_id, driver.self_id());
            }
            other => panic!("expected a response, got {other:?}"),
        }
        assert_eq!(driver.rpc.table().len(), 1);
    }

    #[tokio::test]
    async fn bootstrap_schedules_and_sends_one_ping_per_address() {
        let dir = TempDir::new().unwrap();

        // two reachable "nodes"
        let seed_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let seed_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        BootstrapStore::new(dir.path())
            .save(&[seed_a.local_addr().unwrap(), seed_b.local_addr().unwrap()])
            .unwrap();

        let mut driver = test_driver(&dir).await;
        driver.bootstrap_from_store().unwrap();
        assert_eq!(driver.events.len(), 2);

        while let Some(event) = driver.events.pop_front() {
            driver.on_event(event).await.unwrap();
        }
        assert_eq!(driver.rpc.outstanding_len(), 2);

        for seed in [&seed_a, &seed_b] {
            let mut buf = [0u8; MAX_UDP_PAYLOAD];
            let (len, _) = seed.recv_from(&mut buf).await.unwrap();
            let msg = KrpcMessage::decode(&buf[..len]).unwrap();
            assert!(matches!(
                msg,
                KrpcMessage::Query(Query {
                    method: QueryMethod::Ping,
                    ..
                })
            ));
        }
    }

    #[tokio::test]
    async fn corrupt_bootstrap_file_is_fatal() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("nodes.dat"), "not json").unwrap();

        let mut driver = test_driver(&dir).await;
        assert!(driver.bootstrap_from_store().is_err());
    }

    #[tokio::test]
    async fn peers_beyond_the_cap_get_the_banner() {
        let dir = TempDir::new().unwrap();
        let mut driver = test_driver(&dir).await;
        let listen_addr = driver.listener.local_addr().unwrap();

        let mut clients = Vec::new();
        for _ in 0..3 {
            clients.push(TcpStream::connect(listen_addr).await.unwrap());
            let (stream, addr) = driver.listener.accept().await.unwrap();
            driver.admit_peer(stream, addr).await;
        }
        assert_eq!(driver.peers.len(), 2);

        let mut banner = vec![0u8; REJECT_BANNER.len()];
        clients[2].read_exact(&mut banner).await.unwrap();
        assert_eq!(banner, REJECT_BANNER);
    }

    #[tokio::test]
    async fn eviction_probe_is_scheduled_for_a_full_bucket() {
        let dir = TempDir::new().unwrap();
        let mut driver = test_driver(&dir).await;

        // ids whose last byte differs from ours with the high bit set all
        // land in bucket 7; fill it, then handle a ninth node
        let self_id = driver.self_id();
        let in_bucket7 = |value: u8, octet: u8| {
            let mut bytes = *self_id.as_bytes();
            bytes[NODE_ID_LEN - 1] ^= value;
            NodeInfo::new(
                NodeId::new(bytes),
                format!("10.0.0.{octet}:6881").parse().unwrap(),
            )
        };
        for (i, value) in (128u8..136).enumerate() {
            driver
                .rpc
                .table_mut()
                .insert(in_bucket7(value, i as u8 + 1))
                .unwrap();
        }

        let ninth = in_bucket7(136, 9);
        let query = KrpcMessage::Query(Query {
            tx_id: TxId::random(),
            node_id: ninth.id,
            method: QueryMethod::Ping,
        })
        .encode()
        .unwrap();
        let len = prime_udp_buf(&mut driver, &query);
        driver.on_datagram(Ok((len, ninth.addr))).await.unwrap();

        let head = in_bucket7(128, 1);
        match driver.events.front() {
            Some(Event::PingNode { id, addr }) => {
                assert_eq!(*id, Some(head.id));
                assert_eq!(*addr, head.addr);
            }
            other => panic!("expected a scheduled ping, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn responses_settle_outstanding_queries() {
        let dir = TempDir::new().unwrap();
        let mut driver = test_driver(&dir).await;

        let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let remote_addr = remote.local_addr().unwrap();
        driver.ping_node(None, remote_addr).await.unwrap();
        assert_eq!(driver.rpc.outstanding_len(), 1);

        let mut buf = [0u8; MAX_UDP_PAYLOAD];
        let (len, _) = remote.recv_from(&mut buf).await.unwrap();
        let tx_id = KrpcMessage::decode(&buf[..len]).unwrap().tx_id();

        let response = KrpcMessage::Response(Response {
            tx_id,
            node_id: id_with_last(9),
            nodes: vec![],
        })
        .encode()
        .unwrap();
        let len = prime_udp_buf(&mut driver, &response);
        driver.on_datagram(Ok((len, remote_addr))).await.unwrap();

        assert_eq!(driver.rpc.outstanding_len(), 0);
    }

    #[tokio::test]
    async fn shutdown_persists_routed_addresses() {
        let dir = TempDir::new().unwrap();
        let mut driver = test_driver(&dir).await;
        driver
            .rpc
            .table_mut()
            .insert(NodeInfo::new(
                id_with_last(1),
                "10.0.0.1:6881".parse().unwrap(),
            ))
            .unwrap();

        driver.shutdown();

        let saved = BootstrapStore::new(dir.path()).load().unwrap();
        assert_eq!(saved, vec!["10.0.0.1:6881".parse().unwrap()]);
    }
}
