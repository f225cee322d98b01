// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Connected TCP peers.
//!
//! A peer is a client/server on our TCP port speaking the framed protocol;
//! peers are not DHT nodes. Each registered peer splits into a write half
//! kept beside its parser state, and a read half wrapped into a small
//! chunked stream so the driver can wait on all peers at once through a
//! [`StreamMap`].

use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use burrow_protocol::stream::{Frame, FrameKind, FrameParser};
use tokio::{
    io::{AsyncRead, AsyncWriteExt, ReadBuf},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
};
use tokio_stream::{Stream, StreamExt, StreamMap};

/// Per-read buffer. Deliberately small so the framer routinely sees
/// messages split across chunk boundaries.
pub(crate) const TCP_CHUNK: usize = 64;

/// What accepted-but-over-cap connections are told before the close.
pub(crate) const REJECT_BANNER: &[u8] = b"Too many connections. Please try later...\n";

/// A connected peer: address, write half and framing state.
pub struct Peer {
    pub addr: SocketAddr,
    writer: OwnedWriteHalf,
    pub parser: FrameParser,
}

impl Peer {
    /// Write one frame to the peer.
    pub async fn send_frame(&mut self, kind: FrameKind, payload: &[u8]) -> io::Result<()> {
        self.writer.write_all(&Frame::encode(kind, payload)).await
    }
}

/// Reads a peer socket in small chunks.
///
/// Yields an empty chunk once at end-of-stream so the driver observes the
/// disconnect (a bare stream end would vanish silently inside the
/// `StreamMap`), then terminates.
struct PeerChunks {
    reader: OwnedReadHalf,
    eof: bool,
}

impl Stream for PeerChunks {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.eof {
            return Poll::Ready(None);
        }

        let mut buf = [0u8; TCP_CHUNK];
        let mut read_buf = ReadBuf::new(&mut buf);
        match Pin::new(&mut this.reader).poll_read(cx, &mut read_buf) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(err)) => {
                this.eof = true;
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(Ok(())) => {
                let filled = read_buf.filled();
                if filled.is_empty() {
                    this.eof = true;
                    Poll::Ready(Some(Ok(Bytes::new())))
                } else {
                    Poll::Ready(Some(Ok(Bytes::copy_from_slice(filled))))
                }
            }
        }
    }
}

/// The ordered collection of connected peers, capped at `max_peers`.
pub struct PeerRegistry {
    peers: HashMap<u64, Peer>,
    streams: StreamMap<u64, PeerChunks>,
    next_key: u64,
    max_peers: usize,
}

impl PeerRegistry {
    pub fn new(max_peers: usize) -> Self {
        Self {
            peers: HashMap::new(),
            streams: StreamMap::new(),
            next_key: 0,
            max_peers,
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.peers.len() >= self.max_peers
    }

    /// Take ownership of an accepted connection. The caller has already
    /// checked the cap.
    pub fn register(&mut self, stream: TcpStream, addr: SocketAddr) -> u64 {
        let key = self.next_key;
        self.next_key += 1;

        let (reader, writer) = stream.into_split();
        self.streams.insert(
            key,
            PeerChunks {
                reader,
                eof: false,
            },
        );
        self.peers.insert(
            key,
            Peer {
                addr,
                writer,
                parser: FrameParser::new(),
            },
        );
        debug!("Peer {addr} registered (key={key}).");
        key
    }

    pub fn get_mut(&mut self, key: u64) -> Option<&mut Peer> {
        self.peers.get_mut(&key)
    }

    /// Drop a peer; both socket halves close on drop.
    pub fn unregister(&mut self, key: u64) -> Option<Peer> {
        self.streams.remove(&key);
        let peer = self.peers.remove(&key);
        if let Some(peer) = &peer {
            debug!("Unregistering peer {}.", peer.addr);
        }
        peer
    }

    pub fn unregister_all(&mut self) {
        let keys: Vec<u64> = self.peers.keys().copied().collect();
        for key in keys {
            self.unregister(key);
        }
    }

    /// Next chunk from any connected peer. Must only be awaited while the
    /// registry is non-empty; an empty map yields `None` immediately.
    pub async fn next_chunk(&mut self) -> Option<(u64, io::Result<Bytes>)> {
        self.streams.next().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::{io::AsyncReadExt, net::TcpListener};

    async fn connected_pair(listener: &TcpListener) -> (TcpStream, TcpStream, SocketAddr) {
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (server, addr) = listener.accept().await.unwrap();
        (client, server, addr)
    }

    #[tokio::test]
    async fn chunks_arrive_keyed_by_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (mut client, server, addr) = connected_pair(&listener).await;

        let mut registry = PeerRegistry::new(8);
        let key = registry.register(server, addr);

        client.write_all(b"hello").await.unwrap();
        let (got_key, chunk) = registry.next_chunk().await.unwrap();
        assert_eq!(got_key, key);
        assert_eq!(chunk.unwrap().as_ref(), b"hello");
    }

    #[tokio::test]
    async fn disconnect_surfaces_as_an_empty_chunk() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (client, server, addr) = connected_pair(&listener).await;

        let mut registry = PeerRegistry::new(8);
        registry.register(server, addr);
        drop(client);

        let (_, chunk) = registry.next_chunk().await.unwrap();
        assert!(chunk.unwrap().is_empty());
    }

    #[tokio::test]
    async fn long_writes_split_into_small_chunks() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (mut client, server, addr) = connected_pair(&listener).await;

        let mut registry = PeerRegistry::new(8);
        registry.register(server, addr);

        let payload = vec![0x42u8; TCP_CHUNK * 3];
        client.write_all(&payload).await.unwrap();

        let mut received = 0;
        while received < payload.len() {
            let (_, chunk) = registry.next_chunk().await.unwrap();
            let chunk = chunk.unwrap();
            assert!(chunk.len() <= TCP_CHUNK);
            received += chunk.len();
        }
        assert_eq!(received, payload.len());
    }

    #[tokio::test]
    async fn frames_written_by_send_frame_reach_the_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (mut client, server, addr) = connected_pair(&listener).await;

        let mut registry = PeerRegistry::new(8);
        let key = registry.register(server, addr);
        registry
            .get_mut(key)
            .unwrap()
            .send_frame(FrameKind::Error, b"Could not parse chunk.")
            .await
            .unwrap();

        let mut buf = vec![0u8; 8 + 22];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..4], b"EROR");
    }

    #[tokio::test]
    async fn unregister_forgets_the_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (_client, server, addr) = connected_pair(&listener).await;

        let mut registry = PeerRegistry::new(8);
        let key = registry.register(server, addr);
        assert_eq!(registry.len(), 1);

        assert!(registry.unregister(key).is_some());
        assert!(registry.is_empty());
        assert!(registry.unregister(key).is_none());
    }
}
