// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! KRPC message model and bencode codec (BEP-5 with one deliberate
//! divergence).
//!
//! Messages are bencoded dictionaries small enough for a single UDP
//! datagram. Wire keys: `t` (transaction id), `y` (type: `q`/`r`/`e`), `q`
//! (method name), `a` (query arguments), `r` (response values), `e`
//! (error pair `[code, message]`).
//!
//! Node lists diverge from the BitTorrent compact form: a node info is three
//! byte strings, so lists are flat,
//! `["id1", "host1", "service1", "id2", "host2", "service2", ...]`,
//! with numeric host and decimal port strings.

use std::{
    fmt::{self, Debug, Display},
    net::{IpAddr, SocketAddr},
    str,
};

use bendy::{
    decoding::{Decoder, Object},
    encoding::Encoder,
};
use rand::Rng;
use thiserror::Error;

use crate::{error::Error, NodeId, NodeInfo, K_VALUE};

/// Number of bytes in a transaction id.
pub const TX_ID_LEN: usize = 2;

/// Largest datagram the node will emit. Replies that would exceed this are
/// an internal error, never sent.
pub const MAX_UDP_PAYLOAD: usize = 1400;

/// KRPC error codes (BEP-5).
pub mod code {
    pub const GENERIC: u64 = 201;
    pub const SERVER: u64 = 202;
    pub const PROTOCOL: u64 = 203;
    pub const METHOD_UNKNOWN: u64 = 204;
}

/// A 2-byte transaction id correlating a query with its response.
///
/// `0x0000` is reserved as the "no tx id observed" sentinel and is never
/// issued by [`TxId::random`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxId([u8; TX_ID_LEN]);

impl TxId {
    pub const NONE: TxId = TxId([0; TX_ID_LEN]);

    pub const fn new(bytes: [u8; TX_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// A fresh random id, never the reserved sentinel.
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        loop {
            let tx = Self(rng.gen());
            if !tx.is_none() {
                return tx;
            }
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; TX_ID_LEN] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; TX_ID_LEN] {
        &self.0
    }

    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }
}

impl Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Debug for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxId({})", hex::encode(self.0))
    }
}

/// The two methods this node speaks.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum KrpcMethod {
    Ping,
    FindNode,
}

impl KrpcMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            KrpcMethod::Ping => "ping",
            KrpcMethod::FindNode => "find_node",
        }
    }
}

impl Display for KrpcMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A method invocation together with its arguments.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum QueryMethod {
    Ping,
    FindNode { target: NodeId },
}

impl QueryMethod {
    pub fn method(&self) -> KrpcMethod {
        match self {
            QueryMethod::Ping => KrpcMethod::Ping,
            QueryMethod::FindNode { .. } => KrpcMethod::FindNode,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Query {
    pub tx_id: TxId,
    pub node_id: NodeId,
    pub method: QueryMethod,
}

/// A response carries the responder's id and, for `find_node`, up to
/// [`K_VALUE`] nodes. A ping response is simply a response with no nodes.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Response {
    pub tx_id: TxId,
    pub node_id: NodeId,
    pub nodes: Vec<NodeInfo>,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct KrpcError {
    pub tx_id: TxId,
    pub code: u64,
    pub message: String,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum KrpcMessage {
    Query(Query),
    Response(Response),
    Error(KrpcError),
}

/// Decode failure, carrying any transaction id recovered from the malformed
/// input so the caller can echo it in an error reply.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct DecodeError {
    pub tx_id: Option<TxId>,
    #[source]
    pub source: Error,
}

impl KrpcMessage {
    pub fn tx_id(&self) -> TxId {
        match self {
            KrpcMessage::Query(q) => q.tx_id,
            KrpcMessage::Response(r) => r.tx_id,
            KrpcMessage::Error(e) => e.tx_id,
        }
    }

    /// Sender node id, absent for error messages.
    pub fn node_id(&self) -> Option<NodeId> {
        match self {
            KrpcMessage::Query(q) => Some(q.node_id),
            KrpcMessage::Response(r) => Some(r.node_id),
            KrpcMessage::Error(_) => None,
        }
    }

    /// Encode to a single-datagram byte buffer.
    ///
    /// Dictionary keys are emitted in lexicographic order (canonical
    /// bencode). Fails only when the encoded form would not fit a datagram.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let mut encoder = Encoder::new();
        let result = match self {
            KrpcMessage::Query(q) => encoder.emit_dict(|mut dict| {
                dict.emit_pair_with(b"a", |e| {
                    e.emit_dict(|mut args| {
                        args.emit_pair_with(b"id", |e| e.emit_bytes(q.node_id.as_bytes()))?;
                        if let QueryMethod::FindNode { target } = &q.method {
                            args.emit_pair_with(b"target", |e| e.emit_bytes(target.as_bytes()))?;
                        }
                        Ok(())
                    })
                })?;
                dict.emit_pair(b"q", q.method.method().as_str())?;
                dict.emit_pair_with(b"t", |e| e.emit_bytes(q.tx_id.as_bytes()))?;
                dict.emit_pair(b"y", "q")
            }),
            KrpcMessage::Response(r) => encoder.emit_dict(|mut dict| {
                dict.emit_pair_with(b"r", |e| {
                    e.emit_dict(|mut values| {
                        values.emit_pair_with(b"id", |e| e.emit_bytes(r.node_id.as_bytes()))?;
                        if !r.nodes.is_empty() {
                            values.emit_pair_with(b"nodes", |e| {
                                e.emit_list(|list| {
                                    for node in &r.nodes {
                                        list.emit_bytes(node.id.as_bytes())?;
                                        list.emit_str(&node.addr.ip().to_string())?;
                                        list.emit_str(&node.addr.port().to_string())?;
                                    }
                                    Ok(())
                                })
                            })?;
                        }
                        Ok(())
                    })
                })?;
                dict.emit_pair_with(b"t", |e| e.emit_bytes(r.tx_id.as_bytes()))?;
                dict.emit_pair(b"y", "r")
            }),
            KrpcMessage::Error(err) => encoder.emit_dict(|mut dict| {
                dict.emit_pair_with(b"e", |e| {
                    e.emit_list(|list| {
                        list.emit_int(err.code)?;
                        list.emit_str(&err.message)
                    })
                })?;
                dict.emit_pair_with(b"t", |e| e.emit_bytes(err.tx_id.as_bytes()))?;
                dict.emit_pair(b"y", "e")
            }),
        };
        result.map_err(|e| Error::InvalidBencode(e.to_string()))?;

        let buf = encoder
            .get_output()
            .map_err(|e| Error::InvalidBencode(e.to_string()))?;
        if buf.len() > MAX_UDP_PAYLOAD {
            return Err(Error::OversizedPayload(buf.len()));
        }
        Ok(buf)
    }

    /// Decode a datagram.
    ///
    /// Rejects input that is not well-formed bencode, lacks a mandatory
    /// field, or carries ill-typed fields. Unknown dictionary keys (client
    /// version strings and the like) are skipped.
    pub fn decode(buf: &[u8]) -> Result<KrpcMessage, DecodeError> {
        let mut raw = RawMessage::default();
        if let Err(source) = parse_into(buf, &mut raw) {
            return Err(DecodeError {
                tx_id: raw.tx_id,
                source,
            });
        }
        let tx_id = raw.tx_id;
        assemble(raw).map_err(|source| DecodeError { tx_id, source })
    }
}

/// All fields a datagram may carry, collected before validation.
#[derive(Default)]
struct RawMessage {
    tx_id: Option<TxId>,
    msg_type: Option<Vec<u8>>,
    method: Option<Vec<u8>>,
    args_id: Option<NodeId>,
    args_target: Option<NodeId>,
    resp_id: Option<NodeId>,
    resp_nodes: Vec<NodeInfo>,
    err_code: Option<u64>,
    err_msg: Option<String>,
}

fn bencode_err(err: bendy::decoding::Error) -> Error {
    Error::InvalidBencode(err.to_string())
}

fn parse_into(buf: &[u8], raw: &mut RawMessage) -> Result<(), Error> {
    let mut decoder = Decoder::new(buf);
    let object = decoder.next_object().map_err(bencode_err)?;
    let Some(Object::Dict(mut dict)) = object else {
        return Err(Error::NotADict);
    };

    while let Some((key, value)) = dict.next_pair().map_err(bencode_err)? {
        match key {
            b"t" => {
                let bytes = expect_bytes(value, "t")?;
                raw.tx_id = Some(TxId::from_slice(bytes).ok_or(Error::IllTypedField("t"))?);
            }
            b"y" => raw.msg_type = Some(expect_bytes(value, "y")?.to_vec()),
            b"q" => raw.method = Some(expect_bytes(value, "q")?.to_vec()),
            b"a" => parse_args(value, raw)?,
            b"r" => parse_response_values(value, raw)?,
            b"e" => parse_error_pair(value, raw)?,
            _ => skip_object(value)?,
        }
    }
    Ok(())
}

fn assemble(raw: RawMessage) -> Result<KrpcMessage, Error> {
    let tx_id = raw.tx_id.ok_or(Error::MissingField("t"))?;
    let msg_type = raw.msg_type.ok_or(Error::MissingField("y"))?;

    match msg_type.as_slice() {
        b"q" => {
            let node_id = raw.args_id.ok_or(Error::MissingField("a.id"))?;
            let method_name = raw.method.ok_or(Error::MissingField("q"))?;
            let method = match method_name.as_slice() {
                b"ping" => QueryMethod::Ping,
                b"find_node" => QueryMethod::FindNode {
                    target: raw.args_target.ok_or(Error::MissingField("a.target"))?,
                },
                other => {
                    return Err(Error::UnknownMethod(
                        String::from_utf8_lossy(other).into_owned(),
                    ))
                }
            };
            Ok(KrpcMessage::Query(Query {
                tx_id,
                node_id,
                method,
            }))
        }
        b"r" => Ok(KrpcMessage::Response(Response {
            tx_id,
            node_id: raw.resp_id.ok_or(Error::MissingField("r.id"))?,
            nodes: raw.resp_nodes,
        })),
        b"e" => Ok(KrpcMessage::Error(KrpcError {
            tx_id,
            code: raw.err_code.ok_or(Error::MissingField("e"))?,
            message: raw.err_msg.unwrap_or_default(),
        })),
        other => Err(Error::UnknownMessageType(
            String::from_utf8_lossy(other).into_owned(),
        )),
    }
}

fn expect_bytes<'ser>(object: Object<'_, 'ser>, field: &'static str) -> Result<&'ser [u8], Error> {
    match object {
        Object::Bytes(bytes) => Ok(bytes),
        _ => Err(Error::IllTypedField(field)),
    }
}

fn parse_args(object: Object, raw: &mut RawMessage) -> Result<(), Error> {
    let Object::Dict(mut args) = object else {
        return Err(Error::IllTypedField("a"));
    };
    while let Some((key, value)) = args.next_pair().map_err(bencode_err)? {
        match key {
            b"id" => {
                let bytes = expect_bytes(value, "a.id")?;
                raw.args_id = Some(NodeId::from_slice(bytes).ok_or(Error::IllTypedField("a.id"))?);
            }
            b"target" => {
                let bytes = expect_bytes(value, "a.target")?;
                raw.args_target =
                    Some(NodeId::from_slice(bytes).ok_or(Error::IllTypedField("a.target"))?);
            }
            _ => skip_object(value)?,
        }
    }
    Ok(())
}

fn parse_response_values(object: Object, raw: &mut RawMessage) -> Result<(), Error> {
    let Object::Dict(mut values) = object else {
        return Err(Error::IllTypedField("r"));
    };
    while let Some((key, value)) = values.next_pair().map_err(bencode_err)? {
        match key {
            b"id" => {
                let bytes = expect_bytes(value, "r.id")?;
                raw.resp_id = Some(NodeId::from_slice(bytes).ok_or(Error::IllTypedField("r.id"))?);
            }
            b"nodes" => raw.resp_nodes = parse_flat_nodes(value)?,
            _ => skip_object(value)?,
        }
    }
    Ok(())
}

/// Parse the flat `[id, host, service, ...]` node list.
fn parse_flat_nodes(object: Object) -> Result<Vec<NodeInfo>, Error> {
    let Object::List(mut list) = object else {
        return Err(Error::IllTypedField("r.nodes"));
    };

    let mut nodes = Vec::new();
    loop {
        let Some(id_obj) = list.next_object().map_err(bencode_err)? else {
            break;
        };
        let id = NodeId::from_slice(expect_bytes(id_obj, "r.nodes")?)
            .ok_or(Error::IllTypedField("r.nodes"))?;

        // every triplet must be complete
        let host_obj = list
            .next_object()
            .map_err(bencode_err)?
            .ok_or(Error::IllTypedField("r.nodes"))?;
        let host: IpAddr = parse_text(host_obj)?.ok_or(Error::IllTypedField("r.nodes"))?;

        let service_obj = list
            .next_object()
            .map_err(bencode_err)?
            .ok_or(Error::IllTypedField("r.nodes"))?;
        let port: u16 = parse_text(service_obj)?.ok_or(Error::IllTypedField("r.nodes"))?;

        nodes.push(NodeInfo::new(id, SocketAddr::new(host, port)));
        if nodes.len() > K_VALUE {
            return Err(Error::TooManyNodes { max: K_VALUE });
        }
    }
    Ok(nodes)
}

fn parse_error_pair(object: Object, raw: &mut RawMessage) -> Result<(), Error> {
    let Object::List(mut pair) = object else {
        return Err(Error::IllTypedField("e"));
    };

    let err_code: u64 = match pair
        .next_object()
        .map_err(bencode_err)?
        .ok_or(Error::IllTypedField("e"))?
    {
        Object::Integer(code) => code.parse().map_err(|_| Error::IllTypedField("e"))?,
        _ => return Err(Error::IllTypedField("e")),
    };
    raw.err_code = Some(err_code);

    let err_msg = String::from_utf8_lossy(expect_bytes(
        pair.next_object()
            .map_err(bencode_err)?
            .ok_or(Error::IllTypedField("e"))?,
        "e",
    )?)
    .into_owned();
    raw.err_msg = Some(err_msg);

    // tolerate (and drain) trailing elements
    while let Some(extra) = pair.next_object().map_err(bencode_err)? {
        skip_object(extra)?;
    }
    Ok(())
}

fn parse_text<T: str::FromStr>(object: Object) -> Result<Option<T>, Error> {
    match object {
        Object::Bytes(bytes) => Ok(str::from_utf8(bytes).ok().and_then(|s| s.parse().ok())),
        _ => Ok(None),
    }
}

/// Drain an object we have no interest in, recursively.
fn skip_object(object: Object) -> Result<(), Error> {
    match object {
        Object::Bytes(_) | Object::Integer(_) => Ok(()),
        Object::List(mut list) => {
            while let Some(item) = list.next_object().map_err(bencode_err)? {
                skip_object(item)?;
            }
            Ok(())
        }
        Object::Dict(mut dict) => {
            while let Some((_, value)) = dict.next_pair().map_err(bencode_err)? {
                skip_object(value)?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NODE_ID_LEN;

    fn id_with_last(last: u8) -> NodeId {
        let mut bytes = [0u8; NODE_ID_LEN];
        bytes[NODE_ID_LEN - 1] = last;
        NodeId::new(bytes)
    }

    #[test]
    fn ping_query_wire_shape_is_exact() {
        let msg = KrpcMessage::Query(Query {
            tx_id: TxId::new([0xaa, 0xbb]),
            node_id: id_with_last(1),
            method: QueryMethod::Ping,
        });
        let buf = msg.encode().unwrap();

        let mut expected = Vec::new();
        expected.extend_from_slice(b"d1:ad2:id20:");
        expected.extend_from_slice(id_with_last(1).as_bytes());
        expected.extend_from_slice(b"e1:q4:ping1:t2:\xaa\xbb1:y1:qe");
        assert_eq!(buf, expected);
    }

    #[test]
    fn ping_response_wire_shape_is_exact() {
        let msg = KrpcMessage::Response(Response {
            tx_id: TxId::new([0xaa, 0xbb]),
            node_id: id_with_last(0),
            nodes: vec![],
        });
        let buf = msg.encode().unwrap();

        let mut expected = Vec::new();
        expected.extend_from_slice(b"d1:rd2:id20:");
        expected.extend_from_slice(id_with_last(0).as_bytes());
        expected.extend_from_slice(b"e1:t2:\xaa\xbb1:y1:re");
        assert_eq!(buf, expected);
    }

    #[test]
    fn find_node_response_uses_flat_node_list() {
        let node = NodeInfo::new(id_with_last(7), "10.0.0.2:6881".parse().unwrap());
        let msg = KrpcMessage::Response(Response {
            tx_id: TxId::new([0x01, 0x02]),
            node_id: id_with_last(0),
            nodes: vec![node],
        });
        let buf = msg.encode().unwrap();

        let mut expected = Vec::new();
        expected.extend_from_slice(b"d1:rd2:id20:");
        expected.extend_from_slice(id_with_last(0).as_bytes());
        expected.extend_from_slice(b"5:nodesl20:");
        expected.extend_from_slice(id_with_last(7).as_bytes());
        expected.extend_from_slice(b"8:10.0.0.24:6881ee1:t2:\x01\x021:y1:re");
        assert_eq!(buf, expected);
    }

    #[test]
    fn encode_decode_round_trips() {
        let nodes: Vec<NodeInfo> = (1..=3)
            .map(|i| {
                NodeInfo::new(
                    id_with_last(i),
                    format!("10.0.0.{i}:700{i}").parse().unwrap(),
                )
            })
            .collect();
        let messages = [
            KrpcMessage::Query(Query {
                tx_id: TxId::random(),
                node_id: NodeId::random(),
                method: QueryMethod::Ping,
            }),
            KrpcMessage::Query(Query {
                tx_id: TxId::random(),
                node_id: NodeId::random(),
                method: QueryMethod::FindNode {
                    target: NodeId::random(),
                },
            }),
            KrpcMessage::Response(Response {
                tx_id: TxId::random(),
                node_id: NodeId::random(),
                nodes,
            }),
            KrpcMessage::Error(KrpcError {
                tx_id: TxId::random(),
                code: code::PROTOCOL,
                message: "Protocol Error".to_string(),
            }),
        ];
        for msg in messages {
            let decoded = KrpcMessage::decode(&msg.encode().unwrap()).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn rejects_non_bencode_without_tx() {
        let err = KrpcMessage::decode(b"notbencode").unwrap_err();
        assert!(err.tx_id.is_none());
    }

    #[test]
    fn rejects_missing_mandatory_fields() {
        // well-formed bencode, no `t` and no `y`
        let err = KrpcMessage::decode(b"d1:q4:pinge").unwrap_err();
        assert!(matches!(err.source, Error::MissingField("t")));

        // `t` present but `y` missing: the tx id must be recovered
        let err = KrpcMessage::decode(b"d1:t2:\xaa\xbbe").unwrap_err();
        assert!(matches!(err.source, Error::MissingField("y")));
        assert_eq!(err.tx_id, Some(TxId::new([0xaa, 0xbb])));
    }

    #[test]
    fn recovers_tx_from_unknown_message_type() {
        let err = KrpcMessage::decode(b"d1:t2:\x01\x021:y1:ze").unwrap_err();
        assert!(matches!(err.source, Error::UnknownMessageType(_)));
        assert_eq!(err.tx_id, Some(TxId::new([0x01, 0x02])));
    }

    #[test]
    fn rejects_unknown_method() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d1:ad2:id20:");
        buf.extend_from_slice(id_with_last(1).as_bytes());
        buf.extend_from_slice(b"e1:q9:get_peers1:t2:\x01\x021:y1:qe");
        let err = KrpcMessage::decode(&buf).unwrap_err();
        assert!(matches!(err.source, Error::UnknownMethod(_)));
    }

    #[test]
    fn skips_unknown_keys() {
        // a `v` client-version key must not break decoding
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d1:ad2:id20:");
        buf.extend_from_slice(id_with_last(1).as_bytes());
        buf.extend_from_slice(b"e1:q4:ping1:t2:\xaa\xbb1:v4:BU011:y1:qe");
        let msg = KrpcMessage::decode(&buf).unwrap();
        assert_eq!(msg.tx_id(), TxId::new([0xaa, 0xbb]));
    }

    #[test]
    fn rejects_oversized_node_list() {
        let nodes: Vec<NodeInfo> = (1..=K_VALUE as u8 + 1)
            .map(|i| NodeInfo::new(id_with_last(i), "127.0.0.1:7000".parse().unwrap()))
            .collect();
        // encode by hand: the encoder itself is never handed more than K
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d1:rd2:id20:");
        buf.extend_from_slice(id_with_last(0).as_bytes());
        buf.extend_from_slice(b"5:nodesl");
        for node in &nodes {
            buf.extend_from_slice(b"20:");
            buf.extend_from_slice(node.id.as_bytes());
            buf.extend_from_slice(b"9:127.0.0.14:7000");
        }
        buf.extend_from_slice(b"ee1:t2:\x01\x021:y1:re");
        let err = KrpcMessage::decode(&buf).unwrap_err();
        assert!(matches!(err.source, Error::TooManyNodes { .. }));
    }

    #[test]
    fn rejects_incomplete_node_triplet() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d1:rd2:id20:");
        buf.extend_from_slice(id_with_last(0).as_bytes());
        buf.extend_from_slice(b"5:nodesl20:");
        buf.extend_from_slice(id_with_last(7).as_bytes());
        buf.extend_from_slice(b"8:10.0.0.2ee1:t2:\x01\x021:y1:re");
        let err = KrpcMessage::decode(&buf).unwrap_err();
        assert!(matches!(err.source, Error::IllTypedField("r.nodes")));
    }

    #[test]
    fn encode_refuses_to_exceed_the_datagram_limit() {
        let msg = KrpcMessage::Error(KrpcError {
            tx_id: TxId::random(),
            code: code::GENERIC,
            message: "x".repeat(MAX_UDP_PAYLOAD),
        });
        assert!(matches!(
            msg.encode().unwrap_err(),
            Error::OversizedPayload(_)
        ));
    }

    #[test]
    fn random_tx_id_is_never_the_sentinel() {
        for _ in 0..256 {
            assert!(!TxId::random().is_none());
        }
    }
}
