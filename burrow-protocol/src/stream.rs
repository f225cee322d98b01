// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Typed length-prefixed framing for the peer (TCP) side.
//!
//! Frame layout, bit-exact:
//!
//! ```text
//! +---------------+---------------+=================+
//! | tag (4 ASCII) | length (u32be)| payload (len B) |
//! +---------------+---------------+=================+
//! ```
//!
//! The parser is a resumable state machine driven by chunks of arbitrary
//! size, so a frame may span any number of reads. Any framing inconsistency
//! (unknown tag, oversized length) poisons the parser until the peer is
//! closed; there is no per-message recovery.

use crate::error::Error;

/// Bytes in the frame tag.
pub const FRAME_TAG_LEN: usize = 4;

/// Bytes in the frame length field.
pub const FRAME_LEN_LEN: usize = 4;

/// Upper bound on a frame payload.
pub const MAX_FRAME_PAYLOAD: u32 = 1 << 20;

/// The closed set of frame tags.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FrameKind {
    /// Peer identification.
    Ident,
    /// Application data.
    Data,
    /// Stream reset request.
    Reset,
    /// Error notification; the last frame we send before closing a
    /// misbehaving peer.
    Error,
}

impl FrameKind {
    pub fn tag(&self) -> [u8; FRAME_TAG_LEN] {
        match self {
            FrameKind::Ident => *b"IDEN",
            FrameKind::Data => *b"DATA",
            FrameKind::Reset => *b"RSET",
            FrameKind::Error => *b"EROR",
        }
    }

    pub fn from_tag(tag: [u8; FRAME_TAG_LEN]) -> Option<Self> {
        match &tag {
            b"IDEN" => Some(FrameKind::Ident),
            b"DATA" => Some(FrameKind::Data),
            b"RSET" => Some(FrameKind::Reset),
            b"EROR" => Some(FrameKind::Error),
            _ => None,
        }
    }
}

/// A completed frame.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build the wire form of a frame.
    pub fn encode(kind: FrameKind, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAME_TAG_LEN + FRAME_LEN_LEN + payload.len());
        buf.extend_from_slice(&kind.tag());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(payload);
        buf
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ParseStage {
    /// Between frames.
    None,
    /// Accumulating the 4-byte tag.
    Type,
    /// Accumulating the 4-byte length.
    Length,
    /// Accumulating the payload.
    Payload,
    /// Poisoned; stays here until the peer is closed.
    Error,
}

/// Resumable frame parser, one per connected peer.
#[derive(Debug)]
pub struct FrameParser {
    stage: ParseStage,
    header: [u8; FRAME_TAG_LEN],
    filled: usize,
    kind: Option<FrameKind>,
    expected: usize,
    payload: Vec<u8>,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameParser {
    pub fn new() -> Self {
        Self {
            stage: ParseStage::None,
            header: [0; FRAME_TAG_LEN],
            filled: 0,
            kind: None,
            expected: 0,
            payload: Vec::new(),
        }
    }

    pub fn stage(&self) -> ParseStage {
        self.stage
    }

    /// Consume one chunk and return every frame completed within it.
    ///
    /// On a framing inconsistency the parser moves to [`ParseStage::Error`]
    /// and every call, including this one, fails.
    pub fn feed(&mut self, mut chunk: &[u8]) -> Result<Vec<Frame>, Error> {
        if self.stage == ParseStage::Error {
            return Err(Error::ParserPoisoned);
        }

        let mut completed = Vec::new();
        while !chunk.is_empty() {
            match self.stage {
                ParseStage::None => {
                    self.stage = ParseStage::Type;
                    self.filled = 0;
                }
                ParseStage::Type => {
                    chunk = self.fill_header(chunk);
                    if self.filled == FRAME_TAG_LEN {
                        match FrameKind::from_tag(self.header) {
                            Some(kind) => {
                                self.kind = Some(kind);
                                self.stage = ParseStage::Length;
                                self.filled = 0;
                            }
                            None => {
                                self.stage = ParseStage::Error;
                                return Err(Error::UnknownFrameTag(self.header));
                            }
                        }
                    }
                }
                ParseStage::Length => {
                    chunk = self.fill_header(chunk);
                    if self.filled == FRAME_LEN_LEN {
                        let len = u32::from_be_bytes(self.header);
                        if len > MAX_FRAME_PAYLOAD {
                            self.stage = ParseStage::Error;
                            return Err(Error::FrameTooLarge(len));
                        }
                        self.expected = len as usize;
                        self.payload = Vec::with_capacity(self.expected);
                        if self.expected == 0 {
                            completed.push(self.complete());
                        } else {
                            self.stage = ParseStage::Payload;
                        }
                    }
                }
                ParseStage::Payload => {
                    let want = self.expected - self.payload.len();
                    let take = want.min(chunk.len());
                    self.payload.extend_from_slice(&chunk[..take]);
                    chunk = &chunk[take..];
                    if self.payload.len() == self.expected {
                        completed.push(self.complete());
                    }
                }
                ParseStage::Error => return Err(Error::ParserPoisoned),
            }
        }

        Ok(completed)
    }

    fn fill_header<'c>(&mut self, chunk: &'c [u8]) -> &'c [u8] {
        let want = self.header.len() - self.filled;
        let take = want.min(chunk.len());
        self.header[self.filled..self.filled + take].copy_from_slice(&chunk[..take]);
        self.filled += take;
        &chunk[take..]
    }

    fn complete(&mut self) -> Frame {
        let frame = Frame {
            // kind was set on tag completion, before any length or payload byte
            kind: self.kind.take().unwrap_or(FrameKind::Error),
            payload: std::mem::take(&mut self.payload),
        };
        self.stage = ParseStage::None;
        self.filled = 0;
        self.expected = 0;
        frame
    }
}
