// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not well-formed bencode: {0}")]
    InvalidBencode(String),
    #[error("datagram is not a bencoded dictionary")]
    NotADict,
    #[error("mandatory field `{0}` is missing")]
    MissingField(&'static str),
    #[error("field `{0}` has the wrong type or shape")]
    IllTypedField(&'static str),
    #[error("unknown message type {0:?}")]
    UnknownMessageType(String),
    #[error("unknown method {0:?}")]
    UnknownMethod(String),
    #[error("nodes list carries more than {max} entries")]
    TooManyNodes { max: usize },
    #[error("encoded message of {0} bytes exceeds the UDP payload limit")]
    OversizedPayload(usize),
    #[error("unknown frame tag {0:?}")]
    UnknownFrameTag([u8; 4]),
    #[error("frame payload of {0} bytes exceeds the frame limit")]
    FrameTooLarge(u32),
    #[error("frame parser is in the error state")]
    ParserPoisoned,
}
