//! The replicated key/value state machine.
//!
//! Commands travel through the consensus log as opaque bytes; this module
//! defines their encoding and the deterministic store they apply to. Reads
//! go through the log like writes, which is what makes them linearizable:
//! a `get` observes every `set` committed before it.
//!
//! # Wire Format
//!
//! Command: 1 tag byte, u16 LE key length + key bytes, and for `set` a
//! u32 LE value length + value bytes.
//!
//! Response: 1 tag byte; a found value travels as u32 LE length + bytes.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use caravel_runtime::StateMachine;
use thiserror::Error;
use tracing::warn;

const TAG_SET: u8 = 0;
const TAG_GET: u8 = 1;
const TAG_DEL: u8 = 2;

const RESP_OK: u8 = 0;
const RESP_VALUE: u8 = 1;
const RESP_MISSING: u8 = 2;
const RESP_INVALID: u8 = 3;

/// Errors decoding a command or response.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KvError {
    /// The buffer ended before the encoding did.
    #[error("truncated encoding")]
    Truncated,

    /// Unknown tag byte.
    #[error("unknown tag: {tag}")]
    UnknownTag {
        /// The offending tag value.
        tag: u8,
    },

    /// A key was not valid UTF-8.
    #[error("key is not valid UTF-8")]
    BadKey,
}

/// A key/value command submitted by clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvCommand {
    /// Stores `value` under `key`.
    Set {
        /// The key.
        key: String,
        /// The value.
        value: Bytes,
    },
    /// Reads the value under `key`.
    Get {
        /// The key.
        key: String,
    },
    /// Removes `key`.
    Del {
        /// The key.
        key: String,
    },
}

impl KvCommand {
    /// Encodes the command for the consensus log.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        match self {
            Self::Set { key, value } => {
                buf.put_u8(TAG_SET);
                put_key(&mut buf, key);
                // Value sizes are bounded by the command size limit.
                #[allow(clippy::cast_possible_truncation)]
                buf.put_u32_le(value.len() as u32);
                buf.put_slice(value);
            }
            Self::Get { key } => {
                buf.put_u8(TAG_GET);
                put_key(&mut buf, key);
            }
            Self::Del { key } => {
                buf.put_u8(TAG_DEL);
                put_key(&mut buf, key);
            }
        }
        buf.freeze()
    }

    /// Decodes a command from log-entry bytes.
    ///
    /// # Errors
    /// Returns an error when the bytes are not a valid command encoding.
    pub fn decode(data: &[u8]) -> Result<Self, KvError> {
        let mut buf = data;
        let tag = take_u8(&mut buf)?;
        match tag {
            TAG_SET => {
                let key = take_key(&mut buf)?;
                let len = take_u32(&mut buf)? as usize;
                if buf.remaining() < len {
                    return Err(KvError::Truncated);
                }
                let value = buf.copy_to_bytes(len);
                Ok(Self::Set { key, value })
            }
            TAG_GET => Ok(Self::Get {
                key: take_key(&mut buf)?,
            }),
            TAG_DEL => Ok(Self::Del {
                key: take_key(&mut buf)?,
            }),
            tag => Err(KvError::UnknownTag { tag }),
        }
    }
}

/// The state machine's answer to a committed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvResponse {
    /// The write was applied.
    Ok,
    /// The key was found; carries its value.
    Value(Bytes),
    /// The key was not present.
    Missing,
    /// The command bytes could not be decoded.
    Invalid,
}

impl KvResponse {
    /// Encodes the response for the client.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        match self {
            Self::Ok => buf.put_u8(RESP_OK),
            Self::Value(value) => {
                buf.put_u8(RESP_VALUE);
                #[allow(clippy::cast_possible_truncation)]
                buf.put_u32_le(value.len() as u32);
                buf.put_slice(value);
            }
            Self::Missing => buf.put_u8(RESP_MISSING),
            Self::Invalid => buf.put_u8(RESP_INVALID),
        }
        buf.freeze()
    }

    /// Decodes a response.
    ///
    /// # Errors
    /// Returns an error when the bytes are not a valid response encoding.
    pub fn decode(data: &[u8]) -> Result<Self, KvError> {
        let mut buf = data;
        let tag = take_u8(&mut buf)?;
        match tag {
            RESP_OK => Ok(Self::Ok),
            RESP_VALUE => {
                let len = take_u32(&mut buf)? as usize;
                if buf.remaining() < len {
                    return Err(KvError::Truncated);
                }
                Ok(Self::Value(buf.copy_to_bytes(len)))
            }
            RESP_MISSING => Ok(Self::Missing),
            RESP_INVALID => Ok(Self::Invalid),
            tag => Err(KvError::UnknownTag { tag }),
        }
    }
}

/// In-memory key/value store applied from the consensus log.
#[derive(Debug, Default)]
pub struct KvStore {
    entries: HashMap<String, Bytes>,
}

impl KvStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Returns the number of keys stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when no keys are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Reads a key directly, bypassing the log.
    ///
    /// Only for inspection and tests; linearizable reads go through the
    /// log as [`KvCommand::Get`].
    #[must_use]
    pub fn peek(&self, key: &str) -> Option<&Bytes> {
        self.entries.get(key)
    }
}

impl StateMachine for KvStore {
    fn apply(&mut self, command: &Bytes) -> Bytes {
        let response = match KvCommand::decode(command) {
            Ok(KvCommand::Set { key, value }) => {
                self.entries.insert(key, value);
                KvResponse::Ok
            }
            Ok(KvCommand::Get { key }) => self
                .entries
                .get(&key)
                .map_or(KvResponse::Missing, |value| {
                    KvResponse::Value(value.clone())
                }),
            Ok(KvCommand::Del { key }) => {
                if self.entries.remove(&key).is_some() {
                    KvResponse::Ok
                } else {
                    KvResponse::Missing
                }
            }
            Err(e) => {
                // Deterministic across the cluster: every replica decodes
                // the same bytes and fails the same way.
                warn!(error = %e, "undecodable command in committed entry");
                KvResponse::Invalid
            }
        };
        response.encode()
    }
}

fn put_key(buf: &mut BytesMut, key: &str) {
    let bytes = key.as_bytes();
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u16_le(bytes.len() as u16);
    buf.put_slice(bytes);
}

fn take_u8(buf: &mut &[u8]) -> Result<u8, KvError> {
    if buf.remaining() < 1 {
        return Err(KvError::Truncated);
    }
    Ok(buf.get_u8())
}

fn take_u32(buf: &mut &[u8]) -> Result<u32, KvError> {
    if buf.remaining() < 4 {
        return Err(KvError::Truncated);
    }
    Ok(buf.get_u32_le())
}

fn take_key(buf: &mut &[u8]) -> Result<String, KvError> {
    if buf.remaining() < 2 {
        return Err(KvError::Truncated);
    }
    let len = buf.get_u16_le() as usize;
    if buf.remaining() < len {
        return Err(KvError::Truncated);
    }
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec()).map_err(|_| KvError::BadKey)
}
