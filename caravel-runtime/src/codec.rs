//! Wire codec for peer messages.
//!
//! Binary serialization with a simple length-prefixed format suitable for
//! TCP streaming.
//!
//! # Wire Format
//!
//! Each message is framed as:
//! - 4 bytes: payload length (u32 little-endian, not including this prefix)
//! - 1 byte: message type tag
//! - N bytes: message-specific fields
//!
//! Addresses travel as u16-length-prefixed UTF-8 canonical strings;
//! commands as u32-length-prefixed raw bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use caravel_core::limits::MAX_MESSAGE_BYTES;
use caravel_core::{Address, LogIndex, Term};
use caravel_raft::{
    AppendEntriesRequest, AppendEntriesResponse, LogEntry, Message, RequestVoteRequest,
    RequestVoteResponse,
};
use thiserror::Error;

/// Message type tags.
const TAG_REQUEST_VOTE: u8 = 0;
const TAG_REQUEST_VOTE_RESPONSE: u8 = 1;
const TAG_APPEND_ENTRIES: u8 = 2;
const TAG_APPEND_ENTRIES_RESPONSE: u8 = 3;

/// Codec errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Message exceeds the maximum allowed size.
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge {
        /// Actual size.
        size: usize,
        /// Maximum allowed.
        max: usize,
    },

    /// Unknown message type tag.
    #[error("unknown message type: {tag}")]
    UnknownTag {
        /// The unknown tag value.
        tag: u8,
    },

    /// Not enough bytes to decode the message.
    #[error("truncated message: need {need} bytes, have {have}")]
    Truncated {
        /// Bytes needed.
        need: usize,
        /// Bytes available.
        have: usize,
    },

    /// An embedded address failed to parse.
    #[error("invalid address in message: {0}")]
    InvalidAddress(String),
}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Encodes a message into a complete frame, length prefix included.
///
/// # Errors
/// Returns an error if the encoded message exceeds the size limit.
pub fn encode_message(message: &Message) -> CodecResult<Bytes> {
    let mut buf = BytesMut::with_capacity(256);

    // Reserve the length prefix; filled in at the end.
    buf.put_u32_le(0);

    match message {
        Message::RequestVote(req) => {
            buf.put_u8(TAG_REQUEST_VOTE);
            buf.put_u64_le(req.term.get());
            put_address(&mut buf, &req.candidate);
            put_address(&mut buf, &req.to);
            buf.put_u64_le(req.last_log_index.get());
            buf.put_u64_le(req.last_log_term.get());
        }
        Message::RequestVoteResponse(resp) => {
            buf.put_u8(TAG_REQUEST_VOTE_RESPONSE);
            buf.put_u64_le(resp.term.get());
            put_address(&mut buf, &resp.from);
            put_address(&mut buf, &resp.to);
            buf.put_u8(u8::from(resp.vote_granted));
        }
        Message::AppendEntries(req) => {
            buf.put_u8(TAG_APPEND_ENTRIES);
            buf.put_u64_le(req.term.get());
            put_address(&mut buf, &req.leader);
            put_address(&mut buf, &req.to);
            buf.put_u64_le(req.prev_log_index.get());
            buf.put_u64_le(req.prev_log_term.get());
            buf.put_u64_le(req.leader_commit.get());
            // Entry counts are bounded well below u32::MAX.
            #[allow(clippy::cast_possible_truncation)]
            buf.put_u32_le(req.entries.len() as u32);
            for entry in &req.entries {
                buf.put_u64_le(entry.term.get());
                buf.put_u64_le(entry.index.get());
                #[allow(clippy::cast_possible_truncation)]
                buf.put_u32_le(entry.command.len() as u32);
                buf.put_slice(&entry.command);
            }
        }
        Message::AppendEntriesResponse(resp) => {
            buf.put_u8(TAG_APPEND_ENTRIES_RESPONSE);
            buf.put_u64_le(resp.term.get());
            put_address(&mut buf, &resp.from);
            put_address(&mut buf, &resp.to);
            buf.put_u8(u8::from(resp.success));
            buf.put_u64_le(resp.match_index.get());
        }
    }

    let len = buf.len() - 4;
    if len > MAX_MESSAGE_BYTES {
        return Err(CodecError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_BYTES,
        });
    }

    // Payload length fits in u32 because MAX_MESSAGE_BYTES does.
    #[allow(clippy::cast_possible_truncation)]
    buf[0..4].copy_from_slice(&(len as u32).to_le_bytes());

    Ok(buf.freeze())
}

/// Decodes one message from a buffer holding at least one complete frame.
///
/// Returns the message and the number of bytes consumed.
///
/// # Errors
/// Returns [`CodecError::Truncated`] when the buffer holds less than one
/// frame, or a decoding error when the frame is malformed.
pub fn decode_message(data: &[u8]) -> CodecResult<(Message, usize)> {
    if data.len() < 4 {
        return Err(CodecError::Truncated {
            need: 4,
            have: data.len(),
        });
    }

    let len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if len > MAX_MESSAGE_BYTES {
        return Err(CodecError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_BYTES,
        });
    }

    let total = 4 + len;
    if data.len() < total {
        return Err(CodecError::Truncated {
            need: total,
            have: data.len(),
        });
    }

    let message = decode_payload(&data[4..total])?;
    Ok((message, total))
}

/// Decodes a frame payload (tag + fields, no length prefix).
///
/// # Errors
/// Returns an error when the payload is malformed.
pub fn decode_payload(payload: &[u8]) -> CodecResult<Message> {
    let mut buf = payload;

    let tag = take_u8(&mut buf)?;
    let message = match tag {
        TAG_REQUEST_VOTE => Message::RequestVote(RequestVoteRequest {
            term: Term::new(take_u64(&mut buf)?),
            candidate: take_address(&mut buf)?,
            to: take_address(&mut buf)?,
            last_log_index: LogIndex::new(take_u64(&mut buf)?),
            last_log_term: Term::new(take_u64(&mut buf)?),
        }),
        TAG_REQUEST_VOTE_RESPONSE => Message::RequestVoteResponse(RequestVoteResponse {
            term: Term::new(take_u64(&mut buf)?),
            from: take_address(&mut buf)?,
            to: take_address(&mut buf)?,
            vote_granted: take_u8(&mut buf)? == 1,
        }),
        TAG_APPEND_ENTRIES => {
            let term = Term::new(take_u64(&mut buf)?);
            let leader = take_address(&mut buf)?;
            let to = take_address(&mut buf)?;
            let prev_log_index = LogIndex::new(take_u64(&mut buf)?);
            let prev_log_term = Term::new(take_u64(&mut buf)?);
            let leader_commit = LogIndex::new(take_u64(&mut buf)?);
            let count = take_u32(&mut buf)? as usize;

            let mut entries = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                let entry_term = Term::new(take_u64(&mut buf)?);
                let entry_index = LogIndex::new(take_u64(&mut buf)?);
                let command_len = take_u32(&mut buf)? as usize;
                let command = take_bytes(&mut buf, command_len)?;
                entries.push(LogEntry::new(entry_term, entry_index, command));
            }

            Message::AppendEntries(AppendEntriesRequest {
                term,
                leader,
                to,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            })
        }
        TAG_APPEND_ENTRIES_RESPONSE => Message::AppendEntriesResponse(AppendEntriesResponse {
            term: Term::new(take_u64(&mut buf)?),
            from: take_address(&mut buf)?,
            to: take_address(&mut buf)?,
            success: take_u8(&mut buf)? == 1,
            match_index: LogIndex::new(take_u64(&mut buf)?),
        }),
        tag => return Err(CodecError::UnknownTag { tag }),
    };

    Ok(message)
}

fn put_address(buf: &mut BytesMut, address: &Address) {
    let id = address.id().as_bytes();
    // Canonical ids are far below u16::MAX bytes.
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u16_le(id.len() as u16);
    buf.put_slice(id);
}

fn take_u8(buf: &mut &[u8]) -> CodecResult<u8> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

fn take_u32(buf: &mut &[u8]) -> CodecResult<u32> {
    ensure(buf, 4)?;
    Ok(buf.get_u32_le())
}

fn take_u64(buf: &mut &[u8]) -> CodecResult<u64> {
    ensure(buf, 8)?;
    Ok(buf.get_u64_le())
}

fn take_bytes(buf: &mut &[u8], len: usize) -> CodecResult<Bytes> {
    ensure(buf, len)?;
    Ok(buf.copy_to_bytes(len))
}

fn take_address(buf: &mut &[u8]) -> CodecResult<Address> {
    let len = {
        ensure(buf, 2)?;
        buf.get_u16_le() as usize
    };
    let raw = take_bytes(buf, len)?;
    let id = std::str::from_utf8(&raw)
        .map_err(|_| CodecError::InvalidAddress("not valid UTF-8".to_string()))?;
    Address::parse(id).map_err(|e| CodecError::InvalidAddress(e.to_string()))
}

fn ensure(buf: &[u8], need: usize) -> CodecResult<()> {
    if buf.remaining() < need {
        return Err(CodecError::Truncated {
            need,
            have: buf.remaining(),
        });
    }
    Ok(())
}
