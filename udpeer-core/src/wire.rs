//! Framing: one message per datagram, `KEYWORD field field ... last-field`, ASCII text.
//!
//! Decoding splits the body on the first N-1 spaces, where N is the field count of the
//! keyword, so the last field keeps any spaces it carries (TALK text, NACK reason).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::protocol::{Message, MAX_DATAGRAM_LEN};

const KEYWORDS: [&str; 7] = ["HEARTBEAT", "TALK", "FILE", "CHUNK", "END", "ACK", "NACK"];

/// Header written in front of every CHUNK payload, trailing space included.
pub fn chunk_header(id: &str, seq: u32) -> String {
    format!("CHUNK {} {} ", id, seq)
}

/// Encode a message into a single datagram.
pub fn encode(msg: &Message) -> Result<Vec<u8>, EncodeError> {
    let line = match msg {
        Message::Heartbeat { name } => {
            token("name", name)?;
            format!("HEARTBEAT {}", name)
        }
        Message::Talk { id, text } => {
            token("id", id)?;
            format!("TALK {} {}", id, text)
        }
        Message::File {
            id,
            file_name,
            size,
        } => {
            token("id", id)?;
            token("file name", file_name)?;
            format!("FILE {} {} {}", id, file_name, size)
        }
        Message::Chunk { id, seq, data } => {
            token("id", id)?;
            let mut line = chunk_header(id, *seq);
            line.push_str(&BASE64.encode(data));
            line
        }
        Message::End { id, fingerprint } => {
            token("id", id)?;
            token("fingerprint", fingerprint)?;
            format!("END {} {}", id, fingerprint)
        }
        Message::Ack { id } => {
            token("id", id)?;
            format!("ACK {}", id)
        }
        Message::Nack { id, reason } => {
            token("id", id)?;
            format!("NACK {} {}", id, reason)
        }
    };
    if line.len() > MAX_DATAGRAM_LEN {
        return Err(EncodeError::TooLarge { len: line.len() });
    }
    Ok(line.into_bytes())
}

fn token(field: &'static str, value: &str) -> Result<(), EncodeError> {
    if value.is_empty() {
        return Err(EncodeError::EmptyField(field));
    }
    if value.chars().any(char::is_whitespace) {
        return Err(EncodeError::FieldHasSpace(field));
    }
    Ok(())
}

/// Error encoding a message (bad field or datagram size limit).
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("{0} must not be empty")]
    EmptyField(&'static str),
    #[error("{0} must not contain spaces")]
    FieldHasSpace(&'static str),
    #[error("datagram too large ({len} bytes)")]
    TooLarge { len: usize },
}

/// Decode one datagram. Any error means the datagram is malformed and should be dropped.
pub fn decode(bytes: &[u8]) -> Result<Message, DecodeError> {
    let text = std::str::from_utf8(bytes).map_err(|_| DecodeError::NotUtf8)?;
    let text = text.trim_end_matches(['\r', '\n']);
    if text.is_empty() {
        return Err(DecodeError::Empty);
    }
    let (raw, body) = text.split_once(' ').unwrap_or((text, ""));
    let keyword = KEYWORDS
        .iter()
        .copied()
        .find(|k| *k == raw)
        .ok_or_else(|| DecodeError::UnknownKeyword(raw.to_string()))?;

    let msg = match keyword {
        "HEARTBEAT" => {
            let [name] = fields::<1>(keyword, body)?;
            Message::Heartbeat {
                name: last_token(keyword, "name", name)?,
            }
        }
        "TALK" => {
            let [id, text] = fields::<2>(keyword, body)?;
            Message::Talk {
                id: id.to_string(),
                text: text.to_string(),
            }
        }
        "FILE" => {
            let [id, file_name, size] = fields::<3>(keyword, body)?;
            let size = last_token(keyword, "size", size)?
                .parse()
                .map_err(|_| DecodeError::InvalidField { keyword, field: "size" })?;
            Message::File {
                id: id.to_string(),
                file_name: file_name.to_string(),
                size,
            }
        }
        "CHUNK" => {
            let [id, seq, payload] = fields::<3>(keyword, body)?;
            let seq = seq
                .parse()
                .map_err(|_| DecodeError::InvalidField { keyword, field: "seq" })?;
            Message::Chunk {
                id: id.to_string(),
                seq,
                data: BASE64.decode(payload)?,
            }
        }
        "END" => {
            let [id, fingerprint] = fields::<2>(keyword, body)?;
            Message::End {
                id: id.to_string(),
                fingerprint: last_token(keyword, "fingerprint", fingerprint)?,
            }
        }
        "ACK" => {
            let [id] = fields::<1>(keyword, body)?;
            Message::Ack {
                id: last_token(keyword, "id", id)?,
            }
        }
        "NACK" => {
            let [id, reason] = fields::<2>(keyword, body)?;
            Message::Nack {
                id: id.to_string(),
                reason: reason.to_string(),
            }
        }
        other => return Err(DecodeError::UnknownKeyword(other.to_string())),
    };
    Ok(msg)
}

/// Split `body` into exactly N fields; all but the last must be non-empty.
fn fields<'a, const N: usize>(
    keyword: &'static str,
    body: &'a str,
) -> Result<[&'a str; N], DecodeError> {
    let parts: Vec<&str> = body.splitn(N, ' ').collect();
    let found = parts.iter().filter(|p| !p.is_empty()).count();
    let missing = || DecodeError::MissingFields {
        keyword,
        expected: N,
        found,
    };
    let out: [&str; N] = parts.try_into().map_err(|_| missing())?;
    if out[..N - 1].iter().any(|f| f.is_empty()) {
        return Err(missing());
    }
    Ok(out)
}

/// A last field that is a single token: non-empty and free of spaces.
fn last_token(
    keyword: &'static str,
    field: &'static str,
    value: &str,
) -> Result<String, DecodeError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(DecodeError::MissingFields {
            keyword,
            expected: 1,
            found: 0,
        });
    }
    if value.contains(' ') {
        return Err(DecodeError::InvalidField { keyword, field });
    }
    Ok(value.to_string())
}

/// Error decoding a datagram; the caller logs and drops it.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("datagram is not valid UTF-8")]
    NotUtf8,
    #[error("empty datagram")]
    Empty,
    #[error("unknown message type {0:?}")]
    UnknownKeyword(String),
    #[error("{keyword} needs {expected} fields, found {found}")]
    MissingFields {
        keyword: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("{keyword} has an invalid {field}")]
    InvalidField {
        keyword: &'static str,
        field: &'static str,
    },
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}
