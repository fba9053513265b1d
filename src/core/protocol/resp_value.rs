// src/core/protocol/resp_value.rs

//! Defines a simplified value type handed to callers of the cluster client.

use super::RespFrame;
use bytes::Bytes;

/// `RespValue` is a simplified version of `RespFrame`.
///
/// It's used as the result type of command execution. The caller shouldn't
/// need to worry about the full complexity of the RESP protocol; replies are
/// converted into this shape after redirection handling is done.
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    SimpleString(String),
    BulkString(Bytes),
    Integer(i64),
    Array(Vec<RespValue>),
    Null,
    NullArray,
    /// An error reply nested inside an array (e.g. a transaction result).
    /// Top-level error replies never reach the caller as a `RespValue`.
    Error(String),
}

impl RespValue {
    /// The conventional `+OK` reply.
    pub fn ok() -> Self {
        RespValue::SimpleString("OK".to_string())
    }

    /// Returns the value as a UTF-8 string, for simple and bulk strings.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RespValue::SimpleString(s) => Some(s),
            RespValue::BulkString(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Returns the raw bytes of a bulk string reply.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespValue::BulkString(b) => Some(b),
            RespValue::SimpleString(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Returns the value as an integer, if it is one.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            RespValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Whether the reply is a null (absent key) reply.
    pub fn is_nil(&self) -> bool {
        matches!(self, RespValue::Null | RespValue::NullArray)
    }

    /// Consumes an array reply into its elements; a non-array yields a
    /// single-element vector.
    pub fn into_vec(self) -> Vec<RespValue> {
        match self {
            RespValue::Array(items) => items,
            RespValue::NullArray => Vec::new(),
            other => vec![other],
        }
    }
}

/// Implements the conversion from the wire-protocol `RespFrame` into the
/// caller-facing `RespValue`.
impl From<RespFrame> for RespValue {
    fn from(frame: RespFrame) -> Self {
        match frame {
            RespFrame::SimpleString(s) => RespValue::SimpleString(s),
            RespFrame::Error(s) => RespValue::Error(s),
            RespFrame::Integer(i) => RespValue::Integer(i),
            RespFrame::BulkString(b) => RespValue::BulkString(b),
            RespFrame::Null => RespValue::Null,
            RespFrame::NullArray => RespValue::NullArray,
            // Recursively convert elements of an array.
            RespFrame::Array(arr) => {
                RespValue::Array(arr.into_iter().map(Into::into).collect())
            }
        }
    }
}
