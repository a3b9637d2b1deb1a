//! Wire codec for the resql client protocol.
//!
//! Every message is one length-prefixed frame:
//!
//! ```text
//! ┌──────────┬────────┬───────────────────────────┐
//! │ len      │ tag    │ body                      │
//! │ u32 LE   │ u8     │ tag-specific              │
//! └──────────┴────────┴───────────────────────────┘
//! ```
//!
//! `len` counts the entire frame including the length field itself, so a
//! receiver can detect a complete frame without parsing its body. All
//! integers are little-endian. The encode functions here are stateless
//! and operate on [`FrameBuffer`]s.

use std::fmt;

use crate::error::Result;
use crate::protocol::buffer::FrameBuffer;
use crate::value::Value;

/// Size of the frame length field.
pub const MSG_LEN_SIZE: usize = 4;

/// Reserved size of the batch request header: `len:u32, tag:u8,
/// readonly:bool, seq:u64`. Written last, once the body length is known.
pub const CLIENT_REQ_HEADER: usize = 14;

/// Magic string sent in the connect request.
pub const PROTO_MAGIC: &str = "resql";

/// Remote type field of the connect request: a client, not a node.
pub const REMOTE_CLIENT: u32 = 0;

/// Message tags.
pub mod tag {
    pub const CONNECT_REQ: u8 = 0;
    pub const CONNECT_RESP: u8 = 1;
    pub const DISCONNECT_REQ: u8 = 2;
    pub const DISCONNECT_RESP: u8 = 3;
    pub const CLIENT_REQ: u8 = 4;
    pub const CLIENT_RESP: u8 = 5;
}

/// Flags structuring the body of batch requests and responses.
pub mod flag {
    pub const OK: u8 = 0;
    pub const ERROR: u8 = 1;
    pub const STMT: u8 = 2;
    pub const STMT_ID: u8 = 3;
    pub const STMT_PREPARE: u8 = 4;
    pub const STMT_DEL_PREPARED: u8 = 5;
    pub const OP: u8 = 6;
    pub const OP_END: u8 = 7;
    pub const ROW: u8 = 8;
    pub const MSG_END: u8 = 9;
}

/// Bind markers preceding each parameter binding.
pub mod bind {
    pub const NAME: u8 = 0;
    pub const INDEX: u8 = 1;
    pub const END: u8 = 2;
}

/// Typed value tags.
pub mod param {
    pub const INTEGER: u8 = 0;
    pub const FLOAT: u8 = 1;
    pub const TEXT: u8 = 2;
    pub const BLOB: u8 = 3;
    pub const NULL: u8 = 4;
}

/// Response code of a connect response or disconnect request.
///
/// Codes this client does not know are preserved as `Unknown` and treated
/// as retryable, so a newer server cannot wedge an older client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    Ok,
    Err,
    ClusterNameMismatch,
    Corrupt,
    Unexpected,
    Timeout,
    NotLeader,
    DiskFull,
    Unknown(u8),
}

impl ResponseCode {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => ResponseCode::Ok,
            1 => ResponseCode::Err,
            2 => ResponseCode::ClusterNameMismatch,
            3 => ResponseCode::Corrupt,
            4 => ResponseCode::Unexpected,
            5 => ResponseCode::Timeout,
            6 => ResponseCode::NotLeader,
            7 => ResponseCode::DiskFull,
            other => ResponseCode::Unknown(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            ResponseCode::Ok => 0,
            ResponseCode::Err => 1,
            ResponseCode::ClusterNameMismatch => 2,
            ResponseCode::Corrupt => 3,
            ResponseCode::Unexpected => 4,
            ResponseCode::Timeout => 5,
            ResponseCode::NotLeader => 6,
            ResponseCode::DiskFull => 7,
            ResponseCode::Unknown(v) => v,
        }
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseCode::Ok => write!(f, "ok"),
            ResponseCode::Err => write!(f, "err"),
            ResponseCode::ClusterNameMismatch => write!(f, "cluster name mismatch"),
            ResponseCode::Corrupt => write!(f, "corrupt"),
            ResponseCode::Unexpected => write!(f, "unexpected"),
            ResponseCode::Timeout => write!(f, "timeout"),
            ResponseCode::NotLeader => write!(f, "not leader"),
            ResponseCode::DiskFull => write!(f, "disk is full"),
            ResponseCode::Unknown(v) => write!(f, "unknown rc {}", v),
        }
    }
}

/// Wire size of an encoded string, for precomputed frame lengths.
fn str_len(s: &str) -> usize {
    MSG_LEN_SIZE + s.len() + 1
}

/// Encode a connect request and flip the buffer ready for sending.
pub fn encode_connect_req(buf: &mut FrameBuffer, cluster_name: &str, client_name: &str) {
    let len = MSG_LEN_SIZE
        + 1 // tag
        + 4 // remote type
        + str_len(PROTO_MAGIC)
        + str_len(cluster_name)
        + str_len(client_name);

    buf.put_u32(len as u32);
    buf.put_u8(tag::CONNECT_REQ);
    buf.put_u32(REMOTE_CLIENT);
    buf.put_str(Some(PROTO_MAGIC));
    buf.put_str(Some(cluster_name));
    buf.put_str(Some(client_name));
    buf.flip();
}

/// Encode a disconnect request and flip the buffer ready for sending.
pub fn encode_disconnect_req(buf: &mut FrameBuffer, rc: u8, flags: u32) {
    let len = MSG_LEN_SIZE + 1 + 1 + 4;

    buf.put_u32(len as u32);
    buf.put_u8(tag::DISCONNECT_REQ);
    buf.put_u8(rc);
    buf.put_u32(flags);
    buf.flip();
}

/// Skip the batch request header so operations can be encoded first.
pub fn reserve_client_req_header(buf: &mut FrameBuffer) {
    buf.set_position(CLIENT_REQ_HEADER);
}

/// Patch the reserved batch request header in place with the true frame
/// length, tag, readonly flag and sequence number.
pub fn finish_client_req(buf: &mut FrameBuffer, readonly: bool, seq: u64) {
    buf.patch_u32_at(0, buf.position() as u32);
    buf.patch_u8_at(4, tag::CLIENT_REQ);
    buf.patch_bool_at(5, readonly);
    buf.patch_u64_at(6, seq);
}

/// Encode one typed bind value.
pub fn put_value(buf: &mut FrameBuffer, value: &Value) {
    match value {
        Value::Null => buf.put_u8(param::NULL),
        Value::Integer(v) => {
            buf.put_u8(param::INTEGER);
            buf.put_i64(*v);
        }
        Value::Float(v) => {
            buf.put_u8(param::FLOAT);
            buf.put_f64(*v);
        }
        Value::Text(v) => {
            buf.put_u8(param::TEXT);
            buf.put_str(Some(v));
        }
        Value::Blob(v) => {
            buf.put_u8(param::BLOB);
            buf.put_blob(v);
        }
    }
}

/// Decode one typed column value. A null text marker decodes to `Null`.
pub fn get_value(buf: &mut FrameBuffer) -> Result<Value> {
    match buf.get_u8()? {
        param::INTEGER => Ok(Value::Integer(buf.get_i64()?)),
        param::FLOAT => Ok(Value::Float(buf.get_f64()?)),
        param::TEXT => Ok(buf.get_str()?.map(Value::Text).unwrap_or(Value::Null)),
        param::BLOB => Ok(Value::Blob(buf.get_blob()?)),
        param::NULL => Ok(Value::Null),
        other => Err(crate::error::Error::Corrupt(format!(
            "unknown column type tag: {}",
            other
        ))),
    }
}

/// Declared length of the frame starting at `bytes`, once the length
/// field itself has arrived.
pub fn declared_len(bytes: &[u8]) -> Option<usize> {
    if bytes.len() < MSG_LEN_SIZE {
        return None;
    }
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_req_layout() {
        let mut buf = FrameBuffer::with_capacity(128);
        encode_connect_req(&mut buf, "cluster", "c1");

        let expected_len = 4 + 1 + 4 + (4 + 5 + 1) + (4 + 7 + 1) + (4 + 2 + 1);
        assert_eq!(buf.remaining(), expected_len);

        assert_eq!(buf.get_u32().unwrap() as usize, expected_len);
        assert_eq!(buf.get_u8().unwrap(), tag::CONNECT_REQ);
        assert_eq!(buf.get_u32().unwrap(), REMOTE_CLIENT);
        assert_eq!(buf.get_str().unwrap().as_deref(), Some("resql"));
        assert_eq!(buf.get_str().unwrap().as_deref(), Some("cluster"));
        assert_eq!(buf.get_str().unwrap().as_deref(), Some("c1"));
        assert!(!buf.has_remaining());
    }

    #[test]
    fn test_disconnect_req_layout() {
        let mut buf = FrameBuffer::with_capacity(32);
        encode_disconnect_req(&mut buf, 0, 0);

        assert_eq!(buf.get_u32().unwrap(), 10);
        assert_eq!(buf.get_u8().unwrap(), tag::DISCONNECT_REQ);
        assert_eq!(buf.get_u8().unwrap(), 0);
        assert_eq!(buf.get_u32().unwrap(), 0);
        assert!(!buf.has_remaining());
    }

    #[test]
    fn test_client_req_header_patch() {
        let mut buf = FrameBuffer::with_capacity(64);
        reserve_client_req_header(&mut buf);
        buf.put_u8(flag::OP);
        buf.put_u8(flag::MSG_END);
        finish_client_req(&mut buf, true, 42);
        buf.flip();

        assert_eq!(buf.get_u32().unwrap(), CLIENT_REQ_HEADER as u32 + 2);
        assert_eq!(buf.get_u8().unwrap(), tag::CLIENT_REQ);
        assert!(buf.get_bool().unwrap());
        assert_eq!(buf.get_u64().unwrap(), 42);
        assert_eq!(buf.get_u8().unwrap(), flag::OP);
        assert_eq!(buf.get_u8().unwrap(), flag::MSG_END);
    }

    #[test]
    fn test_value_round_trip() {
        let values = [
            Value::Null,
            Value::Integer(-9),
            Value::Float(2.75),
            Value::Text("çüö 字".into()),
            Value::Blob(vec![0, 1, 254, 255]),
        ];

        let mut buf = FrameBuffer::with_capacity(128);
        for v in &values {
            put_value(&mut buf, v);
        }
        buf.flip();
        for v in &values {
            assert_eq!(&get_value(&mut buf).unwrap(), v);
        }
        assert!(!buf.has_remaining());
    }

    #[test]
    fn test_response_code_mapping() {
        for v in 0u8..8 {
            assert_eq!(ResponseCode::from_u8(v).as_u8(), v);
        }
        assert_eq!(ResponseCode::from_u8(200), ResponseCode::Unknown(200));
        assert_eq!(
            ResponseCode::ClusterNameMismatch.to_string(),
            "cluster name mismatch"
        );
    }

    #[test]
    fn test_declared_len() {
        assert_eq!(declared_len(&[1, 2, 3]), None);
        assert_eq!(declared_len(&[16, 0, 0, 0, 9]), Some(16));
    }
}
