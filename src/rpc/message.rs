//! The RPC wire envelope (spec §4.H, §6 "RPC wire protocol"):
//! `(u32 request_id, String function_name, Vec<u8> args_blob)` requests and
//! `(u32 request_id, u8 status, Vec<u8> return_blob)` replies, each frame
//! ZSTD-compressed end to end.
//!
//! Grounded on `original_source/src/distributed/rpc.h`'s request/reply
//! struct layout; argument/return payloads are `prost`-encoded protobuf
//! messages (teacher's serialization crate) rather than the original's
//! bespoke binary format (SPEC_FULL §4.H).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{CoreError, Result};

/// Reply status byte (spec §4.H, §6): `0x00` ok, `0xfe` remote exception,
/// `0xff` unknown function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    RemoteException,
    UnknownFunction,
}

impl Status {
    pub fn to_byte(self) -> u8 {
        match self {
            Status::Ok => 0x00,
            Status::RemoteException => 0xfe,
            Status::UnknownFunction => 0xff,
        }
    }

    pub fn from_byte(b: u8) -> Result<Self> {
        match b {
            0x00 => Ok(Status::Ok),
            0xfe => Ok(Status::RemoteException),
            0xff => Ok(Status::UnknownFunction),
            other => Err(CoreError::Remote(format!("unrecognized RPC status byte {other:#x}"))),
        }
    }
}

/// One outgoing call (spec §4.H "request = (u32 id, string funcname, args...)").
#[derive(Debug, Clone)]
pub struct Request {
    pub id: u32,
    pub function: String,
    pub args: Vec<u8>,
}

/// One incoming reply (spec §4.H "reply = (u32 id, u8 status, return_value...)").
#[derive(Debug, Clone)]
pub struct Reply {
    pub id: u32,
    pub status: Status,
    pub payload: Vec<u8>,
}

/// Encodes a request into an uncompressed frame body: `id`, then a
/// length-prefixed function name, then the raw args blob. The caller
/// (transport layer) is responsible for ZSTD-compressing the whole frame
/// before handing it to the length-delimited codec (spec §4.H: "each
/// message ZSTD-compressed").
pub fn encode_request(req: &Request) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + 4 + req.function.len() + req.args.len());
    buf.put_u32(req.id);
    buf.put_u32(req.function.len() as u32);
    buf.put_slice(req.function.as_bytes());
    buf.put_slice(&req.args);
    buf.freeze()
}

pub fn decode_request(mut bytes: Bytes) -> Result<Request> {
    if bytes.len() < 8 {
        return Err(CoreError::Remote("truncated RPC request frame".to_string()));
    }
    let id = bytes.get_u32();
    let name_len = bytes.get_u32() as usize;
    if bytes.len() < name_len {
        return Err(CoreError::Remote("truncated RPC request function name".to_string()));
    }
    let function = String::from_utf8(bytes.split_to(name_len).to_vec())
        .map_err(|e| CoreError::Remote(format!("non-utf8 function name: {e}")))?;
    let args = bytes.to_vec();
    Ok(Request { id, function, args })
}

pub fn encode_reply(reply: &Reply) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + reply.payload.len());
    buf.put_u32(reply.id);
    buf.put_u8(reply.status.to_byte());
    buf.put_slice(&reply.payload);
    buf.freeze()
}

pub fn decode_reply(mut bytes: Bytes) -> Result<Reply> {
    if bytes.len() < 5 {
        return Err(CoreError::Remote("truncated RPC reply frame".to_string()));
    }
    let id = bytes.get_u32();
    let status = Status::from_byte(bytes.get_u8())?;
    Ok(Reply { id, status, payload: bytes.to_vec() })
}

/// Compresses a frame body with ZSTD before it goes on the wire (spec
/// §4.H, grounded on `original_source/src/distributed/rpc.h`'s
/// `compress()`).
pub fn compress_frame(body: &[u8]) -> Result<Vec<u8>> {
    zstd::stream::encode_all(body, 0).map_err(|e| CoreError::Compression(e.to_string()))
}

pub fn decompress_frame(body: &[u8]) -> Result<Vec<u8>> {
    zstd::stream::decode_all(body).map_err(|e| CoreError::Compression(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips() {
        let req = Request { id: 7, function: "requestModel".to_string(), args: vec![1, 2, 3] };
        let encoded = encode_request(&req);
        let decoded = decode_request(encoded).unwrap();
        assert_eq!(decoded.id, 7);
        assert_eq!(decoded.function, "requestModel");
        assert_eq!(decoded.args, vec![1, 2, 3]);
    }

    #[test]
    fn reply_round_trips() {
        let reply = Reply { id: 9, status: Status::RemoteException, payload: vec![9, 9] };
        let encoded = encode_reply(&reply);
        let decoded = decode_reply(encoded).unwrap();
        assert_eq!(decoded.id, 9);
        assert_eq!(decoded.status, Status::RemoteException);
        assert_eq!(decoded.payload, vec![9, 9]);
    }

    #[test]
    fn compression_round_trips() {
        let body = b"hello rpc world".repeat(64);
        let compressed = compress_frame(&body).unwrap();
        let decompressed = decompress_frame(&compressed).unwrap();
        assert_eq!(decompressed, body);
    }

    #[test]
    fn unknown_status_byte_is_rejected() {
        let err = Status::from_byte(0x7a).unwrap_err();
        assert_matches::assert_matches!(err, CoreError::Remote(_));
    }
}
