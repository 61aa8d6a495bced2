//! Length-prefixed framing and the client/server wire formats (spec §4.1).
//!
//! Client -> Server (never compressed):
//! `ServiceId(2 LE) · MsgIdLen(1) · MsgId(N UTF-8) · MsgSeq(2 LE) · StageId(8 LE) · Payload(*)`
//!
//! Server -> Client (optionally LZ4):
//! `ServiceId(2 LE) · MsgIdLen(1) · MsgId(N) · MsgSeq(2 LE) · StageId(8 LE) · ErrorCode(2 LE) · OriginalSize(4 LE) · Body(*)`

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::errors::{PlayWireError, Result};
use crate::route::{RouteHeader, ServerNid, ServiceType};

pub const DEFAULT_MAX_PACKET_SIZE: usize = 2 * 1024 * 1024;
pub const LZ4_MIN_SIZE: usize = 512;
pub const LZ4_RATIO_GATE: f64 = 0.9;
pub const LENGTH_PREFIX_SIZE: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientFrame {
    pub service_id: u16,
    pub msg_id: String,
    pub msg_seq: u16,
    pub stage_id: i64,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerFrame {
    pub service_id: u16,
    pub msg_id: String,
    pub msg_seq: u16,
    pub stage_id: i64,
    pub error_code: u16,
    pub payload: Bytes,
}

fn write_msg_id(buf: &mut BytesMut, msg_id: &str) -> Result<()> {
    if msg_id.is_empty() {
        return Err(PlayWireError::EmptyMsgId);
    }
    if msg_id.len() > u8::MAX as usize {
        return Err(PlayWireError::MsgIdTooLong(msg_id.len()));
    }
    buf.put_u8(msg_id.len() as u8);
    buf.put_slice(msg_id.as_bytes());
    Ok(())
}

fn read_msg_id(buf: &mut Bytes) -> Result<String> {
    let len = buf.get_u8() as usize;
    if len == 0 {
        return Err(PlayWireError::EmptyMsgId);
    }
    if buf.remaining() < len {
        return Err(PlayWireError::PacketTooShort { need: len, got: buf.remaining() });
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| PlayWireError::InvalidMsgId)
}

pub fn encode_client_frame(frame: &ClientFrame) -> Result<Vec<u8>> {
    let mut buf = BytesMut::with_capacity(2 + 1 + frame.msg_id.len() + 2 + 8 + frame.payload.len());
    buf.put_u16_le(frame.service_id);
    write_msg_id(&mut buf, &frame.msg_id)?;
    buf.put_u16_le(frame.msg_seq);
    buf.put_i64_le(frame.stage_id);
    buf.put_slice(&frame.payload);
    Ok(buf.to_vec())
}

pub fn decode_client_frame(body: &[u8]) -> Result<ClientFrame> {
    let mut buf = Bytes::copy_from_slice(body);
    if buf.remaining() < 2 + 1 {
        return Err(PlayWireError::PacketTooShort { need: 3, got: buf.remaining() });
    }
    let service_id = buf.get_u16_le();
    let msg_id = read_msg_id(&mut buf)?;
    if buf.remaining() < 2 + 8 {
        return Err(PlayWireError::PacketTooShort { need: 10, got: buf.remaining() });
    }
    let msg_seq = buf.get_u16_le();
    let stage_id = buf.get_i64_le();
    let payload = buf;
    Ok(ClientFrame { service_id, msg_id, msg_seq, stage_id, payload })
}

/// Applies the LZ4 policy (spec §4.1/§8): compression is attempted only for
/// payloads over [`LZ4_MIN_SIZE`] bytes and kept only if it beats the
/// [`LZ4_RATIO_GATE`]. Returns `(original_size, body)`, where
/// `original_size == 0` means `body` is raw.
fn maybe_compress(raw: &[u8]) -> (u32, Vec<u8>) {
    if raw.len() <= LZ4_MIN_SIZE {
        return (0, raw.to_vec());
    }
    let compressed = lz4_flex::compress(raw);
    if (compressed.len() as f64) < (raw.len() as f64) * LZ4_RATIO_GATE {
        (raw.len() as u32, compressed)
    } else {
        (0, raw.to_vec())
    }
}

pub fn encode_server_frame(frame: &ServerFrame) -> Result<Vec<u8>> {
    let (original_size, body) = maybe_compress(&frame.payload);
    let mut buf = BytesMut::with_capacity(2 + 1 + frame.msg_id.len() + 2 + 8 + 2 + 4 + body.len());
    buf.put_u16_le(frame.service_id);
    write_msg_id(&mut buf, &frame.msg_id)?;
    buf.put_u16_le(frame.msg_seq);
    buf.put_i64_le(frame.stage_id);
    buf.put_u16_le(frame.error_code);
    buf.put_u32_le(original_size);
    buf.put_slice(&body);
    Ok(buf.to_vec())
}

pub fn decode_server_frame(body: &[u8]) -> Result<ServerFrame> {
    let mut buf = Bytes::copy_from_slice(body);
    if buf.remaining() < 2 + 1 {
        return Err(PlayWireError::PacketTooShort { need: 3, got: buf.remaining() });
    }
    let service_id = buf.get_u16_le();
    let msg_id = read_msg_id(&mut buf)?;
    if buf.remaining() < 2 + 8 + 2 + 4 {
        return Err(PlayWireError::PacketTooShort { need: 16, got: buf.remaining() });
    }
    let msg_seq = buf.get_u16_le();
    let stage_id = buf.get_i64_le();
    let error_code = buf.get_u16_le();
    let original_size = buf.get_u32_le();
    let payload = if original_size == 0 {
        buf
    } else {
        let decompressed = lz4_flex::decompress(&buf, original_size as usize)
            .map_err(|e| PlayWireError::DecompressionFailed(e.to_string()))?;
        Bytes::from(decompressed)
    };
    Ok(ServerFrame { service_id, msg_id, msg_seq, stage_id, error_code, payload })
}

/// Server <-> Server mesh frame (spec §4.5): carries the full `RouteHeader`
/// instead of the client-facing `ServiceId`/`MsgId`/`MsgSeq`/`StageId` subset,
/// since peers route purely on `RouteHeader` fields and never see a socket's
/// per-connection service context. Same LZ4 policy as [`ServerFrame`].
pub fn encode_mesh_frame(header: &RouteHeader, payload: &Bytes) -> Result<Vec<u8>> {
    let (original_size, body) = maybe_compress(payload);
    let mut buf = BytesMut::with_capacity(2 + 2 + 1 + header.msg_id.len() + 2 + 2 + 8 + 8 + 8 + 2 + 1 + 4 + body.len());
    buf.put_u16_le(header.msg_seq);
    buf.put_u16_le(header.service_id);
    write_msg_id(&mut buf, &header.msg_id)?;
    buf.put_u16_le(header.from.service_type as u16);
    buf.put_u16_le(header.from.server_id);
    buf.put_i64_le(header.stage_id);
    buf.put_i64_le(header.account_id);
    buf.put_i64_le(header.sid);
    buf.put_u16_le(header.error_code);
    buf.put_u8(header.is_reply as u8);
    buf.put_u32_le(original_size);
    buf.put_slice(&body);
    Ok(buf.to_vec())
}

pub fn decode_mesh_frame(body: &[u8]) -> Result<(RouteHeader, Bytes)> {
    let mut buf = Bytes::copy_from_slice(body);
    if buf.remaining() < 2 + 2 + 1 {
        return Err(PlayWireError::PacketTooShort { need: 5, got: buf.remaining() });
    }
    let msg_seq = buf.get_u16_le();
    let service_id = buf.get_u16_le();
    let msg_id = read_msg_id(&mut buf)?;
    if buf.remaining() < 2 + 2 + 8 + 8 + 8 + 2 + 1 + 4 {
        return Err(PlayWireError::PacketTooShort { need: 35, got: buf.remaining() });
    }
    let from_service_type_raw = buf.get_u16_le();
    let from_service_type = ServiceType::from_u16(from_service_type_raw)
        .ok_or_else(|| crate::errors::op_failed(format!("unknown service type in mesh frame: {from_service_type_raw}")))?;
    let from_server_id = buf.get_u16_le();
    let stage_id = buf.get_i64_le();
    let account_id = buf.get_i64_le();
    let sid = buf.get_i64_le();
    let error_code = buf.get_u16_le();
    let is_reply = buf.get_u8() != 0;
    let original_size = buf.get_u32_le();
    let payload = if original_size == 0 {
        buf
    } else {
        let decompressed = lz4_flex::decompress(&buf, original_size as usize)
            .map_err(|e| PlayWireError::DecompressionFailed(e.to_string()))?;
        Bytes::from(decompressed)
    };
    let header = RouteHeader {
        msg_seq,
        service_id,
        msg_id,
        from: ServerNid::new(from_service_type, from_server_id),
        stage_id,
        account_id,
        sid,
        error_code,
        is_reply,
    };
    Ok((header, payload))
}

/// Prepends the 4-byte little-endian body-length prefix used on TCP.
pub fn frame_with_length_prefix(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(body);
    out
}

/// Drains every fully-buffered length-prefixed frame out of `buf`, leaving
/// any partial trailing data in place for the next read. A declared length
/// exceeding `max_packet_size` is a hard framing error (spec §4.1).
pub fn split_frames(buf: &mut BytesMut, max_packet_size: usize) -> Result<Vec<Bytes>> {
    let mut frames = Vec::new();
    loop {
        if buf.len() < LENGTH_PREFIX_SIZE {
            break;
        }
        let len = u32::from_le_bytes(buf[..LENGTH_PREFIX_SIZE].try_into().unwrap()) as usize;
        if len > max_packet_size {
            return Err(PlayWireError::PacketTooLarge { size: len, max: max_packet_size });
        }
        if buf.len() < LENGTH_PREFIX_SIZE + len {
            break;
        }
        buf.advance(LENGTH_PREFIX_SIZE);
        frames.push(buf.split_to(len).freeze());
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frame_roundtrips() {
        let frame = ClientFrame {
            service_id: 1,
            msg_id: "EchoRequest".into(),
            msg_seq: 7,
            stage_id: 1001,
            payload: Bytes::from_static(b"hello"),
        };
        let encoded = encode_client_frame(&frame).unwrap();
        let decoded = decode_client_frame(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn server_frame_roundtrips_small_payload_uncompressed() {
        let frame = ServerFrame {
            service_id: 1,
            msg_id: "EchoReply".into(),
            msg_seq: 7,
            stage_id: 1001,
            error_code: 0,
            payload: Bytes::from_static(b"hello"),
        };
        let encoded = encode_server_frame(&frame).unwrap();
        // original_size field must be 0 for small payloads
        assert_eq!(u32::from_le_bytes(encoded[encoded.len() - frame.payload.len() - 4..encoded.len() - frame.payload.len()].try_into().unwrap()), 0);
        let decoded = decode_server_frame(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn server_frame_compresses_large_compressible_payload() {
        let raw = vec![7u8; 4096];
        let frame = ServerFrame {
            service_id: 1,
            msg_id: "Bulk".into(),
            msg_seq: 9,
            stage_id: 1,
            error_code: 0,
            payload: Bytes::from(raw.clone()),
        };
        let encoded = encode_server_frame(&frame).unwrap();
        assert!(encoded.len() < raw.len());
        let decoded = decode_server_frame(&encoded).unwrap();
        assert_eq!(decoded.payload.as_ref(), raw.as_slice());
    }

    #[test]
    fn empty_msg_id_is_rejected() {
        let frame = ClientFrame { service_id: 1, msg_id: "".into(), msg_seq: 1, stage_id: 1, payload: Bytes::new() };
        assert!(matches!(encode_client_frame(&frame), Err(PlayWireError::EmptyMsgId)));
    }

    #[test]
    fn split_frames_leaves_partial_trailing_data() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&frame_with_length_prefix(b"abc"));
        buf.extend_from_slice(&frame_with_length_prefix(b"defgh"));
        buf.extend_from_slice(&3u32.to_le_bytes()); // partial third frame header only
        let frames = split_frames(&mut buf, DEFAULT_MAX_PACKET_SIZE).unwrap();
        assert_eq!(frames, vec![Bytes::from_static(b"abc"), Bytes::from_static(b"defgh")]);
        assert_eq!(buf.len(), 4); // the dangling length prefix remains buffered
    }

    #[test]
    fn mesh_frame_roundtrips() {
        let header = RouteHeader {
            msg_seq: 42,
            service_id: 3,
            msg_id: "JoinStage".into(),
            from: ServerNid::new(ServiceType::Play, 7),
            stage_id: 1001,
            account_id: 55,
            sid: 2,
            error_code: 0,
            is_reply: false,
        };
        let payload = Bytes::from_static(b"hello mesh");
        let encoded = encode_mesh_frame(&header, &payload).unwrap();
        let (decoded_header, decoded_payload) = decode_mesh_frame(&encoded).unwrap();
        assert_eq!(decoded_header.msg_seq, header.msg_seq);
        assert_eq!(decoded_header.msg_id, header.msg_id);
        assert_eq!(decoded_header.from, header.from);
        assert_eq!(decoded_header.stage_id, header.stage_id);
        assert_eq!(decoded_payload, payload);
    }

    #[test]
    fn mesh_frame_compresses_large_payload() {
        let header = RouteHeader {
            msg_seq: 0,
            service_id: 0,
            msg_id: "Bulk".into(),
            from: ServerNid::new(ServiceType::Api, 1),
            stage_id: 0,
            account_id: 0,
            sid: 0,
            error_code: 0,
            is_reply: true,
        };
        let raw = vec![9u8; 4096];
        let encoded = encode_mesh_frame(&header, &Bytes::from(raw.clone())).unwrap();
        assert!(encoded.len() < raw.len());
        let (_, decoded_payload) = decode_mesh_frame(&encoded).unwrap();
        assert_eq!(decoded_payload.as_ref(), raw.as_slice());
    }

    #[test]
    fn split_frames_rejects_oversize_declaration() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&100u32.to_le_bytes());
        buf.extend_from_slice(&[0u8; 10]);
        assert!(matches!(split_frames(&mut buf, 50), Err(PlayWireError::PacketTooLarge { .. })));
    }
}
