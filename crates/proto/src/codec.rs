//! Length-prefixed framing and the optional per-frame compression envelope.
//!
//! A frame on the wire is `varint(payload_len) ++ payload`. Once the peer
//! has announced a compression threshold, every payload is additionally
//! wrapped as `varint(uncompressed_len) ++ data`, where a zero length means
//! the data is stored raw and a non-zero length means zlib-compressed data
//! that must inflate to exactly that many bytes.

use std::io::{Cursor, Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::{ProtoError, Result};

/// Hard cap on a single frame payload. The wire format itself allows up to
/// 2^35-1; anything past a few MiB is a broken or hostile peer.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// A length varint never legitimately needs more than 5 groups for 32 bits.
pub const MAX_VARINT_BYTES: usize = 5;

/// Protocol-level cap on string fields.
pub const MAX_STRING_LEN: usize = 32767;

/// Reads a varint out of a cursor over a complete payload.
pub fn read_varint(cursor: &mut Cursor<&[u8]>) -> Result<i32> {
    let mut value: u32 = 0;
    for shift in 0..MAX_VARINT_BYTES {
        let mut byte = [0u8; 1];
        cursor
            .read_exact(&mut byte)
            .map_err(|_| ProtoError::Framing("truncated varint".to_string()))?;
        value |= u32::from(byte[0] & 0x7f) << (7 * shift);
        if byte[0] & 0x80 == 0 {
            return Ok(value as i32);
        }
    }
    Err(ProtoError::Framing(
        "varint exceeds 5 bytes".to_string(),
    ))
}

pub fn write_varint(out: &mut Vec<u8>, value: i32) {
    let mut v = value as u32;
    loop {
        if v & !0x7f == 0 {
            out.push(v as u8);
            return;
        }
        out.push((v as u8 & 0x7f) | 0x80);
        v >>= 7;
    }
}

/// Reads a varint-length-prefixed UTF-8 string.
pub fn read_string(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    let len = read_varint(cursor)?;
    if len < 0 || len as usize > MAX_STRING_LEN {
        return Err(ProtoError::Framing(format!("string length {len} out of range")));
    }
    let mut buf = vec![0u8; len as usize];
    cursor
        .read_exact(&mut buf)
        .map_err(|_| ProtoError::Framing("truncated string".to_string()))?;
    String::from_utf8(buf).map_err(|_| ProtoError::Framing("string is not UTF-8".to_string()))
}

pub fn write_string(out: &mut Vec<u8>, value: &str) {
    write_varint(out, value.len() as i32);
    out.extend_from_slice(value.as_bytes());
}

/// Attempts to locate one complete frame at the start of `buf`.
///
/// Returns `(header_len, payload_len)` when the whole frame is buffered,
/// `None` while the length varint or the payload is still incomplete, and
/// an error for a varint longer than 5 bytes or a payload over the cap.
/// Partial input never yields a frame.
pub fn next_frame(buf: &[u8]) -> Result<Option<(usize, usize)>> {
    let mut value: u32 = 0;
    for i in 0..MAX_VARINT_BYTES {
        let Some(&byte) = buf.get(i) else {
            return Ok(None);
        };
        value |= u32::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            let header = i + 1;
            let len = value as i32;
            if len < 0 || len as usize > MAX_FRAME_LEN {
                return Err(ProtoError::Framing(format!(
                    "frame length {len} out of range"
                )));
            }
            let len = len as usize;
            if buf.len() < header + len {
                return Ok(None);
            }
            return Ok(Some((header, len)));
        }
    }
    Err(ProtoError::Framing(
        "frame length varint exceeds 5 bytes".to_string(),
    ))
}

fn zlib_compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2 + 16), Compression::default());
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map_err(|err| ProtoError::Framing(format!("zlib encode: {err}")))
}

fn zlib_decompress(data: &[u8], expected: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(expected);
    let mut decoder = ZlibDecoder::new(data);
    (&mut decoder)
        .take(expected as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|err| ProtoError::Framing(format!("zlib decode: {err}")))?;
    if out.len() != expected {
        return Err(ProtoError::Framing(format!(
            "declared uncompressed length {} but inflated {} bytes",
            expected,
            out.len()
        )));
    }
    Ok(out)
}

/// Strips the compression envelope off a frame payload.
pub fn unwrap_compressed(payload: &[u8]) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(payload);
    let uclen = read_varint(&mut cursor)?;
    let rest = &payload[cursor.position() as usize..];
    if uclen == 0 {
        return Ok(rest.to_vec());
    }
    if uclen < 0 || uclen as usize > MAX_FRAME_LEN {
        return Err(ProtoError::Framing(format!(
            "declared uncompressed length {uclen} out of range"
        )));
    }
    zlib_decompress(rest, uclen as usize)
}

/// Wraps a packet body in the compression envelope according to `threshold`.
///
/// An empty body always takes the raw branch: its declared length would be
/// the `0` sentinel that means "stored raw", so compressing it cannot be
/// represented on the wire.
pub fn wrap_body(body: &[u8], threshold: i32) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(body.len() + 6);
    if !body.is_empty() && body.len() as i32 >= threshold {
        write_varint(&mut out, body.len() as i32);
        out.extend_from_slice(&zlib_compress(body)?);
    } else {
        write_varint(&mut out, 0);
        out.extend_from_slice(body);
    }
    Ok(out)
}

/// Frames a packet body for transmission, applying the compression envelope
/// when `comptr` is non-negative.
pub fn write_frame(body: &[u8], comptr: i32, out: &mut Vec<u8>) -> Result<()> {
    if body.len() > MAX_FRAME_LEN {
        return Err(ProtoError::Framing(format!(
            "packet body of {} bytes exceeds frame cap",
            body.len()
        )));
    }
    if comptr >= 0 {
        let envelope = wrap_body(body, comptr)?;
        write_varint(out, envelope.len() as i32);
        out.extend_from_slice(&envelope);
    } else {
        write_varint(out, body.len() as i32);
        out.extend_from_slice(body);
    }
    Ok(())
}

/// Re-emits an already-enveloped payload verbatim under a fresh length prefix.
pub fn write_frame_raw(payload: &[u8], out: &mut Vec<u8>) {
    write_varint(out, payload.len() as i32);
    out.extend_from_slice(payload);
}

/// The login-phase transitional framing: a zero uncompressed-length marker
/// followed by the plaintext body, without attempting compression. Used for
/// the handshake packets that cross the compression toggle.
pub fn write_frame_plain_marked(body: &[u8], out: &mut Vec<u8>) {
    let mut envelope = Vec::with_capacity(body.len() + 1);
    write_varint(&mut envelope, 0);
    envelope.extend_from_slice(body);
    write_varint(out, envelope.len() as i32);
    out.extend_from_slice(&envelope);
}
