//! Mechanical primitive encode/decode for the framed wire protocol.
//!
//! Frames are size-delimited byte sequences; fields within a frame are
//! little-endian, matching both device dialects (`spec.md` §6: "both are
//! request/response, single outstanding, length-framed, u16-LE fields").
//! Style follows `RMamonts-nfs-mamont`'s `parser/primitive.rs`, which reads
//! primitives off a `Read` source with `byteorder` the same way.

use crate::error::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

pub fn read_u8(src: &mut impl Read) -> Result<u8> {
    src.read_u8().map_err(|_| Error::BadHeader)
}

pub fn read_u16(src: &mut impl Read) -> Result<u16> {
    src.read_u16::<LittleEndian>().map_err(|_| Error::BadHeader)
}

pub fn read_u32(src: &mut impl Read) -> Result<u32> {
    src.read_u32::<LittleEndian>().map_err(|_| Error::BadHeader)
}

pub fn read_u64(src: &mut impl Read) -> Result<u64> {
    src.read_u64::<LittleEndian>().map_err(|_| Error::BadHeader)
}

/// Fixed-width, NUL-padded string field.
pub fn read_fixed_string(src: &mut impl Read, len: usize) -> Result<String> {
    let mut buf = vec![0u8; len];
    src.read_exact(&mut buf).map_err(|_| Error::BadHeader)?;
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8(buf[..end].to_vec()).map_err(|_| Error::BadName)
}

/// Length-prefixed (u16 count) string field.
pub fn read_counted_string(src: &mut impl Read) -> Result<String> {
    let len = read_u16(src)? as usize;
    let mut buf = vec![0u8; len];
    src.read_exact(&mut buf).map_err(|_| Error::BadHeader)?;
    String::from_utf8(buf).map_err(|_| Error::BadName)
}

pub fn write_u8(dst: &mut impl Write, v: u8) -> Result<()> {
    dst.write_u8(v).map_err(|_| Error::BadParams)
}

pub fn write_u16(dst: &mut impl Write, v: u16) -> Result<()> {
    dst.write_u16::<LittleEndian>(v).map_err(|_| Error::BadParams)
}

pub fn write_u32(dst: &mut impl Write, v: u32) -> Result<()> {
    dst.write_u32::<LittleEndian>(v).map_err(|_| Error::BadParams)
}

pub fn write_u64(dst: &mut impl Write, v: u64) -> Result<()> {
    dst.write_u64::<LittleEndian>(v).map_err(|_| Error::BadParams)
}

pub fn write_fixed_string(dst: &mut impl Write, s: &str, len: usize) -> Result<()> {
    let bytes = s.as_bytes();
    if bytes.len() >= len {
        return Err(Error::BadName);
    }
    dst.write_all(bytes).map_err(|_| Error::BadParams)?;
    for _ in bytes.len()..len {
        write_u8(dst, 0)?;
    }
    Ok(())
}

pub fn write_counted_string(dst: &mut impl Write, s: &str) -> Result<()> {
    let bytes = s.as_bytes();
    if bytes.len() > u16::MAX as usize {
        return Err(Error::BadName);
    }
    write_u16(dst, bytes.len() as u16)?;
    dst.write_all(bytes).map_err(|_| Error::BadParams)
}

/// A size-delimited frame: a u32-LE length prefix followed by that many
/// payload bytes. `Transport` impls are free to use a different envelope;
/// this is the default the in-process `MockTransport` and the unit tests
/// use to exercise `rpc.rs` encode/decode round trips.
pub fn frame_encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + payload.len());
    write_u32(&mut out, payload.len() as u32).expect("writing to a Vec cannot fail");
    out.extend_from_slice(payload);
    out
}

pub fn frame_decode(bytes: &[u8]) -> Result<(&[u8], &[u8])> {
    let mut cursor = Cursor::new(bytes);
    let len = read_u32(&mut cursor)? as usize;
    let start = cursor.position() as usize;
    let end = start.checked_add(len).ok_or(Error::BadHeader)?;
    if end > bytes.len() {
        return Err(Error::BadHeader);
    }
    Ok((&bytes[start..end], &bytes[end..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_string_round_trip() {
        let mut buf = Vec::new();
        write_fixed_string(&mut buf, "abc", 8).unwrap();
        assert_eq!(buf.len(), 8);
        let mut cursor = Cursor::new(buf);
        assert_eq!(read_fixed_string(&mut cursor, 8).unwrap(), "abc");
    }

    #[test]
    fn counted_string_round_trip() {
        let mut buf = Vec::new();
        write_counted_string(&mut buf, "hello").unwrap();
        let mut cursor = Cursor::new(buf);
        assert_eq!(read_counted_string(&mut cursor).unwrap(), "hello");
    }

    #[test]
    fn frame_round_trip() {
        let payload = b"payload bytes";
        let framed = frame_encode(payload);
        let (decoded, rest) = frame_decode(&framed).unwrap();
        assert_eq!(decoded, payload);
        assert!(rest.is_empty());
    }

    #[test]
    fn frame_rejects_truncated_input() {
        let mut framed = frame_encode(b"abcdef");
        framed.truncate(5);
        assert!(frame_decode(&framed).is_err());
    }
}
