//! Field-level pack/unpack helpers shared by every message body (spec.md §6): big-endian
//! integers, `u16`-length-prefixed strings, and length-prefixed vectors of either. Follows the
//! teacher's `flux::contract` convention of reading/writing through generic `Read`/`Write`
//! streams with `byteorder` rather than hand-rolled cursor arithmetic.

use crate::error::{CodecError, CodecResult};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

pub fn read_u16<R: Read>(r: &mut R) -> CodecResult<u16> {
    r.read_u16::<BigEndian>().map_err(|_| CodecError::Truncated)
}

pub fn read_u32<R: Read>(r: &mut R) -> CodecResult<u32> {
    r.read_u32::<BigEndian>().map_err(|_| CodecError::Truncated)
}

pub fn read_bytes_fixed<R: Read>(r: &mut R, n: usize) -> CodecResult<Vec<u8>> {
    let mut buf = vec![0u8; n];
    r.read_exact(&mut buf).map_err(|_| CodecError::Truncated)?;
    Ok(buf)
}

/// Reads a `u16`-length-prefixed byte string.
pub fn read_bytes<R: Read>(r: &mut R) -> CodecResult<Vec<u8>> {
    let len = read_u16(r)? as usize;
    read_bytes_fixed(r, len)
}

/// Reads a `u16`-length-prefixed UTF-8 string.
pub fn read_string<R: Read>(r: &mut R) -> CodecResult<String> {
    let raw = read_bytes(r)?;
    String::from_utf8(raw).map_err(|_| CodecError::InvalidUtf8)
}

/// Reads a `u16`-count-prefixed vector of strings.
pub fn read_string_vec<R: Read>(r: &mut R) -> CodecResult<Vec<String>> {
    let count = read_u16(r)?;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        out.push(read_string(r)?);
    }
    Ok(out)
}

/// Reads a `u16`-count-prefixed vector of `u32`s (used for talk-group sets).
pub fn read_u32_vec<R: Read>(r: &mut R) -> CodecResult<Vec<u32>> {
    let count = read_u16(r)?;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        out.push(read_u32(r)?);
    }
    Ok(out)
}

pub fn write_u16<W: Write>(w: &mut W, v: u16) -> CodecResult<()> {
    w.write_u16::<BigEndian>(v).map_err(|_| CodecError::Truncated)
}

pub fn write_u32<W: Write>(w: &mut W, v: u32) -> CodecResult<()> {
    w.write_u32::<BigEndian>(v).map_err(|_| CodecError::Truncated)
}

pub fn write_bytes<W: Write>(w: &mut W, data: &[u8]) -> CodecResult<()> {
    write_u16(w, data.len() as u16)?;
    w.write_all(data).map_err(|_| CodecError::Truncated)
}

pub fn write_string<W: Write>(w: &mut W, s: &str) -> CodecResult<()> {
    write_bytes(w, s.as_bytes())
}

pub fn write_string_vec<W: Write>(w: &mut W, items: &[String]) -> CodecResult<()> {
    write_u16(w, items.len() as u16)?;
    for item in items {
        write_string(w, item)?;
    }
    Ok(())
}

pub fn write_u32_vec<W: Write>(w: &mut W, items: &[u32]) -> CodecResult<()> {
    write_u16(w, items.len() as u16)?;
    for item in items {
        write_u32(w, *item)?;
    }
    Ok(())
}

/// Asserts that a cursor over a decoded message body has been fully consumed. A non-fatal
/// mismatch (extra trailing bytes) still indicates a codec bug or a hostile peer, so it is
/// surfaced rather than silently ignored.
pub fn expect_exhausted(cur: &Cursor<&[u8]>) -> CodecResult<()> {
    if (cur.position() as usize) < cur.get_ref().len() {
        Err(CodecError::TrailingBytes)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_roundtrip() {
        let mut buf = Vec::new();
        write_string(&mut buf, "NODE1").unwrap();

        let mut cur = Cursor::new(&buf[..]);
        let s = read_string(&mut cur).unwrap();
        assert_eq!(s, "NODE1");
        expect_exhausted(&cur).unwrap();
    }

    #[test]
    fn string_vec_roundtrip() {
        let mut buf = Vec::new();
        let items = vec!["A".to_string(), "BB".to_string(), "CCC".to_string()];
        write_string_vec(&mut buf, &items).unwrap();

        let mut cur = Cursor::new(&buf[..]);
        assert_eq!(read_string_vec(&mut cur).unwrap(), items);
    }

    #[test]
    fn truncated_read_fails() {
        let buf = [0u8, 5]; // claims 5 bytes follow, there are none
        let mut cur = Cursor::new(&buf[..]);
        assert_eq!(read_string(&mut cur).unwrap_err(), CodecError::Truncated);
    }
}
