//! Little-endian field codecs, and the records processor state is made of.

use std::io::{Read, Write};

use crate::error::{Result, SnapshotError};

/// A segment register with its descriptor cache, as saved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentRecord {
    pub selector: u16,
    pub base: u32,
    pub limit: u32,
    pub access: u8,
    /// Granularity and default-size nibble.
    pub flags: u8,
    pub valid: bool,
}

/// A write held in the bus unit until it reaches memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferedWrite {
    pub paddr: u32,
    /// 1 to 4 bytes, taken from the low end of `data`.
    pub len: u8,
    pub data: u32,
}

pub trait WriteLeExt: Write {
    fn write_u8(&mut self, v: u8) -> Result<()> {
        self.write_all(&[v])?;
        Ok(())
    }

    fn write_bool(&mut self, v: bool) -> Result<()> {
        self.write_u8(u8::from(v))
    }

    fn write_u16_le(&mut self, v: u16) -> Result<()> {
        self.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn write_u32_le(&mut self, v: u32) -> Result<()> {
        self.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn write_u64_le(&mut self, v: u64) -> Result<()> {
        self.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_all(bytes)?;
        Ok(())
    }

    /// 13 bytes: selector, base, limit, access, flags, valid.
    fn write_segment(&mut self, seg: &SegmentRecord) -> Result<()> {
        self.write_u16_le(seg.selector)?;
        self.write_u32_le(seg.base)?;
        self.write_u32_le(seg.limit)?;
        self.write_u8(seg.access)?;
        self.write_u8(seg.flags)?;
        self.write_bool(seg.valid)
    }

    /// Entry count, then address, length and data of each write in retire order.
    fn write_buffered_writes(&mut self, writes: &[BufferedWrite]) -> Result<()> {
        let count = u32::try_from(writes.len()).map_err(|_| SnapshotError::Corrupt("write queue length"))?;
        self.write_u32_le(count)?;
        for w in writes {
            self.write_u32_le(w.paddr)?;
            self.write_u8(w.len)?;
            self.write_u32_le(w.data)?;
        }
        Ok(())
    }
}

impl<T: Write + ?Sized> WriteLeExt for T {}

pub trait ReadLeExt: Read {
    fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(SnapshotError::Corrupt("boolean out of range")),
        }
    }

    fn read_u16_le(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32_le(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64_le(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_segment(&mut self) -> Result<SegmentRecord> {
        Ok(SegmentRecord {
            selector: self.read_u16_le()?,
            base: self.read_u32_le()?,
            limit: self.read_u32_le()?,
            access: self.read_u8()?,
            flags: self.read_u8()?,
            valid: self.read_bool()?,
        })
    }

    /// Reads a queue written by [`WriteLeExt::write_buffered_writes`] holding at most
    /// `max` entries.
    fn read_buffered_writes(&mut self, max: usize) -> Result<Vec<BufferedWrite>> {
        let count = self.read_u32_le()? as usize;
        if count > max {
            return Err(SnapshotError::Corrupt("write queue length"));
        }
        let mut writes = Vec::with_capacity(count);
        for _ in 0..count {
            let w = BufferedWrite {
                paddr: self.read_u32_le()?,
                len: self.read_u8()?,
                data: self.read_u32_le()?,
            };
            if !(1..=4).contains(&w.len) {
                return Err(SnapshotError::Corrupt("write queue entry length"));
            }
            writes.push(w);
        }
        Ok(writes)
    }
}

impl<T: Read + ?Sized> ReadLeExt for T {}

/// Section framing: name (u16 length), then data (u32 length).
pub(crate) fn write_section<W: Write>(w: &mut W, name: &str, data: &[u8]) -> Result<()> {
    let name_len = u16::try_from(name.len()).map_err(|_| SnapshotError::Corrupt("section name too long"))?;
    let data_len = u32::try_from(data.len()).map_err(|_| SnapshotError::Corrupt("section too large"))?;
    w.write_u16_le(name_len)?;
    w.write_bytes(name.as_bytes())?;
    w.write_u32_le(data_len)?;
    w.write_bytes(data)
}

pub(crate) fn read_section<R: Read>(r: &mut R) -> Result<(String, Vec<u8>)> {
    let name_len = usize::from(r.read_u16_le()?);
    let name = String::from_utf8(read_vec(r, name_len)?)?;
    let data_len = r.read_u32_le()? as usize;
    let data = read_vec(r, data_len)?;
    Ok((name, data))
}

/// Grows with the input, so a corrupt length cannot force a large allocation.
fn read_vec<R: Read>(r: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    r.take(len as u64).read_to_end(&mut buf)?;
    if buf.len() != len {
        return Err(SnapshotError::Truncated { expected: len, found: buf.len() });
    }
    Ok(buf)
}
