//! Named-blob container for machine state.
//!
//! Each stateful component serializes itself into one section tagged with its component
//! name. Restores look sections up by name, so components may be saved and restored in
//! any order and a blob written for the wrong component is caught by its size check.
#![forbid(unsafe_code)]

mod error;
mod io;

pub use crate::error::{Result, SnapshotError};
pub use crate::io::{BufferedWrite, ReadLeExt, SegmentRecord, WriteLeExt};

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

pub const STATE_MAGIC: &[u8; 8] = b"PCATSTAT";
pub const STATE_VERSION: u16 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Section {
    name: String,
    data: Vec<u8>,
}

/// An ordered set of named binary sections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateBuf {
    sections: Vec<Section>,
}

impl StateBuf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.sections.iter().map(|s| s.name.as_str())
    }

    /// Adds a section. Names are unique within a buffer.
    pub fn insert(&mut self, name: &str, data: Vec<u8>) -> Result<()> {
        if self.sections.iter().any(|s| s.name == name) {
            return Err(SnapshotError::DuplicateSection(name.to_string()));
        }
        self.sections.push(Section {
            name: name.to_string(),
            data,
        });
        Ok(())
    }

    /// Adds a section or replaces the one already stored under `name`.
    pub fn replace(&mut self, name: &str, data: Vec<u8>) {
        match self.sections.iter_mut().find(|s| s.name == name) {
            Some(section) => section.data = data,
            None => self.sections.push(Section {
                name: name.to_string(),
                data,
            }),
        }
    }

    pub fn get(&self, name: &str) -> Result<&[u8]> {
        self.sections
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.data.as_slice())
            .ok_or_else(|| SnapshotError::MissingSection(name.to_string()))
    }

    /// Looks up a fixed-size section and checks its length.
    pub fn get_sized(&self, name: &str, expected: usize) -> Result<&[u8]> {
        let data = self.get(name)?;
        if data.len() != expected {
            return Err(SnapshotError::SizeMismatch {
                name: name.to_string(),
                expected,
                found: data.len(),
            });
        }
        Ok(data)
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_bytes(STATE_MAGIC)?;
        w.write_u16_le(STATE_VERSION)?;
        let count: u32 = self
            .sections
            .len()
            .try_into()
            .map_err(|_| SnapshotError::Corrupt("too many sections"))?;
        w.write_u32_le(count)?;
        for section in &self.sections {
            io::write_section(w, &section.name, &section.data)?;
        }
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let mut magic = [0u8; 8];
        r.read_exact(&mut magic)?;
        if &magic != STATE_MAGIC {
            return Err(SnapshotError::InvalidMagic);
        }
        let version = r.read_u16_le()?;
        if version != STATE_VERSION {
            return Err(SnapshotError::UnsupportedVersion(version));
        }
        let count = r.read_u32_le()?;
        let mut buf = StateBuf::new();
        for _ in 0..count {
            let (name, data) = io::read_section(r)?;
            buf.insert(&name, data)?;
        }
        Ok(buf)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.write_to(&mut out)?;
        Ok(out)
    }

    pub fn from_bytes(mut bytes: &[u8]) -> Result<Self> {
        let buf = Self::read_from(&mut bytes)?;
        if !bytes.is_empty() {
            return Err(SnapshotError::Corrupt("trailing bytes after last section"));
        }
        Ok(buf)
    }

    pub fn save_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        self.write_to(&mut w)?;
        w.flush()?;
        Ok(())
    }

    pub fn load_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut r = BufReader::new(File::open(path)?);
        Self::read_from(&mut r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_names_are_rejected() {
        let mut buf = StateBuf::new();
        buf.insert("CPUCore", vec![1]).unwrap();
        let err = buf.insert("CPUCore", vec![2]).unwrap_err();
        assert!(matches!(err, SnapshotError::DuplicateSection(name) if name == "CPUCore"));

        buf.replace("CPUCore", vec![3]);
        assert_eq!(buf.get("CPUCore").unwrap(), &[3]);
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn sized_lookup_checks_length() {
        let mut buf = StateBuf::new();
        buf.insert("CPUBus", vec![0; 12]).unwrap();
        assert!(buf.get_sized("CPUBus", 12).is_ok());
        assert!(matches!(
            buf.get_sized("CPUBus", 16),
            Err(SnapshotError::SizeMismatch { expected: 16, found: 12, .. })
        ));
        assert!(matches!(
            buf.get("Memory"),
            Err(SnapshotError::MissingSection(_))
        ));
    }

    #[test]
    fn bad_magic_and_version_are_reported() {
        let mut bytes = StateBuf::new().to_bytes().unwrap();
        bytes[8] = 9;
        assert!(matches!(
            StateBuf::from_bytes(&bytes),
            Err(SnapshotError::UnsupportedVersion(9))
        ));
        bytes[0] = b'X';
        assert!(matches!(
            StateBuf::from_bytes(&bytes),
            Err(SnapshotError::InvalidMagic)
        ));
    }
}
