//! Binary table encoding.
//!
//! Little-endian integers; strings are a 7-bit varint byte count followed by
//! UTF-16LE code units. A missing string is written as the empty string.

use std::path::Path;

use lws_baseline::ContentHash;

use crate::change_type::PropertyValue;
use crate::{Result, TableError};

pub struct TableWriter {
    buf: Vec<u8>,
}

impl Default for TableWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl TableWriter {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(4096),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn bool(&mut self, v: bool) {
        self.u8(v as u8);
    }

    pub fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn bytes16(&mut self, v: &[u8; 16]) {
        self.buf.extend_from_slice(v);
    }

    /// Hash or all zeroes when absent.
    pub fn hash(&mut self, v: Option<&ContentHash>) {
        self.bytes16(v.unwrap_or(&[0u8; 16]));
    }

    pub fn str(&mut self, s: &str) {
        let units: Vec<u16> = s.encode_utf16().collect();
        let mut len = (units.len() * 2) as u32;
        loop {
            let byte = (len & 0x7f) as u8;
            len >>= 7;
            if len == 0 {
                self.buf.push(byte);
                break;
            }
            self.buf.push(byte | 0x80);
        }
        for unit in units {
            self.buf.extend_from_slice(&unit.to_le_bytes());
        }
    }

    pub fn opt_str(&mut self, s: Option<&str>) {
        self.str(s.unwrap_or(""));
    }

    pub fn properties(&mut self, props: &[PropertyValue]) {
        self.i32(props.len() as i32);
        for p in props {
            self.str(&p.name);
            self.opt_str(p.value.as_deref());
        }
    }
}

/// Cursor over an encoded table. Every read fails with `InvalidTable` on
/// truncated or malformed input.
pub struct TableReader<'a> {
    buf: &'a [u8],
    pos: usize,
    path: &'a Path,
}

impl<'a> TableReader<'a> {
    pub fn new(buf: &'a [u8], path: &'a Path) -> Self {
        Self { buf, pos: 0, path }
    }

    pub fn invalid(&self, reason: impl Into<String>) -> TableError {
        TableError::InvalidTable {
            path: self.path.to_path_buf(),
            reason: reason.into(),
        }
    }

    pub fn is_at_end(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(self.invalid(format!("unexpected end of data at offset {}", self.pos)));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn bool(&mut self) -> Result<bool> {
        Ok(self.u8()? != 0)
    }

    pub fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    pub fn bytes16(&mut self) -> Result<[u8; 16]> {
        self.array()
    }

    /// Hash, `None` when all zeroes.
    pub fn hash(&mut self) -> Result<Option<ContentHash>> {
        let h = self.bytes16()?;
        Ok(if h == [0u8; 16] { None } else { Some(h) })
    }

    pub fn count(&mut self) -> Result<usize> {
        let n = self.i32()?;
        usize::try_from(n).map_err(|_| self.invalid(format!("negative count {}", n)))
    }

    pub fn str(&mut self) -> Result<String> {
        let mut len: u32 = 0;
        let mut shift = 0;
        loop {
            if shift > 28 {
                return Err(self.invalid("string length prefix too long"));
            }
            let byte = self.u8()?;
            len |= ((byte & 0x7f) as u32) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        if len % 2 != 0 {
            return Err(self.invalid("odd UTF-16 byte length"));
        }
        let raw = self.take(len as usize)?;
        let units: Vec<u16> = raw
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        String::from_utf16(&units).map_err(|_| self.invalid("invalid UTF-16 string"))
    }

    /// Empty string reads back as `None`.
    pub fn opt_str(&mut self) -> Result<Option<String>> {
        let s = self.str()?;
        Ok(if s.is_empty() { None } else { Some(s) })
    }

    pub fn properties(&mut self) -> Result<Vec<PropertyValue>> {
        let n = self.count()?;
        let mut props = Vec::with_capacity(n.min(64));
        for _ in 0..n {
            let name = self.str()?;
            let value = self.opt_str()?;
            props.push(PropertyValue { name, value });
        }
        Ok(props)
    }

    /// Check a `magic u16` + `schema u8` header, returning the schema.
    pub fn header(&mut self, magic: u16, schemas: &[u8]) -> Result<u8> {
        let found = self.u16()?;
        if found != magic {
            return Err(self.invalid(format!(
                "bad magic {:#06x}, expected {:#06x}",
                found, magic
            )));
        }
        let schema = self.u8()?;
        if !schemas.contains(&schema) {
            return Err(self.invalid(format!("unsupported schema version {}", schema)));
        }
        Ok(schema)
    }
}
