//! Order-preserving primitive encodings.
//!
//! Integers are written big-endian with the sign bit flipped, so unsigned
//! byte comparison matches signed numeric order. Floats flip the sign bit of
//! positive values and invert every bit of negative values. Strings and byte
//! strings are escaped (`0x00` becomes `0x00 0xFF`) and terminated by
//! `0x00 0x00`, which keeps them self-delimiting inside composite keys while
//! preserving lexicographic order.

use crate::error::{Error, Result};
use bytes::BufMut;

/// Appends a sortable `i8`.
pub fn put_i8(buf: &mut Vec<u8>, v: i8) {
    buf.put_u8((v as u8) ^ 0x80);
}

/// Appends a sortable `i16`.
pub fn put_i16(buf: &mut Vec<u8>, v: i16) {
    buf.put_u16((v as u16) ^ 0x8000);
}

/// Appends a sortable `i32`.
pub fn put_i32(buf: &mut Vec<u8>, v: i32) {
    buf.put_u32((v as u32) ^ 0x8000_0000);
}

/// Appends a sortable `i64`.
pub fn put_i64(buf: &mut Vec<u8>, v: i64) {
    buf.put_u64((v as u64) ^ 0x8000_0000_0000_0000);
}

/// Appends a sortable `f32`.
pub fn put_f32(buf: &mut Vec<u8>, v: f32) {
    let bits = v.to_bits();
    let bits = if bits & 0x8000_0000 != 0 { !bits } else { bits ^ 0x8000_0000 };
    buf.put_u32(bits);
}

/// Appends a sortable `f64`.
pub fn put_f64(buf: &mut Vec<u8>, v: f64) {
    let bits = v.to_bits();
    let bits = if bits & 0x8000_0000_0000_0000 != 0 { !bits } else { bits ^ 0x8000_0000_0000_0000 };
    buf.put_u64(bits);
}

/// Appends escaped, terminated bytes.
pub fn put_escaped(buf: &mut Vec<u8>, data: &[u8]) {
    for &b in data {
        buf.push(b);
        if b == 0x00 {
            buf.push(0xFF);
        }
    }
    buf.extend_from_slice(&[0x00, 0x00]);
}

/// Cursor over an encoded key or value.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Starts reading at the beginning of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left.
    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    /// Whether everything has been consumed.
    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Takes the next `n` bytes.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.data.len() - self.pos < n {
            return Err(Error::corruption(format!(
                "Truncated encoding: wanted {} bytes at {}, have {}",
                n,
                self.pos,
                self.data.len() - self.pos
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Takes everything left.
    pub fn take_rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Reads a raw byte.
    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Reads a big-endian `u16`.
    pub fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    /// Reads a big-endian `u32`.
    pub fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    /// Reads a big-endian `u64`.
    pub fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    /// Reads a sortable `i8`.
    pub fn i8(&mut self) -> Result<i8> {
        Ok((self.u8()? ^ 0x80) as i8)
    }

    /// Reads a sortable `i16`.
    pub fn i16(&mut self) -> Result<i16> {
        Ok((self.u16()? ^ 0x8000) as i16)
    }

    /// Reads a sortable `i32`.
    pub fn i32(&mut self) -> Result<i32> {
        Ok((self.u32()? ^ 0x8000_0000) as i32)
    }

    /// Reads a sortable `i64`.
    pub fn i64(&mut self) -> Result<i64> {
        Ok((self.u64()? ^ 0x8000_0000_0000_0000) as i64)
    }

    /// Reads a sortable `f32`.
    pub fn f32(&mut self) -> Result<f32> {
        let bits = self.u32()?;
        let bits = if bits & 0x8000_0000 != 0 { bits ^ 0x8000_0000 } else { !bits };
        Ok(f32::from_bits(bits))
    }

    /// Reads a sortable `f64`.
    pub fn f64(&mut self) -> Result<f64> {
        let bits = self.u64()?;
        let bits = if bits & 0x8000_0000_0000_0000 != 0 { bits ^ 0x8000_0000_0000_0000 } else { !bits };
        Ok(f64::from_bits(bits))
    }

    /// Reads escaped, terminated bytes.
    pub fn escaped(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let b = self.u8()?;
            if b != 0x00 {
                out.push(b);
                continue;
            }
            match self.u8()? {
                0x00 => return Ok(out),
                0xFF => out.push(0x00),
                other => {
                    return Err(Error::corruption(format!("Invalid escape sequence 0x00 {:#04x}", other)))
                }
            }
        }
    }

    /// Reads an escaped, terminated UTF-8 string.
    pub fn escaped_string(&mut self) -> Result<String> {
        String::from_utf8(self.escaped()?).map_err(|e| Error::corruption(format!("Invalid UTF-8: {}", e)))
    }
}
