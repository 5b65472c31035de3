//! Byte codec and file primitives shared by every on-disk structure.
//!
//! All multi-byte integers are big-endian. Variable-length data is
//! length-prefixed. Every persistent structure implements the
//! [`Encodeable`] / [`Decodeable`] pair and round-trips exactly.

use std::{
    convert::TryInto,
    fs::{File, OpenOptions},
    io::{Cursor, Read, Seek, SeekFrom, Write},
    mem::size_of,
    path::Path,
    sync::{Mutex, MutexGuard},
};

use crate::error::{DbError, DbResult};

pub trait Encodeable {
    fn encode(&self) -> Vec<u8>;
}

pub trait Decodeable: Sized {
    fn decode_from<R: Read>(reader: &mut R) -> DbResult<Self>;
}

pub fn read_exact<R: Read>(reader: &mut R, bytes_count: usize) -> DbResult<Vec<u8>> {
    let mut buf = vec![0u8; bytes_count];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

/// Clone a value by routing it through its wire format, handy when a
/// layer hands out rows that must not alias its own buffers.
pub fn deep_copy<T: Encodeable + Decodeable>(v: &T) -> DbResult<T> {
    let bytes = v.encode();
    let mut reader = Cursor::new(bytes.as_slice());
    T::decode_from(&mut reader)
}

macro_rules! impl_codec {
    (for $($t:ty),+) => {
        $(
            impl Encodeable for $t {
                fn encode(&self) -> Vec<u8> {
                    self.to_be_bytes().to_vec()
                }
            }

            impl Decodeable for $t {
                fn decode_from<R: Read>(reader: &mut R) -> DbResult<Self> {
                    let bytes = read_exact(reader, size_of::<Self>())?;
                    Ok(Self::from_be_bytes(bytes.try_into().unwrap()))
                }
            }
        )*
    }
}

impl_codec!(for u8, u16, u32, u64, i8, i16, i32, i64);

impl Encodeable for f64 {
    fn encode(&self) -> Vec<u8> {
        self.to_bits().to_be_bytes().to_vec()
    }
}

impl Decodeable for f64 {
    fn decode_from<R: Read>(reader: &mut R) -> DbResult<Self> {
        Ok(f64::from_bits(u64::decode_from(reader)?))
    }
}

/// # Format
///
/// - 1 byte (0 for false, 1 for true)
impl Encodeable for bool {
    fn encode(&self) -> Vec<u8> {
        vec![*self as u8]
    }
}

impl Decodeable for bool {
    fn decode_from<R: Read>(reader: &mut R) -> DbResult<Self> {
        Ok(u8::decode_from(reader)? == 1)
    }
}

/// # Format
///
/// - 2 bytes: byte length
/// - n bytes: UTF-8 payload
impl Encodeable for String {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(2 + self.len());
        buf.extend_from_slice(&(self.len() as u16).to_be_bytes());
        buf.extend_from_slice(self.as_bytes());
        buf
    }
}

impl Decodeable for String {
    fn decode_from<R: Read>(reader: &mut R) -> DbResult<Self> {
        let len = u16::decode_from(reader)? as usize;
        let bytes = read_exact(reader, len)?;
        String::from_utf8(bytes).map_err(|_| DbError::corrupt("invalid utf-8 in string"))
    }
}

/// # Format
///
/// - 2 bytes: byte length
/// - n bytes: payload
impl Encodeable for Vec<u8> {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(2 + self.len());
        buf.extend_from_slice(&(self.len() as u16).to_be_bytes());
        buf.extend_from_slice(self);
        buf
    }
}

impl Decodeable for Vec<u8> {
    fn decode_from<R: Read>(reader: &mut R) -> DbResult<Self> {
        let len = u16::decode_from(reader)? as usize;
        read_exact(reader, len)
    }
}

/// Append-style encoding buffer.
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn write<T: Encodeable>(&mut self, obj: &T) {
        self.buf.extend_from_slice(obj.encode().as_slice());
    }

    /// Raw bytes, no length prefix.
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn to_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Pad with zeros up to `size`; fails when the content is already
    /// larger than the target.
    pub fn to_padded_bytes(self, size: usize) -> DbResult<Vec<u8>> {
        let mut buf = self.buf;
        if buf.len() > size {
            return Err(DbError::PagerExhausted(format!(
                "payload of {} bytes exceeds {} bytes",
                buf.len(),
                size
            )));
        }
        buf.resize(size, 0);
        Ok(buf)
    }
}

/// A file handle behind an internal mutex. Every on-disk artifact of
/// the engine (data file, redo log, double-write buffer, xid file,
/// recovery info) goes through one of these; the mutex covers the
/// seek+read / seek+write pairs.
pub struct DbFile {
    file: Mutex<File>,
}

impl DbFile {
    /// Create a fresh file, refusing one that already exists.
    pub fn create<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Open an existing file, refusing a missing one.
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    fn lock(&self) -> MutexGuard<'_, File> {
        self.file.lock().unwrap()
    }

    pub fn read_at(&self, offset: u64, len: usize) -> DbResult<Vec<u8>> {
        let mut file = self.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn write_at(&self, offset: u64, bytes: &[u8]) -> DbResult<()> {
        let mut file = self.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(bytes)?;
        Ok(())
    }

    /// Write at the end of the file; returns the offset the bytes
    /// landed at.
    pub fn append(&self, bytes: &[u8]) -> DbResult<u64> {
        let mut file = self.lock();
        let offset = file.seek(SeekFrom::End(0))?;
        file.write_all(bytes)?;
        Ok(offset)
    }

    pub fn read_all(&self) -> DbResult<Vec<u8>> {
        let mut file = self.lock();
        file.seek(SeekFrom::Start(0))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        Ok(buf)
    }

    pub fn size(&self) -> DbResult<u64> {
        Ok(self.lock().metadata()?.len())
    }

    pub fn set_len(&self, len: u64) -> DbResult<()> {
        self.lock().set_len(len)?;
        Ok(())
    }

    pub fn sync(&self) -> DbResult<()> {
        self.lock().sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_round_trip() {
        let v: u32 = 0xdeadbeef;
        assert_eq!(v.encode(), vec![0xde, 0xad, 0xbe, 0xef]);
        let mut reader = Cursor::new(v.encode());
        assert_eq!(u32::decode_from(&mut reader).unwrap(), v);

        let v: i64 = -42;
        let mut reader = Cursor::new(v.encode());
        assert_eq!(i64::decode_from(&mut reader).unwrap(), v);

        let v: f64 = 3.25;
        let mut reader = Cursor::new(v.encode());
        assert_eq!(f64::decode_from(&mut reader).unwrap(), v);
    }

    #[test]
    fn test_string_round_trip() {
        let s = "hello, 世界".to_string();
        let bytes = s.encode();
        assert_eq!(&bytes[..2], &(s.len() as u16).to_be_bytes());
        let mut reader = Cursor::new(bytes);
        assert_eq!(String::decode_from(&mut reader).unwrap(), s);
    }

    #[test]
    fn test_deep_copy() {
        let v = "copy me".to_string();
        let copied = deep_copy(&v).unwrap();
        assert_eq!(copied, v);
    }

    #[test]
    fn test_padded_bytes() {
        let mut w = ByteWriter::new();
        w.write(&7u16);
        let bytes = w.to_padded_bytes(8).unwrap();
        assert_eq!(bytes, vec![0, 7, 0, 0, 0, 0, 0, 0]);

        let mut w = ByteWriter::new();
        w.write_raw(&[0u8; 16]);
        assert!(w.to_padded_bytes(8).is_err());
    }
}
