//! Big-endian readers for TLS wire structures.

/// Error returned when a TLS structure is truncated or malformed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid encoding: {0}")]
pub struct DecodeError(pub(crate) &'static str);

/// A cursor over a borrowed byte slice.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    offs: usize,
}

impl<'a> Reader<'a> {
    /// Creates a new reader over `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, offs: 0 }
    }

    /// Returns the number of bytes consumed so far.
    pub fn used(&self) -> usize {
        self.offs
    }

    /// Returns the number of unread bytes.
    pub fn left(&self) -> usize {
        self.buf.len() - self.offs
    }

    /// Returns `true` if there are unread bytes.
    pub fn any_left(&self) -> bool {
        self.offs < self.buf.len()
    }

    /// Consumes and returns all remaining bytes.
    pub fn rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.offs..];
        self.offs = self.buf.len();
        rest
    }

    /// Consumes exactly `len` bytes.
    pub fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.left() < len {
            return Err(DecodeError("unexpected end of data"));
        }

        let out = &self.buf[self.offs..self.offs + len];
        self.offs += len;
        Ok(out)
    }

    /// Reads a `u8`.
    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    /// Reads a big-endian `u16`.
    pub fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Reads a big-endian 24-bit integer.
    pub fn u24(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(3)?;
        Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }

    /// Reads a fixed-size array.
    pub fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Reads an opaque vector with a one byte length prefix.
    pub fn vec_u8(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.u8()? as usize;
        self.take(len)
    }

    /// Reads an opaque vector with a two byte length prefix.
    pub fn vec_u16(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.u16()? as usize;
        self.take(len)
    }

    /// Reads an opaque vector with a three byte length prefix.
    pub fn vec_u24(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.u24()? as usize;
        self.take(len)
    }

    /// Returns an error if any bytes are left unread.
    pub fn expect_empty(&self, what: &'static str) -> Result<(), DecodeError> {
        if self.any_left() {
            Err(DecodeError(what))
        } else {
            Ok(())
        }
    }
}

/// Appends a big-endian 24-bit integer to `out`.
pub fn put_u24(v: u32, out: &mut Vec<u8>) {
    out.extend_from_slice(&v.to_be_bytes()[1..]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_integers() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06];
        let mut r = Reader::new(&data);

        assert_eq!(r.u8().unwrap(), 0x01);
        assert_eq!(r.u16().unwrap(), 0x0203);
        assert_eq!(r.u24().unwrap(), 0x040506);
        assert!(!r.any_left());
        assert!(r.u8().is_err());
    }

    #[test]
    fn test_reader_length_prefixed() {
        let data = [0x00, 0x02, 0xaa, 0xbb, 0x01, 0xcc];
        let mut r = Reader::new(&data);

        assert_eq!(r.vec_u16().unwrap(), &[0xaa, 0xbb]);
        assert_eq!(r.vec_u8().unwrap(), &[0xcc]);
        r.expect_empty("trailing").unwrap();
    }

    #[test]
    fn test_reader_truncated_vector() {
        let data = [0x00, 0x00, 0x05, 0x01];
        let mut r = Reader::new(&data);

        assert!(r.vec_u24().is_err());
    }

    #[test]
    fn test_put_u24() {
        let mut out = Vec::new();
        put_u24(0x0a0b0c, &mut out);
        assert_eq!(out, [0x0a, 0x0b, 0x0c]);
    }
}
