//! Buffered byte sources the header codec reads from.
//!
//! The parser needs a little more than `std::io::Read` gives it: peeking at
//! a prefix without consuming it (the v1/v2 discriminator must leave the
//! stream untouched when it fails) and a hint of how many bytes are
//! available without blocking (the v1 slow-writer guard). [`ByteSource`]
//! captures exactly that surface. [`SourceBuffer`] implements it over any
//! blocking reader with a pooled read-ahead buffer; a slice-backed
//! implementation drives the buffer-based parse entry point.

use std::io::{self, Read};
use std::ops::{Deref, DerefMut};
use std::sync::Mutex;

use crate::Error;

/// A buffered source of header bytes.
///
/// Implementations must guarantee that [`peek`](ByteSource::peek) does not
/// consume: after a failed peek the next reader still observes the same
/// bytes.
pub trait ByteSource {
    /// Read and consume a single byte.
    fn read_byte(&mut self) -> Result<u8, Error>;

    /// Read and consume exactly `out.len()` bytes.
    fn fill(&mut self, out: &mut [u8]) -> Result<(), Error>;

    /// Return the next `n` bytes without consuming them.
    fn peek(&mut self, n: usize) -> Result<&[u8], Error>;

    /// Discard `n` bytes previously returned by [`peek`](ByteSource::peek).
    fn consume(&mut self, n: usize);

    /// How many bytes can be read without blocking, when the source knows.
    fn available(&self) -> Option<usize>;
}

const POOLED_BUF: usize = 4096;
const POOLED_LINE: usize = 128;
const POOL_SLOTS: usize = 32;

/// A fixed-capacity freelist of byte buffers.
///
/// Buffers are cleared on release; only buffers still at the pool's standard
/// capacity are retained, so a buffer grown by an oversized peek is simply
/// dropped.
struct Pool {
    capacity: usize,
    bufs: Mutex<Vec<Vec<u8>>>,
}

impl Pool {
    const fn new(capacity: usize) -> Pool {
        Pool {
            capacity,
            bufs: Mutex::new(Vec::new()),
        }
    }

    fn get(&'static self) -> PooledBuf {
        let buf = self
            .bufs
            .lock()
            .ok()
            .and_then(|mut bufs| bufs.pop())
            .unwrap_or_else(|| Vec::with_capacity(self.capacity));
        PooledBuf { buf, pool: self }
    }

    fn put(&self, mut buf: Vec<u8>) {
        if buf.capacity() != self.capacity {
            return;
        }
        buf.clear();
        if let Ok(mut bufs) = self.bufs.lock() {
            if bufs.len() < POOL_SLOTS {
                bufs.push(buf);
            }
        }
    }
}

static READ_AHEAD_POOL: Pool = Pool::new(POOLED_BUF);
static LINE_POOL: Pool = Pool::new(POOLED_LINE);

/// A pooled byte buffer, returned to its pool on drop.
pub(crate) struct PooledBuf {
    buf: Vec<u8>,
    pool: &'static Pool,
}

impl Deref for PooledBuf {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.buf));
    }
}

/// Get a short buffer for assembling a v1 header line.
pub(crate) fn line_buffer() -> PooledBuf {
    LINE_POOL.get()
}

/// A buffered reader with peeking, backed by a pooled page-sized buffer.
///
/// Bytes land in the read-ahead buffer in as few reads as possible; once the
/// header has been consumed, [`Read`] drains the buffered remainder and then
/// bypasses the buffer entirely, reading straight from the inner stream.
pub struct SourceBuffer<R> {
    inner: R,
    buf: PooledBuf,
    pos: usize,
}

impl<R> SourceBuffer<R> {
    pub fn new(inner: R) -> SourceBuffer<R> {
        SourceBuffer {
            inner,
            buf: READ_AHEAD_POOL.get(),
            pos: 0,
        }
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Unread bytes currently sitting in the read-ahead buffer.
    pub fn buffered(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Discard the buffer (it returns to the pool) and take back the inner
    /// stream. Any buffered bytes are lost.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> SourceBuffer<R> {
    /// Perform one read of the inner stream into the buffer, compacting
    /// first. Returns the number of bytes gained; zero means end of stream.
    fn fill_once(&mut self) -> Result<usize, Error> {
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        let filled = self.buf.len();
        self.buf.resize(filled + POOLED_BUF, 0);
        loop {
            match self.inner.read(&mut self.buf[filled..]) {
                Ok(n) => {
                    self.buf.truncate(filled + n);
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.buf.truncate(filled);
                    return Err(e.into());
                }
            }
        }
    }

    fn fill_at_least(&mut self, n: usize) -> Result<(), Error> {
        while self.buffered() < n {
            if self.fill_once()? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended inside a proxy protocol header",
                )
                .into());
            }
        }
        Ok(())
    }
}

impl<R: Read> ByteSource for SourceBuffer<R> {
    fn read_byte(&mut self) -> Result<u8, Error> {
        self.fill_at_least(1)?;
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(b)
    }

    fn fill(&mut self, out: &mut [u8]) -> Result<(), Error> {
        let have = self.buffered().min(out.len());
        out[..have].copy_from_slice(&self.buf[self.pos..self.pos + have]);
        self.pos += have;
        if have < out.len() {
            self.inner.read_exact(&mut out[have..])?;
        }
        Ok(())
    }

    fn peek(&mut self, n: usize) -> Result<&[u8], Error> {
        self.fill_at_least(n)?;
        Ok(&self.buf[self.pos..self.pos + n])
    }

    fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.buffered());
        self.pos += n.min(self.buffered());
    }

    fn available(&self) -> Option<usize> {
        Some(self.buffered())
    }
}

impl<R: Read> Read for SourceBuffer<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.buffered() > 0 {
            let n = self.buffered().min(out.len());
            out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
            self.pos += n;
            return Ok(n);
        }
        self.inner.read(out)
    }
}

/// A [`ByteSource`] over an in-memory prefix of a stream.
///
/// Running past the end yields [`Error::BufferTooShort`] so an accumulating
/// caller can fetch more bytes and retry the parse from the top.
pub(crate) struct SliceSource<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SliceSource<'a> {
    pub(crate) fn new(data: &'a [u8]) -> SliceSource<'a> {
        SliceSource { data, pos: 0 }
    }

    /// Bytes consumed so far.
    pub(crate) fn consumed(&self) -> usize {
        self.pos
    }
}

impl ByteSource for SliceSource<'_> {
    fn read_byte(&mut self) -> Result<u8, Error> {
        let b = *self.data.get(self.pos).ok_or(Error::BufferTooShort)?;
        self.pos += 1;
        Ok(b)
    }

    fn fill(&mut self, out: &mut [u8]) -> Result<(), Error> {
        let end = self.pos + out.len();
        if end > self.data.len() {
            return Err(Error::BufferTooShort);
        }
        out.copy_from_slice(&self.data[self.pos..end]);
        self.pos = end;
        Ok(())
    }

    fn peek(&mut self, n: usize) -> Result<&[u8], Error> {
        if self.pos + n > self.data.len() {
            return Err(Error::BufferTooShort);
        }
        Ok(&self.data[self.pos..self.pos + n])
    }

    fn consume(&mut self, n: usize) {
        debug_assert!(self.pos + n <= self.data.len());
        self.pos = (self.pos + n).min(self.data.len());
    }

    fn available(&self) -> Option<usize> {
        // No slow-writer signal: the caller is accumulating, not blocking.
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A reader that yields its data one byte per read call.
    struct Trickle<'a> {
        data: &'a [u8],
        pos: usize,
    }

    impl Read for Trickle<'_> {
        fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
            if self.pos == self.data.len() || out.is_empty() {
                return Ok(0);
            }
            out[0] = self.data[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    #[test]
    fn peek_does_not_consume() {
        let mut src = SourceBuffer::new(&b"hello world"[..]);
        assert_eq!(src.peek(5).unwrap(), b"hello");
        assert_eq!(src.peek(5).unwrap(), b"hello");
        assert_eq!(src.read_byte().unwrap(), b'h');
        assert_eq!(src.peek(4).unwrap(), b"ello");
    }

    #[test]
    fn peek_spans_multiple_reads() {
        let mut src = SourceBuffer::new(Trickle {
            data: b"abcdef",
            pos: 0,
        });
        assert_eq!(src.peek(6).unwrap(), b"abcdef");
        let mut out = [0u8; 6];
        src.fill(&mut out).unwrap();
        assert_eq!(&out, b"abcdef");
    }

    #[test]
    fn peek_past_eof_is_io_error() {
        let mut src = SourceBuffer::new(&b"ab"[..]);
        match src.peek(3) {
            Err(Error::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected eof, got {other:?}"),
        }
        // The two bytes are still there for the next reader.
        assert_eq!(src.peek(2).unwrap(), b"ab");
    }

    #[test]
    fn read_drains_buffer_then_inner() {
        let mut src = SourceBuffer::new(&b"headerpayload"[..]);
        assert_eq!(src.peek(6).unwrap(), b"header");
        src.consume(6);

        let mut out = vec![0u8; 16];
        let n = src.read(&mut out).unwrap();
        assert_eq!(&out[..n], b"payload");
    }

    #[test]
    fn fill_beyond_buffer_reads_inner() {
        let mut src = SourceBuffer::new(&b"abcdefgh"[..]);
        assert_eq!(src.peek(2).unwrap(), b"ab");
        let mut out = [0u8; 8];
        src.fill(&mut out).unwrap();
        assert_eq!(&out, b"abcdefgh");
    }

    #[test]
    fn slice_source_reports_short_buffer() {
        let mut src = SliceSource::new(b"abc");
        assert!(matches!(src.peek(4), Err(Error::BufferTooShort)));
        assert_eq!(src.peek(3).unwrap(), b"abc");
        src.consume(1);
        assert_eq!(src.consumed(), 1);
        let mut out = [0u8; 3];
        assert!(matches!(src.fill(&mut out), Err(Error::BufferTooShort)));
    }

    #[test]
    fn pooled_buffers_are_reused() {
        let pool: &'static Pool = Box::leak(Box::new(Pool::new(64)));
        let first = {
            let mut buf = pool.get();
            buf.extend_from_slice(b"leftover");
            buf.as_ptr()
        };
        // The released buffer comes back, cleared.
        let again = pool.get();
        assert_eq!(first, again.as_ptr());
        assert!(again.is_empty());
    }
}
