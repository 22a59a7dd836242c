//! Read buffer that can be asked to hold a minimum number of bytes
//!
//! `tokio::io::BufReader` only refills once it is empty, so a record that
//! straddles two refills can never be seen whole. The demultiplexer needs to
//! look at a full data descriptor before deciding whether the bytes in front
//! of it belong to the entry, which is what [`Lookahead::poll_fill_to`] gives.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncBufRead, AsyncRead, ReadBuf};

/// Smallest accepted buffer; holds the largest data descriptor with room to spare
pub(crate) const MIN_CAPACITY: usize = 64;

pub(crate) struct Lookahead<R> {
    inner: R,
    buf: Box<[u8]>,
    pos: usize,
    filled: usize,
    eof: bool,
}

impl<R: AsyncRead + Unpin> Lookahead<R> {
    pub(crate) fn with_capacity(capacity: usize, inner: R) -> Self {
        Lookahead {
            inner,
            buf: vec![0u8; capacity.max(MIN_CAPACITY)].into_boxed_slice(),
            pos: 0,
            filled: 0,
            eof: false,
        }
    }

    #[cfg(test)]
    pub(crate) fn new(inner: R) -> Self {
        Self::with_capacity(MIN_CAPACITY, inner)
    }

    /// Bytes buffered and not yet consumed
    pub(crate) fn buffer(&self) -> &[u8] {
        &self.buf[self.pos..self.filled]
    }

    /// The source has reported its end
    pub(crate) fn is_eof(&self) -> bool {
        self.eof
    }

    pub(crate) fn consume_buffered(&mut self, amt: usize) {
        self.pos = (self.pos + amt).min(self.filled);
    }

    /// Read until at least `n` bytes are buffered or the source ends.
    ///
    /// `n` is capped at the buffer capacity.
    pub(crate) fn poll_fill_to(&mut self, cx: &mut Context<'_>, n: usize) -> Poll<io::Result<()>> {
        let n = n.min(self.buf.len());
        if self.filled - self.pos >= n || self.eof {
            return Poll::Ready(Ok(()));
        }

        if self.pos > 0 {
            self.buf.copy_within(self.pos..self.filled, 0);
            self.filled -= self.pos;
            self.pos = 0;
        }

        while self.filled < n {
            let mut read_buf = ReadBuf::new(&mut self.buf[self.filled..]);
            ready!(Pin::new(&mut self.inner).poll_read(cx, &mut read_buf))?;
            let got = read_buf.filled().len();
            if got == 0 {
                self.eof = true;
                break;
            }
            self.filled += got;
        }
        Poll::Ready(Ok(()))
    }
}

impl<R: AsyncRead + Unpin> AsyncBufRead for Lookahead<R> {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        let this = self.get_mut();
        if this.pos >= this.filled {
            ready!(this.poll_fill_to(cx, 1))?;
        }
        Poll::Ready(Ok(this.buffer()))
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        self.get_mut().consume_buffered(amt);
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for Lookahead<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pos >= this.filled {
            ready!(this.poll_fill_to(cx, 1))?;
        }
        let available = this.buffer();
        let n = available.len().min(buf.remaining());
        buf.put_slice(&available[..n]);
        this.consume_buffered(n);
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::poll_fn;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_fill_spans_fragmented_reads() {
        let source = tokio_test::io::Builder::new()
            .read(b"abc")
            .read(b"defg")
            .read(b"hijklmnop")
            .build();
        let mut reader = Lookahead::new(source);

        let mut first = [0u8; 2];
        reader.read_exact(&mut first).await.unwrap();
        assert_eq!(&first, b"ab");

        poll_fn(|cx| reader.poll_fill_to(cx, 10)).await.unwrap();
        assert!(reader.buffer().len() >= 10);
        assert!(reader.buffer().starts_with(b"cdefghijkl"));

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"cdefghijklmnop");
        assert!(reader.is_eof());
    }

    #[tokio::test]
    async fn test_fill_stops_at_end_of_source() {
        let mut reader = Lookahead::new(io::Cursor::new(b"xyz".to_vec()));
        poll_fn(|cx| reader.poll_fill_to(cx, 32)).await.unwrap();
        assert_eq!(reader.buffer(), b"xyz");
        assert!(reader.is_eof());
    }

    #[test]
    fn test_capacity_has_a_floor() {
        let reader = Lookahead::with_capacity(7, io::Cursor::new(Vec::new()));
        assert_eq!(reader.buf.len(), MIN_CAPACITY);
    }
}
