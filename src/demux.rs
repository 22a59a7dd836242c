//! Forward-only streaming ZIP demultiplexer
//!
//! Walks the local file headers of a ZIP container as the bytes arrive, so the
//! archive can be consumed straight off a network stream with no seeking and no
//! central directory. Each entry is handed out as a [`ZipStreamEntry`] that
//! borrows the reader mutably: the next entry cannot be requested while the
//! current one is alive, and entries are always consumed in container order.
//!
//! ```no_run
//! use zip_fanout::ZipStreamReader;
//! use tokio::io::AsyncReadExt;
//!
//! # async fn example() -> zip_fanout::Result<()> {
//! let file = tokio::fs::File::open("archive.zip").await?;
//! let mut zip = ZipStreamReader::new(file);
//!
//! while let Some(mut entry) = zip.next_entry().await? {
//!     if entry.path().ends_with(".txt") {
//!         let mut text = String::new();
//!         entry.read_to_string(&mut text).await?;
//!         entry.finish().await?;
//!     } else {
//!         entry.drain().await?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use crate::error::{FanoutError, Result};
use async_compression::tokio::bufread::DeflateDecoder;
#[cfg(feature = "zstd-support")]
use async_compression::tokio::bufread::ZstdDecoder;
use crc32fast::Hasher as Crc32;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use crate::lookahead::Lookahead;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf, Take};

/// ZIP local file header signature
const LOCAL_FILE_HEADER_SIGNATURE: u32 = 0x04034b50;

/// ZIP central directory signature
const CENTRAL_DIRECTORY_SIGNATURE: u32 = 0x02014b50;

/// ZIP end of central directory signature
const END_OF_CENTRAL_DIRECTORY_SIGNATURE: u32 = 0x06054b50;

/// ZIP64 end of central directory record signature
const ZIP64_END_OF_CENTRAL_DIRECTORY_SIGNATURE: u32 = 0x06064b50;

/// Optional data descriptor signature
const DATA_DESCRIPTOR_SIGNATURE: u32 = 0x08074b50;

/// ZIP64 extended information extra field
const ZIP64_EXTRA_FIELD_ID: u16 = 0x0001;

const FLAG_ENCRYPTED: u16 = 0x0001;
const FLAG_DATA_DESCRIPTOR: u16 = 0x0008;

const METHOD_STORED: u16 = 0;
const METHOD_DEFLATE: u16 = 8;
const METHOD_ZSTD: u16 = 93;

/// Default read buffer in front of the container stream
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Local file header of one entry, as found in the stream
#[derive(Debug, Clone)]
pub struct EntryHeader {
    pub name: String,
    pub flags: u16,
    pub compression_method: u16,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub zip64: bool,
}

impl EntryHeader {
    /// CRC and sizes follow the entry data instead of living in the header
    pub fn has_data_descriptor(&self) -> bool {
        self.flags & FLAG_DATA_DESCRIPTOR != 0
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags & FLAG_ENCRYPTED != 0
    }

    pub fn is_dir(&self) -> bool {
        self.name.ends_with('/')
    }

    /// Whether the body can be decompressed by this reader
    pub fn is_supported(&self) -> bool {
        if self.is_encrypted() {
            return false;
        }
        match self.compression_method {
            METHOD_STORED | METHOD_DEFLATE => true,
            METHOD_ZSTD => cfg!(feature = "zstd-support"),
            _ => false,
        }
    }

    /// Compressed length when it is declared ahead of the data
    ///
    /// Writers that set the data descriptor flag usually leave the header
    /// sizes at zero; a non-zero value is still trusted.
    pub fn declared_compressed_size(&self) -> Option<u64> {
        if self.has_data_descriptor() && self.compressed_size == 0 {
            None
        } else {
            Some(self.compressed_size)
        }
    }

    /// Uncompressed length when it is declared ahead of the data
    pub fn declared_uncompressed_size(&self) -> Option<u64> {
        if self.has_data_descriptor() && self.uncompressed_size == 0 {
            None
        } else {
            Some(self.uncompressed_size)
        }
    }

    async fn read<R: AsyncRead + Unpin>(reader: &mut Lookahead<R>) -> Result<Self> {
        // Fixed part after the signature: version, flags, method, time, date,
        // crc, compressed size, uncompressed size, name length, extra length
        let mut fixed = [0u8; 26];
        read_exact_or_corrupt(reader, &mut fixed, "local file header").await?;

        let flags = le_u16(&fixed, 2);
        let compression_method = le_u16(&fixed, 4);
        let crc32 = le_u32(&fixed, 10);
        let compressed_size_32 = le_u32(&fixed, 14);
        let uncompressed_size_32 = le_u32(&fixed, 18);
        let filename_len = le_u16(&fixed, 22) as usize;
        let extra_len = le_u16(&fixed, 24) as usize;

        let mut filename_buf = vec![0u8; filename_len];
        read_exact_or_corrupt(reader, &mut filename_buf, "entry name").await?;
        let name = String::from_utf8_lossy(&filename_buf).to_string();

        let mut extra_buf = vec![0u8; extra_len];
        read_exact_or_corrupt(reader, &mut extra_buf, "extra field").await?;

        let mut header = EntryHeader {
            name,
            flags,
            compression_method,
            crc32,
            compressed_size: compressed_size_32 as u64,
            uncompressed_size: uncompressed_size_32 as u64,
            zip64: false,
        };

        // In a local header the ZIP64 field carries the original size first,
        // then the compressed size, each only when its 32-bit slot is saturated
        let mut i = 0usize;
        while i + 4 <= extra_buf.len() {
            let id = le_u16(&extra_buf, i);
            let data_len = le_u16(&extra_buf, i + 2) as usize;
            i += 4;
            if i + data_len > extra_buf.len() {
                return Err(FanoutError::corrupt(format!(
                    "extra field of {:?} overruns its header",
                    header.name
                )));
            }
            if id == ZIP64_EXTRA_FIELD_ID {
                header.zip64 = true;
                let field = &extra_buf[i..i + data_len];
                let mut cursor = 0usize;
                if uncompressed_size_32 == u32::MAX && cursor + 8 <= field.len() {
                    header.uncompressed_size = le_u64(field, cursor);
                    cursor += 8;
                }
                if compressed_size_32 == u32::MAX && cursor + 8 <= field.len() {
                    header.compressed_size = le_u64(field, cursor);
                }
            }
            i += data_len;
        }

        // Streaming ZIP64 writers saturate the 32-bit sizes and defer the real
        // ones to a 64-bit descriptor
        if header.has_data_descriptor() {
            if header.compressed_size == u32::MAX as u64 {
                header.compressed_size = 0;
                header.zip64 = true;
            }
            if header.uncompressed_size == u32::MAX as u64 {
                header.uncompressed_size = 0;
                header.zip64 = true;
            }
        }

        Ok(header)
    }
}

/// CRC and sizes written after an entry's data
#[derive(Debug, Clone, Copy)]
struct DataDescriptor {
    crc32: u32,
    compressed_size: u64,
    uncompressed_size: u64,
}

impl DataDescriptor {
    async fn read<R: AsyncRead + Unpin>(reader: &mut Lookahead<R>, zip64: bool) -> Result<Self> {
        let first = read_u32_or_corrupt(reader).await?;
        // The signature is optional; without it the first word is the CRC
        let crc32 = if first == DATA_DESCRIPTOR_SIGNATURE {
            read_u32_or_corrupt(reader).await?
        } else {
            first
        };

        let (compressed_size, uncompressed_size) = if zip64 {
            let mut buf = [0u8; 16];
            read_exact_or_corrupt(reader, &mut buf, "data descriptor").await?;
            (le_u64(&buf, 0), le_u64(&buf, 8))
        } else {
            let mut buf = [0u8; 8];
            read_exact_or_corrupt(reader, &mut buf, "data descriptor").await?;
            (le_u32(&buf, 0) as u64, le_u32(&buf, 4) as u64)
        };

        Ok(DataDescriptor {
            crc32,
            compressed_size,
            uncompressed_size,
        })
    }
}

/// Decompressor over the container cursor for the current entry
enum Decoder<R> {
    Stored(Take<Lookahead<R>>),
    /// Stored with no declared size; ends where a matching descriptor starts
    StoredScan(Lookahead<R>),
    Deflate(DeflateDecoder<Take<Lookahead<R>>>),
    /// Deflate with no declared size; the deflate stream marks its own end
    DeflateUnbounded(DeflateDecoder<Lookahead<R>>),
    #[cfg(feature = "zstd-support")]
    Zstd(ZstdDecoder<Take<Lookahead<R>>>),
    #[cfg(feature = "zstd-support")]
    ZstdUnbounded(ZstdDecoder<Lookahead<R>>),
    /// Known length but undecodable (encrypted or unknown method); skip only
    Opaque(Take<Lookahead<R>>),
}

impl<R: AsyncRead + Unpin> Decoder<R> {
    fn new(reader: Lookahead<R>, header: &EntryHeader) -> Result<Self> {
        let declared = header.declared_compressed_size();

        if !header.is_supported() {
            return match declared {
                Some(size) => Ok(Decoder::Opaque(reader.take(size))),
                None => Err(FanoutError::corrupt(format!(
                    "entry {:?} has an unsupported encoding and no declared size, cannot skip it",
                    header.name
                ))),
            };
        }

        match (header.compression_method, declared) {
            (METHOD_STORED, Some(size)) => Ok(Decoder::Stored(reader.take(size))),
            (METHOD_STORED, None) => Ok(Decoder::StoredScan(reader)),
            (METHOD_DEFLATE, Some(size)) => {
                Ok(Decoder::Deflate(DeflateDecoder::new(reader.take(size))))
            }
            (METHOD_DEFLATE, None) => Ok(Decoder::DeflateUnbounded(DeflateDecoder::new(reader))),
            #[cfg(feature = "zstd-support")]
            (METHOD_ZSTD, Some(size)) => Ok(Decoder::Zstd(ZstdDecoder::new(reader.take(size)))),
            #[cfg(feature = "zstd-support")]
            (METHOD_ZSTD, None) => Ok(Decoder::ZstdUnbounded(ZstdDecoder::new(reader))),
            (method, _) => Err(FanoutError::UnsupportedCompression(method)),
        }
    }

    /// The raw compressed bytes still owed, for entries of declared length
    fn raw_mut(&mut self) -> Option<&mut Take<Lookahead<R>>> {
        match self {
            Decoder::Stored(r) | Decoder::Opaque(r) => Some(r),
            Decoder::Deflate(d) => Some(d.get_mut()),
            #[cfg(feature = "zstd-support")]
            Decoder::Zstd(d) => Some(d.get_mut()),
            _ => None,
        }
    }

    fn into_inner(self) -> Lookahead<R> {
        match self {
            Decoder::Stored(r) | Decoder::Opaque(r) => r.into_inner(),
            Decoder::StoredScan(r) => r,
            Decoder::Deflate(d) => d.into_inner().into_inner(),
            Decoder::DeflateUnbounded(d) => d.into_inner(),
            #[cfg(feature = "zstd-support")]
            Decoder::Zstd(d) => d.into_inner().into_inner(),
            #[cfg(feature = "zstd-support")]
            Decoder::ZstdUnbounded(d) => d.into_inner(),
        }
    }
}

/// Body of the entry currently under the cursor
struct Body<R> {
    decoder: Decoder<R>,
    header: EntryHeader,
    crc: Crc32,
    written: u64,
    eof: bool,
}

fn verify_body(
    header: &EntryHeader,
    crc: &Crc32,
    written: u64,
    crc32: u32,
    uncompressed_size: u64,
) -> Result<()> {
    if written != uncompressed_size {
        return Err(FanoutError::corrupt(format!(
            "entry {:?} decoded to {} bytes, expected {}",
            header.name, written, uncompressed_size
        )));
    }
    let actual = crc.clone().finalize();
    if actual != crc32 {
        return Err(FanoutError::corrupt(format!(
            "entry {:?} failed CRC check: 0x{:08x} != 0x{:08x}",
            header.name, actual, crc32
        )));
    }
    Ok(())
}

/// Where the body of an unsized stored entry stands within the lookahead window
#[derive(Debug, PartialEq, Eq)]
enum Scan {
    /// This many leading bytes are entry data; more input is needed after them
    Body(usize),
    /// The descriptor starts after this many bytes of entry data
    Descriptor(usize),
    /// The source ended before any descriptor matched
    Truncated,
}

/// Look for the data descriptor that closes a stored entry of unknown size.
///
/// A candidate only counts when its CRC and both sizes agree with the bytes
/// in front of it, so descriptor signatures inside the data are passed over.
/// Positions are decided only once a whole signed descriptor fits behind
/// them, unless the source has ended.
fn scan_stored(window: &[u8], crc: &Crc32, written: u64, zip64: bool, at_eof: bool) -> Scan {
    let size_len = if zip64 { 8 } else { 4 };
    let unsigned_len = 4 + 2 * size_len;
    let signed_len = 4 + unsigned_len;

    let decided = if at_eof {
        window.len()
    } else {
        window.len().saturating_sub(signed_len - 1)
    };

    let sizes_match = |at: &[u8], count: u64| {
        if zip64 {
            le_u64(at, 0) == count && le_u64(at, 8) == count
        } else {
            le_u32(at, 0) as u64 == count && le_u32(at, 4) as u64 == count
        }
    };

    let mut running = crc.clone();
    let mut hashed = 0usize;
    for i in 0..decided {
        let rest = &window[i..];
        let count = written + i as u64;

        let signed = rest.len() >= signed_len
            && le_u32(rest, 0) == DATA_DESCRIPTOR_SIGNATURE
            && sizes_match(&rest[8..], count);
        let unsigned = rest.len() >= unsigned_len && sizes_match(&rest[4..], count);
        if !signed && !unsigned {
            continue;
        }

        running.update(&window[hashed..i]);
        hashed = i;
        let actual = running.clone().finalize();
        if (signed && le_u32(rest, 4) == actual) || (unsigned && le_u32(rest, 0) == actual) {
            return Scan::Descriptor(i);
        }
    }

    if at_eof {
        Scan::Truncated
    } else {
        Scan::Body(decided)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for Body<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.eof || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let before = buf.filled().len();
        match &mut this.decoder {
            Decoder::Stored(r) => ready!(Pin::new(r).poll_read(cx, buf))?,
            Decoder::StoredScan(r) => {
                let zip64 = this.header.zip64;
                ready!(r.poll_fill_to(cx, if zip64 { 24 } else { 16 }))?;
                let n = match scan_stored(r.buffer(), &this.crc, this.written, zip64, r.is_eof()) {
                    Scan::Body(n) | Scan::Descriptor(n) => n.min(buf.remaining()),
                    Scan::Truncated => {
                        let err = FanoutError::corrupt(format!(
                            "archive ended inside entry {:?}",
                            this.header.name
                        ));
                        return Poll::Ready(Err(err.into()));
                    }
                };
                // Nothing left in front of the descriptor means end of body;
                // the descriptor itself stays buffered for the trailer read
                buf.put_slice(&r.buffer()[..n]);
                r.consume_buffered(n);
            }
            Decoder::Deflate(d) => ready!(Pin::new(d).poll_read(cx, buf))?,
            Decoder::DeflateUnbounded(d) => ready!(Pin::new(d).poll_read(cx, buf))?,
            #[cfg(feature = "zstd-support")]
            Decoder::Zstd(d) => ready!(Pin::new(d).poll_read(cx, buf))?,
            #[cfg(feature = "zstd-support")]
            Decoder::ZstdUnbounded(d) => ready!(Pin::new(d).poll_read(cx, buf))?,
            Decoder::Opaque(_) => {
                let err = if this.header.is_encrypted() {
                    FanoutError::corrupt(format!(
                        "entry {:?} is encrypted",
                        this.header.name
                    ))
                } else {
                    FanoutError::UnsupportedCompression(this.header.compression_method)
                };
                return Poll::Ready(Err(err.into()));
            }
        }

        let chunk = &buf.filled()[before..];
        if chunk.is_empty() {
            this.eof = true;
            // Descriptor entries are checked once the trailer has been read
            if !this.header.has_data_descriptor() {
                verify_body(
                    &this.header,
                    &this.crc,
                    this.written,
                    this.header.crc32,
                    this.header.uncompressed_size,
                )?;
            }
        } else {
            this.crc.update(chunk);
            this.written += chunk.len() as u64;
        }
        Poll::Ready(Ok(()))
    }
}

enum State<R> {
    /// Positioned at the next record signature
    Header(Lookahead<R>),
    Body(Body<R>),
    Finished,
    /// A previous error left the cursor at an unknown position
    Poisoned,
}

/// Streaming ZIP reader over any `AsyncRead` source (network body, file, pipe)
pub struct ZipStreamReader<R> {
    state: State<R>,
    entries_seen: u64,
}

impl<R: AsyncRead + Unpin> ZipStreamReader<R> {
    /// Create a reader with the default 64KB buffer
    pub fn new(reader: R) -> Self {
        Self::with_buffer_size(reader, DEFAULT_BUFFER_SIZE)
    }

    /// Create a reader with a custom buffer in front of the source (at least 64 bytes)
    pub fn with_buffer_size(reader: R, buffer_size: usize) -> Self {
        ZipStreamReader {
            state: State::Header(Lookahead::with_capacity(buffer_size, reader)),
            entries_seen: 0,
        }
    }

    /// Number of local headers parsed so far
    pub fn entries_seen(&self) -> u64 {
        self.entries_seen
    }

    /// Advance to the next entry
    ///
    /// Whatever is left of the previous entry is discarded first. Returns
    /// `Ok(None)` once the central directory (or end record) is reached.
    pub async fn next_entry(&mut self) -> Result<Option<ZipStreamEntry<'_, R>>> {
        if matches!(self.state, State::Body(_)) {
            self.close_body(false).await?;
        }

        let mut reader = match std::mem::replace(&mut self.state, State::Poisoned) {
            State::Header(reader) => reader,
            State::Finished => {
                self.state = State::Finished;
                return Ok(None);
            }
            State::Poisoned | State::Body(_) => {
                return Err(FanoutError::corrupt(
                    "archive stream is unusable after an earlier error",
                ))
            }
        };

        let signature = read_u32_or_corrupt(&mut reader).await?;
        match signature {
            LOCAL_FILE_HEADER_SIGNATURE => {}
            CENTRAL_DIRECTORY_SIGNATURE
            | ZIP64_END_OF_CENTRAL_DIRECTORY_SIGNATURE
            | END_OF_CENTRAL_DIRECTORY_SIGNATURE => {
                self.state = State::Finished;
                return Ok(None);
            }
            other => {
                return Err(FanoutError::corrupt(format!(
                    "unexpected record signature 0x{:08x}",
                    other
                )))
            }
        }

        let header = EntryHeader::read(&mut reader).await?;
        let decoder = Decoder::new(reader, &header)?;
        self.entries_seen += 1;
        self.state = State::Body(Body {
            decoder,
            header: header.clone(),
            crc: Crc32::new(),
            written: 0,
            eof: false,
        });

        Ok(Some(ZipStreamEntry {
            header,
            stream: self,
        }))
    }

    /// Move past the current body and its trailer, returning the bytes decoded
    async fn close_body(&mut self, verify: bool) -> Result<u64> {
        let State::Body(mut body) = std::mem::replace(&mut self.state, State::Poisoned) else {
            return Err(FanoutError::corrupt("no entry is open"));
        };

        if verify || (!body.eof && body.decoder.raw_mut().is_none()) {
            // Either the caller wants the checksum, or the only way to find
            // the end of the entry is to decode it
            let mut scratch = [0u8; 8 * 1024];
            loop {
                let n = body.read(&mut scratch).await.map_err(FanoutError::from_io)?;
                if n == 0 {
                    break;
                }
            }
        }

        if let Some(raw) = body.decoder.raw_mut() {
            tokio::io::copy(raw, &mut tokio::io::sink()).await?;
            if raw.limit() != 0 {
                return Err(FanoutError::corrupt(format!(
                    "archive ended inside entry {:?}",
                    body.header.name
                )));
            }
        }

        let Body {
            decoder,
            header,
            crc,
            written,
            eof,
        } = body;
        let mut reader = decoder.into_inner();

        if header.has_data_descriptor() {
            let descriptor = DataDescriptor::read(&mut reader, header.zip64).await?;
            if eof {
                verify_body(
                    &header,
                    &crc,
                    written,
                    descriptor.crc32,
                    descriptor.uncompressed_size,
                )?;
            }
            tracing::trace!(
                entry = %header.name,
                compressed = descriptor.compressed_size,
                "read data descriptor"
            );
        }

        self.state = State::Header(reader);
        Ok(written)
    }
}

/// One entry of the archive, borrowed from its [`ZipStreamReader`]
///
/// Reading through `AsyncRead` yields the decompressed bytes. Finish with
/// [`finish`](Self::finish) to have the checksum verified, or
/// [`drain`](Self::drain) to throw the entry away.
pub struct ZipStreamEntry<'a, R> {
    header: EntryHeader,
    stream: &'a mut ZipStreamReader<R>,
}

impl<R: AsyncRead + Unpin> ZipStreamEntry<'_, R> {
    /// Entry path inside the archive
    pub fn path(&self) -> &str {
        &self.header.name
    }

    pub fn header(&self) -> &EntryHeader {
        &self.header
    }

    pub fn compression_method(&self) -> u16 {
        self.header.compression_method
    }

    pub fn compressed_size(&self) -> Option<u64> {
        self.header.declared_compressed_size()
    }

    pub fn uncompressed_size(&self) -> Option<u64> {
        self.header.declared_uncompressed_size()
    }

    pub fn is_dir(&self) -> bool {
        self.header.is_dir()
    }

    pub fn is_supported(&self) -> bool {
        self.header.is_supported()
    }

    /// Read any remaining bytes, verify CRC-32 and size, and release the reader.
    ///
    /// Returns the total decompressed size of the entry.
    pub async fn finish(self) -> Result<u64> {
        self.stream.close_body(true).await
    }

    /// Discard the entry without holding its bytes.
    ///
    /// Entries of declared size are skipped as raw compressed bytes; otherwise
    /// the body is decoded into a fixed scratch buffer to find its end.
    pub async fn drain(self) -> Result<()> {
        self.stream.close_body(false).await.map(|_| ())
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ZipStreamEntry<'_, R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream.state {
            State::Body(body) => Pin::new(body).poll_read(cx, buf),
            _ => Poll::Ready(Ok(())),
        }
    }
}

async fn read_exact_or_corrupt<R: AsyncRead + Unpin>(
    reader: &mut Lookahead<R>,
    buf: &mut [u8],
    what: &str,
) -> Result<()> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(FanoutError::corrupt(format!(
            "archive ended inside {}",
            what
        ))),
        Err(e) => Err(e.into()),
    }
}

async fn read_u32_or_corrupt<R: AsyncRead + Unpin>(reader: &mut Lookahead<R>) -> Result<u32> {
    let mut buf = [0u8; 4];
    read_exact_or_corrupt(reader, &mut buf, "record signature").await?;
    Ok(u32::from_le_bytes(buf))
}

fn le_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn le_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn le_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}
