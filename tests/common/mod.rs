//! Hand-built ZIP archives for tests
//!
//! Lets tests produce layouts that mainstream writers avoid: data descriptors
//! with and without signature, ZIP64 extra fields, unknown methods, encrypted
//! flags, and corrupted checksums.

#![allow(dead_code)]

use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::io::Write;

const LOCAL_FILE_HEADER: u32 = 0x04034b50;
const CENTRAL_DIRECTORY: u32 = 0x02014b50;
const END_OF_CENTRAL_DIRECTORY: u32 = 0x06054b50;
const DATA_DESCRIPTOR: u32 = 0x08074b50;

pub const STORED: u16 = 0;
pub const DEFLATE: u16 = 8;

/// How one entry is laid out
#[derive(Debug, Clone, Copy)]
pub struct EntryOptions {
    pub method: u16,
    /// Sizes and CRC go into a trailing data descriptor
    pub descriptor: bool,
    /// Write the optional `PK\x07\x08` descriptor signature
    pub descriptor_signature: bool,
    /// Saturated 32-bit sizes plus a ZIP64 extra field (or 64-bit descriptor)
    pub zip64: bool,
    pub encrypted: bool,
    /// Flip the stored CRC
    pub bad_crc: bool,
}

impl EntryOptions {
    pub fn stored() -> Self {
        Self {
            method: STORED,
            descriptor: false,
            descriptor_signature: true,
            zip64: false,
            encrypted: false,
            bad_crc: false,
        }
    }

    pub fn deflated() -> Self {
        Self {
            method: DEFLATE,
            ..Self::stored()
        }
    }

    pub fn with_descriptor(mut self, signature: bool) -> Self {
        self.descriptor = true;
        self.descriptor_signature = signature;
        self
    }

    pub fn zip64(mut self) -> Self {
        self.zip64 = true;
        self
    }
}

struct CentralRecord {
    name: String,
    method: u16,
    flags: u16,
    crc: u32,
    compressed: u64,
    uncompressed: u64,
    offset: u64,
}

/// Builds an archive entry by entry, then appends a central directory
#[derive(Default)]
pub struct ZipFixture {
    buf: Vec<u8>,
    central: Vec<CentralRecord>,
}

pub fn deflate(data: &[u8]) -> Vec<u8> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// Compressible payload of `len` bytes
pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| b"the quick brown fox "[(i + seed as usize) % 20])
        .collect()
}

impl ZipFixture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stored(self, name: &str, data: &[u8]) -> Self {
        self.entry(name, data, EntryOptions::stored())
    }

    pub fn deflated(self, name: &str, data: &[u8]) -> Self {
        self.entry(name, data, EntryOptions::deflated())
    }

    pub fn directory(self, name: &str) -> Self {
        self.entry(name, b"", EntryOptions::stored())
    }

    /// Entry whose body is written verbatim under an arbitrary method id
    pub fn raw(mut self, name: &str, method: u16, body: &[u8]) -> Self {
        let crc = crc32fast::hash(body);
        self.push_local(name, method, 0, crc, body.len() as u64, body.len() as u64, &[]);
        self.buf.extend_from_slice(body);
        self
    }

    pub fn entry(mut self, name: &str, data: &[u8], options: EntryOptions) -> Self {
        let body = match options.method {
            DEFLATE => deflate(data),
            _ => data.to_vec(),
        };
        let mut crc = crc32fast::hash(data);
        if options.bad_crc {
            crc ^= 0xdead_beef;
        }
        let mut flags = 0u16;
        if options.descriptor {
            flags |= 0x0008;
        }
        if options.encrypted {
            flags |= 0x0001;
        }

        let (header_crc, header_compressed, header_uncompressed) = if options.descriptor {
            (0, 0, 0)
        } else {
            (crc, body.len() as u64, data.len() as u64)
        };

        let mut extra = Vec::new();
        let offset = self.buf.len() as u64;
        if options.zip64 {
            extra.extend_from_slice(&0x0001u16.to_le_bytes());
            extra.extend_from_slice(&16u16.to_le_bytes());
            extra.extend_from_slice(&header_uncompressed.to_le_bytes());
            extra.extend_from_slice(&header_compressed.to_le_bytes());
            self.push_local(
                name,
                options.method,
                flags,
                header_crc,
                u32::MAX as u64,
                u32::MAX as u64,
                &extra,
            );
        } else {
            self.push_local(
                name,
                options.method,
                flags,
                header_crc,
                header_compressed,
                header_uncompressed,
                &extra,
            );
        }
        self.buf.extend_from_slice(&body);

        if options.descriptor {
            if options.descriptor_signature {
                self.put_u32(DATA_DESCRIPTOR);
            }
            self.put_u32(crc);
            if options.zip64 {
                self.put_u64(body.len() as u64);
                self.put_u64(data.len() as u64);
            } else {
                self.put_u32(body.len() as u32);
                self.put_u32(data.len() as u32);
            }
        }

        if let Some(record) = self.central.last_mut() {
            record.crc = crc;
            record.compressed = body.len() as u64;
            record.uncompressed = data.len() as u64;
            record.offset = offset;
        }
        self
    }

    #[allow(clippy::too_many_arguments)]
    fn push_local(
        &mut self,
        name: &str,
        method: u16,
        flags: u16,
        crc: u32,
        compressed: u64,
        uncompressed: u64,
        extra: &[u8],
    ) {
        let offset = self.buf.len() as u64;
        self.put_u32(LOCAL_FILE_HEADER);
        self.put_u16(if extra.is_empty() { 20 } else { 45 });
        self.put_u16(flags);
        self.put_u16(method);
        self.put_u16(0); // time
        self.put_u16(0x21); // date
        self.put_u32(crc);
        self.put_u32(compressed.min(u32::MAX as u64) as u32);
        self.put_u32(uncompressed.min(u32::MAX as u64) as u32);
        self.put_u16(name.len() as u16);
        self.put_u16(extra.len() as u16);
        self.buf.extend_from_slice(name.as_bytes());
        self.buf.extend_from_slice(extra);

        self.central.push(CentralRecord {
            name: name.to_string(),
            method,
            flags,
            crc,
            compressed,
            uncompressed,
            offset,
        });
    }

    /// Append the central directory and end record
    pub fn finish(mut self) -> Vec<u8> {
        let cd_start = self.buf.len();
        let records = std::mem::take(&mut self.central);
        for record in &records {
            self.put_u32(CENTRAL_DIRECTORY);
            self.put_u16(20); // version made by
            self.put_u16(20); // version needed
            self.put_u16(record.flags);
            self.put_u16(record.method);
            self.put_u16(0);
            self.put_u16(0x21);
            self.put_u32(record.crc);
            self.put_u32(record.compressed.min(u32::MAX as u64) as u32);
            self.put_u32(record.uncompressed.min(u32::MAX as u64) as u32);
            self.put_u16(record.name.len() as u16);
            self.put_u16(0); // extra
            self.put_u16(0); // comment
            self.put_u16(0); // disk
            self.put_u16(0); // internal attributes
            self.put_u32(0); // external attributes
            self.put_u32(record.offset.min(u32::MAX as u64) as u32);
            self.buf.extend_from_slice(record.name.as_bytes());
        }
        let cd_size = self.buf.len() - cd_start;

        self.put_u32(END_OF_CENTRAL_DIRECTORY);
        self.put_u16(0);
        self.put_u16(0);
        self.put_u16(records.len() as u16);
        self.put_u16(records.len() as u16);
        self.put_u32(cd_size as u32);
        self.put_u32(cd_start as u32);
        self.put_u16(0);
        self.buf
    }

    /// The local sections only, cut `cut` bytes short
    pub fn truncated(self, cut: usize) -> Vec<u8> {
        let mut bytes = self.buf;
        let len = bytes.len().saturating_sub(cut);
        bytes.truncate(len);
        bytes
    }

    fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
}

/// Archive written by the `zip` crate, for interoperability checks
pub fn zip_crate_archive(entries: &[(&str, &[u8], bool)]) -> Vec<u8> {
    use zip::write::FileOptions;
    use zip::CompressionMethod;

    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for (name, data, compress) in entries {
        if name.ends_with('/') {
            writer.add_directory(*name, FileOptions::default()).unwrap();
            continue;
        }
        let method = if *compress {
            CompressionMethod::Deflated
        } else {
            CompressionMethod::Stored
        };
        writer
            .start_file(*name, FileOptions::default().compression_method(method))
            .unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap().into_inner()
}
