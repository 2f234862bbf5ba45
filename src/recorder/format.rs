//! File format structures for raw COPPER data files
//!
//! File structure:
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  Header (length-prefixed MsgPack)        │
//! │  - Magic, Version, Run metadata          │
//! ├─────────────────────────────────────────┤
//! │  Block record 1                         │
//! │  - Word count (u32 LE)                  │
//! │  - COPPER block words (u32 LE each)     │
//! ├─────────────────────────────────────────┤
//! │  ...                                    │
//! ├─────────────────────────────────────────┤
//! │  Footer (fixed 64 bytes)                │
//! │  - Magic, checksums, completion flag    │
//! └─────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use xxhash_rust::xxh64::xxh64;

/// Magic bytes for raw data files
pub const FILE_MAGIC: [u8; 8] = *b"B2RAW001";

/// Current file format version
pub const FORMAT_VERSION: u32 = 1;

/// Footer magic bytes (different from header to detect truncation)
pub const FOOTER_MAGIC: [u8; 8] = *b"B2RAWEND";

/// Fixed footer size in bytes
pub const FOOTER_SIZE: usize = 64;

/// Largest block record accepted when scanning (words)
pub const MAX_RECORD_NWORDS: usize = 25_000_000;

/// File header containing metadata about the run and file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileHeader {
    /// Format version
    pub version: u32,

    pub exp_number: u32,
    pub run_number: u32,
    pub subrun_number: u32,

    /// File sequence number within run (0, 1, 2, ...)
    pub file_sequence: u32,

    /// File creation time (Unix timestamp in nanoseconds)
    pub file_start_time_ns: u64,

    /// Run comment
    pub comment: String,

    /// Node ids of the COPPER boards in this file
    pub node_ids: Vec<u32>,

    /// Additional key-value metadata
    pub metadata: HashMap<String, String>,
}

impl FileHeader {
    /// Create a new header with required fields
    pub fn new(exp_number: u32, run_number: u32, file_sequence: u32) -> Self {
        Self {
            version: FORMAT_VERSION,
            exp_number,
            run_number,
            subrun_number: 0,
            file_sequence,
            file_start_time_ns: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64,
            comment: String::new(),
            node_ids: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Serialize header to bytes (with magic prefix)
    pub fn to_bytes(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(&FILE_MAGIC);
        let header_bytes = rmp_serde::to_vec(self)?;
        let len = header_bytes.len() as u32;
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&header_bytes);
        Ok(buf)
    }

    /// Deserialize header from bytes (expects magic prefix)
    pub fn from_bytes(data: &[u8]) -> Result<Self, FileFormatError> {
        if data.len() < 12 {
            return Err(FileFormatError::TooShort);
        }
        if data[0..8] != FILE_MAGIC {
            return Err(FileFormatError::InvalidMagic);
        }
        let len = u32::from_le_bytes([data[8], data[9], data[10], data[11]]) as usize;
        if data.len() < 12 + len {
            return Err(FileFormatError::TooShort);
        }
        rmp_serde::from_slice(&data[12..12 + len]).map_err(FileFormatError::Deserialization)
    }

    /// Write header to a writer
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<usize, FileFormatError> {
        let bytes = self.to_bytes()?;
        writer.write_all(&bytes)?;
        Ok(bytes.len())
    }

    /// Read header from a reader
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, FileFormatError> {
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if magic != FILE_MAGIC {
            return Err(FileFormatError::InvalidMagic);
        }

        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;

        let mut data = vec![0u8; len];
        reader.read_exact(&mut data)?;

        rmp_serde::from_slice(&data).map_err(FileFormatError::Deserialization)
    }
}

/// File footer containing checksums and completion status
///
/// Fixed 64-byte structure for easy seeking to file end.
#[derive(Debug, Clone, Copy)]
pub struct FileFooter {
    pub magic: [u8; 8],

    /// Combined xxHash64 of all block records (excluding header and footer)
    pub data_checksum: u64,

    /// Number of block records
    pub total_blocks: u64,

    /// Total bytes of block records
    pub data_bytes: u64,

    /// Event number of the first and last block
    pub first_event_number: u64,
    pub last_event_number: u64,

    /// File end time (Unix timestamp in nanoseconds)
    pub file_end_time_ns: u64,

    /// Write completion flag (1 = complete, 0 = incomplete/crashed)
    pub write_complete: u8,

    _reserved: [u8; 7],
}

impl Default for FileFooter {
    fn default() -> Self {
        Self::new()
    }
}

impl FileFooter {
    pub fn new() -> Self {
        Self {
            magic: FOOTER_MAGIC,
            data_checksum: 0,
            total_blocks: 0,
            data_bytes: 0,
            first_event_number: u64::MAX,
            last_event_number: 0,
            file_end_time_ns: 0,
            write_complete: 0,
            _reserved: [0u8; 7],
        }
    }

    /// Mark as complete and set end time
    pub fn finalize(&mut self) {
        self.write_complete = 1;
        self.file_end_time_ns = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
    }

    pub fn is_complete(&self) -> bool {
        self.write_complete == 1
    }

    /// Widen the event number range with one block
    pub fn update_event_range(&mut self, event_number: u64) {
        self.first_event_number = self.first_event_number.min(event_number);
        self.last_event_number = self.last_event_number.max(event_number);
    }

    /// Serialize footer to fixed 64-byte array
    pub fn to_bytes(&self) -> [u8; FOOTER_SIZE] {
        let mut buf = [0u8; FOOTER_SIZE];
        buf[0..8].copy_from_slice(&self.magic);
        let fields = [
            self.data_checksum,
            self.total_blocks,
            self.data_bytes,
            self.first_event_number,
            self.last_event_number,
            self.file_end_time_ns,
        ];
        for (i, value) in fields.iter().enumerate() {
            let start = 8 + i * 8;
            buf[start..start + 8].copy_from_slice(&value.to_le_bytes());
        }
        buf[56] = self.write_complete;
        buf
    }

    /// Deserialize footer from 64-byte array
    pub fn from_bytes(data: &[u8; FOOTER_SIZE]) -> Result<Self, FileFormatError> {
        let mut magic = [0u8; 8];
        magic.copy_from_slice(&data[0..8]);
        if magic != FOOTER_MAGIC {
            return Err(FileFormatError::InvalidFooterMagic);
        }

        let field = |i: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&data[8 + i * 8..16 + i * 8]);
            u64::from_le_bytes(bytes)
        };

        Ok(Self {
            magic,
            data_checksum: field(0),
            total_blocks: field(1),
            data_bytes: field(2),
            first_event_number: field(3),
            last_event_number: field(4),
            file_end_time_ns: field(5),
            write_complete: data[56],
            _reserved: [0u8; 7],
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), FileFormatError> {
        writer.write_all(&self.to_bytes())?;
        Ok(())
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, FileFormatError> {
        let mut buf = [0u8; FOOTER_SIZE];
        reader.read_exact(&mut buf)?;
        Self::from_bytes(&buf)
    }
}

/// Incremental checksum calculator using xxHash64
#[derive(Debug, Clone, Default)]
pub struct ChecksumCalculator {
    state: u64,
    bytes_processed: u64,
}

impl ChecksumCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one chunk into the running checksum
    ///
    /// Chunk boundaries matter: writer and verifier feed the same record
    /// split (length prefix, then payload).
    pub fn update(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let block_hash = xxh64(data, 0);
        self.state = self.state.rotate_left(5) ^ block_hash;
        self.bytes_processed += data.len() as u64;
    }

    pub fn finalize(&self) -> u64 {
        self.state ^ self.bytes_processed
    }

    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed
    }

    pub fn reset(&mut self) {
        self.state = 0;
        self.bytes_processed = 0;
    }
}

/// Encode one block record: word count then the words, little endian
pub fn encode_record(words: &[u32]) -> (Vec<u8>, [u8; 4]) {
    let len_bytes = (words.len() as u32).to_le_bytes();
    let mut data = Vec::with_capacity(words.len() * 4);
    for w in words {
        data.extend_from_slice(&w.to_le_bytes());
    }
    (data, len_bytes)
}

/// File format errors
#[derive(Debug, thiserror::Error)]
pub enum FileFormatError {
    #[error("Data too short to contain valid structure")]
    TooShort,

    #[error("Invalid file magic bytes")]
    InvalidMagic,

    #[error("Invalid footer magic bytes")]
    InvalidFooterMagic,

    #[error("Deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid record length {0} words")]
    InvalidRecord(usize),

    #[error("Checksum mismatch: expected {expected:016x}, got {actual:016x}")]
    ChecksumMismatch { expected: u64, actual: u64 },

    #[error("Incomplete file (footer indicates crash during write)")]
    IncompleteFile,
}

/// Result of file validation
#[derive(Debug)]
pub struct FileValidationResult {
    pub is_valid: bool,
    pub header: Option<FileHeader>,
    pub footer: Option<FileFooter>,
    /// Number of readable block records
    pub recoverable_blocks: usize,
    /// Words in readable block records
    pub recoverable_words: u64,
    pub errors: Vec<String>,
}

impl FileValidationResult {
    /// Check if file needs recovery (has data but incomplete)
    pub fn needs_recovery(&self) -> bool {
        !self.is_valid && self.recoverable_blocks > 0
    }
}

/// Reader for raw data files with recovery support
pub struct DataFileReader<R> {
    reader: R,
    header: Option<FileHeader>,
    footer: Option<FileFooter>,
    header_size: u64,
    file_size: u64,
}

impl<R: Read + Seek> DataFileReader<R> {
    /// Open a data file for reading
    pub fn new(mut reader: R) -> Result<Self, FileFormatError> {
        let file_size = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;

        let mut this = Self {
            reader,
            header: None,
            footer: None,
            header_size: 0,
            file_size,
        };
        this.read_header()?;
        Ok(this)
    }

    fn read_header(&mut self) -> Result<(), FileFormatError> {
        self.reader.seek(SeekFrom::Start(0))?;
        let header = FileHeader::read_from(&mut self.reader)?;
        self.header_size = self.reader.stream_position()?;
        self.header = Some(header);
        Ok(())
    }

    /// Try to read the footer (may fail for incomplete files)
    pub fn read_footer(&mut self) -> Result<FileFooter, FileFormatError> {
        if self.file_size < self.header_size + FOOTER_SIZE as u64 {
            return Err(FileFormatError::TooShort);
        }
        self.reader.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let footer = FileFooter::read_from(&mut self.reader)?;
        self.footer = Some(footer);
        Ok(footer)
    }

    pub fn header(&self) -> Option<&FileHeader> {
        self.header.as_ref()
    }

    pub fn footer(&self) -> Option<&FileFooter> {
        self.footer.as_ref()
    }

    /// End of the record region; a missing footer leaves it at file end
    fn data_end(&self) -> u64 {
        match self.footer {
            Some(_) => self.file_size - FOOTER_SIZE as u64,
            None => self.file_size,
        }
    }

    /// Validate file integrity
    pub fn validate(&mut self) -> FileValidationResult {
        let mut result = FileValidationResult {
            is_valid: false,
            header: self.header.clone(),
            footer: None,
            recoverable_blocks: 0,
            recoverable_words: 0,
            errors: Vec::new(),
        };

        if self.header.is_none() {
            result.errors.push("Missing or invalid header".to_string());
            return result;
        }

        match self.read_footer() {
            Ok(footer) => {
                result.footer = Some(footer);
                if !footer.is_complete() {
                    result
                        .errors
                        .push("File incomplete (crash during write)".to_string());
                }
            }
            Err(e) => {
                self.footer = None;
                result.errors.push(format!("Failed to read footer: {}", e));
            }
        }

        // Scan records and recompute the checksum in one pass
        let mut calc = ChecksumCalculator::new();
        for record in self.records() {
            match record {
                Ok(raw) => {
                    result.recoverable_blocks += 1;
                    result.recoverable_words += raw.words.len() as u64;
                    calc.update(&raw.len_bytes);
                    calc.update(&raw.data);
                }
                Err(e) => {
                    result.errors.push(format!("Record scan stopped: {}", e));
                    break;
                }
            }
        }

        if let Some(footer) = result.footer {
            if footer.is_complete() {
                let actual = calc.finalize();
                if actual == footer.data_checksum {
                    result.is_valid = true;
                } else {
                    result.errors.push(
                        FileFormatError::ChecksumMismatch {
                            expected: footer.data_checksum,
                            actual,
                        }
                        .to_string(),
                    );
                }
            }
        }

        result
    }

    fn records(&mut self) -> RecordIterator<'_, R> {
        let start = self.header_size;
        let data_end = self.data_end();
        let failed = self.reader.seek(SeekFrom::Start(start)).is_err();
        RecordIterator {
            reader: &mut self.reader,
            data_end,
            done: failed,
        }
    }

    /// Iterator over the COPPER blocks in the file
    ///
    /// Call [`read_footer`](Self::read_footer) first on complete files so
    /// the footer is not read as a record; without it the scan stops at the
    /// first unreadable record.
    pub fn data_blocks(&mut self) -> DataBlockIterator<'_, R> {
        DataBlockIterator {
            inner: self.records(),
        }
    }

    /// Owning variant of [`data_blocks`](Self::data_blocks) for handing the
    /// file to another thread
    pub fn into_data_blocks(mut self) -> IntoDataBlocks<R> {
        let data_end = self.data_end();
        let done = self.reader.seek(SeekFrom::Start(self.header_size)).is_err();
        IntoDataBlocks {
            reader: self.reader,
            data_end,
            done,
        }
    }
}

/// One record with the raw bytes needed for checksumming
struct RawRecord {
    len_bytes: [u8; 4],
    data: Vec<u8>,
    words: Vec<u32>,
}

struct RecordIterator<'a, R> {
    reader: &'a mut R,
    data_end: u64,
    done: bool,
}

impl<'a, R: Read + Seek> Iterator for RecordIterator<'a, R> {
    type Item = Result<RawRecord, FileFormatError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let pos = match self.reader.stream_position() {
            Ok(p) => p,
            Err(e) => {
                self.done = true;
                return Some(Err(FileFormatError::Io(e)));
            }
        };
        if pos >= self.data_end {
            self.done = true;
            return None;
        }

        let mut len_bytes = [0u8; 4];
        if let Err(e) = self.reader.read_exact(&mut len_bytes) {
            self.done = true;
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                return None;
            }
            return Some(Err(FileFormatError::Io(e)));
        }

        let nwords = u32::from_le_bytes(len_bytes) as usize;
        if nwords == 0 || nwords > MAX_RECORD_NWORDS {
            self.done = true;
            return Some(Err(FileFormatError::InvalidRecord(nwords)));
        }
        if pos + 4 + nwords as u64 * 4 > self.data_end {
            self.done = true;
            return Some(Err(FileFormatError::TooShort));
        }

        let mut data = vec![0u8; nwords * 4];
        if let Err(e) = self.reader.read_exact(&mut data) {
            self.done = true;
            return Some(Err(FileFormatError::Io(e)));
        }
        let words = data
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        Some(Ok(RawRecord {
            len_bytes,
            data,
            words,
        }))
    }
}

/// Iterator over COPPER blocks in a file
pub struct DataBlockIterator<'a, R> {
    inner: RecordIterator<'a, R>,
}

impl<'a, R: Read + Seek> Iterator for DataBlockIterator<'a, R> {
    type Item = Result<Vec<u32>, FileFormatError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|r| r.map(|raw| raw.words))
    }
}

/// Iterator over COPPER blocks that owns the file
pub struct IntoDataBlocks<R> {
    reader: R,
    data_end: u64,
    done: bool,
}

impl<R: Read + Seek> Iterator for IntoDataBlocks<R> {
    type Item = Result<Vec<u32>, FileFormatError>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut records = RecordIterator {
            reader: &mut self.reader,
            data_end: self.data_end,
            done: self.done,
        };
        let item = records.next();
        self.done = records.done;
        item.map(|r| r.map(|raw| raw.words))
    }
}
