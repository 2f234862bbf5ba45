//! Raw data file writing
//!
//! File format:
//! - Header: Magic "B2RAW001" + length (4 bytes) + MsgPack metadata
//! - Block records: word count (4 bytes LE) + words (4 bytes LE each), repeated
//! - Footer: Fixed 64 bytes with magic "B2RAWEND", checksum, completion flag
//!
//! A file without footer (writer crashed) stays readable up to the last
//! complete record.

mod format;

pub use format::{
    encode_record, ChecksumCalculator, DataBlockIterator, DataFileReader, FileFooter,
    FileFormatError, FileHeader, FileValidationResult, IntoDataBlocks, FILE_MAGIC, FOOTER_MAGIC,
    FOOTER_SIZE, FORMAT_VERSION,
};

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::rawdata::layout::raw_header;

/// Open a raw data file for reading
pub fn open_raw_file<P: AsRef<Path>>(
    path: P,
) -> Result<DataFileReader<BufReader<File>>, FileFormatError> {
    let file = File::open(path)?;
    DataFileReader::new(BufReader::new(file))
}

/// Writes COPPER blocks to one raw data file
pub struct RawFileWriter {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    checksum: ChecksumCalculator,
    footer: FileFooter,
    header_size: u64,
}

impl RawFileWriter {
    /// Create the file and write its header
    pub fn create<P: AsRef<Path>>(path: P, header: &FileHeader) -> Result<Self, FileFormatError> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let file = File::create(&path)?;
        let mut writer = BufWriter::with_capacity(64 * 1024, file);
        let header_size = header.write_to(&mut writer)? as u64;

        info!(
            path = %path.display(),
            exp = header.exp_number,
            run = header.run_number,
            "Opened raw data file"
        );

        Ok(Self {
            path,
            writer: Some(writer),
            checksum: ChecksumCalculator::new(),
            footer: FileFooter::new(),
            header_size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn blocks_written(&self) -> u64 {
        self.footer.total_blocks
    }

    /// Bytes written so far, header included
    pub fn file_size(&self) -> u64 {
        self.header_size + self.checksum.bytes_processed()
    }

    /// Append one COPPER block
    pub fn write_block(&mut self, words: &[u32]) -> Result<(), FileFormatError> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(FileFormatError::IncompleteFile);
        };
        let (data, len_bytes) = encode_record(words);
        writer.write_all(&len_bytes)?;
        writer.write_all(&data)?;

        self.checksum.update(&len_bytes);
        self.checksum.update(&data);
        self.footer.total_blocks += 1;
        if let Some(&event) = words.get(raw_header::POS_EVE_NO) {
            self.footer.update_event_range(event as u64);
        }

        debug!(nwords = words.len(), "Wrote block");
        Ok(())
    }

    /// Write the footer and close the file
    pub fn finish(mut self) -> Result<FileFooter, FileFormatError> {
        self.close()
    }

    fn close(&mut self) -> Result<FileFooter, FileFormatError> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(self.footer);
        };
        self.footer.data_checksum = self.checksum.finalize();
        self.footer.data_bytes = self.checksum.bytes_processed();
        self.footer.finalize();
        self.footer.write_to(&mut writer)?;
        writer.flush()?;
        writer.get_ref().sync_data()?;

        info!(
            path = %self.path.display(),
            blocks = self.footer.total_blocks,
            size_mb = (self.file_size() + FOOTER_SIZE as u64) as f64 / 1_000_000.0,
            checksum = format!("{:016x}", self.footer.data_checksum),
            "Closed raw data file"
        );
        Ok(self.footer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_and_read_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sub").join("run0001.b2raw");

        let mut writer = RawFileWriter::create(&path, &FileHeader::new(1, 1, 0)).unwrap();
        let mut a = vec![0u32; 30];
        a[raw_header::POS_EVE_NO] = 10;
        let mut b = vec![1u32; 32];
        b[raw_header::POS_EVE_NO] = 11;
        writer.write_block(&a).unwrap();
        writer.write_block(&b).unwrap();
        assert_eq!(writer.blocks_written(), 2);
        let footer = writer.finish().unwrap();
        assert_eq!(footer.first_event_number, 10);
        assert_eq!(footer.last_event_number, 11);

        let mut reader = open_raw_file(&path).unwrap();
        let result = reader.validate();
        assert!(result.is_valid, "{:?}", result.errors);
        let blocks: Vec<Vec<u32>> = reader.data_blocks().map(|b| b.unwrap()).collect();
        assert_eq!(blocks, vec![a, b]);
    }

    #[test]
    fn test_unfinished_file_is_recoverable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("crash.b2raw");
        {
            let mut writer = RawFileWriter::create(&path, &FileHeader::new(1, 2, 0)).unwrap();
            writer.write_block(&[5u32; 30]).unwrap();
            // Dropped without finish(): no footer, as after a crash
        }
        let mut reader = open_raw_file(&path).unwrap();
        let result = reader.validate();
        assert!(!result.is_valid);
        assert!(result.needs_recovery());
        assert_eq!(result.recoverable_blocks, 1);
    }
}
