//! Page-level I/O on a single history file.

use crate::header::{TreeHeader, HEADER_REGION_SIZE};
use histree_common::{Result, StateHistoryError};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Reads and writes node pages, the header and the attribute blob of one history file.
///
/// Pages are addressed by node sequence number: page `seq` lives at
/// `HEADER_REGION_SIZE + seq * block_size`.
pub struct HistoryFile {
    /// Path to the file.
    path: PathBuf,
    /// The file handle, shared by the writer and concurrent readers.
    file: Mutex<File>,
    /// Size of one node page.
    block_size: usize,
    #[cfg(test)]
    fail_writes: std::sync::atomic::AtomicBool,
}

impl HistoryFile {
    /// Creates a new history file, truncating any existing file at `path`.
    pub fn create(path: impl AsRef<Path>, block_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        Ok(Self {
            path,
            file: Mutex::new(file),
            block_size,
            #[cfg(test)]
            fail_writes: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Opens an existing history file for reading and returns it with its header.
    ///
    /// The header is validated before the file is returned.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, TreeHeader)> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().read(true).open(&path)?;

        let mut buf = [0u8; TreeHeader::SIZE];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut buf).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                StateHistoryError::Format("file too short to hold a header".to_string())
            }
            _ => StateHistoryError::StorageIo(e),
        })?;
        let header = TreeHeader::from_bytes(&buf)?;
        header.validate()?;

        Ok((
            Self {
                path,
                file: Mutex::new(file),
                block_size: header.block_size as usize,
                #[cfg(test)]
                fail_writes: std::sync::atomic::AtomicBool::new(false),
            },
            header,
        ))
    }

    /// Returns the file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the page size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// File offset of page `seq`.
    #[inline]
    pub fn page_offset(&self, seq: u32) -> u64 {
        HEADER_REGION_SIZE + seq as u64 * self.block_size as u64
    }

    /// Writes the header at offset 0.
    pub fn write_header(&self, header: &TreeHeader) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header.to_bytes())?;
        Ok(())
    }

    /// Reads the page of node `seq`.
    pub fn read_page(&self, seq: u32) -> Result<Vec<u8>> {
        let offset = self.page_offset(seq);
        let mut buf = vec![0u8; self.block_size];

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                StateHistoryError::Format(format!("node {} lies past the end of the file", seq))
            }
            _ => StateHistoryError::StorageIo(e),
        })?;

        Ok(buf)
    }

    /// Writes the page of node `seq`.
    pub fn write_page(&self, seq: u32, data: &[u8]) -> Result<()> {
        if data.len() != self.block_size {
            return Err(StateHistoryError::Format(format!(
                "page of {} bytes written to file with block size {}",
                data.len(),
                self.block_size
            )));
        }
        #[cfg(test)]
        if self.fail_writes.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "page write failed").into());
        }
        let offset = self.page_offset(seq);

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    /// Makes every following page write fail with an I/O error.
    #[cfg(test)]
    pub(crate) fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, std::sync::atomic::Ordering::Relaxed);
    }

    /// Writes `data` followed by its CRC32 at `offset`.
    pub fn write_blob(&self, offset: u64, data: &[u8]) -> Result<()> {
        let checksum = crc32fast::hash(data);

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.write_all(&checksum.to_le_bytes())?;
        Ok(())
    }

    /// Reads `size` bytes at `offset` and verifies the trailing CRC32.
    pub fn read_blob(&self, offset: u64, size: u64) -> Result<Vec<u8>> {
        let size = usize::try_from(size)
            .map_err(|_| StateHistoryError::Format(format!("blob size {} too large", size)))?;
        let mut data = vec![0u8; size];
        let mut checksum = [0u8; 4];

        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut data)
                .and_then(|_| file.read_exact(&mut checksum))
                .map_err(|e| match e.kind() {
                    std::io::ErrorKind::UnexpectedEof => {
                        StateHistoryError::Format("attribute blob truncated".to_string())
                    }
                    _ => StateHistoryError::StorageIo(e),
                })?;
        }

        if crc32fast::hash(&data) != u32::from_le_bytes(checksum) {
            return Err(StateHistoryError::Format(
                "attribute blob checksum mismatch".to_string(),
            ));
        }
        Ok(data)
    }

    /// Flushes all pending writes to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }

    /// Returns the file size in bytes.
    pub fn len(&self) -> Result<u64> {
        Ok(self.file.lock().metadata()?.len())
    }

    /// Closes the file and removes it from disk.
    pub fn delete(self) -> Result<()> {
        let Self { path, file, .. } = self;
        drop(file);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for HistoryFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryFile")
            .field("path", &self.path)
            .field("block_size", &self.block_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use histree_common::HistoryTreeConfig;
    use tempfile::tempdir;

    fn create_test_file(block_size: usize) -> (HistoryFile, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let file = HistoryFile::create(dir.path().join("test.ht"), block_size).unwrap();
        (file, dir)
    }

    #[test]
    fn test_history_file_create() {
        let (file, _dir) = create_test_file(1024);
        assert!(file.path().exists());
        assert_eq!(file.block_size(), 1024);
        assert_eq!(file.len().unwrap(), 0);
    }

    #[test]
    fn test_history_file_create_nested_dir() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a").join("b").join("trace.ht");
        let file = HistoryFile::create(&path, 1024).unwrap();
        assert!(file.path().exists());
    }

    #[test]
    fn test_history_file_page_offset() {
        let (file, _dir) = create_test_file(1024);
        assert_eq!(file.page_offset(0), HEADER_REGION_SIZE);
        assert_eq!(file.page_offset(3), HEADER_REGION_SIZE + 3 * 1024);
    }

    #[test]
    fn test_history_file_write_read_page() {
        let (file, _dir) = create_test_file(1024);

        let mut page = vec![0u8; 1024];
        page[0] = 0xAB;
        page[1023] = 0xCD;
        file.write_page(2, &page).unwrap();

        let read = file.read_page(2).unwrap();
        assert_eq!(read, page);
        assert_eq!(file.len().unwrap(), HEADER_REGION_SIZE + 3 * 1024);
    }

    #[test]
    fn test_history_file_write_wrong_size() {
        let (file, _dir) = create_test_file(1024);
        assert!(file.write_page(0, &[0u8; 100]).is_err());
    }

    #[test]
    fn test_history_file_read_past_end() {
        let (file, _dir) = create_test_file(1024);
        file.write_page(0, &vec![1u8; 1024]).unwrap();
        let err = file.read_page(5).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_history_file_header_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trace.ht");
        let mut header = TreeHeader::new(&HistoryTreeConfig::new(2048, 4), 10);
        header.node_count = 1;
        header.seal();

        {
            let file = HistoryFile::create(&path, 2048).unwrap();
            file.write_header(&header).unwrap();
            file.write_page(0, &vec![7u8; 2048]).unwrap();
            file.sync().unwrap();
        }

        let (file, read_header) = HistoryFile::open(&path).unwrap();
        assert_eq!(read_header, header);
        assert_eq!(file.block_size(), 2048);
        assert_eq!(file.read_page(0).unwrap(), vec![7u8; 2048]);
    }

    #[test]
    fn test_history_file_open_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("garbage.ht");
        std::fs::write(&path, vec![0xFFu8; 200]).unwrap();
        assert!(matches!(
            HistoryFile::open(&path),
            Err(StateHistoryError::Format(_))
        ));
    }

    #[test]
    fn test_history_file_open_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.ht");
        std::fs::write(&path, b"").unwrap();
        assert!(matches!(
            HistoryFile::open(&path),
            Err(StateHistoryError::Format(_))
        ));
    }

    #[test]
    fn test_history_file_open_missing() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            HistoryFile::open(dir.path().join("missing.ht")),
            Err(StateHistoryError::StorageIo(_))
        ));
    }

    #[test]
    fn test_history_file_blob_roundtrip() {
        let (file, _dir) = create_test_file(1024);
        let offset = file.page_offset(4);
        file.write_blob(offset, b"attribute tree").unwrap();
        assert_eq!(file.read_blob(offset, 14).unwrap(), b"attribute tree");
    }

    #[test]
    fn test_history_file_blob_corrupted() {
        let (file, _dir) = create_test_file(1024);
        file.write_page(0, &vec![0u8; 1024]).unwrap();
        let offset = file.page_offset(0);
        file.write_blob(offset, b"attribute tree").unwrap();

        let mut page = file.read_page(0).unwrap();
        page[3] ^= 0x20;
        file.write_page(0, &page).unwrap();

        let err = file.read_blob(offset, 14).unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn test_history_file_delete() {
        let (file, _dir) = create_test_file(1024);
        let path = file.path().to_path_buf();
        file.write_page(0, &vec![0u8; 1024]).unwrap();
        file.delete().unwrap();
        assert!(!path.exists());
    }
}
