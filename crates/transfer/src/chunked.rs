use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::planner::ChunkDescriptor;

// ---------------------------------------------------------------------------
// ChunkReader
// ---------------------------------------------------------------------------

/// Shared read handle on the source file.
///
/// The file is opened once per upload. Each [`read`](Self::read) takes the
/// cursor lock, seeks, copies one chunk into a fresh buffer and releases the
/// lock before the bytes go anywhere near the network.
#[derive(Debug)]
pub struct ChunkReader {
    file: Mutex<std::fs::File>,
    path: PathBuf,
    file_size: u64,
}

impl ChunkReader {
    /// Opens `path` for chunked reading.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = std::fs::File::open(path)?;
        let file_size = file.metadata()?.len();
        Ok(Self {
            file: Mutex::new(file),
            path: path.to_path_buf(),
            file_size,
        })
    }

    /// Reads exactly the bytes covered by `chunk`.
    ///
    /// Blocking; call from `spawn_blocking` inside async code.
    pub fn read(&self, chunk: &ChunkDescriptor) -> std::io::Result<Vec<u8>> {
        if chunk.end() > self.file_size {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "chunk {} ends at {} but {} is {} bytes",
                    chunk.index,
                    chunk.end(),
                    self.path.display(),
                    self.file_size
                ),
            ));
        }

        let len = usize::try_from(chunk.length)
            .map_err(|_| std::io::Error::other("chunk does not fit in memory"))?;
        let mut buf = vec![0u8; len];
        if len == 0 {
            return Ok(buf);
        }

        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.seek(SeekFrom::Start(chunk.offset))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Total file size in bytes, as seen when the file was opened.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Path the reader was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::plan;
    use std::io::Write;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn create_test_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(data).unwrap();
        path
    }

    #[test]
    fn chunk_reader_reads_planned_chunks() {
        let dir = TempDir::new().unwrap();
        let data = b"AABBCCDDEE"; // 10 bytes.
        let path = create_test_file(dir.path(), "test.bin", data);

        let reader = ChunkReader::open(&path).unwrap();
        assert_eq!(reader.file_size(), 10);

        let chunks = plan(reader.file_size(), 4).unwrap();
        assert_eq!(reader.read(&chunks[0]).unwrap(), b"AABB");
        assert_eq!(reader.read(&chunks[1]).unwrap(), b"CCDD");
        assert_eq!(reader.read(&chunks[2]).unwrap(), b"EE");
    }

    #[test]
    fn chunk_reader_out_of_order() {
        let dir = TempDir::new().unwrap();
        let path = create_test_file(dir.path(), "test.bin", b"0123456789");

        let reader = ChunkReader::open(&path).unwrap();
        let chunks = plan(10, 3).unwrap();
        assert_eq!(reader.read(&chunks[3]).unwrap(), b"9");
        assert_eq!(reader.read(&chunks[0]).unwrap(), b"012");
        assert_eq!(reader.read(&chunks[2]).unwrap(), b"678");
    }

    #[test]
    fn chunk_reader_empty_file() {
        let dir = TempDir::new().unwrap();
        let path = create_test_file(dir.path(), "empty.bin", b"");

        let reader = ChunkReader::open(&path).unwrap();
        let chunks = plan(reader.file_size(), 1024).unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(reader.read(&chunks[0]).unwrap().is_empty());
    }

    #[test]
    fn chunk_reader_rejects_range_past_eof() {
        let dir = TempDir::new().unwrap();
        let path = create_test_file(dir.path(), "short.bin", b"abc");

        let reader = ChunkReader::open(&path).unwrap();
        let past_end = ChunkDescriptor {
            index: 1,
            offset: 2,
            length: 4,
        };
        let err = reader.read(&past_end).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn chunk_reader_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = ChunkReader::open(&dir.path().join("nope.bin")).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }

    #[test]
    fn concurrent_reads_see_their_own_ranges() {
        use std::thread;

        let dir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..=255u8).cycle().take(64 * 1024).collect();
        let path = create_test_file(dir.path(), "big.bin", &data);

        let reader = Arc::new(ChunkReader::open(&path).unwrap());
        let chunks = plan(data.len() as u64, 1000).unwrap();

        let mut handles = vec![];
        for chunk in chunks {
            let r = Arc::clone(&reader);
            handles.push(thread::spawn(move || (chunk, r.read(&chunk).unwrap())));
        }

        for h in handles {
            let (chunk, bytes) = h.join().unwrap();
            let start = chunk.offset as usize;
            assert_eq!(&bytes[..], &data[start..start + chunk.length as usize]);
        }
    }
}
