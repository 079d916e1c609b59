//! Blob storage abstraction
//!
//! Every store component reads and writes files only through [`BlobStorage`],
//! a narrow contract that a local directory, an in-memory map or a remote
//! object store can all satisfy. Names are flat, relative to the storage root.
//!
//! Retrying transient failures is the implementation's business; the store
//! itself never retries.

use arbor_common::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// Sequential writer returned by [`BlobStorage::open_write`]
pub trait BlobWriter: Write + Send {
    /// Flush buffers and make written bytes durable
    fn sync(&mut self) -> Result<()>;

    /// File length once everything written so far is flushed
    fn position(&self) -> u64;
}

/// Storage backend contract
pub trait BlobStorage: Send + Sync {
    fn exists(&self, name: &str) -> Result<bool>;

    /// Make sure the storage root exists
    fn mkdirs(&self) -> Result<()>;

    /// Delete a file; deleting a missing file is not an error
    fn delete(&self, name: &str) -> Result<()>;

    /// Rename, atomically replacing `to` if it exists
    fn rename(&self, from: &str, to: &str) -> Result<()>;

    fn file_length(&self, name: &str) -> Result<u64>;

    /// Open for sequential writing, either appending or truncating
    fn open_write(&self, name: &str, append: bool) -> Result<Box<dyn BlobWriter>>;

    /// Open for sequential reading from `offset`
    fn open_read(&self, name: &str, offset: u64) -> Result<Box<dyn Read + Send>>;

    /// Replace a file's contents and sync it
    fn write_all(&self, name: &str, data: &[u8]) -> Result<()>;

    /// Append bytes to a file, creating it if needed
    fn append(&self, name: &str, data: &[u8]) -> Result<()>;

    /// Read up to `len` bytes at `offset`; shorter at end of file
    fn read_range(&self, name: &str, offset: u64, len: usize) -> Result<Vec<u8>>;

    /// Cut a file down to `len` bytes
    fn truncate(&self, name: &str, len: u64) -> Result<()>;

    /// Human-readable location, for logs
    fn describe(&self) -> String;
}

/// Files in a local directory
pub struct LocalBlobStorage {
    root: PathBuf,
    write_buffer_size: usize,
}

impl LocalBlobStorage {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            write_buffer_size: 64 * 1024,
        }
    }

    pub fn with_write_buffer(mut self, size: usize) -> Self {
        self.write_buffer_size = size.max(1);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

struct LocalWriter {
    inner: BufWriter<File>,
    position: u64,
}

impl Write for LocalWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.position += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl BlobWriter for LocalWriter {
    fn sync(&mut self) -> Result<()> {
        self.inner.flush()?;
        self.inner.get_ref().sync_data()?;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }
}

impl BlobStorage for LocalBlobStorage {
    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.path(name).try_exists()?)
    }

    fn mkdirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root).map_err(|e| {
            Error::Storage(format!("failed to create {}: {}", self.root.display(), e))
        })
    }

    fn delete(&self, name: &str) -> Result<()> {
        match std::fs::remove_file(self.path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(format!("failed to delete {name}: {e}"))),
        }
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        std::fs::rename(self.path(from), self.path(to))
            .map_err(|e| Error::Storage(format!("failed to rename {from} to {to}: {e}")))?;
        // Persist the directory entry
        if let Err(e) = File::open(&self.root).and_then(|dir| dir.sync_all()) {
            warn!(
                "Failed to sync {} after renaming {} to {}: {}",
                self.root.display(),
                from,
                to,
                e
            );
        }
        Ok(())
    }

    fn file_length(&self, name: &str) -> Result<u64> {
        Ok(std::fs::metadata(self.path(name))?.len())
    }

    fn open_write(&self, name: &str, append: bool) -> Result<Box<dyn BlobWriter>> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(self.path(name))
            .map_err(|e| Error::Storage(format!("failed to open {name} for writing: {e}")))?;
        let position = file.metadata()?.len();
        Ok(Box::new(LocalWriter {
            inner: BufWriter::with_capacity(self.write_buffer_size, file),
            position,
        }))
    }

    fn open_read(&self, name: &str, offset: u64) -> Result<Box<dyn Read + Send>> {
        let mut file = File::open(self.path(name))?;
        file.seek(SeekFrom::Start(offset))?;
        Ok(Box::new(io::BufReader::new(file)))
    }

    fn write_all(&self, name: &str, data: &[u8]) -> Result<()> {
        let mut writer = self.open_write(name, false)?;
        writer.write_all(data)?;
        writer.sync()
    }

    fn append(&self, name: &str, data: &[u8]) -> Result<()> {
        let mut writer = self.open_write(name, true)?;
        writer.write_all(data)?;
        writer.sync()
    }

    fn read_range(&self, name: &str, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut file = File::open(self.path(name))?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::new();
        file.take(len as u64).read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn truncate(&self, name: &str, len: u64) -> Result<()> {
        let file = OpenOptions::new().write(true).open(self.path(name))?;
        file.set_len(len)?;
        file.sync_all()?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.root.display().to_string()
    }
}

type SharedFile = Arc<Mutex<Vec<u8>>>;

/// Files held in process memory
#[derive(Default)]
pub struct MemoryBlobStorage {
    files: RwLock<HashMap<String, SharedFile>>,
}

impl MemoryBlobStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of all files, sorted
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.files.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn file(&self, name: &str) -> Result<SharedFile> {
        self.files
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Io(io::Error::new(io::ErrorKind::NotFound, name.to_string())))
    }
}

struct MemoryWriter {
    file: SharedFile,
    position: u64,
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.lock().extend_from_slice(buf);
        self.position += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl BlobWriter for MemoryWriter {
    fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }
}

impl BlobStorage for MemoryBlobStorage {
    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.files.read().contains_key(name))
    }

    fn mkdirs(&self) -> Result<()> {
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        self.files.write().remove(name);
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let mut files = self.files.write();
        let file = files
            .remove(from)
            .ok_or_else(|| Error::Storage(format!("failed to rename {from}: not found")))?;
        files.insert(to.to_string(), file);
        Ok(())
    }

    fn file_length(&self, name: &str) -> Result<u64> {
        Ok(self.file(name)?.lock().len() as u64)
    }

    fn open_write(&self, name: &str, append: bool) -> Result<Box<dyn BlobWriter>> {
        let mut files = self.files.write();
        let file = if append {
            files.entry(name.to_string()).or_default().clone()
        } else {
            let file = SharedFile::default();
            files.insert(name.to_string(), file.clone());
            file
        };
        let position = file.lock().len() as u64;
        Ok(Box::new(MemoryWriter { file, position }))
    }

    fn open_read(&self, name: &str, offset: u64) -> Result<Box<dyn Read + Send>> {
        let data = self.file(name)?.lock().clone();
        let mut cursor = Cursor::new(data);
        cursor.set_position(offset);
        Ok(Box::new(cursor))
    }

    fn write_all(&self, name: &str, data: &[u8]) -> Result<()> {
        self.files
            .write()
            .insert(name.to_string(), Arc::new(Mutex::new(data.to_vec())));
        Ok(())
    }

    fn append(&self, name: &str, data: &[u8]) -> Result<()> {
        let file = self
            .files
            .write()
            .entry(name.to_string())
            .or_default()
            .clone();
        file.lock().extend_from_slice(data);
        Ok(())
    }

    fn read_range(&self, name: &str, offset: u64, len: usize) -> Result<Vec<u8>> {
        let file = self.file(name)?;
        let data = file.lock();
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
        let end = start.saturating_add(len).min(data.len());
        Ok(data[start..end].to_vec())
    }

    fn truncate(&self, name: &str, len: u64) -> Result<()> {
        let file = self.file(name)?;
        let mut data = file.lock();
        let len = usize::try_from(len).unwrap_or(usize::MAX).min(data.len());
        data.truncate(len);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
