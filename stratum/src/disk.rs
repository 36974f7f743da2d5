//! Byte-level file I/O. One `DiskManager` owns every open file of an
//! engine directory plus the log file and the start file. Page numbers
//! are allocated densely and monotonically per file; page 0 is reserved
//! for the file header.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::trace;

use crate::error::{EngineError, Result};
use crate::failpoint;
use crate::{PageNo, PAGE_SIZE};

/// Handle for an open file, vended by [`DiskManager::open_file`].
pub type FileId = u32;

/// Name of the write-ahead log inside the engine directory.
pub const LOG_FILE_NAME: &str = "db.log";
/// Name of the start file holding the last checkpoint LSN.
pub const START_FILE_NAME: &str = "db.start";

struct FileEntry {
    file: File,
    path: PathBuf,
    next_page_no: PageNo,
}

struct DiskState {
    files: HashMap<FileId, FileEntry>,
    by_path: HashMap<PathBuf, FileId>,
    next_file_id: FileId,
}

pub struct DiskManager {
    dir: PathBuf,
    state: Mutex<DiskState>,
    log_file: Mutex<File>,
}

impl DiskManager {
    /// Opens (creating if needed) an engine directory with its log file.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let log_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(LOG_FILE_NAME))?;
        Ok(Self {
            dir,
            state: Mutex::new(DiskState {
                files: HashMap::new(),
                by_path: HashMap::new(),
                next_file_id: 0,
            }),
            log_file: Mutex::new(log_file),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn file_exists(&self, name: &str) -> bool {
        self.path_of(name).exists()
    }

    /// Creates an empty file. The caller is responsible for writing the
    /// header page.
    pub fn create_file(&self, name: &str) -> Result<()> {
        let path = self.path_of(name);
        if path.exists() {
            return Err(EngineError::Internal(format!(
                "file {name} already exists"
            )));
        }
        File::create(path)?;
        Ok(())
    }

    /// Removes a file from disk. The file must not be open.
    pub fn destroy_file(&self, name: &str) -> Result<()> {
        let path = self.path_of(name);
        let state = self.state.lock().unwrap();
        if state.by_path.contains_key(&path) {
            return Err(EngineError::Internal(format!(
                "cannot destroy open file {name}"
            )));
        }
        drop(state);
        std::fs::remove_file(path)?;
        Ok(())
    }

    /// Opens a file and returns its handle. Opening the same file twice
    /// yields the same handle.
    pub fn open_file(&self, name: &str) -> Result<FileId> {
        let path = self.path_of(name);
        let mut state = self.state.lock().unwrap();
        if let Some(&fd) = state.by_path.get(&path) {
            return Ok(fd);
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        let len = file.metadata()?.len();
        let fd = state.next_file_id;
        state.next_file_id += 1;
        state.files.insert(
            fd,
            FileEntry {
                file,
                path: path.clone(),
                next_page_no: (len / PAGE_SIZE as u64) as PageNo,
            },
        );
        state.by_path.insert(path, fd);
        trace!("opened {name} as fd {fd}");
        Ok(fd)
    }

    pub fn close_file(&self, fd: FileId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let entry = state
            .files
            .remove(&fd)
            .ok_or_else(|| EngineError::Internal(format!("close of unknown fd {fd}")))?;
        state.by_path.remove(&entry.path);
        Ok(())
    }

    fn with_file<R>(&self, fd: FileId, f: impl FnOnce(&mut FileEntry) -> Result<R>) -> Result<R> {
        let mut state = self.state.lock().unwrap();
        let entry = state
            .files
            .get_mut(&fd)
            .ok_or_else(|| EngineError::Internal(format!("unknown fd {fd}")))?;
        f(entry)
    }

    /// Reads one page, byte-exact. A short read is an I/O error.
    pub fn read_page(&self, fd: FileId, page_no: PageNo, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), PAGE_SIZE);
        self.with_file(fd, |entry| {
            let offset = page_no as u64 * PAGE_SIZE as u64;
            entry.file.read_exact_at(buf, offset)?;
            Ok(())
        })
    }

    /// Writes one page, byte-exact.
    pub fn write_page(&self, fd: FileId, page_no: PageNo, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), PAGE_SIZE);
        failpoint::maybe_fail("disk.write_page")?;
        self.with_file(fd, |entry| {
            let offset = page_no as u64 * PAGE_SIZE as u64;
            entry.file.write_all_at(buf, offset)?;
            if page_no >= entry.next_page_no {
                entry.next_page_no = page_no + 1;
            }
            Ok(())
        })
    }

    /// Bumps the file's next-page counter and returns the fresh number.
    pub fn allocate_page(&self, fd: FileId) -> Result<PageNo> {
        self.with_file(fd, |entry| {
            let page_no = entry.next_page_no;
            entry.next_page_no += 1;
            Ok(page_no)
        })
    }

    /// Pages currently backed by bytes in the file (the allocation
    /// counter before any caller raised it).
    pub fn pages_on_disk(&self, fd: FileId) -> Result<PageNo> {
        self.with_file(fd, |entry| {
            Ok((entry.file.metadata()?.len() / PAGE_SIZE as u64) as PageNo)
        })
    }

    /// Resets the allocation counter, used when a file header records a
    /// page count ahead of the file length on disk.
    pub fn set_next_page_no(&self, fd: FileId, page_no: PageNo) -> Result<()> {
        self.with_file(fd, |entry| {
            if page_no > entry.next_page_no {
                entry.next_page_no = page_no;
            }
            Ok(())
        })
    }

    pub fn sync_file(&self, fd: FileId) -> Result<()> {
        self.with_file(fd, |entry| {
            entry.file.sync_all()?;
            Ok(())
        })
    }

    pub fn log_size(&self) -> Result<u64> {
        let file = self.log_file.lock().unwrap();
        Ok(file.metadata()?.len())
    }

    /// Reads up to `buf.len()` bytes of log starting at `offset`,
    /// returning how many bytes were actually read.
    pub fn read_log(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let file = self.log_file.lock().unwrap();
        let len = file.metadata()?.len();
        if offset >= len {
            return Ok(0);
        }
        let want = buf.len().min((len - offset) as usize);
        file.read_exact_at(&mut buf[..want], offset)?;
        Ok(want)
    }

    /// Writes log bytes at the offset their LSNs dictate and syncs. The
    /// log only ever grows; rewrites are limited to the header record at
    /// offset 0.
    pub fn write_log(&self, buf: &[u8], offset: u64) -> Result<()> {
        failpoint::maybe_fail("disk.write_log")?;
        let file = self.log_file.lock().unwrap();
        file.write_all_at(buf, offset)?;
        file.sync_all()?;
        Ok(())
    }

    /// Cuts the log back to `len` bytes, discarding a torn tail.
    pub fn truncate_log(&self, len: u64) -> Result<()> {
        let file = self.log_file.lock().unwrap();
        file.set_len(len)?;
        file.sync_all()?;
        Ok(())
    }

    /// Reads the checkpoint LSN from the start file; `-1` if there is no
    /// start file or no checkpoint yet.
    pub fn read_start_file(&self) -> Result<i64> {
        let path = self.path_of(START_FILE_NAME);
        if !path.exists() {
            return Ok(-1);
        }
        let mut buf = [0u8; 8];
        File::open(path)?.read_exact_at(&mut buf, 0)?;
        Ok(i64::from_le_bytes(buf))
    }

    pub fn write_start_file(&self, lsn: i64) -> Result<()> {
        let file = File::create(self.path_of(START_FILE_NAME))?;
        file.write_all_at(&lsn.to_le_bytes(), 0)?;
        file.sync_all()?;
        Ok(())
    }
}
