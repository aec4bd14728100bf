//! Raw page-granular I/O on one volume file.
//!
//! All reads and writes are positioned and exactly one page long. An
//! advisory range lock over the whole file keeps two engines off the same
//! volume: shared when read-only, exclusive otherwise. Page writes happen
//! only on the checkpoint copier path; everything else reaches pages through
//! the buffer pool and journal.

#![allow(unsafe_code)]

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::FileExt;

use crate::error::{Error, Result};
use crate::value::PageAddr;

#[derive(Debug)]
pub struct VolumeFile {
    file: File,
    path: PathBuf,
    page_size: usize,
    read_only: bool,
}

impl VolumeFile {
    pub fn open(path: &Path, page_size: usize, read_only: bool, create: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(create && !read_only)
            .truncate(false)
            .open(path)?;
        if !try_lock_whole_file(&file, read_only)? {
            return Err(Error::InUse(format!(
                "volume {} is locked by another process",
                path.display()
            )));
        }
        Ok(Self {
            file,
            path: path.to_path_buf(),
            page_size,
            read_only,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn page_count(&self) -> Result<u64> {
        Ok(self.size()? / self.page_size as u64)
    }

    fn offset_of(&self, page: PageAddr) -> Result<u64> {
        page.checked_mul(self.page_size as u64)
            .ok_or_else(|| Error::corrupt_page(page, "page offset overflow"))
    }

    /// Positioned read of exactly one page. Pages inside the extended region
    /// that were never written read as zeros.
    pub fn read_page(&self, page: PageAddr, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.page_size);
        let offset = self.offset_of(page)?;
        match self.read_at_fully(buf, offset) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                buf.fill(0);
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    #[cfg(unix)]
    fn read_at_fully(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.file.read_exact_at(buf, offset)
    }

    #[cfg(not(unix))]
    fn read_at_fully(&self, _buf: &mut [u8], _offset: u64) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "positioned reads unsupported on this platform",
        ))
    }

    /// Positioned one-page write; checkpoint copier only.
    pub fn write_page(&self, page: PageAddr, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.page_size);
        if self.read_only {
            return Err(Error::ReadOnly(format!(
                "write to read-only volume {}",
                self.path.display()
            )));
        }
        let offset = self.offset_of(page)?;
        self.write_at_fully(buf, offset)?;
        Ok(())
    }

    #[cfg(unix)]
    fn write_at_fully(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        self.file.write_all_at(buf, offset)
    }

    #[cfg(not(unix))]
    fn write_at_fully(&self, _buf: &[u8], _offset: u64) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "positioned writes unsupported on this platform",
        ))
    }

    /// Grows the file to hold `new_page_count` pages by writing the final
    /// byte, then forces metadata so the new length is durable.
    pub fn extend(&self, new_page_count: u64) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly(format!(
                "extend of read-only volume {}",
                self.path.display()
            )));
        }
        let end = new_page_count
            .checked_mul(self.page_size as u64)
            .ok_or_else(|| Error::VolumeFull("volume byte size overflow".into()))?;
        if end <= self.size()? {
            return Ok(());
        }
        self.write_at_fully(&[0u8], end - 1)?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Resets to an empty file; only for brand-new or re-created volumes.
    pub fn truncate(&self) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly(format!(
                "truncate of read-only volume {}",
                self.path.display()
            )));
        }
        self.file.set_len(0)?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Flushes file data and metadata to durable storage.
    pub fn force(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(unix)]
fn try_lock_whole_file(file: &File, shared: bool) -> Result<bool> {
    use std::os::unix::io::AsRawFd;

    let fd = file.as_raw_fd();
    let mut flock = libc::flock {
        l_type: if shared { libc::F_RDLCK as _ } else { libc::F_WRLCK as _ },
        l_whence: libc::SEEK_SET as _,
        l_start: 0,
        l_len: 0, // to end of file, however far it grows
        l_pid: 0,
    };
    loop {
        let res = unsafe { libc::fcntl(fd, libc::F_SETLK, &mut flock) };
        if res == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EAGAIN) | Some(libc::EACCES) => return Ok(false),
            _ => return Err(err.into()),
        }
    }
}

#[cfg(not(unix))]
fn try_lock_whole_file(_file: &File, _shared: bool) -> Result<bool> {
    Err(Error::Unsupported("file range locks"))
}
