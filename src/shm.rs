//! Named POSIX shared-memory frame regions.
//!
//! An external frame provider writes one greyscale frame per eye into a named
//! region at camera rate. The core maps those regions and copies a frame out
//! before doing anything with it. [`SharedFrame::create`] exists for the
//! provider side and for tests; it unlinks the name again on drop.

use crate::error::{Error, Result};
use rustix::fs::{fstat, ftruncate, Mode};
use rustix::io::Errno;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use rustix::shm;
use std::ptr::{self, null_mut};

/// A mapped shared-memory region of fixed length.
pub struct SharedFrame {
    ptr: *mut u8,
    len: usize,
    name: String,
    owner: bool,
}

// The mapping is plain bytes owned by this value; access goes through copies.
unsafe impl Send for SharedFrame {}
unsafe impl Sync for SharedFrame {}

/// POSIX names must start with a single slash.
fn posix_name(name: &str) -> String {
    format!("/{}", name.trim_start_matches('/'))
}

impl SharedFrame {
    /// Maps an existing region for reading. The region must hold at least
    /// `len` bytes.
    pub fn open(name: &str, len: usize) -> Result<Self> {
        let path = posix_name(name);
        let fd = shm::open(path.as_str(), shm::OFlags::RDONLY, Mode::empty()).map_err(|e| {
            if e == Errno::NOENT {
                Error::SharedMemoryMissing(name.to_string())
            } else {
                Error::Io(e.into())
            }
        })?;

        let actual = fstat(&fd).map_err(std::io::Error::from)?.st_size.max(0) as usize;
        if actual < len || len == 0 {
            return Err(Error::SharedMemorySize {
                name: name.to_string(),
                expected: len,
                actual,
            });
        }

        // SAFETY: fd is a valid shared memory object of at least `len` bytes.
        // The mapping outlives fd and is released in Drop.
        let ptr = unsafe {
            mmap(null_mut(), len, ProtFlags::READ, MapFlags::SHARED, &fd, 0)
                .map_err(std::io::Error::from)?
        };

        Ok(Self {
            ptr: ptr as *mut u8,
            len,
            name: path,
            owner: false,
        })
    }

    /// Creates (or resizes) a region of `len` bytes and maps it read-write.
    /// The name is unlinked when the returned value is dropped.
    pub fn create(name: &str, len: usize) -> Result<Self> {
        let path = posix_name(name);
        let fd = shm::open(
            path.as_str(),
            shm::OFlags::CREATE | shm::OFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
        .map_err(std::io::Error::from)?;
        ftruncate(&fd, len as u64).map_err(std::io::Error::from)?;

        // SAFETY: fd was just truncated to `len` bytes.
        let ptr = unsafe {
            mmap(
                null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
            .map_err(std::io::Error::from)?
        };

        Ok(Self {
            ptr: ptr as *mut u8,
            len,
            name: path,
            owner: true,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Copies the whole region out. The producer may be writing concurrently;
    /// the copy is whatever the bytes were at that moment.
    pub fn copy_frame(&self) -> Vec<u8> {
        let mut frame = vec![0u8; self.len];
        // SAFETY: ptr is valid for len bytes while self is alive.
        unsafe { ptr::copy_nonoverlapping(self.ptr, frame.as_mut_ptr(), self.len) };
        frame
    }

    /// Writes `data` at the start of a region this process created.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if !self.owner {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "region is mapped read-only",
            )));
        }
        let n = data.len().min(self.len);
        // SAFETY: the mapping is writable and n <= len.
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), self.ptr, n) };
        Ok(())
    }
}

impl Drop for SharedFrame {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap and are unmapped once.
        unsafe {
            let _ = munmap(self.ptr as *mut _, self.len);
        }
        if self.owner {
            let _ = shm::unlink(self.name.as_str());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique(tag: &str) -> String {
        format!("vrcore_test_{}_{}", tag, std::process::id())
    }

    #[test]
    fn create_write_open_copy() {
        let name = unique("rw");
        let mut producer = SharedFrame::create(&name, 16).unwrap();
        producer.write(&[7; 16]).unwrap();

        let reader = SharedFrame::open(&name, 16).unwrap();
        assert_eq!(reader.copy_frame(), vec![7; 16]);

        producer.write(&[9; 4]).unwrap();
        assert_eq!(&reader.copy_frame()[..5], &[9, 9, 9, 9, 7]);
    }

    #[test]
    fn missing_region_is_reported() {
        let err = SharedFrame::open(&unique("missing"), 16).err().unwrap();
        assert!(matches!(err, Error::SharedMemoryMissing(_)));
    }

    #[test]
    fn undersized_region_is_rejected() {
        let name = unique("small");
        let _producer = SharedFrame::create(&name, 8).unwrap();
        assert!(matches!(
            SharedFrame::open(&name, 64),
            Err(Error::SharedMemorySize { actual: 8, .. })
        ));
    }

    #[test]
    fn reader_cannot_write() {
        let name = unique("ro");
        let _producer = SharedFrame::create(&name, 4).unwrap();
        let mut reader = SharedFrame::open(&name, 4).unwrap();
        assert!(reader.write(&[1]).is_err());
    }
}
