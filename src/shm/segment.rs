//! Named POSIX shared-memory segment
//!
//! Thin owner of an `shm_open` + `mmap` mapping. Header words are exposed as
//! `AtomicU32` references; slot contents are moved with bounds-checked
//! copies. The region is shared with other processes, so slot copies may
//! race with the producer: readers must treat slot bytes as untrusted.

use std::ffi::CString;
use std::io;
use std::ptr::NonNull;
use std::sync::atomic::AtomicU32;

use crate::error::ShmError;

pub(crate) fn c_name(name: &str) -> Result<CString, ShmError> {
    CString::new(name).map_err(|_| {
        ShmError::segment(
            name,
            io::Error::new(io::ErrorKind::InvalidInput, "name contains NUL"),
        )
    })
}

/// A mapped shared-memory segment
pub(crate) struct SharedSegment {
    name: String,
    ptr: NonNull<u8>,
    len: usize,
}

// The mapping is only touched through atomics and raw copies.
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

impl SharedSegment {
    /// Create a fresh zero-filled segment, replacing any stale one
    pub fn create(name: &str, len: usize) -> Result<Self, ShmError> {
        let c = c_name(name)?;

        // SAFETY: `c` is a valid NUL-terminated string for every call below,
        // and `fd` is closed on every path once the mapping exists or fails.
        unsafe {
            libc::shm_unlink(c.as_ptr());

            let fd = libc::shm_open(c.as_ptr(), libc::O_CREAT | libc::O_RDWR, 0o666);
            if fd < 0 {
                return Err(ShmError::segment(name, io::Error::last_os_error()));
            }

            if libc::ftruncate(fd, len as libc::off_t) < 0 {
                let err = io::Error::last_os_error();
                libc::close(fd);
                libc::shm_unlink(c.as_ptr());
                return Err(ShmError::segment(name, err));
            }

            let result = Self::map(name, fd, len);
            libc::close(fd);
            if result.is_err() {
                libc::shm_unlink(c.as_ptr());
            }
            result
        }
    }

    /// Open an existing segment created by a producer
    pub fn open(name: &str) -> Result<Self, ShmError> {
        let c = c_name(name)?;

        // SAFETY: as in `create`; `st` is fully written by a successful fstat.
        unsafe {
            let fd = libc::shm_open(c.as_ptr(), libc::O_RDWR, 0);
            if fd < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::NotFound {
                    return Err(ShmError::NotFound {
                        name: name.to_string(),
                    });
                }
                return Err(ShmError::segment(name, err));
            }

            let mut st: libc::stat = std::mem::zeroed();
            if libc::fstat(fd, &mut st) < 0 {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(ShmError::segment(name, err));
            }

            let len = st.st_size as usize;
            if len == 0 {
                // Producer created the object but has not sized it yet
                libc::close(fd);
                return Err(ShmError::NotFound {
                    name: name.to_string(),
                });
            }

            let result = Self::map(name, fd, len);
            libc::close(fd);
            result
        }
    }

    unsafe fn map(name: &str, fd: libc::c_int, len: usize) -> Result<Self, ShmError> {
        let addr = libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        );
        if addr == libc::MAP_FAILED {
            return Err(ShmError::segment(name, io::Error::last_os_error()));
        }

        let ptr = NonNull::new(addr as *mut u8).ok_or_else(|| {
            ShmError::segment(name, io::Error::other("mmap returned null"))
        })?;

        Ok(Self {
            name: name.to_string(),
            ptr,
            len,
        })
    }

    /// Remove a segment name system-wide. Existing mappings stay valid.
    pub fn unlink(name: &str) {
        if let Ok(c) = CString::new(name) {
            // SAFETY: valid C string
            unsafe {
                libc::shm_unlink(c.as_ptr());
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Header word at `offset`
    pub fn word(&self, offset: usize) -> &AtomicU32 {
        assert!(offset % 4 == 0 && offset + 4 <= self.len, "bad header offset {offset}");
        // SAFETY: in bounds and 4-byte aligned (mmap is page aligned); the
        // reference lives no longer than the mapping.
        unsafe { &*(self.ptr.as_ptr().add(offset) as *const AtomicU32) }
    }

    /// Copy `src` into the segment at `offset`
    pub fn write_at(&self, offset: usize, src: &[u8]) -> bool {
        if offset.checked_add(src.len()).map_or(true, |end| end > self.len) {
            return false;
        }
        // SAFETY: bounds checked above; `src` cannot alias the mapping
        // through a shared Rust reference.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.as_ptr().add(offset), src.len());
        }
        true
    }

    /// Copy `dst.len()` bytes out of the segment at `offset`
    pub fn read_at(&self, offset: usize, dst: &mut [u8]) -> bool {
        if offset.checked_add(dst.len()).map_or(true, |end| end > self.len) {
            return false;
        }
        // SAFETY: bounds checked above. The bytes may be concurrently
        // rewritten by the producer; callers validate what they copied.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), dst.as_mut_ptr(), dst.len());
        }
        true
    }

    /// Zero the whole mapping
    pub fn clear(&self) {
        // SAFETY: the whole range is ours
        unsafe {
            std::ptr::write_bytes(self.ptr.as_ptr(), 0, self.len);
        }
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        // SAFETY: ptr/len are exactly what mmap returned
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

impl std::fmt::Debug for SharedSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSegment")
            .field("name", &self.name)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    fn unique(tag: &str) -> String {
        format!("/camstream_test_seg_{}_{}", tag, std::process::id())
    }

    #[test]
    fn test_create_open_share_memory() {
        let name = unique("share");
        let producer = SharedSegment::create(&name, 4096).unwrap();
        producer.word(8).store(41, Ordering::Release);
        assert!(producer.write_at(100, b"hello"));

        let consumer = SharedSegment::open(&name).unwrap();
        assert_eq!(consumer.len(), 4096);
        assert_eq!(consumer.word(8).load(Ordering::Acquire), 41);

        let mut buf = [0u8; 5];
        assert!(consumer.read_at(100, &mut buf));
        assert_eq!(&buf, b"hello");

        SharedSegment::unlink(&name);
    }

    #[test]
    fn test_open_missing_is_not_found() {
        let err = SharedSegment::open(&unique("missing")).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_out_of_bounds_copy_rejected() {
        let name = unique("bounds");
        let seg = SharedSegment::create(&name, 128).unwrap();
        assert!(!seg.write_at(120, &[0u8; 16]));
        let mut buf = [0u8; 16];
        assert!(!seg.read_at(usize::MAX, &mut buf));
        assert!(seg.read_at(112, &mut buf));
        SharedSegment::unlink(&name);
    }

    #[test]
    fn test_create_replaces_stale_segment() {
        let name = unique("stale");
        let first = SharedSegment::create(&name, 256).unwrap();
        first.word(0).store(0xDEAD, Ordering::Relaxed);

        let second = SharedSegment::create(&name, 256).unwrap();
        assert_eq!(second.word(0).load(Ordering::Relaxed), 0);
        SharedSegment::unlink(&name);
    }
}
