//! Named POSIX semaphores
//!
//! Each channel uses two: a binary write-exclusion semaphore the producer
//! only ever try-acquires, and a counting read-notification semaphore
//! posted once per completed frame.

use std::ffi::CString;
use std::io;
use std::time::Duration;

use super::segment::c_name;
use crate::error::ShmError;

pub(crate) struct NamedSemaphore {
    name: String,
    sem: *mut libc::sem_t,
}

// sem_t handles are process-wide and the sem_* calls are thread-safe.
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

impl NamedSemaphore {
    /// Create a semaphore with `initial` permits, replacing any stale one
    pub fn create(name: &str, initial: u32) -> Result<Self, ShmError> {
        let c = c_name(name)?;

        // SAFETY: valid C string; variadic mode/value promoted to c_uint
        let sem = unsafe {
            libc::sem_unlink(c.as_ptr());
            libc::sem_open(
                c.as_ptr(),
                libc::O_CREAT,
                0o666 as libc::c_uint,
                initial as libc::c_uint,
            )
        };
        Self::checked(name, sem)
    }

    /// Open a semaphore created by the producer
    pub fn open(name: &str) -> Result<Self, ShmError> {
        let c = c_name(name)?;

        // SAFETY: valid C string
        let sem = unsafe { libc::sem_open(c.as_ptr(), 0) };
        if sem == libc::SEM_FAILED {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::NotFound {
                return Err(ShmError::NotFound {
                    name: name.to_string(),
                });
            }
            return Err(ShmError::segment(name, err));
        }
        Self::checked(name, sem)
    }

    fn checked(name: &str, sem: *mut libc::sem_t) -> Result<Self, ShmError> {
        if sem == libc::SEM_FAILED {
            return Err(ShmError::segment(name, io::Error::last_os_error()));
        }
        Ok(Self {
            name: name.to_string(),
            sem,
        })
    }

    pub fn unlink(name: &str) {
        if let Ok(c) = CString::new(name) {
            // SAFETY: valid C string
            unsafe {
                libc::sem_unlink(c.as_ptr());
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take a permit without blocking
    pub fn try_acquire(&self) -> bool {
        loop {
            // SAFETY: `sem` is open for the lifetime of `self`
            if unsafe { libc::sem_trywait(self.sem) } == 0 {
                return true;
            }
            if io::Error::last_os_error().kind() != io::ErrorKind::Interrupted {
                return false;
            }
        }
    }

    pub fn release(&self) {
        // SAFETY: `sem` is open for the lifetime of `self`. EOVERFLOW only
        // means nobody has been waiting for a very long time.
        unsafe {
            libc::sem_post(self.sem);
        }
    }

    /// Block for at most `timeout`. `Ok(false)` on timeout or signal
    /// interruption.
    pub fn wait_timeout(&self, timeout: Duration) -> io::Result<bool> {
        let deadline = realtime_deadline(timeout)?;

        // SAFETY: `sem` is open, `deadline` is a valid timespec
        if unsafe { libc::sem_timedwait(self.sem, &deadline) } == 0 {
            return Ok(true);
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ETIMEDOUT) | Some(libc::EINTR) => Ok(false),
            _ => Err(err),
        }
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        // SAFETY: opened by sem_open, closed exactly once
        unsafe {
            libc::sem_close(self.sem);
        }
    }
}

impl std::fmt::Debug for NamedSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedSemaphore").field("name", &self.name).finish()
    }
}

/// sem_timedwait takes an absolute CLOCK_REALTIME deadline
fn realtime_deadline(timeout: Duration) -> io::Result<libc::timespec> {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `now` is a valid out pointer
    if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) } != 0 {
        return Err(io::Error::last_os_error());
    }

    let mut sec = now.tv_sec as i64 + timeout.as_secs() as i64;
    let mut nsec = now.tv_nsec as i64 + timeout.subsec_nanos() as i64;
    if nsec >= 1_000_000_000 {
        sec += 1;
        nsec -= 1_000_000_000;
    }

    Ok(libc::timespec {
        tv_sec: sec as libc::time_t,
        tv_nsec: nsec as _,
    })
}
