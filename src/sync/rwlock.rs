use crate::result::Result;
use crate::sync::{abs_timeout, os_result, rebind_guard};
use crate::utils::runid;
use crate::Error;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering::*};
use std::time::Duration;

// Not exposed by the `libc` crate for linux-gnu targets, though present in glibc.
extern "C" {
    fn pthread_rwlock_timedrdlock(
        lock: *mut libc::pthread_rwlock_t,
        abstime: *const libc::timespec,
    ) -> libc::c_int;
    fn pthread_rwlock_timedwrlock(
        lock: *mut libc::pthread_rwlock_t,
        abstime: *const libc::timespec,
    ) -> libc::c_int;
}

/// A reader-writer lock cell that lives in persistent memory
///
/// Same volatile-rebind scheme as [`PMutex`](crate::sync::PMutex): the cell
/// stores a run id and a pointer to a `pthread_rwlock_t` shadow, re-bound on
/// the first use within each run. A zeroed cell is ready to use.
#[repr(C)]
pub struct PRwLock {
    runid: AtomicU64,
    shadow: AtomicU64,
}

impl PRwLock {
    /// A new, unbound cell
    pub const fn new() -> PRwLock {
        PRwLock {
            runid: AtomicU64::new(0),
            shadow: AtomicU64::new(0),
        }
    }

    fn inner(&self) -> Result<*mut libc::pthread_rwlock_t> {
        let rid = runid();
        if self.runid.load(Acquire) == rid {
            return Ok(self.shadow.load(Acquire) as *mut _);
        }
        let _guard = rebind_guard();
        if self.runid.load(Acquire) == rid {
            return Ok(self.shadow.load(Acquire) as *mut _);
        }
        unsafe {
            let p = libc::malloc(mem::size_of::<libc::pthread_rwlock_t>())
                as *mut libc::pthread_rwlock_t;
            if p.is_null() {
                return Err(Error::NoMem);
            }
            let rc = libc::pthread_rwlock_init(p, ptr::null());
            if rc != 0 {
                libc::free(p as *mut libc::c_void);
                return Err(Error::Os(rc));
            }
            self.shadow.store(p as u64, Release);
            self.runid.store(rid, Release);
            Ok(p)
        }
    }

    /// (Re)initializes the cell's shadow primitive
    pub fn init(&self) -> Result<()> {
        let l = self.inner()?;
        os_result(unsafe { libc::pthread_rwlock_init(l, ptr::null()) })
    }

    /// Acquires the lock for reading
    pub fn rdlock(&self) -> Result<()> {
        let l = self.inner()?;
        os_result(unsafe { libc::pthread_rwlock_rdlock(l) })
    }

    /// Acquires the lock for writing
    pub fn wrlock(&self) -> Result<()> {
        let l = self.inner()?;
        os_result(unsafe { libc::pthread_rwlock_wrlock(l) })
    }

    /// Attempts a read lock without blocking; `Ok(false)` when unavailable
    pub fn try_rdlock(&self) -> Result<bool> {
        let l = self.inner()?;
        match unsafe { libc::pthread_rwlock_tryrdlock(l) } {
            0 => Ok(true),
            libc::EBUSY => Ok(false),
            rc => Err(Error::Os(rc)),
        }
    }

    /// Attempts a write lock without blocking; `Ok(false)` when unavailable
    pub fn try_wrlock(&self) -> Result<bool> {
        let l = self.inner()?;
        match unsafe { libc::pthread_rwlock_trywrlock(l) } {
            0 => Ok(true),
            libc::EBUSY => Ok(false),
            rc => Err(Error::Os(rc)),
        }
    }

    /// Read lock with a timeout; surfaces `ETIMEDOUT` as [`Error::Os`]
    pub fn timed_rdlock(&self, timeout: Duration) -> Result<()> {
        let l = self.inner()?;
        let ts = abs_timeout(timeout);
        os_result(unsafe { pthread_rwlock_timedrdlock(l, &ts) })
    }

    /// Write lock with a timeout; surfaces `ETIMEDOUT` as [`Error::Os`]
    pub fn timed_wrlock(&self, timeout: Duration) -> Result<()> {
        let l = self.inner()?;
        let ts = abs_timeout(timeout);
        os_result(unsafe { pthread_rwlock_timedwrlock(l, &ts) })
    }

    /// Releases the lock
    pub fn unlock(&self) -> Result<()> {
        let l = self.inner()?;
        os_result(unsafe { libc::pthread_rwlock_unlock(l) })
    }
}

impl Default for PRwLock {
    fn default() -> Self {
        PRwLock::new()
    }
}

unsafe impl Send for PRwLock {}
unsafe impl Sync for PRwLock {}
