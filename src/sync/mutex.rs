use crate::result::Result;
use crate::sync::{os_result, rebind_guard};
use crate::utils::runid;
use crate::Error;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering::*};

/// A mutex cell that lives in persistent memory
///
/// The persistent representation is two words: the run id of the process
/// that last bound the cell, and a pointer to the live `pthread_mutex_t`
/// shadow belonging to that run. On the first use within a run the stored
/// run id no longer matches, a fresh shadow is allocated and initialized,
/// and the cell is re-bound, so a mutex left "locked" by a crash comes back
/// unlocked, and callers never reinitialize anything by hand.
///
/// Unlike `pthread_mutex_t`, a `PMutex` is considered initialized when it is
/// zeroed; cells inside objects obtained from [`Tx::zalloc`] are ready to
/// use as-is.
///
/// [`Tx::zalloc`]: crate::Tx::zalloc
#[repr(C)]
pub struct PMutex {
    runid: AtomicU64,
    shadow: AtomicU64,
}

impl PMutex {
    /// A new, unbound cell
    pub const fn new() -> PMutex {
        PMutex {
            runid: AtomicU64::new(0),
            shadow: AtomicU64::new(0),
        }
    }

    /// Finds or allocates the shadow primitive for this run
    ///
    /// The shadow pointer is published before the run id, both with release
    /// ordering, so a racing reader that observes the current run id always
    /// observes the bound pointer as well.
    pub(crate) fn inner(&self) -> Result<*mut libc::pthread_mutex_t> {
        let rid = runid();
        if self.runid.load(Acquire) == rid {
            return Ok(self.shadow.load(Acquire) as *mut _);
        }
        let _guard = rebind_guard();
        if self.runid.load(Acquire) == rid {
            return Ok(self.shadow.load(Acquire) as *mut _);
        }
        unsafe {
            let p = libc::malloc(mem::size_of::<libc::pthread_mutex_t>())
                as *mut libc::pthread_mutex_t;
            if p.is_null() {
                return Err(Error::NoMem);
            }
            let rc = libc::pthread_mutex_init(p, ptr::null());
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
    ///
    /// Only necessary for cells whose memory was not zeroed; binding happens
    /// lazily either way.
    pub fn init(&self) -> Result<()> {
        let m = self.inner()?;
        os_result(unsafe { libc::pthread_mutex_init(m, ptr::null()) })
    }

    /// Locks the mutex, blocking the current thread until it is available
    pub fn lock(&self) -> Result<()> {
        let m = self.inner()?;
        os_result(unsafe { libc::pthread_mutex_lock(m) })
    }

    /// Attempts the lock without blocking; `Ok(false)` when it is held
    pub fn try_lock(&self) -> Result<bool> {
        let m = self.inner()?;
        match unsafe { libc::pthread_mutex_trylock(m) } {
            0 => Ok(true),
            libc::EBUSY => Ok(false),
            rc => Err(Error::Os(rc)),
        }
    }

    /// Unlocks the mutex
    pub fn unlock(&self) -> Result<()> {
        let m = self.inner()?;
        os_result(unsafe { libc::pthread_mutex_unlock(m) })
    }
}

impl Default for PMutex {
    fn default() -> Self {
        PMutex::new()
    }
}

unsafe impl Send for PMutex {}
unsafe impl Sync for PMutex {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn zeroed_cell_binds_lazily() {
        let m: PMutex = unsafe { std::mem::zeroed() };
        m.lock().unwrap();
        assert!(!m.try_lock().unwrap());
        m.unlock().unwrap();
        assert!(m.try_lock().unwrap());
        m.unlock().unwrap();
    }

    #[test]
    fn init_is_idempotent() {
        let m = PMutex::new();
        m.init().unwrap();
        m.init().unwrap();
        m.lock().unwrap();
        m.unlock().unwrap();
    }
}
