use crate::result::Result;
use crate::sync::{abs_timeout, os_result, rebind_guard, PMutex};
use crate::utils::runid;
use crate::Error;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering::*};
use std::time::Duration;

/// A condition variable cell that lives in persistent memory
///
/// Bound to a volatile `pthread_cond_t` shadow on first use in each run,
/// like [`PMutex`]. Waits take the [`PMutex`] guarding the shared state;
/// both cells are bound before the underlying wait begins.
#[repr(C)]
pub struct PCond {
    runid: AtomicU64,
    shadow: AtomicU64,
}

impl PCond {
    /// A new, unbound cell
    pub const fn new() -> PCond {
        PCond {
            runid: AtomicU64::new(0),
            shadow: AtomicU64::new(0),
        }
    }

    fn inner(&self) -> Result<*mut libc::pthread_cond_t> {
        let rid = runid();
        if self.runid.load(Acquire) == rid {
            return Ok(self.shadow.load(Acquire) as *mut _);
        }
        let _guard = rebind_guard();
        if self.runid.load(Acquire) == rid {
            return Ok(self.shadow.load(Acquire) as *mut _);
        }
        unsafe {
            let p = libc::malloc(mem::size_of::<libc::pthread_cond_t>())
                as *mut libc::pthread_cond_t;
            if p.is_null() {
                return Err(Error::NoMem);
            }
            let rc = libc::pthread_cond_init(p, ptr::null());
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
        let c = self.inner()?;
        os_result(unsafe { libc::pthread_cond_init(c, ptr::null()) })
    }

    /// Wakes one waiter
    pub fn signal(&self) -> Result<()> {
        let c = self.inner()?;
        os_result(unsafe { libc::pthread_cond_signal(c) })
    }

    /// Wakes every waiter
    pub fn broadcast(&self) -> Result<()> {
        let c = self.inner()?;
        os_result(unsafe { libc::pthread_cond_broadcast(c) })
    }

    /// Blocks on the condition, releasing `mutex` while waiting
    pub fn wait(&self, mutex: &PMutex) -> Result<()> {
        let c = self.inner()?;
        let m = mutex.inner()?;
        os_result(unsafe { libc::pthread_cond_wait(c, m) })
    }

    /// Timed wait; surfaces `ETIMEDOUT` as [`Error::Os`]
    pub fn timed_wait(&self, mutex: &PMutex, timeout: Duration) -> Result<()> {
        let c = self.inner()?;
        let m = mutex.inner()?;
        let ts = abs_timeout(timeout);
        os_result(unsafe { libc::pthread_cond_timedwait(c, m, &ts) })
    }
}

impl Default for PCond {
    fn default() -> Self {
        PCond::new()
    }
}

unsafe impl Send for PCond {}
unsafe impl Sync for PCond {}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn signal_wakes_a_waiter() {
        let cond = PCond::new();
        let mutex = PMutex::new();
        let ready = AtomicBool::new(false);

        std::thread::scope(|s| {
            s.spawn(|| {
                mutex.lock().unwrap();
                while !ready.load(Acquire) {
                    cond.wait(&mutex).unwrap();
                }
                mutex.unlock().unwrap();
            });

            std::thread::sleep(Duration::from_millis(20));
            mutex.lock().unwrap();
            ready.store(true, Release);
            cond.signal().unwrap();
            mutex.unlock().unwrap();
        });
    }

    #[test]
    fn timed_wait_times_out() {
        let cond = PCond::new();
        let mutex = PMutex::new();
        mutex.lock().unwrap();
        match cond.timed_wait(&mutex, Duration::from_millis(50)) {
            Err(Error::Os(rc)) => assert_eq!(rc, libc::ETIMEDOUT),
            other => panic!("unexpected: {:?}", other),
        }
        mutex.unlock().unwrap();
    }
}
