//! PMEM-resident synchronization primitives
//!
//! The OS's opaque primitive state cannot safely live in persistent memory
//! across crashes or reboots. Each cell here stores only a run id and a
//! pointer to a volatile shadow primitive, lazily allocated the first time
//! the cell is used within a run. A zeroed cell is a valid, unbound cell, so
//! primitives embedded in freshly allocated (or freshly reopened) objects
//! need no explicit initialization.

mod condvar;
mod mutex;
mod rwlock;

pub use condvar::*;
pub use mutex::*;
pub use rwlock::*;

use crate::result::Result;
use crate::Error;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Serializes the slow path of cell rebinding; the fast path is lock-free
static REBIND: Mutex<()> = Mutex::new(());

pub(crate) fn rebind_guard() -> MutexGuard<'static, ()> {
    match REBIND.lock() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}

#[inline]
pub(crate) fn os_result(rc: i32) -> Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(Error::Os(rc))
    }
}

/// Absolute CLOCK_REALTIME timeout for the pthread timed operations
pub(crate) fn abs_timeout(d: Duration) -> libc::timespec {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_REALTIME, &mut now);
    }
    let nsec = now.tv_nsec as i64 + d.subsec_nanos() as i64;
    libc::timespec {
        tv_sec: now.tv_sec + d.as_secs() as libc::time_t + (nsec / 1_000_000_000) as libc::time_t,
        tv_nsec: (nsec % 1_000_000_000) as libc::c_long,
    }
}
