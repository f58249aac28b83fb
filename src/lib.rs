//! *pobj* is a transactional object store for byte-addressable persistent
//! memory. It maps a pool file into the process, hands out persistent
//! object references ([`Oid`]: a pool base and an offset), and routes every
//! mutation through a thread-local, nestable transaction with an undo log,
//! so the pool's contents move from one consistent state to the next no
//! matter where a crash lands.
//!
//! # Programming Model
//!
//! A pool is a single mapped file: a checksummed header, a root-object
//! descriptor, and an allocator-managed heap. [`Pool::open`] validates or
//! initializes the header and replays anything a previous run left
//! unfinished; [`Pool::root_direct`] lazily creates the one well-known
//! object everything else hangs off.
//!
//! Mutation happens inside transactions. The closure form commits on `Ok`
//! and rolls back on `Err` or panic; the explicit [`Pool::begin`] /
//! [`Tx::commit`] / [`Pool::abort`] form mirrors it, and the two compose:
//! an abort anywhere unwinds the whole nest and surfaces at the outermost
//! closure. Inner transactions flatten into their parent at commit.
//!
//! ```no_run
//! use pobj::{Pool, DEFAULT_POOL_SIZE};
//!
//! # fn main() -> pobj::result::Result<()> {
//! let pool = Pool::create("foo.pool", DEFAULT_POOL_SIZE)?;
//!
//! let value: u64 = 0xfeed;
//! let oid = pool.transaction(|tx| {
//!     let oid = tx.alloc(64)?;
//!     unsafe { tx.set(oid.direct() as *mut u64, value)? };
//!     Ok(oid)
//! })?;
//!
//! assert_eq!(unsafe { *(oid.direct_ntx() as *const u64) }, value);
//! # Ok(())
//! # }
//! ```
//!
//! Synchronization primitives that live *inside* persistent objects are in
//! [`sync`]: cells that re-bind themselves to fresh OS primitives on each
//! run, so a mutex held across a crash does not stay stuck. The [`list`]
//! module builds a crash-consistent doubly-linked list out of nothing but
//! the transactional field-set, which is the pattern user data structures
//! are expected to follow.

pub mod ll;
pub mod utils;

mod alloc;
pub mod list;
mod oid;
mod pool;
mod stm;
pub mod sync;

#[cfg(test)]
mod tests;

pub use oid::Oid;
pub use pool::{Pool, DEFAULT_POOL_SIZE, MIN_POOL};
pub use stm::Tx;
pub use sync::{PCond, PMutex, PRwLock};

use std::fmt;

/// Errors surfaced by pool, allocator, transaction, and sync operations
#[derive(Debug)]
pub enum Error {
    /// Persistent state or an argument is invalid (`EINVAL`)
    Invalid(String),
    /// The allocator or a sync cell could not obtain memory (`ENOMEM`)
    NoMem,
    /// The pool was downgraded to read-only by unknown ro-compat features
    /// (`EROFS`)
    ReadOnly,
    /// No transaction is open on this thread (`EINVAL`)
    NotInTx,
    /// The transaction was aborted; carries the caller-supplied errnum
    Aborted(i32),
    /// An OS primitive failed; carries the raw errno
    Os(i32),
    /// A file operation failed
    Io(std::io::Error),
}

impl Error {
    /// The closest errno for this error
    pub fn errno(&self) -> i32 {
        match self {
            Error::Invalid(_) | Error::NotInTx => libc::EINVAL,
            Error::NoMem => libc::ENOMEM,
            Error::ReadOnly => libc::EROFS,
            Error::Aborted(e) => *e,
            Error::Os(e) => *e,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Invalid(msg) => write!(f, "invalid: {}", msg),
            Error::NoMem => write!(f, "out of memory"),
            Error::ReadOnly => write!(f, "pool is read-only"),
            Error::NotInTx => write!(f, "no transaction in progress"),
            Error::Aborted(e) => write!(f, "transaction aborted ({})", e),
            Error::Os(e) => write!(f, "OS error ({})", e),
            Error::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error::Io(e)
    }
}

/// A `Result` type carrying this crate's [`Error`]
pub mod result {
    pub type Result<T> = std::result::Result<T, crate::Error>;
}
