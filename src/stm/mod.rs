//! The transaction engine
//!
//! Transactions are thread-local and nest by stacking frames; an inner
//! commit flattens its operations into the parent, and an abort unwinds the
//! whole stack with the undo log applied in reverse. Every frame's log
//! lives in pool memory, reachable from the pool metadata, so a run cut
//! short by a crash is replayed (committed logs forward, uncommitted logs
//! backward) the next time the pool opens.

pub(crate) mod log;
mod tx;

pub use tx::Tx;

pub(crate) use log::recover;

/// Durably writes one field of a persistent struct through the undo log
///
/// `pset!(tx, (*node).value, 7)` takes the field's address and hands it to
/// [`Tx::set`]. The place expression is evaluated inside an `unsafe` block;
/// the field must live in the transaction's pool.
///
/// [`Tx::set`]: crate::Tx::set
#[macro_export]
macro_rules! pset {
    ($tx:expr, $field:expr, $val:expr) => {{
        let v = $val;
        #[allow(unused_unsafe)]
        unsafe {
            $tx.set(std::ptr::addr_of_mut!($field), v)
        }
    }};
}
