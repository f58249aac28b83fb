//! Thread-local transaction frames and the user-facing engine API

use crate::alloc;
use crate::oid::Oid;
use crate::pool::Pool;
use crate::result::Result;
use crate::stm::log::{self, OP_ALLOC, OP_FREE, OP_SET};
use crate::sync::{PMutex, PRwLock};
use crate::Error;
use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::mem;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::ptr;

enum Held {
    Mutex(*const PMutex),
    Rwlock(*const PRwLock),
}

struct Frame {
    pool: *const Pool,
    base: u64,
    /// Offset of the frame's persistent log record; 0 until the first op
    log: u64,
    /// Volatile mirror of the chain's tail for O(1) appends
    tail: u64,
    /// Set for closure transactions, which catch the abort unwind
    env: bool,
    lock: Option<Held>,
}

thread_local! {
    static FRAMES: RefCell<Vec<Frame>> = RefCell::new(Vec::new());
    static UNWOUND_ENVS: Cell<usize> = Cell::new(0);
}

/// Unwind payload that transfers control to the outermost closure
/// transaction after the stack has been rolled back
struct Abort(i32);

/// A handle to an open transaction
///
/// Obtained from [`Pool::begin`] and friends, or lent to the body of
/// [`Pool::transaction`]. Every mutation of pool bytes goes through this
/// handle so the pre-images end up in the undo log. The handle is bound to
/// the thread that began the transaction.
pub struct Tx<'p> {
    pool: &'p Pool,
    level: usize,
    _not_send: PhantomData<*mut ()>,
}

impl Pool {
    /// Begins a transaction on this pool
    ///
    /// Nested calls push inner frames: an inner commit splices its
    /// operations into the parent, which becomes responsible for them, and
    /// an abort anywhere unwinds the whole stack.
    pub fn begin(&self) -> Result<Tx<'_>> {
        self.begin_impl(false)
    }

    fn begin_impl(&self, env: bool) -> Result<Tx<'_>> {
        if self.is_read_only() {
            return Err(Error::ReadOnly);
        }
        let level = FRAMES.with(|f| {
            let mut f = f.borrow_mut();
            f.push(Frame {
                pool: self,
                base: self.base(),
                log: 0,
                tail: 0,
                env,
                lock: None,
            });
            f.len() - 1
        });
        crate::log!(White, "BEGIN", "level {}", level);
        Ok(Tx {
            pool: self,
            level,
            _not_send: PhantomData,
        })
    }

    /// Begins a transaction and takes `mutex`, releasing it on commit or
    /// abort
    pub fn begin_lock<'p>(&'p self, mutex: &PMutex) -> Result<Tx<'p>> {
        let tx = self.begin()?;
        if let Err(e) = mutex.lock() {
            abort_from(tx.level);
            return Err(e);
        }
        FRAMES.with(|f| f.borrow_mut()[tx.level].lock = Some(Held::Mutex(mutex)));
        Ok(tx)
    }

    /// Begins a transaction and write-locks `rwlock`, releasing it on
    /// commit or abort
    pub fn begin_wrlock<'p>(&'p self, rwlock: &PRwLock) -> Result<Tx<'p>> {
        let tx = self.begin()?;
        if let Err(e) = rwlock.wrlock() {
            abort_from(tx.level);
            return Err(e);
        }
        FRAMES.with(|f| f.borrow_mut()[tx.level].lock = Some(Held::Rwlock(rwlock)));
        Ok(tx)
    }

    /// Commits the innermost transaction on this thread
    pub fn commit(&self) -> Result<()> {
        let depth = FRAMES.with(|f| f.borrow().len());
        if depth == 0 {
            return Err(Error::NotInTx);
        }
        commit_frame(self, depth - 1)
    }

    /// Aborts, unwinding every nested frame on this thread
    ///
    /// Undo entries are applied in reverse order, so later writes come
    /// undone before earlier ones. When closure transactions are on the
    /// stack, control transfers to the outermost one, which returns
    /// [`Error::Aborted`]; otherwise the error returns from here.
    pub fn abort(&self, errnum: i32) -> Result<()> {
        let depth = FRAMES.with(|f| f.borrow().len());
        if depth == 0 {
            return Err(Error::NotInTx);
        }
        Err(abort_all(errnum))
    }

    /// Runs `body` inside a transaction
    ///
    /// Commits when the body returns `Ok`; rolls back when it returns `Err`
    /// or panics. An explicit [`Tx::abort`] inside the body unwinds nested
    /// transactions and lands at the outermost enclosing closure as
    /// [`Error::Aborted`].
    pub fn transaction<T, F>(&self, body: F) -> Result<T>
    where
        F: FnOnce(&Tx<'_>) -> Result<T>,
    {
        let tx = self.begin_impl(true)?;
        let level = tx.level;
        let res = catch_unwind(AssertUnwindSafe(|| body(&tx)));
        match res {
            Ok(Ok(v)) => {
                let depth = FRAMES.with(|f| f.borrow().len());
                if depth != level + 1 {
                    abort_from(level);
                    return Err(Error::Invalid(
                        "transaction body left nested frames open".to_string(),
                    ));
                }
                commit_frame(self, level)?;
                Ok(v)
            }
            Ok(Err(e)) => {
                abort_from(level);
                Err(e)
            }
            Err(payload) => {
                if let Some(Abort(errnum)) = payload.downcast_ref::<Abort>() {
                    // the stack is already rolled back; stop at the
                    // outermost environment frame
                    let errnum = *errnum;
                    let left = UNWOUND_ENVS.with(|c| {
                        let v = c.get().saturating_sub(1);
                        c.set(v);
                        v
                    });
                    if left == 0 {
                        Err(Error::Aborted(errnum))
                    } else {
                        resume_unwind(payload)
                    }
                } else {
                    abort_from(level);
                    if level == 0 {
                        Err(Error::Aborted(libc::ECANCELED))
                    } else {
                        resume_unwind(payload)
                    }
                }
            }
        }
    }
}

impl<'p> Tx<'p> {
    /// The pool this transaction operates on
    pub fn pool(&self) -> &Pool {
        self.pool
    }

    fn check_open(&self) -> Result<()> {
        let ok = FRAMES.with(|f| {
            let f = f.borrow();
            f.len() > self.level && f[self.level].base == self.pool.base()
        });
        if ok {
            Ok(())
        } else {
            Err(Error::Invalid("stale transaction handle".to_string()))
        }
    }

    /// The frame's persistent log record, created lazily on the first op
    fn ensure_log(&self) -> Result<(u64, u64)> {
        self.check_open()?;
        let (log_off, tail) = FRAMES.with(|f| {
            let f = f.borrow();
            (f[self.level].log, f[self.level].tail)
        });
        if log_off != 0 {
            return Ok((log_off, tail));
        }
        let log_off = log::new_log(self.pool)?;
        FRAMES.with(|f| f.borrow_mut()[self.level].log = log_off);
        Ok((log_off, 0))
    }

    fn append(&self, kind: u64, off: u64, aux: u64, len: u64) -> Result<u64> {
        let (log_off, tail) = self.ensure_log()?;
        let node = log::append(self.pool, log_off, tail, kind, off, aux, len)?;
        FRAMES.with(|f| f.borrow_mut()[self.level].tail = node);
        Ok(node)
    }

    /// Transactionally allocates `size` bytes
    ///
    /// The undo entry is appended first and the allocator writes the
    /// produced offset through it, so an abort (or a crash before commit)
    /// reclaims the block.
    pub fn alloc(&self, size: usize) -> Result<Oid> {
        let node = self.append(OP_ALLOC, 0, 0, 0)?;
        let op = unsafe { log::op_at(self.pool, node) };
        alloc::palloc(self.pool, &mut op.off, size)?;
        Ok(Oid::new(self.pool.base(), op.off))
    }

    /// As [`alloc`](Self::alloc), with the bytes zeroed
    pub fn zalloc(&self, size: usize) -> Result<Oid> {
        let oid = self.alloc(size)?;
        unsafe {
            ptr::write_bytes(oid.direct(), 0, size);
        }
        self.pool.persist_range(oid.direct_ntx(), size);
        Ok(oid)
    }

    /// Transactional duplicate of a string, NUL-terminated in pool memory
    pub fn strdup(&self, s: &str) -> Result<Oid> {
        let bytes = s.as_bytes();
        let oid = self.alloc(bytes.len() + 1)?;
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), oid.direct(), bytes.len());
            *oid.direct().add(bytes.len()) = 0;
        }
        self.pool.persist_range(oid.direct_ntx(), bytes.len() + 1);
        Ok(oid)
    }

    /// Frees `oid` when the transaction commits; a no-op on null
    pub fn free(&self, oid: Oid) -> Result<()> {
        if oid.is_null() {
            return Ok(());
        }
        self.append(OP_FREE, oid.off(), 0, 0)?;
        Ok(())
    }

    /// Transactional reallocation
    ///
    /// A null `oid` allocates. Otherwise the contents move to a fresh block
    /// with any growth zeroed, and the old block is freed at commit.
    pub fn realloc(&self, oid: Oid, size: usize) -> Result<Oid> {
        if oid.is_null() {
            return self.alloc(size);
        }
        let old = self.pool.size_of(oid);
        let fresh = self.alloc(size)?;
        unsafe {
            let copy = old.min(size);
            ptr::copy_nonoverlapping(oid.direct_ntx(), fresh.direct(), copy);
            if size > copy {
                ptr::write_bytes(fresh.direct().add(copy), 0, size - copy);
            }
        }
        self.pool.persist_range(fresh.direct_ntx(), size);
        self.free(oid)?;
        Ok(fresh)
    }

    /// Transactionally allocates `size` bytes aligned to `align` (a power
    /// of two)
    pub fn aligned_alloc(&self, align: usize, size: usize) -> Result<Oid> {
        let node = self.append(OP_ALLOC, 0, 0, 0)?;
        let op = unsafe { log::op_at(self.pool, node) };
        alloc::palloc_aligned(self.pool, &mut op.off, size, align)?;
        Ok(Oid::new(self.pool.base(), op.off))
    }

    /// Changes a range of pool memory, keeping undo log entries
    ///
    /// The pre-image goes to an allocator-owned backup and is persisted,
    /// then the undo entry, then the in-place write; that ordering keeps a
    /// crash at any point recoverable. The backup is owned by its
    /// own `Alloc` entry, so an abort both restores and reclaims it.
    ///
    /// # Safety
    ///
    /// `dst..dst+len` must lie within this pool's mapping and be disjoint
    /// from `src..src+len`.
    pub unsafe fn memcpy(&self, dst: *mut u8, src: *const u8, len: usize) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let dst_off = self.pool.off_of(dst)?;

        let bnode = self.append(OP_ALLOC, 0, 0, 0)?;
        let bop = log::op_at(self.pool, bnode);
        alloc::palloc(self.pool, &mut bop.off, len)?;
        let backup = bop.off;
        ptr::copy_nonoverlapping(dst as *const u8, (self.pool.base() + backup) as *mut u8, len);
        self.pool.persist_off(backup, len);

        self.append(OP_SET, dst_off, backup, len as u64)?;

        ptr::copy_nonoverlapping(src, dst, len);
        self.pool.persist_range(dst, len);
        Ok(())
    }

    /// Durably writes one value through the undo log
    ///
    /// The engine's field-set primitive; see also the [`pset!`] macro.
    ///
    /// # Safety
    ///
    /// `dst` must point into this pool's mapping.
    ///
    /// [`pset!`]: crate::pset
    pub unsafe fn set<T: Copy>(&self, dst: *mut T, val: T) -> Result<()> {
        self.memcpy(
            dst as *mut u8,
            &val as *const T as *const u8,
            mem::size_of::<T>(),
        )
    }

    /// Commits this transaction
    pub fn commit(self) -> Result<()> {
        commit_frame(self.pool, self.level)
    }

    /// Aborts, unwinding every nested frame on this thread; see
    /// [`Pool::abort`]
    pub fn abort(&self, errnum: i32) -> Result<()> {
        self.check_open()?;
        Err(abort_all(errnum))
    }
}

fn release_lock(frame: &Frame) {
    match frame.lock {
        Some(Held::Mutex(m)) => {
            let _ = unsafe { &*m }.unlock();
        }
        Some(Held::Rwlock(l)) => {
            let _ = unsafe { &*l }.unlock();
        }
        None => {}
    }
}

fn commit_frame(pool: &Pool, level: usize) -> Result<()> {
    let ok = FRAMES.with(|f| {
        let f = f.borrow();
        f.len() == level + 1 && f[level].base == pool.base()
    });
    if !ok {
        return Err(Error::Invalid(
            "commit of a transaction that is not innermost".to_string(),
        ));
    }
    let frame = FRAMES.with(|f| f.borrow_mut().pop().unwrap());
    release_lock(&frame);

    let parent = FRAMES.with(|f| f.borrow().last().map(|p| (p.base, p.log, p.tail)));
    match parent {
        // outermost, or the innermost frame of a different pool: fan out
        None => commit_fanout(pool, &frame),
        Some((pbase, _, _)) if pbase != frame.base => commit_fanout(pool, &frame),

        // the parent has no log yet and simply adopts this frame's
        Some((_, 0, _)) => {
            if frame.log != 0 {
                FRAMES.with(|f| {
                    let mut f = f.borrow_mut();
                    let p = f.last_mut().unwrap();
                    p.log = frame.log;
                    p.tail = frame.tail;
                });
            }
        }

        // splice this frame's chain onto the parent's tail, in order; the
        // parent answers for the spliced ops at its own commit or abort
        Some((_, plog, ptail)) => {
            if frame.log != 0 {
                unsafe {
                    let child = log::log_at(pool, frame.log);
                    if child.head != 0 {
                        if ptail == 0 {
                            let pl = log::log_at(pool, plog);
                            pl.head = child.head;
                            pool.persist_obj(&pl.head);
                        } else {
                            let t = log::op_at(pool, ptail);
                            t.next = child.head;
                            pool.persist_obj(&t.next);
                        }
                        FRAMES.with(|f| f.borrow_mut().last_mut().unwrap().tail = frame.tail);
                    }
                }
                log::drop_log(pool, frame.log, false);
            }
        }
    }
    crate::log!(White, "COMMIT", "level {}", level);
    Ok(())
}

/// Outermost commit: persist the marker, run the on-commit actions, and
/// retire the log
fn commit_fanout(pool: &Pool, frame: &Frame) {
    if frame.log == 0 {
        return;
    }
    unsafe {
        let l = log::log_at(pool, frame.log);
        l.committed = 1;
        pool.persist_obj(&l.committed);
        let mut cur = l.head;
        while cur != 0 {
            let op = log::op_at(pool, cur);
            let next = op.next;
            log::commit_op(pool, op);
            cur = next;
        }
    }
    log::drop_log(pool, frame.log, true);
}

/// Rolls back one frame: on-abort actions in reverse order, then the log
/// goes away
fn rollback_frame(frame: &Frame) {
    if frame.log == 0 {
        return;
    }
    let pool = unsafe { &*frame.pool };
    unsafe {
        let l = log::log_at(pool, frame.log);
        let mut chain = Vec::new();
        let mut cur = l.head;
        while cur != 0 {
            chain.push(cur);
            cur = log::op_at(pool, cur).next;
        }
        for &o in chain.iter().rev() {
            log::abort_op(pool, log::op_at(pool, o));
        }
    }
    log::drop_log(pool, frame.log, true);
}

/// Unwinds every frame on the thread; transfers control by unwind when any
/// of them was a closure transaction
fn abort_all(errnum: i32) -> Error {
    let mut envs = 0;
    while let Some(frame) = FRAMES.with(|f| f.borrow_mut().pop()) {
        if frame.env {
            envs += 1;
        }
        release_lock(&frame);
        rollback_frame(&frame);
    }
    crate::log!(Magenta, "ABORT", "errnum {}", errnum);
    if envs > 0 {
        UNWOUND_ENVS.with(|c| c.set(envs));
        std::panic::panic_any(Abort(errnum));
    }
    Error::Aborted(errnum)
}

/// Unwinds frames down to `level`, innermost first, without env transfer
fn abort_from(level: usize) {
    loop {
        let frame = FRAMES.with(|f| {
            let mut f = f.borrow_mut();
            if f.len() > level {
                f.pop()
            } else {
                None
            }
        });
        match frame {
            Some(frame) => {
                release_lock(&frame);
                rollback_frame(&frame);
            }
            None => break,
        }
    }
}
