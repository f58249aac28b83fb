//! Memory pool mapping and lifecycle

use crate::alloc::{self, buddy::BuddyAlg};
use crate::ll;
use crate::oid::Oid;
use crate::result::Result;
use crate::sync::PMutex;
use crate::utils;
use crate::Error;
use memmap::MmapMut;
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::mem;
use std::path::Path;
use std::ptr;
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

/// Minimum size of a pool file
pub const MIN_POOL: u64 = 2 * 1024 * 1024;

/// Pool size used by examples and tests when creating a fresh file
pub const DEFAULT_POOL_SIZE: u64 = 8 * 1024 * 1024;

const HDR_SIG: &[u8; 16] = b"POBJ_OBJ_STORE\0\0";
const FORMAT_MAJOR: u32 = 1;
const FORMAT_COMPAT: u32 = 0;
const FORMAT_INCOMPAT: u32 = 0;
const FORMAT_RO_COMPAT: u32 = 0;

/// The header owns the first page of the pool so it can be fenced off with
/// `mprotect` after validation.
const HDR_LEN: usize = 4096;

/// Serialized header bytes: signature, major, three feature masks, uuid,
/// creation time, checksum
const HDR_RAW_LEN: usize = 64;
const HDR_CKSUM_OFF: usize = 56;

const META_OFF: usize = HDR_LEN;

struct PoolHdr {
    signature: [u8; 16],
    major: u32,
    compat: u32,
    incompat: u32,
    ro_compat: u32,
    uuid: [u8; 16],
    crtime: u64,
    checksum: u64,
}

impl PoolHdr {
    /// All multi-byte integers are little-endian on media
    fn to_bytes(&self) -> [u8; HDR_RAW_LEN] {
        let mut b = [0u8; HDR_RAW_LEN];
        b[0..16].copy_from_slice(&self.signature);
        b[16..20].copy_from_slice(&self.major.to_le_bytes());
        b[20..24].copy_from_slice(&self.compat.to_le_bytes());
        b[24..28].copy_from_slice(&self.incompat.to_le_bytes());
        b[28..32].copy_from_slice(&self.ro_compat.to_le_bytes());
        b[32..48].copy_from_slice(&self.uuid);
        b[48..56].copy_from_slice(&self.crtime.to_le_bytes());
        b[56..64].copy_from_slice(&self.checksum.to_le_bytes());
        b
    }

    fn from_bytes(b: &[u8; HDR_RAW_LEN]) -> PoolHdr {
        let mut signature = [0u8; 16];
        signature.copy_from_slice(&b[0..16]);
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&b[32..48]);
        let word = |r: std::ops::Range<usize>| {
            let mut w = [0u8; 4];
            w.copy_from_slice(&b[r]);
            u32::from_le_bytes(w)
        };
        let dword = |r: std::ops::Range<usize>| {
            let mut w = [0u8; 8];
            w.copy_from_slice(&b[r]);
            u64::from_le_bytes(w)
        };
        PoolHdr {
            signature,
            major: word(16..20),
            compat: word(20..24),
            incompat: word(24..28),
            ro_compat: word(28..32),
            uuid,
            crtime: dword(48..56),
            checksum: dword(56..64),
        }
    }
}

/// Persistent pool metadata, right after the header page
#[repr(C)]
pub(crate) struct PoolMeta {
    pub(crate) root_off: u64,
    pub(crate) root_size: u64,
    pub(crate) root_lock: PMutex,
    /// Head of the active-transaction list; 0 when no log is pending
    pub(crate) tx_head: u64,
    pub(crate) heap: BuddyAlg,
}

/// An open transactional object pool
///
/// A `Pool` maps one file into the process and exposes it as a
/// crash-consistent heap of objects addressed by [`Oid`]s. All mutation goes
/// through transactions ([`Pool::begin`], [`Pool::transaction`]); reads go
/// through [`Oid::direct`]. The mapping is released when the `Pool` drops.
pub struct Pool {
    mmap: MmapMut,
    base: u64,
    size: usize,
    is_pmem: bool,
    read_only: bool,
    uuid: [u8; 16],
    crtime: u64,
    heap_lock: Mutex<()>,
    txl_lock: Mutex<()>,
}

// The mapping is shared across threads; the pool's own bookkeeping is either
// immutable after open or guarded by the locks above.
unsafe impl Send for Pool {}
unsafe impl Sync for Pool {}

impl Pool {
    /// Creates a pool file of `size` bytes and opens it
    pub fn create<P: AsRef<Path>>(path: P, size: u64) -> Result<Pool> {
        utils::create_file(path.as_ref(), size)?;
        Self::open(path)
    }

    /// Opens a transactional object pool
    ///
    /// The file must exist and be at least [`MIN_POOL`] bytes. A valid header
    /// is verified (signature, version, feature masks, checksum); a file with
    /// no header yet is initialized in place. A previously interrupted run is
    /// recovered before the pool is handed out.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Pool> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path)?;
        if metadata.len() < MIN_POOL {
            return Err(Error::Invalid(format!(
                "pool size {} smaller than {}",
                metadata.len(),
                MIN_POOL
            )));
        }
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut mmap = unsafe { memmap::MmapOptions::new().map_mut(&file)? };
        let base = mmap.as_mut_ptr() as u64;
        let size = metadata.len() as usize;

        // check if the mapped region is located in persistent memory
        let is_pmem = ll::is_pmem(base as *const u8, size);

        let mut pool = Pool {
            mmap,
            base,
            size,
            is_pmem,
            read_only: false,
            uuid: [0; 16],
            crtime: 0,
            heap_lock: Mutex::new(()),
            txl_lock: Mutex::new(()),
        };

        // any failure from here on unmaps by dropping `pool`
        let mut raw = [0u8; HDR_RAW_LEN];
        raw.copy_from_slice(&pool.mmap[..HDR_RAW_LEN]);
        let hdr = PoolHdr::from_bytes(&raw);
        let cksum_ok = utils::checksum(&raw, HDR_CKSUM_OFF..HDR_RAW_LEN) == hdr.checksum;
        let sig_zeroed = hdr.signature == [0u8; 16];

        if cksum_ok && !sig_zeroed {
            if &hdr.signature != HDR_SIG {
                return Err(Error::Invalid(format!(
                    "wrong pool type: \"{}\"",
                    String::from_utf8_lossy(&hdr.signature)
                )));
            }
            if hdr.major != FORMAT_MAJOR {
                return Err(Error::Invalid(format!(
                    "pool version {} (library expects {})",
                    hdr.major, FORMAT_MAJOR
                )));
            }
            if hdr.incompat & !FORMAT_INCOMPAT != 0 {
                return Err(Error::Invalid(format!(
                    "unknown incompat features 0x{:x}",
                    hdr.incompat & !FORMAT_INCOMPAT
                )));
            }
            if hdr.compat & !FORMAT_COMPAT != 0 {
                // unknown compat bits are accepted as-is
            }
            pool.read_only = hdr.ro_compat & !FORMAT_RO_COMPAT != 0;
            pool.uuid = hdr.uuid;
            pool.crtime = hdr.crtime;
            if !pool.read_only {
                pool.recover();
            }
            crate::log!(Cyan, "OPEN", "{:?} ({} bytes)", path, size);
        } else if &hdr.signature == HDR_SIG {
            return Err(Error::Invalid("pool header checksum mismatch".to_string()));
        } else {
            pool.format()?;
            crate::log!(Cyan, "FORMAT", "{:?} ({} bytes)", path, size);
        }

        // If possible, turn off all permissions on the pool header page.
        // Not being able to is not an error.
        unsafe {
            libc::mprotect(pool.base as *mut libc::c_void, HDR_LEN, libc::PROT_NONE);
        }

        Ok(pool)
    }

    /// Lays a fresh header and zeroed metadata over the mapping
    fn format(&mut self) -> Result<()> {
        let crtime = match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_secs(),
            Err(_) => 0,
        };
        let mut hdr = PoolHdr {
            signature: *HDR_SIG,
            major: FORMAT_MAJOR,
            compat: FORMAT_COMPAT,
            incompat: FORMAT_INCOMPAT,
            ro_compat: FORMAT_RO_COMPAT,
            uuid: utils::uuid_v4(),
            crtime,
            checksum: 0,
        };
        let mut raw = hdr.to_bytes();
        hdr.checksum = utils::checksum(&raw, HDR_CKSUM_OFF..HDR_RAW_LEN);
        raw[HDR_CKSUM_OFF..].copy_from_slice(&hdr.checksum.to_le_bytes());
        self.mmap[..HDR_RAW_LEN].copy_from_slice(&raw);
        self.persist_off(0, HDR_RAW_LEN);
        self.uuid = hdr.uuid;
        self.crtime = hdr.crtime;

        unsafe {
            let meta = self.meta();
            ptr::write_bytes(meta as *mut PoolMeta as *mut u8, 0, mem::size_of::<PoolMeta>());
            let heap_base = ((META_OFF + mem::size_of::<PoolMeta>() + 63) & !63) as u64;
            let heap_len = self.size - heap_base as usize;
            meta.heap.init(self, heap_base, heap_len);
            self.persist_obj(meta);
        }
        Ok(())
    }

    /// Finishes whatever a previous run left half-done
    fn recover(&self) {
        unsafe {
            self.meta().heap.recover(self);
        }
        crate::stm::recover(self);
        crate::log!(Cyan, "RECOVER", "base 0x{:x}", self.base);
    }

    /// Transactional memory pool consistency check
    ///
    /// Verifies the header of the pool file at `path` (signature, checksum,
    /// format version, and incompat feature mask) without mapping it.
    pub fn check<P: AsRef<Path>>(path: P) -> Result<()> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path)?;
        if metadata.len() < MIN_POOL {
            return Err(Error::Invalid(format!(
                "pool size {} smaller than {}",
                metadata.len(),
                MIN_POOL
            )));
        }
        let mut f = File::open(path)?;
        let mut raw = [0u8; HDR_RAW_LEN];
        f.read_exact(&mut raw)?;
        let hdr = PoolHdr::from_bytes(&raw);
        if &hdr.signature != HDR_SIG {
            return Err(Error::Invalid("no valid pool header".to_string()));
        }
        if utils::checksum(&raw, HDR_CKSUM_OFF..HDR_RAW_LEN) != hdr.checksum {
            return Err(Error::Invalid("pool header checksum mismatch".to_string()));
        }
        if hdr.major != FORMAT_MAJOR {
            return Err(Error::Invalid(format!(
                "pool version {} (library expects {})",
                hdr.major, FORMAT_MAJOR
            )));
        }
        if hdr.incompat & !FORMAT_INCOMPAT != 0 {
            return Err(Error::Invalid(format!(
                "unknown incompat features 0x{:x}",
                hdr.incompat & !FORMAT_INCOMPAT
            )));
        }
        Ok(())
    }

    /// Closes the pool, releasing the mapping
    pub fn close(self) {
        crate::log!(Cyan, "CLOSE", "base 0x{:x}", self.base);
    }

    /// Direct access to the root object, creating it on first use
    ///
    /// The root object is special: it is the only allocation reachable
    /// without holding an [`Oid`], and it is created atomically: two threads
    /// racing here get the same object. `size` determines the root object's
    /// size the first time this is called; afterwards it is a caller
    /// assertion of the expected size. Beyond creation there is no update
    /// protection; the root almost certainly wants to embed a [`PMutex`].
    pub fn root_direct(&self, size: usize) -> Result<*mut u8> {
        if size == 0 {
            return Err(Error::Invalid("zero-sized root object".to_string()));
        }
        let meta = unsafe { self.meta() };
        meta.root_lock.lock()?;
        let res = (|| {
            if meta.root_off == 0 {
                if self.read_only {
                    return Err(Error::ReadOnly);
                }
                let mut off = 0u64;
                alloc::palloc(self, &mut off, size)?;
                unsafe {
                    ptr::write_bytes((self.base + off) as *mut u8, 0, size);
                }
                self.persist_off(off, size);
                meta.root_size = size as u64;
                self.persist_obj(&meta.root_size);
                // publish the offset last; a crash before this point leaks
                // only the unpublished allocation
                meta.root_off = off;
                self.persist_obj(&meta.root_off);
            } else {
                debug_assert_eq!(
                    size as u64, meta.root_size,
                    "root object size differs from the recorded one"
                );
            }
            Ok((self.base + meta.root_off) as *mut u8)
        })();
        let _ = meta.root_lock.unlock();
        res
    }

    /// The root object as an object reference
    pub fn root(&self, size: usize) -> Result<Oid> {
        self.root_direct(size)?;
        Ok(Oid::new(self.base, unsafe { self.meta() }.root_off))
    }

    /// Re-derives a stored object reference against this pool's mapping
    ///
    /// `Oid`s written into pool memory carry the base address of the mapping
    /// that stored them, which does not survive a close. Only the offset is
    /// meaningful afterwards; this re-pairs it with the current base.
    pub fn rebase(&self, oid: Oid) -> Oid {
        if oid.is_null() {
            Oid::NULL
        } else {
            Oid::new(self.base, oid.off())
        }
    }

    /// Current size of the allocation behind `oid`, 0 for null
    pub fn size_of(&self, oid: Oid) -> usize {
        if oid.is_null() {
            0
        } else {
            alloc::usable_size(self, oid.off())
        }
    }

    /// Free bytes left in the pool heap
    pub fn available(&self) -> usize {
        let _g = self.heap_guard();
        unsafe { self.meta().heap.available() as usize }
    }

    /// Total size of the pool in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// True when unknown ro-compat features downgraded this open
    #[inline]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// UUID recorded in the pool header
    #[inline]
    pub fn uuid(&self) -> [u8; 16] {
        self.uuid
    }

    /// Creation time recorded in the pool header, in seconds since the epoch
    #[inline]
    pub fn created(&self) -> u64 {
        self.crtime
    }

    #[inline]
    pub(crate) fn base(&self) -> u64 {
        self.base
    }

    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn meta<'a>(&self) -> &'a mut PoolMeta {
        utils::read_addr(self.base + META_OFF as u64)
    }

    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn heap<'a>(&self) -> &'a mut BuddyAlg {
        &mut self.meta().heap
    }

    pub(crate) fn heap_guard(&self) -> MutexGuard<'_, ()> {
        match self.heap_lock.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    pub(crate) fn txl_guard(&self) -> MutexGuard<'_, ()> {
        match self.txl_lock.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    #[inline]
    pub(crate) fn contains_addr(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.base + self.size as u64
    }

    #[inline]
    pub(crate) fn contains_off(&self, off: u64, len: usize) -> bool {
        off != 0 && (off as usize) + len <= self.size
    }

    /// Pool offset of an in-pool address
    pub(crate) fn off_of(&self, p: *const u8) -> Result<u64> {
        let a = p as u64;
        if self.contains_addr(a) {
            Ok(a - self.base)
        } else {
            Err(Error::Invalid(format!("address {:p} outside the pool", p)))
        }
    }

    #[inline]
    pub(crate) fn persist_range(&self, addr: *const u8, len: usize) {
        ll::persist(self.is_pmem, addr, len);
    }

    #[inline]
    pub(crate) fn persist_obj<T: ?Sized>(&self, obj: &T) {
        ll::persist_obj(self.is_pmem, obj);
    }

    #[inline]
    pub(crate) fn persist_off(&self, off: u64, len: usize) {
        self.persist_range((self.base + off) as *const u8, len);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::{Seek, SeekFrom, Write};
    use std::path::PathBuf;

    fn testfile(name: &str) -> PathBuf {
        let p = std::env::temp_dir().join(format!("pobj_pool_{}_{}.pool", name, std::process::id()));
        let _ = std::fs::remove_file(&p);
        p
    }

    #[test]
    fn too_small_pool_is_rejected() {
        let path = testfile("small");
        utils::create_file(&path, MIN_POOL / 2).unwrap();
        match Pool::open(&path) {
            Err(e @ Error::Invalid(_)) => assert_eq!(e.errno(), libc::EINVAL),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn fresh_file_is_initialized_and_reopens() {
        let path = testfile("fresh");
        {
            let pool = Pool::create(&path, DEFAULT_POOL_SIZE).unwrap();
            assert!(pool.available() > 0);
            pool.close();
        }
        {
            // second open must take the valid-header path
            let pool = Pool::open(&path).unwrap();
            assert!(!pool.is_read_only());
            pool.close();
        }
        Pool::check(&path).unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn corrupt_checksum_is_rejected() {
        let path = testfile("corrupt");
        Pool::create(&path, DEFAULT_POOL_SIZE).unwrap().close();

        // flip a byte inside the uuid; the signature still matches
        let mut f = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        let mut b = [0u8; 1];
        f.seek(SeekFrom::Start(40)).unwrap();
        f.read_exact(&mut b).unwrap();
        f.seek(SeekFrom::Start(40)).unwrap();
        f.write_all(&[!b[0]]).unwrap();
        drop(f);

        match Pool::open(&path) {
            Err(e @ Error::Invalid(_)) => assert_eq!(e.errno(), libc::EINVAL),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
        assert!(Pool::check(&path).is_err());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn root_object_is_created_once() {
        let path = testfile("root");
        let first;
        {
            let pool = Pool::create(&path, DEFAULT_POOL_SIZE).unwrap();
            let root = pool.root(32).unwrap();
            assert!(!root.is_null());
            first = root.off();
            // same object on every call
            assert_eq!(pool.root(32).unwrap().off(), first);
            pool.close();
        }
        let pool = Pool::open(&path).unwrap();
        assert_eq!(pool.root(32).unwrap().off(), first);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn root_direct_is_inside_the_pool() {
        let path = testfile("rootrange");
        let pool = Pool::create(&path, DEFAULT_POOL_SIZE).unwrap();
        let p = pool.root_direct(64).unwrap() as u64;
        assert!(p >= pool.base() && p + 64 <= pool.base() + pool.size() as u64);
        let _ = std::fs::remove_file(&path);
    }
}
