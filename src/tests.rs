//! End-to-end scenarios for the object store

use crate::list;
use crate::pool::{Pool, DEFAULT_POOL_SIZE};
use crate::sync::PMutex;
use crate::utils;
use crate::{Error, Oid};
use std::mem;
use std::path::{Path, PathBuf};
use std::ptr::{self, addr_of_mut};
use std::slice;

fn testfile(name: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!("pobj_{}_{}.pool", name, std::process::id()));
    let _ = std::fs::remove_file(&p);
    p
}

fn bytes_at<'a>(oid: Oid, len: usize) -> &'a [u8] {
    unsafe { slice::from_raw_parts(oid.direct_ntx(), len) }
}

#[repr(C)]
struct Base {
    node: Oid,
}

#[test]
fn committed_insert_survives_reopen() {
    let path = testfile("insert_reopen");
    let val = *b"value_0123456789";
    {
        let pool = Pool::create(&path, DEFAULT_POOL_SIZE).unwrap();
        let root = pool.root_direct(mem::size_of::<Base>()).unwrap() as *mut Base;
        pool.transaction(|tx| unsafe {
            let node = tx.alloc(64)?;
            tx.memcpy(node.direct(), val.as_ptr(), val.len())?;
            tx.set(addr_of_mut!((*root).node), node)
        })
        .unwrap();
        pool.close();
    }

    let pool = Pool::open(&path).unwrap();
    let root = pool.root_direct(mem::size_of::<Base>()).unwrap() as *mut Base;
    let node = pool.rebase(unsafe { ptr::read(&(*root).node) });
    assert!(!node.is_null());
    assert_eq!(bytes_at(node, val.len()), &val);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn abort_restores_overwritten_bytes() {
    let path = testfile("abort_set");
    let pool = Pool::create(&path, DEFAULT_POOL_SIZE).unwrap();
    let initial: [u8; 8] = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
    let o = pool
        .transaction(|tx| {
            let o = tx.alloc(8)?;
            unsafe { tx.memcpy(o.direct(), initial.as_ptr(), 8)? };
            Ok(o)
        })
        .unwrap();

    let tx = pool.begin().unwrap();
    let aa = [0xAAu8; 8];
    unsafe { tx.memcpy(o.direct(), aa.as_ptr(), 8).unwrap() };
    // before commit, the write is visible to this thread's direct access
    assert_eq!(bytes_at(o, 8), &aa);
    match tx.abort(-1) {
        Err(Error::Aborted(e)) => assert_eq!(e, -1),
        other => panic!("unexpected: {:?}", other),
    }
    assert_eq!(bytes_at(o, 8), &initial);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn nested_commit_flattens_into_parent() {
    let path = testfile("nested_flatten");
    let pool = Pool::create(&path, DEFAULT_POOL_SIZE).unwrap();
    let before = pool.available();

    let t1 = pool.begin().unwrap();
    let a = t1.alloc(128).unwrap();
    assert!(!a.is_null());

    let t2 = pool.begin().unwrap();
    let b = t2.alloc(256).unwrap();
    assert!(!b.is_null());
    t2.commit().unwrap();

    // the inner allocation now belongs to the outer frame; aborting it
    // must reclaim both
    match pool.abort(-1) {
        Err(Error::Aborted(-1)) => {}
        other => panic!("unexpected: {:?}", other),
    }
    assert_eq!(pool.available(), before);
    let _ = std::fs::remove_file(&path);
}

#[repr(C)]
struct DllNode {
    link: list::List,
    value: u64,
}

#[repr(C)]
struct DllRoot {
    head: Oid,
    mutex: PMutex,
}

fn dll_root(pool: &Pool) -> *mut DllRoot {
    pool.root_direct(mem::size_of::<DllRoot>()).unwrap() as *mut DllRoot
}

fn dll_init(pool: &Pool) {
    let root = dll_root(pool);
    let tx = pool.begin_lock(unsafe { &(*root).mutex }).unwrap();
    let head = tx.alloc(mem::size_of::<DllNode>()).unwrap();
    unsafe { tx.set(addr_of_mut!((*root).head), head).unwrap() };
    list::init_head(pool, head).unwrap();
    tx.commit().unwrap();
}

fn dll_head(pool: &Pool) -> Oid {
    let root = dll_root(pool);
    pool.rebase(unsafe { ptr::read(&(*root).head) })
}

fn dll_insert(pool: &Pool, val: u64, at_tail: bool) -> Oid {
    let root = dll_root(pool);
    let tx = pool.begin_lock(unsafe { &(*root).mutex }).unwrap();
    let node = tx.alloc(mem::size_of::<DllNode>()).unwrap();
    crate::pset!(tx, (*(node.direct() as *mut DllNode)).value, val).unwrap();
    let head = dll_head(pool);
    if at_tail {
        list::add_tail(pool, node, head).unwrap();
    } else {
        list::add(pool, node, head).unwrap();
    }
    tx.commit().unwrap();
    node
}

fn dll_values(pool: &Pool) -> Vec<u64> {
    list::iter(pool, dll_head(pool))
        .unwrap()
        .map(|item| unsafe { ptr::read(&(*(item.direct() as *const DllNode)).value) })
        .collect()
}

#[test]
fn dll_end_to_end() {
    let path = testfile("dll");
    let pool = Pool::create(&path, DEFAULT_POOL_SIZE).unwrap();
    dll_init(&pool);
    assert!(list::is_empty(&pool, dll_head(&pool)).unwrap());

    dll_insert(&pool, 1, false);
    dll_insert(&pool, 2, false);
    let item3 = dll_insert(&pool, 3, false);
    let item4 = dll_insert(&pool, 4, false);
    dll_insert(&pool, 5, false);
    dll_insert(&pool, 6, false);
    assert_eq!(dll_values(&pool), vec![6, 5, 4, 3, 2, 1]);

    list::del(&pool, item3).unwrap();
    assert_eq!(dll_values(&pool), vec![6, 5, 4, 2, 1]);

    // swap the node holding 4 for a fresh node holding 4
    let fresh = pool
        .transaction(|tx| {
            let n = tx.alloc(mem::size_of::<DllNode>())?;
            unsafe { tx.set(addr_of_mut!((*(n.direct() as *mut DllNode)).value), 4u64)? };
            Ok(n)
        })
        .unwrap();
    list::replace(&pool, item4, fresh).unwrap();
    pool.transaction(|tx| tx.free(item4)).unwrap();
    assert_eq!(dll_values(&pool), vec![6, 5, 4, 2, 1]);

    dll_insert(&pool, 70, true);
    dll_insert(&pool, 80, true);
    dll_insert(&pool, 90, true);
    assert_eq!(dll_values(&pool), vec![6, 5, 4, 2, 1, 70, 80, 90]);

    let last = list::iter(&pool, dll_head(&pool)).unwrap().last().unwrap();
    assert!(list::is_last(&pool, last, dll_head(&pool)).unwrap());

    // walking prev visits the same items in reverse
    let head = dll_head(&pool);
    let mut rev = Vec::new();
    let mut cur = pool.rebase(unsafe { ptr::read(&(*(head.direct() as *const list::List)).prev) });
    while cur != head {
        rev.push(unsafe { ptr::read(&(*(cur.direct() as *const DllNode)).value) });
        cur = pool.rebase(unsafe { ptr::read(&(*(cur.direct() as *const list::List)).prev) });
    }
    assert_eq!(rev, vec![90, 80, 70, 1, 2, 4, 5, 6]);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn list_add_del_round_trip() {
    let path = testfile("list_roundtrip");
    let pool = Pool::create(&path, DEFAULT_POOL_SIZE).unwrap();
    dll_init(&pool);
    let a = dll_insert(&pool, 10, false);
    let b = dll_insert(&pool, 20, true);

    let snapshot: Vec<Oid> = list::iter(&pool, dll_head(&pool)).unwrap().collect();
    let x = dll_insert(&pool, 30, false);
    list::del(&pool, x).unwrap();
    pool.transaction(|tx| tx.free(x)).unwrap();

    let after: Vec<Oid> = list::iter(&pool, dll_head(&pool)).unwrap().collect();
    assert_eq!(snapshot, after);
    assert_eq!(dll_values(&pool), vec![10, 20]);
    assert_eq!(snapshot, vec![a, b]);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn list_replace_twice_restores() {
    let path = testfile("list_replace");
    let pool = Pool::create(&path, DEFAULT_POOL_SIZE).unwrap();
    dll_init(&pool);
    let a = dll_insert(&pool, 1, false);
    dll_insert(&pool, 2, false);
    let b = pool
        .transaction(|tx| {
            let n = tx.alloc(mem::size_of::<DllNode>())?;
            unsafe { tx.set(addr_of_mut!((*(n.direct() as *mut DllNode)).value), 9u64)? };
            Ok(n)
        })
        .unwrap();

    let before: Vec<Oid> = list::iter(&pool, dll_head(&pool)).unwrap().collect();
    list::replace(&pool, a, b).unwrap();
    assert_eq!(dll_values(&pool), vec![2, 9]);
    list::replace(&pool, b, a).unwrap();
    let after: Vec<Oid> = list::iter(&pool, dll_head(&pool)).unwrap().collect();
    assert_eq!(before, after);
    assert_eq!(dll_values(&pool), vec![2, 1]);
    let _ = std::fs::remove_file(&path);
}

#[repr(C)]
struct ObjLog {
    data: Oid,
    size: u64,
    offset: u64,
    mutex: PMutex,
}

fn objlog_root(pool: &Pool) -> *mut ObjLog {
    pool.root_direct(mem::size_of::<ObjLog>()).unwrap() as *mut ObjLog
}

fn objlog_create(pool: &Pool, size: usize) {
    let log = objlog_root(pool);
    let tx = pool.begin_lock(unsafe { &(*log).mutex }).unwrap();
    let data = tx.alloc(size).unwrap();
    unsafe {
        tx.set(addr_of_mut!((*log).data), data).unwrap();
        tx.set(addr_of_mut!((*log).size), size as u64).unwrap();
        tx.set(addr_of_mut!((*log).offset), 0u64).unwrap();
    }
    tx.commit().unwrap();
}

fn objlog_append(pool: &Pool, buf: &[u8]) -> crate::result::Result<()> {
    let log = objlog_root(pool);
    let tx = pool.begin_lock(unsafe { &(*log).mutex })?;
    let (size, offset, data) = unsafe {
        (
            ptr::read(&(*log).size),
            ptr::read(&(*log).offset),
            pool.rebase(ptr::read(&(*log).data)),
        )
    };
    if offset + buf.len() as u64 > size {
        return tx.abort(libc::ENOSPC);
    }
    unsafe {
        tx.memcpy(data.direct().add(offset as usize), buf.as_ptr(), buf.len())?;
        tx.set(addr_of_mut!((*log).offset), offset + buf.len() as u64)?;
    }
    tx.commit()
}

fn objlog_rewind(pool: &Pool) {
    let log = objlog_root(pool);
    let tx = pool.begin_lock(unsafe { &(*log).mutex }).unwrap();
    unsafe { tx.set(addr_of_mut!((*log).offset), 0u64).unwrap() };
    tx.commit().unwrap();
}

fn objlog_tell(pool: &Pool) -> u64 {
    let log = objlog_root(pool);
    let m = unsafe { &(*log).mutex };
    m.lock().unwrap();
    let off = unsafe { ptr::read(&(*log).offset) };
    m.unlock().unwrap();
    off
}

fn objlog_walk<F: FnMut(&[u8]) -> bool>(pool: &Pool, chunksize: usize, mut f: F) {
    let log = objlog_root(pool);
    let m = unsafe { &(*log).mutex };
    m.lock().unwrap();
    let (offset, data) = unsafe { (ptr::read(&(*log).offset), pool.rebase(ptr::read(&(*log).data))) };
    let all = unsafe { slice::from_raw_parts(data.direct_ntx(), offset as usize) };
    if chunksize == 0 {
        f(all);
    } else {
        let mut pos = 0;
        while pos < all.len() {
            let len = chunksize.min(all.len() - pos);
            if !f(&all[pos..pos + len]) {
                break;
            }
            pos += chunksize;
        }
    }
    m.unlock().unwrap();
}

#[test]
fn object_log_append_walk_rewind() {
    let strings = [
        "1st test string\n",
        "2nd test string\n",
        "3rd test string\n",
        "4th test string\n",
        "5th test string\n",
        "6th test string\n",
    ];
    let path = testfile("objlog");
    let pool = Pool::create(&path, DEFAULT_POOL_SIZE).unwrap();
    objlog_create(&pool, 1024 * 1024);

    for s in &strings {
        objlog_append(&pool, s.as_bytes()).unwrap();
    }
    assert_eq!(objlog_tell(&pool), 96);

    // chunk size 0 walks everything in one call
    let mut calls = 0;
    let mut all = Vec::new();
    objlog_walk(&pool, 0, |buf| {
        calls += 1;
        all.extend_from_slice(buf);
        true
    });
    assert_eq!(calls, 1);
    assert_eq!(all, strings.concat().into_bytes());

    // chunk size 16 walks the six strings one by one
    let mut chunks = Vec::new();
    objlog_walk(&pool, 16, |buf| {
        chunks.push(buf.to_vec());
        true
    });
    assert_eq!(chunks.len(), 6);
    for (c, s) in chunks.iter().zip(strings.iter()) {
        assert_eq!(c.as_slice(), s.as_bytes());
    }

    objlog_rewind(&pool);
    assert_eq!(objlog_tell(&pool), 0);
    let mut walked = Vec::new();
    objlog_walk(&pool, 0, |buf| {
        walked.extend_from_slice(buf);
        true
    });
    assert!(walked.is_empty());
    let mut calls = 0;
    objlog_walk(&pool, 16, |_| {
        calls += 1;
        true
    });
    assert_eq!(calls, 0);
    let _ = std::fs::remove_file(&path);
}

#[repr(C)]
struct MtxRoot {
    mutex: PMutex,
    value: u64,
}

#[test]
fn mutex_rebinds_across_reopen() {
    let path = testfile("mutex_rebind");
    {
        let pool = Pool::create(&path, DEFAULT_POOL_SIZE).unwrap();
        let root = pool.root_direct(mem::size_of::<MtxRoot>()).unwrap() as *mut MtxRoot;
        let m = unsafe { &(*root).mutex };
        m.lock().unwrap();
        m.unlock().unwrap();
        pool.close();
    }

    let pool = Pool::open(&path).unwrap();
    let root = pool.root_direct(mem::size_of::<MtxRoot>()).unwrap() as *mut MtxRoot;
    // make the cell look like it was bound by an earlier run: a stale run
    // id over a stale shadow pointer
    unsafe {
        let runid_word = root as *mut u64;
        ptr::write(runid_word, 0x1);
    }
    let m = unsafe { &(*root).mutex };
    std::thread::scope(|s| {
        s.spawn(|| {
            m.lock().unwrap();
            m.unlock().unwrap();
        });
    });
    m.lock().unwrap();
    m.unlock().unwrap();
    let _ = std::fs::remove_file(&path);
}

#[test]
fn concurrent_locked_transactions() {
    let path = testfile("concurrent");
    let pool = Pool::create(&path, DEFAULT_POOL_SIZE).unwrap();
    let root = pool.root_direct(mem::size_of::<MtxRoot>()).unwrap() as *mut MtxRoot;
    let root_addr = root as u64;

    std::thread::scope(|s| {
        for _ in 0..4 {
            let pool = &pool;
            s.spawn(move || {
                let root = root_addr as *mut MtxRoot;
                for _ in 0..25 {
                    let tx = pool.begin_lock(unsafe { &(*root).mutex }).unwrap();
                    let v = unsafe { ptr::read(&(*root).value) };
                    unsafe { tx.set(addr_of_mut!((*root).value), v + 1).unwrap() };
                    tx.commit().unwrap();
                }
            });
        }
    });
    assert_eq!(unsafe { ptr::read(&(*root).value) }, 100);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn empty_transactions_are_noops() {
    let path = testfile("empty_tx");
    let pool = Pool::create(&path, DEFAULT_POOL_SIZE).unwrap();
    let before = pool.available();

    let tx = pool.begin().unwrap();
    tx.commit().unwrap();
    assert_eq!(pool.available(), before);

    let tx = pool.begin().unwrap();
    match tx.abort(-7) {
        Err(Error::Aborted(-7)) => {}
        other => panic!("unexpected: {:?}", other),
    }
    assert_eq!(pool.available(), before);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn closure_abort_lands_at_outermost() {
    let path = testfile("closure_abort");
    let pool = Pool::create(&path, DEFAULT_POOL_SIZE).unwrap();
    let initial = [0x11u8; 8];
    let o = pool
        .transaction(|tx| {
            let o = tx.alloc(8)?;
            unsafe { tx.memcpy(o.direct(), initial.as_ptr(), 8)? };
            Ok(o)
        })
        .unwrap();
    let before = pool.available();

    let res: crate::result::Result<()> = pool.transaction(|_outer| {
        pool.transaction(|tx| {
            unsafe { tx.memcpy(o.direct(), [0x22u8; 8].as_ptr(), 8)? };
            let extra = tx.alloc(32)?;
            assert!(!extra.is_null());
            tx.abort(77)
        })
    });
    match res {
        Err(Error::Aborted(77)) => {}
        other => panic!("unexpected: {:?}", other),
    }
    assert_eq!(bytes_at(o, 8), &initial);
    assert_eq!(pool.available(), before);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn body_error_rolls_back() {
    let path = testfile("body_err");
    let pool = Pool::create(&path, DEFAULT_POOL_SIZE).unwrap();
    let before = pool.available();
    let res: crate::result::Result<()> = pool.transaction(|tx| {
        let _ = tx.alloc(64)?;
        Err(Error::Invalid("caller bailed".to_string()))
    });
    assert!(res.is_err());
    assert_eq!(pool.available(), before);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn aborted_free_leaves_object() {
    let path = testfile("abort_free");
    let pool = Pool::create(&path, DEFAULT_POOL_SIZE).unwrap();
    let pat = [0x5au8; 16];
    let o = pool
        .transaction(|tx| {
            let o = tx.alloc(16)?;
            unsafe { tx.memcpy(o.direct(), pat.as_ptr(), 16)? };
            Ok(o)
        })
        .unwrap();
    let held = pool.available();

    let tx = pool.begin().unwrap();
    tx.free(o).unwrap();
    let _ = tx.abort(-1);
    assert_eq!(bytes_at(o, 16), &pat);
    assert_eq!(pool.available(), held);

    // a committed free does reclaim it
    pool.transaction(|tx| tx.free(o)).unwrap();
    assert!(pool.available() > held);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn allocation_family() {
    let path = testfile("alloc_family");
    let pool = Pool::create(&path, DEFAULT_POOL_SIZE).unwrap();
    pool.transaction(|tx| {
        let z = tx.zalloc(100)?;
        assert!(bytes_at(z, 100).iter().all(|&b| b == 0));

        let s = tx.strdup("persistent memory")?;
        assert_eq!(&bytes_at(s, 18)[..17], b"persistent memory");
        assert_eq!(bytes_at(s, 18)[17], 0);

        let a = tx.aligned_alloc(512, 64)?;
        assert_eq!(a.off() % 512, 0);
        assert_eq!(a.direct() as u64 % 512, 0);

        let r0 = tx.alloc(16)?;
        unsafe { tx.memcpy(r0.direct(), b"0123456789abcdef".as_ptr(), 16)? };
        let r1 = tx.realloc(r0, 64)?;
        assert_eq!(&bytes_at(r1, 64)[..16], b"0123456789abcdef");
        assert!(bytes_at(r1, 64)[16..].iter().all(|&b| b == 0));
        assert!(tx.pool().size_of(r1) >= 64);

        // every allocation is non-null and lands inside the pool
        for oid in [z, s, a, r1] {
            assert!(!oid.is_null());
            assert!((oid.off() as usize) < tx.pool().size());
        }
        Ok(())
    })
    .unwrap();
    let _ = std::fs::remove_file(&path);
}

/// Rewrites one little-endian u32 header field and fixes up the checksum
fn patch_header(path: &Path, off: usize, val: u32) {
    use std::io::{Read, Seek, SeekFrom, Write};
    let mut f = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .unwrap();
    let mut raw = [0u8; 64];
    f.read_exact(&mut raw).unwrap();
    raw[off..off + 4].copy_from_slice(&val.to_le_bytes());
    let sum = utils::checksum(&raw, 56..64);
    raw[56..64].copy_from_slice(&sum.to_le_bytes());
    f.seek(SeekFrom::Start(0)).unwrap();
    f.write_all(&raw).unwrap();
}

#[test]
fn unknown_feature_bits() {
    let path = testfile("features");
    Pool::create(&path, DEFAULT_POOL_SIZE).unwrap().close();

    // unknown incompat bit refuses to open
    patch_header(&path, 24, 0x2);
    match Pool::open(&path) {
        Err(e @ Error::Invalid(_)) => assert_eq!(e.errno(), libc::EINVAL),
        other => panic!("unexpected: {:?}", other.map(|_| ())),
    }
    patch_header(&path, 24, 0);

    // unknown ro-compat bit downgrades to read-only
    patch_header(&path, 28, 0x4);
    {
        let pool = Pool::open(&path).unwrap();
        assert!(pool.is_read_only());
        match pool.begin() {
            Err(Error::ReadOnly) => {}
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
        match pool.root_direct(32) {
            Err(Error::ReadOnly) => {}
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }
    patch_header(&path, 28, 0);

    // unknown compat bit is accepted read-write
    patch_header(&path, 20, 0x8);
    let pool = Pool::open(&path).unwrap();
    assert!(!pool.is_read_only());
    pool.close();
    let _ = std::fs::remove_file(&path);
}

#[test]
fn pool_state_survives_many_reopens() {
    let path = testfile("many_reopens");
    let mut expected = Vec::new();
    {
        let pool = Pool::create(&path, DEFAULT_POOL_SIZE).unwrap();
        dll_init(&pool);
        pool.close();
    }
    for i in 0..5u64 {
        let pool = Pool::open(&path).unwrap();
        dll_insert(&pool, i, true);
        expected.push(i);
        assert_eq!(dll_values(&pool), expected);
        pool.close();
    }
    let _ = std::fs::remove_file(&path);
}
