//! Instrumented locking: wrappers over the `parking_lot` primitives with an
//! always-on registry of lock acquisitions.
//!
//! Every tracked acquire records (lock address, kind, thread, acquire time,
//! call site, backtrace) in a held-lock map; the matching release removes
//! the record and folds the hold time into per-site usage statistics. A
//! release with no matching record lands in an orphan map. [LockRegistry::dump]
//! renders both maps for a stuck process; [LockRegistry::usage_report]
//! summarizes hold times by call site.
//!
//! The wrappers invoke the underlying primitive first and do their
//! bookkeeping second, so a disabled or partially torn-down registry can
//! never deadlock a caller: tracking degrades to the plain primitive.

use std::fmt::Write as _;
use std::mem::ManuallyDrop;
use std::panic::Location;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant, SystemTime};

use backtrace::Backtrace;
use fnv::FnvHashMap;
use log::debug;
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LockKind {
    Mutex,
    RwLockRead,
    RwLockWrite,
}

impl std::fmt::Display for LockKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(match self {
            LockKind::Mutex => "mutex",
            LockKind::RwLockRead => "rwlock(rd)",
            LockKind::RwLockWrite => "rwlock(wr)",
        })
    }
}

/// Identity of one held lock: FNV-hashed (address, kind, thread).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct HeldKey {
    addr: usize,
    kind: LockKind,
    thread: ThreadId,
}

struct HeldRecord {
    acquired_at: Instant,
    site: &'static Location<'static>,
    // Unresolved at capture; symbolization is deferred to dump time. The
    // acquiring function's name comes from these frames.
    backtrace: Backtrace,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct SiteKey {
    file: &'static str,
    line: u32,
    kind: LockKind,
}

struct SiteStats {
    count: u64,
    total_held: Duration,
    min_held: Duration,
    max_held: Duration,
    first: SystemTime,
    last: SystemTime,
}

struct OrphanRecord {
    count: u64,
    first: SystemTime,
    last: SystemTime,
}

/// Process-wide acquisition tracker. Obtain via [registry].
pub struct LockRegistry {
    enabled: AtomicBool,
    held: RwLock<FnvHashMap<HeldKey, HeldRecord>>,
    orphans: RwLock<FnvHashMap<HeldKey, OrphanRecord>>,
    site_stats: RwLock<FnvHashMap<SiteKey, SiteStats>>,
    acquired: AtomicU64,
    released: AtomicU64,
    currently_held: AtomicU64,
}

static REGISTRY: Lazy<LockRegistry> = Lazy::new(LockRegistry::new);

pub fn registry() -> &'static LockRegistry {
    &REGISTRY
}

impl LockRegistry {
    fn new() -> Self {
        LockRegistry {
            enabled: AtomicBool::new(true),
            held: RwLock::new(FnvHashMap::default()),
            orphans: RwLock::new(FnvHashMap::default()),
            site_stats: RwLock::new(FnvHashMap::default()),
            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
            currently_held: AtomicU64::new(0),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Lifetime count of tracked acquisitions.
    pub fn acquired(&self) -> u64 {
        self.acquired.load(Ordering::Relaxed)
    }

    /// Lifetime count of tracked releases.
    pub fn released(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }

    /// Locks currently held, equal to `acquired() - released()` modulo
    /// in-flight updates.
    pub fn currently_held(&self) -> u64 {
        self.currently_held.load(Ordering::Relaxed)
    }

    fn note_acquire(&self, addr: usize, kind: LockKind, site: &'static Location<'static>) {
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }
        let key = HeldKey {
            addr,
            kind,
            thread: thread::current().id(),
        };
        let record = HeldRecord {
            acquired_at: Instant::now(),
            site,
            backtrace: Backtrace::new_unresolved(),
        };
        if self.held.write().insert(key, record).is_some() {
            // A reentrant read acquisition of the same rwlock on the same
            // thread collapses to one record; its first release will
            // match, the second becomes an orphan.
            debug!("lock {:#x} {} reacquired while already held by {:?}", addr, kind, key.thread);
        }
        self.acquired.fetch_add(1, Ordering::Relaxed);
        self.currently_held.fetch_add(1, Ordering::Relaxed);
    }

    fn note_release(&self, addr: usize, kind: LockKind) {
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }
        let key = HeldKey {
            addr,
            kind,
            thread: thread::current().id(),
        };
        let removed = self.held.write().remove(&key);
        let now = SystemTime::now();
        match removed {
            Some(record) => {
                let held_for = record.acquired_at.elapsed();
                self.released.fetch_add(1, Ordering::Relaxed);
                self.currently_held.fetch_sub(1, Ordering::Relaxed);
                let site_key = SiteKey {
                    file: record.site.file(),
                    line: record.site.line(),
                    kind,
                };
                let mut stats = self.site_stats.write();
                match stats.get_mut(&site_key) {
                    Some(s) => {
                        s.count += 1;
                        s.total_held += held_for;
                        s.min_held = s.min_held.min(held_for);
                        s.max_held = s.max_held.max(held_for);
                        s.last = now;
                    }
                    None => {
                        stats.insert(
                            site_key,
                            SiteStats {
                                count: 1,
                                total_held: held_for,
                                min_held: held_for,
                                max_held: held_for,
                                first: now,
                                last: now,
                            },
                        );
                    }
                }
            }
            None => {
                let mut orphans = self.orphans.write();
                match orphans.get_mut(&key) {
                    Some(o) => {
                        o.count += 1;
                        o.last = now;
                    }
                    None => {
                        orphans.insert(
                            key,
                            OrphanRecord {
                                count: 1,
                                first: now,
                                last: now,
                            },
                        );
                    }
                }
            }
        }
    }

    /// Renders every currently-held lock (with backtrace) and every orphan
    /// release event.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        {
            let held = self.held.read();
            writeln!(&mut out, "{} lock(s) currently held:", held.len()).unwrap();
            for (key, record) in held.iter() {
                writeln!(
                    &mut out,
                    "  {} {:#x} acquired at {}:{} by {:?}, held {:.3?}",
                    key.kind,
                    key.addr,
                    record.site.file(),
                    record.site.line(),
                    key.thread,
                    record.acquired_at.elapsed(),
                )
                .unwrap();
                let mut bt = record.backtrace.clone();
                bt.resolve();
                writeln!(&mut out, "{:?}", bt).unwrap();
            }
        }
        {
            let orphans = self.orphans.read();
            writeln!(&mut out, "{} orphan release site(s):", orphans.len()).unwrap();
            for (key, o) in orphans.iter() {
                writeln!(
                    &mut out,
                    "  {} {:#x} released {}x without record by {:?} (last {:?})",
                    key.kind, key.addr, o.count, key.thread, o.last,
                )
                .unwrap();
            }
        }
        out
    }

    /// Per-site hold-time summary, heaviest total first.
    pub fn usage_report(&self) -> String {
        let stats = self.site_stats.read();
        let mut rows: Vec<(&SiteKey, &SiteStats)> = stats.iter().collect();
        rows.sort_by(|a, b| b.1.total_held.cmp(&a.1.total_held));
        let mut out = String::new();
        writeln!(
            &mut out,
            "{:>8} {:>12} {:>12} {:>12}  site",
            "count", "total", "min", "max"
        )
        .unwrap();
        for (key, s) in rows {
            writeln!(
                &mut out,
                "{:>8} {:>12} {:>12} {:>12}  {} {}:{}",
                s.count,
                format!("{:?}", s.total_held),
                format!("{:?}", s.min_held),
                format!("{:?}", s.max_held),
                key.kind,
                key.file,
                key.line,
            )
            .unwrap();
        }
        out
    }
}

/// Mutex wrapped with registry instrumentation.
pub struct TrackedMutex<T> {
    inner: Mutex<T>,
}

impl<T> TrackedMutex<T> {
    pub fn new(value: T) -> Self {
        TrackedMutex {
            inner: Mutex::new(value),
        }
    }

    fn addr(&self) -> usize {
        self as *const Self as *const () as usize
    }

    #[track_caller]
    pub fn lock(&self) -> TrackedMutexGuard<T> {
        let site = Location::caller();
        let guard = self.inner.lock();
        registry().note_acquire(self.addr(), LockKind::Mutex, site);
        TrackedMutexGuard {
            guard: ManuallyDrop::new(guard),
            addr: self.addr(),
        }
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

pub struct TrackedMutexGuard<'a, T> {
    guard: ManuallyDrop<MutexGuard<'a, T>>,
    addr: usize,
}

impl<'a, T> std::ops::Deref for TrackedMutexGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &*self.guard
    }
}

impl<'a, T> std::ops::DerefMut for TrackedMutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.guard
    }
}

impl<'a, T> Drop for TrackedMutexGuard<'a, T> {
    fn drop(&mut self) {
        // Unlock first, then record; see the module invariant.
        // Safety: the guard is dropped exactly once, here.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        registry().note_release(self.addr, LockKind::Mutex);
    }
}

/// Reader/writer lock wrapped with registry instrumentation. Read and write
/// acquisitions are tracked as distinct kinds at the same address.
pub struct TrackedRwLock<T> {
    inner: RwLock<T>,
}

impl<T> TrackedRwLock<T> {
    pub fn new(value: T) -> Self {
        TrackedRwLock {
            inner: RwLock::new(value),
        }
    }

    fn addr(&self) -> usize {
        self as *const Self as *const () as usize
    }

    #[track_caller]
    pub fn read(&self) -> TrackedRwLockReadGuard<T> {
        let site = Location::caller();
        let guard = self.inner.read();
        registry().note_acquire(self.addr(), LockKind::RwLockRead, site);
        TrackedRwLockReadGuard {
            guard: ManuallyDrop::new(guard),
            addr: self.addr(),
        }
    }

    #[track_caller]
    pub fn write(&self) -> TrackedRwLockWriteGuard<T> {
        let site = Location::caller();
        let guard = self.inner.write();
        registry().note_acquire(self.addr(), LockKind::RwLockWrite, site);
        TrackedRwLockWriteGuard {
            guard: ManuallyDrop::new(guard),
            addr: self.addr(),
        }
    }
}

pub struct TrackedRwLockReadGuard<'a, T> {
    guard: ManuallyDrop<RwLockReadGuard<'a, T>>,
    addr: usize,
}

impl<'a, T> std::ops::Deref for TrackedRwLockReadGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &*self.guard
    }
}

impl<'a, T> Drop for TrackedRwLockReadGuard<'a, T> {
    fn drop(&mut self) {
        // Safety: dropped exactly once, here.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        registry().note_release(self.addr, LockKind::RwLockRead);
    }
}

pub struct TrackedRwLockWriteGuard<'a, T> {
    guard: ManuallyDrop<RwLockWriteGuard<'a, T>>,
    addr: usize,
}

impl<'a, T> std::ops::Deref for TrackedRwLockWriteGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &*self.guard
    }
}

impl<'a, T> std::ops::DerefMut for TrackedRwLockWriteGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.guard
    }
}

impl<'a, T> Drop for TrackedRwLockWriteGuard<'a, T> {
    fn drop(&mut self) {
        // Safety: dropped exactly once, here.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        registry().note_release(self.addr, LockKind::RwLockWrite);
    }
}

/// Condition variable paired with [TrackedMutex]. The wait re-records the
/// mutex: released for the duration of the wait, reacquired at wakeup.
pub struct TrackedCondvar {
    inner: Condvar,
}

impl TrackedCondvar {
    pub fn new() -> Self {
        TrackedCondvar {
            inner: Condvar::new(),
        }
    }

    #[track_caller]
    pub fn wait<T>(&self, guard: &mut TrackedMutexGuard<T>) {
        let site = Location::caller();
        registry().note_release(guard.addr, LockKind::Mutex);
        self.inner.wait(&mut *guard.guard);
        registry().note_acquire(guard.addr, LockKind::Mutex, site);
    }

    /// Waits with a timeout; the only interruptible blocking operation.
    /// Returns true if the wait timed out.
    #[track_caller]
    pub fn wait_for<T>(&self, guard: &mut TrackedMutexGuard<T>, timeout: Duration) -> bool {
        let site = Location::caller();
        registry().note_release(guard.addr, LockKind::Mutex);
        let result = self.inner.wait_for(&mut *guard.guard, timeout);
        registry().note_acquire(guard.addr, LockKind::Mutex, site);
        result.timed_out()
    }

    pub fn notify_one(&self) {
        self.inner.notify_one();
    }

    pub fn notify_all(&self) {
        self.inner.notify_all();
    }
}

impl Default for TrackedCondvar {
    fn default() -> Self {
        TrackedCondvar::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn held_key(addr: usize, kind: LockKind) -> HeldKey {
        HeldKey {
            addr,
            kind,
            thread: thread::current().id(),
        }
    }

    #[test]
    fn mutex_held_record_lifecycle() {
        let m = TrackedMutex::new(0u32);
        let key = held_key(m.addr(), LockKind::Mutex);
        let acquired_before = registry().acquired();
        {
            let mut g = m.lock();
            *g += 1;
            assert!(registry().held.read().contains_key(&key));
        }
        assert!(!registry().held.read().contains_key(&key));
        assert!(registry().acquired() > acquired_before);
        assert!(registry().acquired() >= registry().released());
    }

    #[test]
    fn site_stats_accumulate() {
        let m = TrackedMutex::new(());
        let mut line = 0;
        for _ in 0..3 {
            let g = m.lock();
            line = Location::caller().line() - 1;
            std::thread::sleep(Duration::from_millis(1));
            drop(g);
        }
        let stats = registry().site_stats.read();
        let key = SiteKey {
            file: file!(),
            line,
            kind: LockKind::Mutex,
        };
        let s = stats.get(&key).expect("stats entry for lock site");
        assert_eq!(s.count, 3);
        assert!(s.min_held <= s.max_held);
        assert!(s.total_held >= s.max_held);
        assert!(s.first <= s.last);
    }

    #[test]
    fn orphan_release_recorded() {
        // An address no real lock can occupy in this test.
        let fake_addr = 0xdead_b000usize;
        registry().note_release(fake_addr, LockKind::Mutex);
        registry().note_release(fake_addr, LockKind::Mutex);
        let orphans = registry().orphans.read();
        let o = orphans
            .get(&held_key(fake_addr, LockKind::Mutex))
            .expect("orphan entry");
        assert_eq!(o.count, 2);
        assert!(o.first <= o.last);
    }

    #[test]
    fn rwlock_kinds_are_distinct() {
        let l = TrackedRwLock::new(5u32);
        {
            let g = l.read();
            assert_eq!(*g, 5);
            assert!(registry().held.read().contains_key(&held_key(l.addr(), LockKind::RwLockRead)));
            assert!(!registry().held.read().contains_key(&held_key(l.addr(), LockKind::RwLockWrite)));
        }
        {
            let mut g = l.write();
            *g = 6;
            assert!(registry().held.read().contains_key(&held_key(l.addr(), LockKind::RwLockWrite)));
        }
        assert!(!registry().held.read().contains_key(&held_key(l.addr(), LockKind::RwLockRead)));
        assert!(!registry().held.read().contains_key(&held_key(l.addr(), LockKind::RwLockWrite)));
    }

    #[test]
    fn condvar_timeout_rebalances_records() {
        let m = TrackedMutex::new(false);
        let cv = TrackedCondvar::new();
        let key = held_key(m.addr(), LockKind::Mutex);
        let mut g = m.lock();
        assert!(cv.wait_for(&mut g, Duration::from_millis(10)));
        // Reacquired by the wait: still held until the guard drops.
        assert!(registry().held.read().contains_key(&key));
        drop(g);
        assert!(!registry().held.read().contains_key(&key));
    }

    #[test]
    fn condvar_notify_wakes_waiter() {
        use std::sync::Arc;
        struct Shared {
            ready: TrackedMutex<bool>,
            cv: TrackedCondvar,
        }
        let shared = Arc::new(Shared {
            ready: TrackedMutex::new(false),
            cv: TrackedCondvar::new(),
        });
        let shared2 = Arc::clone(&shared);
        let waiter = thread::spawn(move || {
            let mut g = shared2.ready.lock();
            while !*g {
                shared2.cv.wait(&mut g);
            }
        });
        thread::sleep(Duration::from_millis(5));
        *shared.ready.lock() = true;
        shared.cv.notify_all();
        waiter.join().unwrap();
    }

    #[test]
    fn dump_mentions_held_lock() {
        let m = TrackedMutex::new(());
        let _g = m.lock();
        let dump = registry().dump();
        assert!(dump.contains(file!()));
        assert!(dump.contains("currently held"));
    }

    #[test]
    fn disabled_registry_degrades() {
        let r = LockRegistry::new();
        r.set_enabled(false);
        let site = Location::caller();
        r.note_acquire(0x1000, LockKind::Mutex, site);
        r.note_release(0x1000, LockKind::Mutex);
        assert_eq!(r.acquired(), 0);
        assert_eq!(r.released(), 0);
        assert_eq!(r.currently_held(), 0);
        assert!(r.held.read().is_empty());
        assert!(r.orphans.read().is_empty());
    }
}
