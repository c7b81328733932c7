//! Pre-allocated buffer pool feeding the render pipeline and packet queues.
//!
//! Four size classes, each owning one contiguous backing block carved into
//! `pool_size` fixed-size nodes on a LIFO free list. Allocations dispatch to
//! the smallest class that fits; an exhausted class or an oversize request
//! falls back to the system allocator. Returned [PooledBuf]s hand their node
//! back on drop, so the class never needs to be recovered from a raw
//! pointer. One instrumented mutex guards all class state.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::sync::TrackedMutex;

pub const SMALL_BUFFER_SIZE: usize = 1 << 10;
pub const MEDIUM_BUFFER_SIZE: usize = 64 << 10;
pub const LARGE_BUFFER_SIZE: usize = 256 << 10;
pub const XLARGE_BUFFER_SIZE: usize = 2 << 20;

pub const SMALL_POOL_SIZE: usize = 64;
pub const MEDIUM_POOL_SIZE: usize = 32;
pub const LARGE_POOL_SIZE: usize = 16;
pub const XLARGE_POOL_SIZE: usize = 8;

const CLASSES: [(usize, usize); 4] = [
    (SMALL_BUFFER_SIZE, SMALL_POOL_SIZE),
    (MEDIUM_BUFFER_SIZE, MEDIUM_POOL_SIZE),
    (LARGE_BUFFER_SIZE, LARGE_POOL_SIZE),
    (XLARGE_BUFFER_SIZE, XLARGE_POOL_SIZE),
];

const BACKING_ALIGN: usize = 64;

struct Class {
    buffer_size: usize,
    pool_size: usize,

    /// Backing block of `buffer_size * pool_size` bytes; node `i` occupies
    /// `[i * buffer_size, (i + 1) * buffer_size)`.
    base: NonNull<u8>,

    /// LIFO stack of free node indices.
    free: Vec<u32>,

    /// Mirrors free-list membership: a node is in exactly one of
    /// {free list, in-use set}.
    in_use: Box<[bool]>,

    used_count: usize,
    peak_used: usize,
    hits: u64,
    misses: u64,
    returns: u64,
    bytes_served: u64,
}

// The raw backing pointer is only dereferenced through PooledBufs holding
// disjoint node ranges; the class metadata itself is guarded by the manager
// mutex.
unsafe impl Send for Class {}

impl Class {
    fn new(buffer_size: usize, pool_size: usize) -> Self {
        let layout = Layout::from_size_align(buffer_size * pool_size, BACKING_ALIGN)
            .expect("class layout fits in isize");
        // Safety: the layout has non-zero size.
        let base = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(base).unwrap_or_else(|| std::alloc::handle_alloc_error(layout));
        Class {
            buffer_size,
            pool_size,
            base,
            free: (0..pool_size as u32).rev().collect(),
            in_use: vec![false; pool_size].into_boxed_slice(),
            used_count: 0,
            peak_used: 0,
            hits: 0,
            misses: 0,
            returns: 0,
            bytes_served: 0,
        }
    }

    fn node_ptr(&self, node: u32) -> NonNull<u8> {
        debug_assert!((node as usize) < self.pool_size);
        // Safety: node is in bounds, so the offset stays within the backing
        // block.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(node as usize * self.buffer_size)) }
    }
}

impl Drop for Class {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.buffer_size * self.pool_size, BACKING_ALIGN)
            .expect("class layout fits in isize");
        // Safety: base was allocated with this exact layout in Class::new.
        unsafe { dealloc(self.base.as_ptr(), layout) };
    }
}

struct Shared {
    classes: [Class; 4],
    fallback_allocs: u64,
    total_allocs: u64,
    total_frees: u64,
}

/// Size-classed pool manager. Create with [BufferPool::new] or use the
/// process-wide singleton via [global].
pub struct BufferPool {
    shared: TrackedMutex<Shared>,
}

impl BufferPool {
    pub fn new() -> Arc<BufferPool> {
        let [s, m, l, x] = CLASSES;
        Arc::new(BufferPool {
            shared: TrackedMutex::new(Shared {
                classes: [
                    Class::new(s.0, s.1),
                    Class::new(m.0, m.1),
                    Class::new(l.0, l.1),
                    Class::new(x.0, x.1),
                ],
                fallback_allocs: 0,
                total_allocs: 0,
                total_frees: 0,
            }),
        })
    }

    /// Returns a buffer of at least `size` bytes. Pool-resident buffers come
    /// back in strict LIFO order per class; an exhausted class or a request
    /// larger than every class is served by the system allocator.
    pub fn alloc(self: &Arc<Self>, size: usize) -> PooledBuf {
        {
            let mut shared = self.shared.lock();
            shared.total_allocs += 1;
            for (i, class) in shared.classes.iter_mut().enumerate() {
                if size > class.buffer_size {
                    continue;
                }
                match class.free.pop() {
                    Some(node) => {
                        debug_assert!(!class.in_use[node as usize]);
                        class.in_use[node as usize] = true;
                        class.used_count += 1;
                        class.peak_used = class.peak_used.max(class.used_count);
                        class.hits += 1;
                        class.bytes_served += size as u64;
                        return PooledBuf {
                            ptr: class.node_ptr(node),
                            len: size,
                            capacity: class.buffer_size,
                            owner: Owner::Pool {
                                pool: Arc::clone(self),
                                class: i as u8,
                                node,
                            },
                        };
                    }
                    None => {
                        class.misses += 1;
                        break;
                    }
                }
            }
            shared.fallback_allocs += 1;
        }
        let mut heap = vec![0u8; size].into_boxed_slice();
        let ptr = NonNull::new(heap.as_mut_ptr()).unwrap_or(NonNull::dangling());
        PooledBuf {
            ptr,
            len: size,
            capacity: size,
            owner: Owner::Heap { _alloc: heap },
        }
    }

    fn release(&self, class: u8, node: u32) {
        let mut shared = self.shared.lock();
        shared.total_frees += 1;
        let c = &mut shared.classes[class as usize];
        debug_assert!(c.in_use[node as usize], "double release of pool node");
        c.in_use[node as usize] = false;
        c.free.push(node);
        c.used_count -= 1;
        c.returns += 1;
    }

    pub fn stats(&self) -> PoolStats {
        let shared = self.shared.lock();
        PoolStats {
            classes: [
                ClassStats::from(&shared.classes[0]),
                ClassStats::from(&shared.classes[1]),
                ClassStats::from(&shared.classes[2]),
                ClassStats::from(&shared.classes[3]),
            ],
            fallback_allocs: shared.fallback_allocs,
            total_allocs: shared.total_allocs,
            total_frees: shared.total_frees,
        }
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        let shared = self.shared.lock();
        for c in &shared.classes {
            assert_eq!(c.used_count + c.free.len(), c.pool_size);
            let in_use = c.in_use.iter().filter(|&&b| b).count();
            assert_eq!(in_use, c.used_count);
            for &n in &c.free {
                assert!(!c.in_use[n as usize], "node {} free and in use", n);
            }
        }
    }
}

enum Owner {
    Pool {
        pool: Arc<BufferPool>,
        class: u8,
        node: u32,
    },
    Heap {
        _alloc: Box<[u8]>,
    },
}

/// A buffer borrowed from a [BufferPool] (or its heap fallback). Derefs to
/// the requested length; drop returns the node to its class's free list.
pub struct PooledBuf {
    ptr: NonNull<u8>,
    len: usize,
    capacity: usize,
    owner: Owner,
}

// A PooledBuf has exclusive ownership of its node's byte range.
unsafe impl Send for PooledBuf {}
unsafe impl Sync for PooledBuf {}

impl PooledBuf {
    /// Usable size of the underlying node, which may exceed the requested
    /// length.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// True if this buffer was served from a pool class rather than the
    /// system allocator.
    pub fn is_pooled(&self) -> bool {
        matches!(self.owner, Owner::Pool { .. })
    }
}

impl std::ops::Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // Safety: ptr covers at least `len` bytes exclusively owned by this
        // handle.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl std::ops::DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        // Safety: as above, and `&mut self` guarantees uniqueness.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Owner::Pool { pool, class, node } = &self.owner {
            pool.release(*class, *node);
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ClassStats {
    pub buffer_size: usize,
    pub pool_size: usize,
    pub used: usize,
    pub peak_used: usize,
    pub hits: u64,
    pub misses: u64,
    pub returns: u64,
    pub bytes_served: u64,
}

impl From<&Class> for ClassStats {
    fn from(c: &Class) -> Self {
        ClassStats {
            buffer_size: c.buffer_size,
            pool_size: c.pool_size,
            used: c.used_count,
            peak_used: c.peak_used,
            hits: c.hits,
            misses: c.misses,
            returns: c.returns,
            bytes_served: c.bytes_served,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct PoolStats {
    pub classes: [ClassStats; 4],
    pub fallback_allocs: u64,
    pub total_allocs: u64,
    pub total_frees: u64,
}

static GLOBAL: Lazy<parking_lot::Mutex<Option<Arc<BufferPool>>>> =
    Lazy::new(|| parking_lot::Mutex::new(None));

/// Initializes the process-wide pool. Idempotent: later calls return the
/// pool created by the first.
pub fn init_global() -> Arc<BufferPool> {
    let mut g = GLOBAL.lock();
    match &*g {
        Some(pool) => Arc::clone(pool),
        None => {
            let pool = BufferPool::new();
            *g = Some(Arc::clone(&pool));
            pool
        }
    }
}

/// Returns the process-wide pool, initializing it on first use.
pub fn global() -> Arc<BufferPool> {
    init_global()
}

/// Drops the process-wide pool reference. Outstanding [PooledBuf]s keep the
/// backing memory alive until they drop.
pub fn shutdown_global() {
    GLOBAL.lock().take();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifo_reuse() {
        let pool = BufferPool::new();
        let a = pool.alloc(100);
        let a_ptr = a.as_ptr();
        drop(a);
        let b = pool.alloc(200);
        assert_eq!(b.as_ptr(), a_ptr);
        let c = pool.alloc(100);
        assert_ne!(c.as_ptr(), a_ptr);
        pool.check_invariants();
    }

    #[test]
    fn len_and_capacity() {
        let pool = BufferPool::new();
        let mut b = pool.alloc(100);
        assert_eq!(b.len(), 100);
        assert_eq!(b.capacity(), SMALL_BUFFER_SIZE);
        b[0] = 0xa5;
        b[99] = 0x5a;
        assert_eq!((b[0], b[99]), (0xa5, 0x5a));
    }

    #[test]
    fn class_dispatch() {
        let pool = BufferPool::new();
        assert_eq!(pool.alloc(SMALL_BUFFER_SIZE).capacity(), SMALL_BUFFER_SIZE);
        assert_eq!(pool.alloc(SMALL_BUFFER_SIZE + 1).capacity(), MEDIUM_BUFFER_SIZE);
        assert_eq!(pool.alloc(MEDIUM_BUFFER_SIZE + 1).capacity(), LARGE_BUFFER_SIZE);
        assert_eq!(pool.alloc(LARGE_BUFFER_SIZE + 1).capacity(), XLARGE_BUFFER_SIZE);
        pool.check_invariants();
    }

    #[test]
    fn oversize_falls_back() {
        let pool = BufferPool::new();
        let b = pool.alloc(XLARGE_BUFFER_SIZE + 1);
        assert!(!b.is_pooled());
        assert_eq!(b.len(), XLARGE_BUFFER_SIZE + 1);
        let stats = pool.stats();
        assert_eq!(stats.fallback_allocs, 1);
        // Oversize requests never count against a class.
        assert!(stats.classes.iter().all(|c| c.misses == 0));
    }

    #[test]
    fn exhaustion() {
        let pool = BufferPool::new();
        let mut held = Vec::new();
        for _ in 0..SMALL_POOL_SIZE {
            held.push(pool.alloc(64));
        }
        pool.check_invariants();
        let extra = pool.alloc(64);
        assert!(!extra.is_pooled());
        let stats = pool.stats();
        assert_eq!(stats.classes[0].hits, SMALL_POOL_SIZE as u64);
        assert_eq!(stats.classes[0].misses, 1);
        assert_eq!(stats.classes[0].used, SMALL_POOL_SIZE);
        assert_eq!(stats.classes[0].peak_used, SMALL_POOL_SIZE);
        assert_eq!(stats.fallback_allocs, 1);

        held.truncate(0);
        drop(extra);
        pool.check_invariants();
        let stats = pool.stats();
        assert_eq!(stats.classes[0].used, 0);
        assert_eq!(stats.classes[0].returns, SMALL_POOL_SIZE as u64);
        // The fallback allocation was returned straight to the system
        // allocator, not to a class.
        assert_eq!(stats.total_frees, SMALL_POOL_SIZE as u64);
        assert_eq!(stats.total_allocs, SMALL_POOL_SIZE as u64 + 1);
    }

    #[test]
    fn interleaved_alloc_free_holds_invariants() {
        let pool = BufferPool::new();
        let mut held = Vec::new();
        for round in 0..8usize {
            for i in 0..16usize {
                held.push(pool.alloc(1 + (round * 16 + i) % SMALL_BUFFER_SIZE));
            }
            // Free every other buffer.
            let mut i = 0;
            held.retain(|_| {
                i += 1;
                i % 2 == 0
            });
            pool.check_invariants();
        }
        held.clear();
        pool.check_invariants();
    }

    #[test]
    fn global_is_idempotent() {
        shutdown_global();
        let a = init_global();
        let b = init_global();
        let c = global();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &c));
        shutdown_global();
        let d = global();
        assert!(!Arc::ptr_eq(&a, &d));
        shutdown_global();
    }

    #[test]
    fn buffers_outlive_pool_handle() {
        let pool = BufferPool::new();
        let mut b = pool.alloc(32);
        drop(pool);
        b[31] = 7;
        assert_eq!(b[31], 7);
    }
}
