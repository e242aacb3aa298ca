//! Page-granular byte buffers for request and reply bodies.

use fxhash::{FxHashMap, FxHashSet};
use parking_lot::Mutex;

use crate::raw::PAGE_SIZE;

/// Hands out byte buffers for the read/dispatch/write loop.
pub trait BufferPool: Send + Sync {
    /// Returns a buffer of length `size`.
    fn alloc_buffer(&self, size: usize) -> Vec<u8>;

    /// Gives a buffer back. Buffers the pool did not hand out are dropped.
    fn return_buffer(&self, buf: Vec<u8>);

    /// One-line summary for diagnostics.
    fn stats(&self) -> String {
        String::new()
    }
}

/// Round `size` up to a power-of-two number of pages.
pub fn rounded_size(size: usize) -> usize {
    size.max(PAGE_SIZE).next_power_of_two()
}

fn is_pool_size(capacity: usize) -> bool {
    capacity >= PAGE_SIZE && capacity.is_power_of_two()
}

#[derive(Default)]
struct PoolState {
    free: FxHashMap<usize, Vec<Vec<u8>>>,
    /// Data pointers of buffers currently handed out.
    outstanding: FxHashSet<usize>,
    created: usize,
}

/// Free-list pool bucketed by power-of-two page multiples.
#[derive(Default)]
pub struct PooledBufferPool {
    state: Mutex<PoolState>,
}

impl PooledBufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buffers handed out and not yet returned.
    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding.len()
    }

    /// Number of buffers sitting in free lists.
    pub fn free_count(&self) -> usize {
        self.state.lock().free.values().map(Vec::len).sum()
    }

    /// Number of buffers ever allocated fresh by this pool.
    pub fn created(&self) -> usize {
        self.state.lock().created
    }
}

impl BufferPool for PooledBufferPool {
    fn alloc_buffer(&self, size: usize) -> Vec<u8> {
        let capacity = rounded_size(size);
        let mut state = self.state.lock();

        let mut buf = match state.free.get_mut(&capacity).and_then(Vec::pop) {
            Some(buf) => buf,
            None => {
                state.created += 1;
                Vec::with_capacity(capacity)
            }
        };

        // Allocators may round up; only exact power-of-two capacities are
        // tracked, others are handed out untracked and dropped on return.
        if buf.capacity() == capacity {
            state.outstanding.insert(buf.as_ptr() as usize);
        }
        drop(state);

        buf.resize(size, 0);
        buf
    }

    fn return_buffer(&self, mut buf: Vec<u8>) {
        let capacity = buf.capacity();
        if !is_pool_size(capacity) {
            return;
        }

        let mut state = self.state.lock();
        if !state.outstanding.remove(&(buf.as_ptr() as usize)) {
            tracing::trace!("Ignoring foreign buffer of capacity {}", capacity);
            return;
        }
        buf.clear();
        state.free.entry(capacity).or_default().push(buf);
    }

    fn stats(&self) -> String {
        let state = self.state.lock();
        let mut sizes: Vec<_> = state
            .free
            .iter()
            .filter(|(_, bufs)| !bufs.is_empty())
            .map(|(size, bufs)| (*size / PAGE_SIZE, bufs.len()))
            .collect();
        sizes.sort_unstable();
        let free: Vec<String> = sizes
            .iter()
            .map(|(pages, n)| format!("{}p:{}", pages, n))
            .collect();
        format!(
            "created: {}, outstanding: {}, free: [{}]",
            state.created,
            state.outstanding.len(),
            free.join(" ")
        )
    }
}

/// Pass-through pool: fresh allocation every time, release drops.
#[derive(Debug, Default, Clone, Copy)]
pub struct GcBufferPool;

impl BufferPool for GcBufferPool {
    fn alloc_buffer(&self, size: usize) -> Vec<u8> {
        vec![0; size]
    }

    fn return_buffer(&self, _buf: Vec<u8>) {}
}
