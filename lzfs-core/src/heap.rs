//! Heap capability and heap-owned byte buffers.
//!
//! The dispatcher never allocates buffers from the global allocator directly.
//! Every buffer comes from a [`Heap`]: read destinations from the heap the
//! caller passes at submission, scratch buffers from the dispatcher's own
//! heap. A [`HeapBuffer`] remembers where it came from and gives its memory
//! back to that heap when dropped, so ownership of a buffer is ownership of
//! the value.

use crate::error::AllocError;
use dashmap::DashMap;
use std::alloc::{self, Layout};
use std::backtrace::Backtrace;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Default alignment of dispatcher buffers.
pub const DEFAULT_ALIGNMENT: usize = 8;

/// An allocator the dispatcher can draw buffers from.
pub trait Heap: Send + Sync {
    /// Human-readable name used in logs and errors.
    fn name(&self) -> &str;

    /// Allocates a block for `layout`.
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError>;

    /// Allocates a zero-filled block for `layout`.
    ///
    /// Heaps that get zeroed memory cheaply (fresh pages from the OS) should
    /// override the default, which clears the block by hand.
    fn allocate_zeroed(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        let ptr = self.allocate(layout)?;
        // Safety: the block is at least `layout.size()` bytes long.
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, layout.size()) };
        Ok(ptr)
    }

    /// Returns a block to the heap.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate` on this heap with the same
    /// `layout`, and must not be used afterwards.
    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout);
}

/// Shared handle to a heap.
pub type SharedHeap = Arc<dyn Heap>;

/// Heap backed by the process allocator.
#[derive(Debug, Clone)]
pub struct SystemHeap {
    name: String,
}

impl SystemHeap {
    /// Creates a system heap with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Creates a named system heap behind a shared handle.
    pub fn shared(name: impl Into<String>) -> SharedHeap {
        Arc::new(Self::new(name))
    }
}

impl Default for SystemHeap {
    fn default() -> Self {
        Self::new("system")
    }
}

impl Heap for SystemHeap {
    fn name(&self) -> &str {
        &self.name
    }

    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        let refused = || AllocError {
            heap: self.name.clone(),
            size: layout.size(),
            align: layout.align(),
        };
        if layout.size() == 0 {
            return Err(refused());
        }
        // Safety: the layout has a non-zero size.
        let ptr = unsafe { alloc::alloc(layout) };
        NonNull::new(ptr).ok_or_else(refused)
    }

    fn allocate_zeroed(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        let refused = || AllocError {
            heap: self.name.clone(),
            size: layout.size(),
            align: layout.align(),
        };
        if layout.size() == 0 {
            return Err(refused());
        }
        // Safety: the layout has a non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(refused)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
        alloc::dealloc(ptr.as_ptr(), layout);
    }
}

/// An owned, zero-initialised byte buffer allocated from a [`Heap`].
///
/// The buffer has a fixed capacity and a logical length. Bytes past the
/// length stay readable through [`HeapBuffer::with_terminator`], which is how
/// null-terminated reads expose their trailing zero.
pub struct HeapBuffer {
    ptr: NonNull<u8>,
    len: usize,
    capacity: usize,
    layout: Layout,
    heap: SharedHeap,
}

// Safety: the buffer exclusively owns its block, like a `Vec<u8>`.
unsafe impl Send for HeapBuffer {}
unsafe impl Sync for HeapBuffer {}

impl HeapBuffer {
    /// Allocates a zeroed buffer of `capacity` bytes from `heap`.
    pub fn allocate(heap: &SharedHeap, capacity: usize, align: usize) -> Result<Self, AllocError> {
        let layout = Layout::from_size_align(capacity.max(1), align).map_err(|_| AllocError {
            heap: heap.name().to_string(),
            size: capacity,
            align,
        })?;

        let ptr = heap.allocate_zeroed(layout)?;

        Ok(Self {
            ptr,
            len: 0,
            capacity,
            layout,
            heap: Arc::clone(heap),
        })
    }

    /// Allocates a buffer holding a copy of `data`.
    pub fn from_slice(heap: &SharedHeap, data: &[u8]) -> Result<Self, AllocError> {
        let mut buffer = Self::allocate(heap, data.len(), DEFAULT_ALIGNMENT)?;
        buffer.storage_mut()[..data.len()].copy_from_slice(data);
        buffer.set_len(data.len());
        Ok(buffer)
    }

    /// Logical length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the logical length is zero.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of bytes the buffer can hold.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sets the logical length.
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds the capacity.
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.capacity, "length exceeds buffer capacity");
        self.len = len;
    }

    /// The bytes within the logical length.
    pub fn as_slice(&self) -> &[u8] {
        // Safety: `len <= capacity` and the block is initialised.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// The bytes within the logical length, mutably.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safety: `len <= capacity` and the block is initialised.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// The whole capacity, regardless of the logical length.
    pub fn storage_mut(&mut self) -> &mut [u8] {
        // Safety: the block holds `capacity` initialised bytes.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.capacity) }
    }

    /// The logical contents followed by the byte after them, if the
    /// buffer has room for one.
    pub fn with_terminator(&self) -> Option<&[u8]> {
        if self.capacity <= self.len {
            return None;
        }
        // Safety: `len + 1 <= capacity`.
        Some(unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len + 1) })
    }

    /// Writes a zero byte right after the logical contents.
    ///
    /// Returns `false` when the buffer has no room for it.
    pub fn terminate(&mut self) -> bool {
        let len = self.len;
        match self.storage_mut().get_mut(len) {
            Some(byte) => {
                *byte = 0;
                true
            }
            None => false,
        }
    }

    /// The heap this buffer returns to.
    pub fn heap(&self) -> &SharedHeap {
        &self.heap
    }
}

impl Deref for HeapBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl DerefMut for HeapBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

impl AsRef<[u8]> for HeapBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Debug for HeapBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapBuffer")
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .field("heap", &self.heap.name())
            .finish()
    }
}

impl Drop for HeapBuffer {
    fn drop(&mut self) {
        // Safety: the block came from `self.heap` with `self.layout`.
        unsafe { self.heap.free(self.ptr, self.layout) };
    }
}

struct Allocation {
    size: usize,
    backtrace: Option<Backtrace>,
}

/// A live allocation reported by [`TrackingHeap::leaks`].
#[derive(Debug, Clone)]
pub struct LeakRecord {
    /// Address of the block.
    pub address: usize,
    /// Size of the block in bytes.
    pub size: usize,
    /// Call stack captured at allocation time, if enabled.
    pub backtrace: Option<String>,
}

/// Decorator that records every live allocation of an inner heap.
///
/// Dropping a tracking heap with live allocations logs each of them, with
/// the allocation call stack when backtrace capture is enabled.
pub struct TrackingHeap {
    name: String,
    inner: SharedHeap,
    live: DashMap<usize, Allocation>,
    total: AtomicUsize,
    capture_backtraces: bool,
}

impl TrackingHeap {
    /// Wraps `inner`, without capturing backtraces.
    pub fn new(inner: SharedHeap) -> Self {
        Self {
            name: format!("tracking({})", inner.name()),
            inner,
            live: DashMap::new(),
            total: AtomicUsize::new(0),
            capture_backtraces: false,
        }
    }

    /// Enables or disables capturing a backtrace per allocation.
    pub fn with_backtraces(mut self, enabled: bool) -> Self {
        self.capture_backtraces = enabled;
        self
    }

    /// Number of blocks currently allocated.
    pub fn live_allocations(&self) -> usize {
        self.live.len()
    }

    /// Number of bytes currently allocated.
    pub fn live_bytes(&self) -> usize {
        self.live.iter().map(|entry| entry.value().size).sum()
    }

    /// Number of allocations served since creation.
    pub fn total_allocations(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    /// Snapshot of the live allocations.
    pub fn leaks(&self) -> Vec<LeakRecord> {
        self.live
            .iter()
            .map(|entry| LeakRecord {
                address: *entry.key(),
                size: entry.value().size,
                backtrace: entry.value().backtrace.as_ref().map(|bt| bt.to_string()),
            })
            .collect()
    }

    /// Logs every live allocation and returns how many there were.
    pub fn report_leaks(&self) -> usize {
        let leaks = self.leaks();
        for leak in &leaks {
            match &leak.backtrace {
                Some(bt) => tracing::error!(
                    heap = %self.name,
                    address = %format!("{:#x}", leak.address),
                    size = leak.size,
                    "Memory leak with callstack:\n{}",
                    bt
                ),
                None => tracing::error!(
                    heap = %self.name,
                    address = %format!("{:#x}", leak.address),
                    size = leak.size,
                    "Memory leak"
                ),
            }
        }
        leaks.len()
    }
}

impl fmt::Debug for TrackingHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackingHeap")
            .field("name", &self.name)
            .field("live_allocations", &self.live_allocations())
            .field("total_allocations", &self.total_allocations())
            .finish()
    }
}

impl Heap for TrackingHeap {
    fn name(&self) -> &str {
        &self.name
    }

    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        let ptr = self.inner.allocate(layout)?;
        self.record(ptr, layout);
        Ok(ptr)
    }

    fn allocate_zeroed(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        let ptr = self.inner.allocate_zeroed(layout)?;
        self.record(ptr, layout);
        Ok(ptr)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
        if self.live.remove(&(ptr.as_ptr() as usize)).is_none() {
            tracing::warn!(heap = %self.name, "Freeing a block this heap did not allocate");
        }
        self.inner.free(ptr, layout);
    }
}

impl TrackingHeap {
    fn record(&self, ptr: NonNull<u8>, layout: Layout) {
        let backtrace = self.capture_backtraces.then(Backtrace::force_capture);
        self.live.insert(
            ptr.as_ptr() as usize,
            Allocation {
                size: layout.size(),
                backtrace,
            },
        );
        self.total.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for TrackingHeap {
    fn drop(&mut self) {
        if !self.live.is_empty() {
            self.report_leaks();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_allocation() {
        let heap = SystemHeap::shared("test");
        let mut buffer = HeapBuffer::allocate(&heap, 16, 8).unwrap();

        assert_eq!(buffer.len(), 0);
        assert_eq!(buffer.capacity(), 16);
        assert!(buffer.storage_mut().iter().all(|&b| b == 0));

        buffer.storage_mut()[..5].copy_from_slice(b"hello");
        buffer.set_len(5);
        assert_eq!(&buffer[..], b"hello");
        assert_eq!(buffer.as_ptr() as usize % 8, 0);
    }

    #[test]
    fn test_terminator() {
        let heap = SystemHeap::shared("test");
        let mut buffer = HeapBuffer::allocate(&heap, 6, 8).unwrap();
        buffer.storage_mut()[..5].copy_from_slice(b"hello");
        buffer.set_len(5);

        assert!(buffer.terminate());
        assert_eq!(buffer.with_terminator(), Some(&b"hello\0"[..]));

        // No room past a full buffer
        let exact = HeapBuffer::from_slice(&heap, b"hello").unwrap();
        assert_eq!(exact.with_terminator(), None);
    }

    #[test]
    #[should_panic(expected = "length exceeds buffer capacity")]
    fn test_set_len_past_capacity() {
        let heap = SystemHeap::shared("test");
        let mut buffer = HeapBuffer::allocate(&heap, 4, 8).unwrap();
        buffer.set_len(5);
    }

    #[test]
    fn test_bad_alignment_is_refused() {
        let heap = SystemHeap::shared("test");
        let err = HeapBuffer::allocate(&heap, 4, 3).unwrap_err();
        assert_eq!(err.align, 3);
        assert_eq!(err.heap, "test");
    }

    #[test]
    fn test_tracking_heap_counts_live_blocks() {
        let tracking = Arc::new(TrackingHeap::new(SystemHeap::shared("inner")));
        let heap: SharedHeap = tracking.clone();

        let a = HeapBuffer::allocate(&heap, 100, 8).unwrap();
        let b = HeapBuffer::from_slice(&heap, b"abc").unwrap();
        assert_eq!(tracking.live_allocations(), 2);
        assert_eq!(tracking.live_bytes(), 103);

        drop(a);
        assert_eq!(tracking.live_allocations(), 1);

        let leaks = tracking.leaks();
        assert_eq!(leaks.len(), 1);
        assert_eq!(leaks[0].size, 3);
        assert!(leaks[0].backtrace.is_none());

        drop(b);
        assert_eq!(tracking.live_allocations(), 0);
        assert_eq!(tracking.total_allocations(), 2);
        assert_eq!(tracking.report_leaks(), 0);
    }

    /// Hands out blocks full of garbage and only implements `allocate`.
    struct DirtyHeap;

    impl Heap for DirtyHeap {
        fn name(&self) -> &str {
            "dirty"
        }

        fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
            let ptr = SystemHeap::default().allocate(layout)?;
            unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0xAA, layout.size()) };
            Ok(ptr)
        }

        unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
            SystemHeap::default().free(ptr, layout);
        }
    }

    #[test]
    fn test_buffers_are_zeroed_by_every_heap() {
        let dirty: SharedHeap = Arc::new(DirtyHeap);
        let mut buffer = HeapBuffer::allocate(&dirty, 64, 8).unwrap();
        assert!(buffer.storage_mut().iter().all(|&b| b == 0));

        let system = SystemHeap::shared("test");
        let mut large = HeapBuffer::allocate(&system, 4 << 20, 8).unwrap();
        assert!(large.storage_mut().iter().all(|&b| b == 0));

        let tracking = Arc::new(TrackingHeap::new(dirty.clone()));
        let heap: SharedHeap = tracking.clone();
        let mut tracked = HeapBuffer::allocate(&heap, 32, 8).unwrap();
        assert!(tracked.storage_mut().iter().all(|&b| b == 0));
        assert_eq!(tracking.live_allocations(), 1);
        drop(tracked);
        assert_eq!(tracking.live_allocations(), 0);
    }

    #[test]
    fn test_tracking_heap_backtraces() {
        let tracking =
            Arc::new(TrackingHeap::new(SystemHeap::shared("inner")).with_backtraces(true));
        let heap: SharedHeap = tracking.clone();

        let buffer = HeapBuffer::allocate(&heap, 8, 8).unwrap();
        let leaks = tracking.leaks();
        assert_eq!(leaks.len(), 1);
        assert!(leaks[0].backtrace.is_some());
        assert_eq!(tracking.report_leaks(), 1);

        drop(buffer);
        assert_eq!(tracking.live_allocations(), 0);
    }
}
