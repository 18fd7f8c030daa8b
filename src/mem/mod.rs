//! Page-granular backing storage
//!
//! Buffer chains never touch the heap for payload data; every cell lives in
//! a page drawn from a [`PageAllocator`]. This module defines the page
//! handle, the allocator contract, and a heap-backed allocator suitable for
//! hosted environments and tests.

pub mod user;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::alloc::Layout;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;

/// Size of one backing page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Layout of a single page allocation.
// SAFETY: PAGE_SIZE is a nonzero power of two.
const PAGE_LAYOUT: Layout = unsafe { Layout::from_size_align_unchecked(PAGE_SIZE, PAGE_SIZE) };

/// Owned handle to one page of backing storage.
///
/// A `PageRef` is handed out by a [`PageAllocator`] and must eventually be
/// returned to it. While the handle is live its page belongs exclusively to
/// the holder; pages are never shared or split.
pub struct PageRef {
    ptr: NonNull<u8>,
}

impl PageRef {
    /// Wraps a raw page mapping in an owned handle.
    ///
    /// # Safety
    ///
    /// `ptr` must reference `PAGE_SIZE` bytes of initialized memory, valid
    /// for reads and writes and aliased by nothing else, for as long as the
    /// handle (and any cell built in it) is live.
    pub unsafe fn new(ptr: NonNull<u8>) -> Self {
        Self { ptr }
    }

    /// Kernel-visible pointer to the start of the page.
    pub fn as_non_null(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Raw pointer to the start of the page.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

// SAFETY: a PageRef is an exclusive handle to its page; nothing else
// aliases the memory it points at.
unsafe impl Send for PageRef {}

/// A batch of pages moving between a chain and its allocator.
pub type PageList = Vec<PageRef>;

/// Source and sink of page-sized buffers.
///
/// Chains allocate in batches and free in batches; an implementation may
/// block internally (waiting for reclaim) but must either satisfy a request
/// in full or fail it without retaining anything.
pub trait PageAllocator {
    /// Allocates exactly `count` pages, or `None` if the request cannot be
    /// satisfied in full.
    fn alloc_pages(&self, count: usize) -> Option<PageList>;

    /// Takes ownership of and reclaims every page in `pages`.
    fn free_pages(&self, pages: PageList);
}

impl<A: PageAllocator + ?Sized> PageAllocator for &A {
    fn alloc_pages(&self, count: usize) -> Option<PageList> {
        (**self).alloc_pages(count)
    }

    fn free_pages(&self, pages: PageList) {
        (**self).free_pages(pages)
    }
}

impl<A: PageAllocator + ?Sized> PageAllocator for Arc<A> {
    fn alloc_pages(&self, count: usize) -> Option<PageList> {
        (**self).alloc_pages(count)
    }

    fn free_pages(&self, pages: PageList) {
        (**self).free_pages(pages)
    }
}

/// Pages kept on the recycle cache before falling back to the heap.
const CACHE_PAGES: usize = 32;

/// Page allocator backed by the global heap.
///
/// Freed pages are parked on a small recycle cache and reused before any
/// fresh allocation, so steady-state traffic does not churn the heap. An
/// optional limit bounds the number of outstanding pages; a request that
/// would cross it fails without retaining anything, which is what a chain
/// reports as back-pressure.
pub struct HeapPages {
    /// Recycled pages, most recently freed first.
    cache: Mutex<Vec<PageRef>>,
    /// Pages handed out and not yet returned.
    outstanding: AtomicUsize,
    /// Maximum outstanding pages.
    limit: usize,
}

impl HeapPages {
    /// Creates an allocator with no outstanding-page limit.
    pub const fn new() -> Self {
        Self::with_limit(usize::MAX)
    }

    /// Creates an allocator that refuses to exceed `limit` outstanding
    /// pages.
    pub const fn with_limit(limit: usize) -> Self {
        Self {
            cache: Mutex::new(Vec::new()),
            outstanding: AtomicUsize::new(0),
            limit,
        }
    }

    /// Number of pages currently handed out and not yet returned.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// Parks `pages` on the cache, releasing overflow back to the heap.
    fn park(&self, pages: PageList) {
        let mut cache = self.cache.lock();
        for page in pages {
            if cache.len() < CACHE_PAGES {
                cache.push(page);
            } else {
                // SAFETY: the page was produced by PAGE_LAYOUT and the
                // handle being consumed here is its sole owner.
                unsafe { alloc::alloc::dealloc(page.as_ptr(), PAGE_LAYOUT) };
            }
        }
    }
}

impl PageAllocator for HeapPages {
    fn alloc_pages(&self, count: usize) -> Option<PageList> {
        if count == 0 {
            return Some(Vec::new());
        }

        // Reserve against the limit up front so the request is all or
        // nothing even under concurrent callers.
        let reserved = self
            .outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                n.checked_add(count).filter(|total| *total <= self.limit)
            });
        if reserved.is_err() {
            log::trace!("heap pages exhausted: {count} requested, limit {}", self.limit);
            return None;
        }

        let mut pages = Vec::with_capacity(count);
        {
            let mut cache = self.cache.lock();
            while pages.len() < count {
                match cache.pop() {
                    Some(page) => pages.push(page),
                    None => break,
                }
            }
        }

        while pages.len() < count {
            // SAFETY: PAGE_LAYOUT has nonzero size.
            let raw = unsafe { alloc::alloc::alloc_zeroed(PAGE_LAYOUT) };
            match NonNull::new(raw) {
                // SAFETY: freshly allocated, zeroed, exclusively ours.
                Some(ptr) => pages.push(unsafe { PageRef::new(ptr) }),
                None => {
                    log::trace!("heap pages exhausted after {} of {count}", pages.len());
                    self.outstanding.fetch_sub(count, Ordering::SeqCst);
                    self.park(pages);
                    return None;
                }
            }
        }

        Some(pages)
    }

    fn free_pages(&self, pages: PageList) {
        if pages.is_empty() {
            return;
        }
        self.outstanding.fetch_sub(pages.len(), Ordering::SeqCst);
        self.park(pages);
    }
}

impl Default for HeapPages {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HeapPages {
    fn drop(&mut self) {
        let mut cache = self.cache.lock();
        for page in cache.drain(..) {
            // SAFETY: cached pages came from PAGE_LAYOUT allocations and
            // are owned by the cache.
            unsafe { alloc::alloc::dealloc(page.as_ptr(), PAGE_LAYOUT) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_free_roundtrip() {
        let pages = HeapPages::new();
        let batch = pages.alloc_pages(3).expect("allocation failed");
        assert_eq!(batch.len(), 3);
        assert_eq!(pages.outstanding(), 3);

        pages.free_pages(batch);
        assert_eq!(pages.outstanding(), 0);
    }

    #[test]
    fn test_limit_is_all_or_nothing() {
        let pages = HeapPages::with_limit(2);
        assert!(pages.alloc_pages(3).is_none());
        assert_eq!(pages.outstanding(), 0);

        let batch = pages.alloc_pages(2).expect("allocation failed");
        assert_eq!(pages.outstanding(), 2);
        assert!(pages.alloc_pages(1).is_none());
        pages.free_pages(batch);
    }

    #[test]
    fn test_freed_pages_are_recycled() {
        let pages = HeapPages::new();
        let batch = pages.alloc_pages(1).expect("allocation failed");
        let addr = batch[0].as_ptr() as usize;
        pages.free_pages(batch);

        let again = pages.alloc_pages(1).expect("allocation failed");
        assert_eq!(again[0].as_ptr() as usize, addr);
        pages.free_pages(again);
    }

    #[test]
    fn test_fresh_pages_are_zeroed() {
        let pages = HeapPages::new();
        let batch = pages.alloc_pages(1).expect("allocation failed");
        // SAFETY: the page is owned by `batch` and PAGE_SIZE bytes long.
        let bytes = unsafe { core::slice::from_raw_parts(batch[0].as_ptr(), PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0));
        pages.free_pages(batch);
    }

    #[test]
    fn test_zero_count_allocates_nothing() {
        let pages = HeapPages::with_limit(0);
        let batch = pages.alloc_pages(0).expect("empty request must succeed");
        assert!(batch.is_empty());
        assert_eq!(pages.outstanding(), 0);
    }
}
