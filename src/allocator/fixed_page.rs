//! Fixed-size page allocator for overflow buckets
//!
//! Buckets are handed out by logical [`FixedPageAddress`]; the address is
//! translated to memory through a page table of lazily installed pages.
//! Pages are never freed while the allocator lives, so a `&HashBucket`
//! obtained from [`FixedPageAllocator::get`] stays valid for `&self`.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use crossbeam::queue::SegQueue;

use crate::index::{FixedPageAddress, HashBucket};
use crate::status::Status;

/// Number of address bits selecting a bucket within a page
pub const FIXED_PAGE_BITS: u32 = 9;

/// Buckets per page (32 KiB of buckets)
pub const FIXED_PAGE_SIZE: u64 = 1 << FIXED_PAGE_BITS;

/// Default page-table capacity (32M overflow buckets)
pub const DEFAULT_MAX_PAGES: usize = 1 << 16;

/// Page-based allocator of cache-line [`HashBucket`]s.
///
/// - `allocate` pops the free list, else bumps the tail, installing a
///   zeroed page on first touch.
/// - `free` zeroes the bucket and pushes it on the free list.
/// - Address 0 is never issued.
pub struct FixedPageAllocator {
    pages: Box<[AtomicPtr<HashBucket>]>,
    tail: AtomicU64,
    free_list: SegQueue<FixedPageAddress>,
    live_buckets: AtomicU64,
    installed_pages: AtomicUsize,
}

impl FixedPageAllocator {
    /// Create an allocator with the default page-table capacity
    pub fn new() -> Self {
        Self::with_max_pages(DEFAULT_MAX_PAGES)
    }

    /// Create an allocator that can hold at most `max_pages` pages
    pub fn with_max_pages(max_pages: usize) -> Self {
        let pages: Vec<AtomicPtr<HashBucket>> = (0..max_pages.max(1))
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();
        Self {
            pages: pages.into_boxed_slice(),
            // Offset 0 of page 0 is reserved so that 0 can mean "no bucket".
            tail: AtomicU64::new(1),
            free_list: SegQueue::new(),
            live_buckets: AtomicU64::new(0),
            installed_pages: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn page_layout() -> Layout {
        // Cannot fail: size is a small multiple of the bucket size and the
        // alignment is the bucket's own.
        Layout::array::<HashBucket>(FIXED_PAGE_SIZE as usize)
            .unwrap_or_else(|_| Layout::new::<HashBucket>())
    }

    #[inline]
    fn split(address: u64) -> (usize, usize) {
        (
            (address >> FIXED_PAGE_BITS) as usize,
            (address & (FIXED_PAGE_SIZE - 1)) as usize,
        )
    }

    /// Allocate a zeroed bucket.
    ///
    /// Fails with [`Status::OutOfMemory`] when the page table is exhausted or
    /// the system allocator refuses a page.
    pub fn allocate(&self) -> Result<FixedPageAddress, Status> {
        if let Some(address) = self.free_list.pop() {
            self.live_buckets.fetch_add(1, Ordering::Relaxed);
            return Ok(address);
        }

        let address = self.tail.fetch_add(1, Ordering::AcqRel);
        if address > FixedPageAddress::MAX {
            return Err(Status::OutOfMemory);
        }
        let (page, _) = Self::split(address);
        if page >= self.pages.len() {
            return Err(Status::OutOfMemory);
        }
        self.ensure_page(page)?;

        self.live_buckets.fetch_add(1, Ordering::Relaxed);
        Ok(FixedPageAddress::new(address))
    }

    fn ensure_page(&self, page: usize) -> Result<(), Status> {
        let slot = &self.pages[page];
        if !slot.load(Ordering::Acquire).is_null() {
            return Ok(());
        }

        let layout = Self::page_layout();
        // SAFETY: the layout has non-zero size; all-zero bytes are a valid
        // array of empty `HashBucket`s.
        let fresh = unsafe { alloc_zeroed(layout) } as *mut HashBucket;
        if fresh.is_null() {
            return Err(Status::OutOfMemory);
        }

        match slot.compare_exchange(ptr::null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => {
                self.installed_pages.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                // Another thread installed the page first.
                // SAFETY: `fresh` was never published and came from `alloc_zeroed(layout)`.
                unsafe { dealloc(fresh as *mut u8, layout) };
            }
        }
        Ok(())
    }

    /// Return a bucket to the free list.
    ///
    /// The caller guarantees the bucket is not reachable from any chain and
    /// no thread still reads it.
    pub fn free(&self, address: FixedPageAddress) {
        let Some(bucket) = self.get(address) else {
            debug_assert!(false, "free of unallocated {address:?}");
            return;
        };
        bucket.reset();
        self.live_buckets.fetch_sub(1, Ordering::Relaxed);
        self.free_list.push(address);
    }

    /// Translate a logical address to its bucket
    #[inline]
    pub fn get(&self, address: FixedPageAddress) -> Option<&HashBucket> {
        if address.is_none() {
            return None;
        }
        let (page, offset) = Self::split(address.control());
        let base = self.pages.get(page)?.load(Ordering::Acquire);
        if base.is_null() {
            return None;
        }
        // SAFETY: `offset < FIXED_PAGE_SIZE` and the page stays allocated
        // until `self` is dropped.
        Some(unsafe { &*base.add(offset) })
    }

    /// Buckets currently handed out (allocated and not freed)
    pub fn allocated_buckets(&self) -> u64 {
        self.live_buckets.load(Ordering::Relaxed)
    }

    /// Buckets waiting on the free list
    pub fn free_list_len(&self) -> usize {
        self.free_list.len()
    }

    /// Pages installed so far
    pub fn pages(&self) -> usize {
        self.installed_pages.load(Ordering::Relaxed)
    }

    /// Page-table capacity
    pub fn max_pages(&self) -> usize {
        self.pages.len()
    }
}

impl Default for FixedPageAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FixedPageAllocator {
    fn drop(&mut self) {
        let layout = Self::page_layout();
        for slot in self.pages.iter_mut() {
            let page = std::mem::replace(slot.get_mut(), ptr::null_mut());
            if !page.is_null() {
                // SAFETY: every installed page came from `alloc_zeroed(layout)`
                // and `&mut self` rules out concurrent readers.
                unsafe { dealloc(page as *mut u8, layout) };
            }
        }
    }
}

impl std::fmt::Debug for FixedPageAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedPageAllocator")
            .field("pages", &self.pages())
            .field("max_pages", &self.max_pages())
            .field("allocated_buckets", &self.allocated_buckets())
            .field("free_list_len", &self.free_list_len())
            .finish()
    }
}

// Safety: pages are only reached through atomics; bucket contents are atomics.
unsafe impl Send for FixedPageAllocator {}
unsafe impl Sync for FixedPageAllocator {}
