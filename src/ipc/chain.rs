//! Chained page-sized buffer cells
//!
//! A chain stores a stream of bytes or a sequence of datagrams for one
//! endpoint. Each cell is built inside the single page that backs it, so
//! the unit of allocation, linkage, and payload is the same page; cells are
//! drawn from the chain's [`PageAllocator`] on write and handed back as
//! soon as a read drains them.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::mem;
use core::ptr;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

use super::ChainError;
use crate::mem::user::{UserCopyError, UserSink, UserSource};
use crate::mem::{PageAllocator, PageList, PageRef, PAGE_SIZE};

/// Header bytes preceding the payload region of a cell.
const CELL_HEADER: usize = 16;

/// Bytes of payload carried by one cell.
pub const CELL_PAYLOAD: usize = PAGE_SIZE - CELL_HEADER;

/// Upper bound on unread bytes stored in one chain.
pub const CHAIN_CAPACITY: usize = 128 * CELL_PAYLOAD;

/// Total bytes occupied by live buffer cells, across all chains.
static TOTAL_CELL_BYTES: AtomicU64 = AtomicU64::new(0);

/// Current memory footprint of live buffer cells, in bytes.
///
/// Updated as cells are built and torn down; safe to read from observers
/// at any time.
pub fn total_cell_bytes() -> u64 {
    TOTAL_CELL_BYTES.load(Ordering::Relaxed)
}

/// A buffer cell: one page holding a small header and payload bytes.
///
/// The cell is constructed in place inside the page referenced by `page`,
/// and the two are reclaimed together. The payload region is not scrubbed;
/// nothing past `valid_len` is ever read.
#[repr(C)]
struct BufCell {
    /// Bytes of `data` populated so far. Stream writes append to the tail
    /// cell and grow this.
    valid_len: u32,
    /// Total length of the datagram that starts in this cell; 0 for body
    /// cells and for every cell of a stream chain.
    frame_len: u32,
    /// The page this cell lives in, returned to the allocator on free.
    page: PageRef,
    /// Payload. Left as the page had it until written.
    data: [u8; CELL_PAYLOAD],
}

// A cell and the page that stores it are the same allocation.
const _: () = assert!(mem::size_of::<BufCell>() == PAGE_SIZE);
const _: () = assert!(mem::align_of::<BufCell>() <= PAGE_SIZE);

impl BufCell {
    /// Number of cells needed to carry `payload` bytes (`payload > 0`).
    const fn cells_for_payload(payload: usize) -> usize {
        1 + (payload - 1) / CELL_PAYLOAD
    }

    /// Free space left in this cell.
    fn rem(&self) -> usize {
        CELL_PAYLOAD - self.valid_len as usize
    }

    /// Builds a cell in the page it describes. Only the header is written.
    fn construct(page: PageRef) -> NonNull<BufCell> {
        let cell: NonNull<BufCell> = page.as_non_null().cast();
        let hdr = cell.as_ptr();
        // SAFETY: `page` grants exclusive read/write access to PAGE_SIZE
        // bytes and BufCell fills the page exactly; only header fields are
        // touched here.
        unsafe {
            ptr::addr_of_mut!((*hdr).valid_len).write(0);
            ptr::addr_of_mut!((*hdr).frame_len).write(0);
            ptr::addr_of_mut!((*hdr).page).write(page);
        }
        TOTAL_CELL_BYTES.fetch_add(mem::size_of::<BufCell>() as u64, Ordering::Relaxed);
        cell
    }

    /// Tears a cell down, handing back the page it lived in.
    ///
    /// # Safety
    ///
    /// `cell` must have come from [`BufCell::construct`] and must not be
    /// used afterwards.
    unsafe fn destruct(cell: NonNull<BufCell>) -> PageRef {
        TOTAL_CELL_BYTES.fetch_sub(mem::size_of::<BufCell>() as u64, Ordering::Relaxed);
        // SAFETY: the header was initialized by `construct`; moving the
        // page handle out ends the cell's life.
        unsafe { ptr::addr_of!((*cell.as_ptr()).page).read() }
    }

    /// Copies user bytes into the free space of this cell, continuing a
    /// write that has already placed `pos` of `len` bytes. Returns the
    /// bytes copied.
    fn fill_from<S: UserSource + ?Sized>(
        &mut self,
        src: &S,
        pos: usize,
        len: usize,
    ) -> Result<usize, UserCopyError> {
        let copy_len = self.rem().min(len - pos);
        let start = self.valid_len as usize;
        src.copy_from_user(pos, &mut self.data[start..start + copy_len])?;
        self.valid_len += copy_len as u32;
        Ok(copy_len)
    }
}

/// Copies the readable span of `cell` past `off` out to `dst`, continuing
/// a transfer that has already delivered `pos` of `len` bytes. Returns the
/// bytes copied.
fn copy_out<D: UserSink + ?Sized>(
    cell: &BufCell,
    off: usize,
    dst: &mut D,
    pos: usize,
    len: usize,
) -> Result<usize, UserCopyError> {
    let copy_len = (cell.valid_len as usize - off).min(len - pos);
    dst.copy_to_user(pos, &cell.data[off..off + copy_len])?;
    Ok(copy_len)
}

/// A bounded FIFO of buffer cells backing one IPC endpoint.
///
/// The chain stores stream bytes or datagrams, never both at once; callers
/// pick one discipline per chain and stick to it. There is no internal
/// locking, the owning endpoint serializes access.
pub struct BufChain<A: PageAllocator> {
    /// Active cells, oldest first. The head plus `read_off` is the read
    /// cursor; stream writes append into the tail.
    bufs: VecDeque<NonNull<BufCell>>,
    /// Byte offset of the read cursor within the head cell.
    read_off: u32,
    /// Unread bytes across all cells.
    size: usize,
    /// Where cell pages come from and go back to.
    alloc: A,
}

// SAFETY: cells are exclusively owned page memory reachable only through
// the chain, so sending the chain moves sole access with it.
unsafe impl<A: PageAllocator + Send> Send for BufChain<A> {}

impl<A: PageAllocator> BufChain<A> {
    /// Creates an empty chain drawing pages from `alloc`.
    pub fn new(alloc: A) -> Self {
        Self {
            bufs: VecDeque::new(),
            read_off: 0,
            size: 0,
            alloc,
        }
    }

    /// Appends up to `len` bytes of stream data from `src`.
    ///
    /// Returns the number of bytes written. Bytes copied before a fault
    /// stay committed to the chain, and the error reports how many; the
    /// same count is visible to later reads, so callers that retry may
    /// duplicate data. `ShouldWait` means nothing could be accepted at all.
    pub fn write_stream<S: UserSource + ?Sized>(
        &mut self,
        src: &S,
        len: usize,
    ) -> Result<usize, ChainError> {
        // Cap len by the space we are allowed to use.
        let len = len.min(CHAIN_CAPACITY - self.size);
        let mut pos = 0;

        // Top up the tail cell before allocating anything new.
        if let Some(&tail_ptr) = self.bufs.back() {
            // SAFETY: the chain exclusively owns its cells and `&mut self`
            // makes this the only live reference.
            let tail = unsafe { &mut *tail_ptr.as_ptr() };
            if tail.rem() > 0 {
                match tail.fill_from(src, pos, len) {
                    Ok(copied) => {
                        pos += copied;
                        self.size += copied;
                    }
                    Err(cause) => return Err(ChainError::Fault { copied: pos, cause }),
                }
            }
        }

        if pos != len {
            if let Some(mut fresh) = self.alloc_bufs(BufCell::cells_for_payload(len - pos)) {
                while let Some(cell_ptr) = fresh.pop_front() {
                    // SAFETY: freshly constructed and owned by `fresh`.
                    let cell = unsafe { &mut *cell_ptr.as_ptr() };
                    match cell.fill_from(src, pos, len) {
                        Ok(copied) => {
                            pos += copied;
                            self.size += copied;
                            self.bufs.push_back(cell_ptr);
                        }
                        Err(cause) => {
                            // Cells not yet published go straight back.
                            fresh.push_front(cell_ptr);
                            self.free_bufs(fresh);
                            return Err(ChainError::Fault { copied: pos, cause });
                        }
                    }
                }
            }
        }

        if pos == 0 {
            return Err(ChainError::ShouldWait);
        }
        Ok(pos)
    }

    /// Appends one datagram of exactly `len` bytes from `src`.
    ///
    /// All or nothing: on any failure the chain is exactly as it was.
    /// Zero-length datagrams are rejected.
    pub fn write_datagram<S: UserSource + ?Sized>(
        &mut self,
        src: &S,
        len: usize,
    ) -> Result<usize, ChainError> {
        if len == 0 {
            return Err(ChainError::InvalidArgs);
        }
        if len > CHAIN_CAPACITY {
            return Err(ChainError::OutOfRange);
        }
        if len + self.size > CHAIN_CAPACITY {
            return Err(ChainError::ShouldWait);
        }

        let mut bufs = match self.alloc_bufs(BufCell::cells_for_payload(len)) {
            Some(bufs) => bufs,
            None => return Err(ChainError::ShouldWait),
        };

        let mut pos = 0;
        for i in 0..bufs.len() {
            let cell_ptr = bufs[i];
            // SAFETY: cells in `bufs` are freshly constructed and owned by
            // the list.
            let cell = unsafe { &mut *cell_ptr.as_ptr() };
            let copy_len = CELL_PAYLOAD.min(len - pos);
            if src.copy_from_user(pos, &mut cell.data[..copy_len]).is_err() {
                // Bad user buffer; nothing of the datagram is kept.
                self.free_bufs(bufs);
                return Err(ChainError::InvalidArgs);
            }
            cell.valid_len = copy_len as u32;
            pos += copy_len;
        }

        if let Some(&head_ptr) = bufs.front() {
            // SAFETY: as above.
            unsafe { (*head_ptr.as_ptr()).frame_len = len as u32 };
        }

        // The datagram is complete; splice it onto the chain.
        self.bufs.append(&mut bufs);
        self.size += len;
        Ok(len)
    }

    /// Reads up to `len` bytes into `dst`, consuming them.
    ///
    /// With `datagram` set, at most one datagram is read; if `len` is too
    /// small for it, the unread remainder of that datagram is discarded.
    /// Bytes delivered before a fault stay delivered and the error carries
    /// their count; a faulted datagram is still dropped whole.
    pub fn read<D: UserSink + ?Sized>(
        &mut self,
        dst: &mut D,
        len: usize,
        datagram: bool,
    ) -> Result<usize, ChainError> {
        if self.size == 0 {
            return Ok(0);
        }

        let mut len = len;
        if datagram {
            if let Some(head) = self.front() {
                len = len.min(head.frame_len as usize);
            }
        }

        let mut pos = 0;
        let mut read_off = self.read_off as usize;
        let mut drained: Vec<NonNull<BufCell>> = Vec::new();
        let mut fault = None;

        while pos < len && fault.is_none() {
            let Some(&head_ptr) = self.bufs.front() else {
                break;
            };
            // SAFETY: exclusive ownership via `&mut self`.
            let head = unsafe { &*head_ptr.as_ptr() };

            match copy_out(head, read_off, dst, pos, len) {
                Ok(copied) => {
                    pos += copied;
                    read_off += copied;
                    self.size -= copied;
                }
                Err(cause) => fault = Some(cause),
            }

            // A fully consumed cell comes off the chain; in datagram mode
            // every touched cell does, and its unread tail is given up.
            if read_off == head.valid_len as usize || datagram {
                if datagram {
                    self.size -= head.valid_len as usize - read_off;
                }
                self.bufs.pop_front();
                drained.push(head_ptr);
                read_off = 0;
            }
        }

        // Drop the rest of a partially read datagram, fault or not.
        if datagram {
            while let Some(&head_ptr) = self.bufs.front() {
                // SAFETY: shared view of an owned cell.
                let head = unsafe { head_ptr.as_ref() };
                if head.frame_len != 0 {
                    break;
                }
                self.size -= head.valid_len as usize - read_off;
                self.bufs.pop_front();
                drained.push(head_ptr);
                read_off = 0;
            }
        }

        if !drained.is_empty() {
            self.free_bufs(drained);
        }
        self.read_off = read_off as u32;

        match fault {
            None => Ok(pos),
            Some(cause) => Err(ChainError::Fault { copied: pos, cause }),
        }
    }

    /// Reads up to `len` bytes into `dst` without consuming anything.
    ///
    /// The chain is left untouched on every path, faults included. With
    /// `datagram` set, at most the first datagram is returned.
    pub fn peek<D: UserSink + ?Sized>(
        &self,
        dst: &mut D,
        len: usize,
        datagram: bool,
    ) -> Result<usize, ChainError> {
        if self.size == 0 {
            return Ok(0);
        }

        let mut len = len;
        if datagram {
            if let Some(head) = self.front() {
                len = len.min(head.frame_len as usize);
            }
        }

        let mut pos = 0;
        let mut off = self.read_off as usize;
        for cell_ptr in self.bufs.iter() {
            if pos >= len {
                break;
            }
            // SAFETY: shared view of an owned cell under `&self`.
            let cell = unsafe { cell_ptr.as_ref() };
            match copy_out(cell, off, dst, pos, len) {
                Ok(copied) => pos += copied,
                Err(cause) => return Err(ChainError::Fault { copied: pos, cause }),
            }
            // Cells past the head are entered at their start.
            off = 0;
        }

        Ok(pos)
    }

    /// Unread bytes stored in the chain.
    ///
    /// With `datagram` set, returns the length of the first datagram
    /// instead, which is 0 on a stream chain.
    pub fn size(&self, datagram: bool) -> usize {
        if datagram {
            if let Some(head) = self.front() {
                return head.frame_len as usize;
            }
        }
        self.size
    }

    /// Whether the chain holds no unread bytes.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Whether the chain is at capacity.
    pub fn is_full(&self) -> bool {
        self.size >= CHAIN_CAPACITY
    }

    /// Maximum number of bytes a chain can hold.
    pub const fn max_size() -> usize {
        CHAIN_CAPACITY
    }

    /// Number of bytes a single cell in the chain can carry.
    pub const fn payload_size() -> usize {
        CELL_PAYLOAD
    }

    /// Shared view of the head cell.
    fn front(&self) -> Option<&BufCell> {
        // SAFETY: the chain exclusively owns its cells; a shared view under
        // `&self` cannot race a mutation.
        self.bufs.front().map(|cell| unsafe { cell.as_ref() })
    }

    /// Allocates exactly `count` cells, or nothing.
    fn alloc_bufs(&self, count: usize) -> Option<VecDeque<NonNull<BufCell>>> {
        let pages = self.alloc.alloc_pages(count)?;
        Some(pages.into_iter().map(BufCell::construct).collect())
    }

    /// Tears down `bufs` and returns their pages in one batch.
    fn free_bufs<I: IntoIterator<Item = NonNull<BufCell>>>(&self, bufs: I) {
        let pages: PageList = bufs
            .into_iter()
            // SAFETY: every cell handed here was built by `construct` and
            // its last owner is giving it up.
            .map(|cell| unsafe { BufCell::destruct(cell) })
            .collect();
        self.alloc.free_pages(pages);
    }
}

impl<A: PageAllocator> Drop for BufChain<A> {
    fn drop(&mut self) {
        if !self.bufs.is_empty() {
            log::trace!("dropping chain with {} unread bytes", self.size);
        }
        let bufs = mem::take(&mut self.bufs);
        self.free_bufs(bufs);
    }
}
