//! # bufchain
//!
//! Chained page-sized buffers backing the data queues of stream sockets,
//! datagram sockets, and byte channels.
//!
//! ## Design
//!
//! - **Page-granular storage**: every buffer cell lives in exactly one page
//!   drawn from a [`PageAllocator`]; header and payload fill the page.
//! - **Two framing disciplines**: a chain carries either an unframed byte
//!   stream or whole datagrams, over the same storage layout.
//! - **Bounded**: a chain never holds more than [`CHAIN_CAPACITY`] unread
//!   bytes; writers beyond that see [`ChainError::ShouldWait`].
//! - **Untrusted endpoints**: payload moves through the [`UserSource`] and
//!   [`UserSink`] seams, which may fault; datagram writes roll back fully,
//!   stream writes commit the prefix that made it in.
//! - **Externally locked**: chains have no internal synchronization; the
//!   owning dispatcher serializes access per endpoint.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod ipc;
pub mod mem;

pub use ipc::{total_cell_bytes, BufChain, ChainError, CELL_PAYLOAD, CHAIN_CAPACITY};
pub use mem::user::{UserCopyError, UserSink, UserSlice, UserSource};
pub use mem::{HeapPages, PageAllocator, PageList, PageRef, PAGE_SIZE};
