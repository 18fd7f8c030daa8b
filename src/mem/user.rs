//! User memory copy primitives
//!
//! Chains move payload bytes between cells and untrusted user memory
//! through the [`UserSource`] and [`UserSink`] traits. Every call is
//! all-or-nothing: either the full span is copied or an error comes back
//! and nothing else changed. Dispatchers hand chains a [`UserSlice`]
//! wrapping the raw user pointer; kernel-internal producers and tests can
//! use plain byte slices, which implement both traits.

use core::ptr;

/// Maximum address for userspace (canonical low half on x86_64).
const USER_SPACE_MAX: u64 = 0x0000_7FFF_FFFF_FFFF;

/// Minimum address for userspace (avoid the null pointer region).
const USER_SPACE_MIN: u64 = 0x1000;

/// Maximum allowed size for a single user window (16 MB).
const MAX_COPY_SIZE: usize = 16 * 1024 * 1024;

/// Errors that can occur while accessing user memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserCopyError {
    /// Pointer is null.
    NullPointer,
    /// Address range is outside the accessible region.
    InvalidAddress,
    /// Memory region is not mapped.
    NotMapped,
    /// Memory region lacks required permissions.
    PermissionDenied,
    /// Requested size is too large.
    SizeTooLarge,
    /// Address overflow during range calculation.
    AddressOverflow,
}

/// A readable span of user memory, addressed by byte offset.
pub trait UserSource {
    /// Copies `dst.len()` bytes starting at `offset` into `dst`.
    ///
    /// On failure the contents of `dst` are unspecified but no other state
    /// has been touched.
    fn copy_from_user(&self, offset: usize, dst: &mut [u8]) -> Result<(), UserCopyError>;
}

/// A writable span of user memory, addressed by byte offset.
pub trait UserSink {
    /// Copies `src` into the span starting at `offset`.
    fn copy_to_user(&mut self, offset: usize, src: &[u8]) -> Result<(), UserCopyError>;
}

/// Validate that an address range lies within userspace bounds.
#[inline]
fn validate_user_range(addr: u64, len: usize) -> Result<(), UserCopyError> {
    if addr == 0 {
        return Err(UserCopyError::NullPointer);
    }

    if len > MAX_COPY_SIZE {
        return Err(UserCopyError::SizeTooLarge);
    }

    // Zero-length windows are always valid (nothing to access).
    if len == 0 {
        return Ok(());
    }

    if addr < USER_SPACE_MIN || addr > USER_SPACE_MAX {
        return Err(UserCopyError::InvalidAddress);
    }

    let end = addr
        .checked_add(len as u64)
        .ok_or(UserCopyError::AddressOverflow)?;
    if end > USER_SPACE_MAX + 1 {
        return Err(UserCopyError::InvalidAddress);
    }

    Ok(())
}

/// A window onto raw user memory.
///
/// Construction checks the window against userspace address bounds; each
/// copy re-checks its span against the window. The mapping itself cannot be
/// verified here, so creating a slice is unsafe and the guarantee is a
/// caller contract.
#[derive(Debug, Clone, Copy)]
pub struct UserSlice {
    addr: u64,
    len: usize,
}

impl UserSlice {
    /// Creates a window over `[addr, addr + len)` in user memory.
    ///
    /// # Safety
    ///
    /// The range must be mapped in the current address space, with write
    /// permission if the slice will be used as a [`UserSink`], for as long
    /// as the window is used.
    pub unsafe fn new(addr: u64, len: usize) -> Result<Self, UserCopyError> {
        validate_user_range(addr, len)?;
        Ok(Self { addr, len })
    }

    /// Length of the window in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the window is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bounds-check a span within the window and return its base pointer.
    fn span(&self, offset: usize, len: usize) -> Result<*mut u8, UserCopyError> {
        let end = offset
            .checked_add(len)
            .ok_or(UserCopyError::AddressOverflow)?;
        if end > self.len {
            return Err(UserCopyError::InvalidAddress);
        }
        Ok((self.addr as *mut u8).wrapping_add(offset))
    }
}

impl UserSource for UserSlice {
    fn copy_from_user(&self, offset: usize, dst: &mut [u8]) -> Result<(), UserCopyError> {
        let src = self.span(offset, dst.len())?;
        // SAFETY: the span is inside the window and the window's creator
        // guaranteed the mapping; `dst` is a live kernel buffer and the two
        // cannot overlap.
        unsafe { ptr::copy_nonoverlapping(src as *const u8, dst.as_mut_ptr(), dst.len()) };
        Ok(())
    }
}

impl UserSink for UserSlice {
    fn copy_to_user(&mut self, offset: usize, src: &[u8]) -> Result<(), UserCopyError> {
        let dst = self.span(offset, src.len())?;
        // SAFETY: as above, with the creator guaranteeing write permission.
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len()) };
        Ok(())
    }
}

impl UserSource for [u8] {
    fn copy_from_user(&self, offset: usize, dst: &mut [u8]) -> Result<(), UserCopyError> {
        let end = offset
            .checked_add(dst.len())
            .ok_or(UserCopyError::AddressOverflow)?;
        let src = self.get(offset..end).ok_or(UserCopyError::InvalidAddress)?;
        dst.copy_from_slice(src);
        Ok(())
    }
}

impl UserSink for [u8] {
    fn copy_to_user(&mut self, offset: usize, src: &[u8]) -> Result<(), UserCopyError> {
        let end = offset
            .checked_add(src.len())
            .ok_or(UserCopyError::AddressOverflow)?;
        let dst = self
            .get_mut(offset..end)
            .ok_or(UserCopyError::InvalidAddress)?;
        dst.copy_from_slice(src);
        Ok(())
    }
}
