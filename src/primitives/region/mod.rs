#![allow(unsafe_code)]

//! Borrowed views over application memory.
//!
//! A memory-backed database file never owns its bytes. The application lends
//! a buffer, and open requests name it by address. [`RegionSource`] turns
//! such an address back into a [`MemoryRegion`], refusing addresses it cannot
//! vouch for.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};

use parking_lot::Mutex;
use tracing::debug;

use crate::types::{Result, VfsError};

/// A fixed-capacity, bounds-checked view over lent bytes.
///
/// All copies go through raw pointers, so several views of the same buffer
/// never materialize overlapping references.
#[derive(Debug)]
pub struct MemoryRegion<'a> {
    ptr: NonNull<u8>,
    capacity: usize,
    _borrow: PhantomData<&'a mut [u8]>,
}

impl<'a> MemoryRegion<'a> {
    /// Views the whole of `buf`.
    pub fn new(buf: &'a mut [u8]) -> Self {
        let capacity = buf.len();
        Self {
            ptr: NonNull::from(buf).cast(),
            capacity,
            _borrow: PhantomData,
        }
    }

    /// Views `capacity` bytes at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `capacity` bytes for all of
    /// `'a`, and nothing else may hold a reference into that range while the
    /// view is used.
    pub unsafe fn from_raw(ptr: NonNull<u8>, capacity: usize) -> Self {
        Self {
            ptr,
            capacity,
            _borrow: PhantomData,
        }
    }

    /// Numeric start address of the view.
    pub fn address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Number of addressable bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn span(&self, offset: u64, len: usize) -> Option<usize> {
        let start = usize::try_from(offset).ok()?;
        let end = start.checked_add(len)?;
        (end <= self.capacity).then_some(start)
    }

    /// Copies `dst.len()` bytes starting at `offset` into `dst`.
    pub fn read(&self, offset: u64, dst: &mut [u8]) -> Result<()> {
        let start = self.span(offset, dst.len()).ok_or(VfsError::OutOfBounds {
            offset,
            len: dst.len(),
            capacity: self.capacity as u64,
        })?;
        // SAFETY: `span` proved `start + dst.len() <= capacity`.
        unsafe {
            ptr::copy_nonoverlapping(self.ptr.as_ptr().add(start), dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    /// Copies `src` into the view starting at `offset`.
    pub fn write(&mut self, offset: u64, src: &[u8]) -> Result<()> {
        let start = self.span(offset, src.len()).ok_or_else(|| VfsError::Full {
            end: offset.saturating_add(src.len() as u64),
            capacity: self.capacity as u64,
        })?;
        // SAFETY: `span` proved `start + src.len() <= capacity`.
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.as_ptr().add(start), src.len());
        }
        Ok(())
    }

    /// Zeroes `len` bytes starting at `offset`.
    pub fn zero(&mut self, offset: u64, len: usize) -> Result<()> {
        let start = self.span(offset, len).ok_or_else(|| VfsError::Full {
            end: offset.saturating_add(len as u64),
            capacity: self.capacity as u64,
        })?;
        // SAFETY: `span` proved `start + len <= capacity`.
        unsafe {
            ptr::write_bytes(self.ptr.as_ptr().add(start), 0, len);
        }
        Ok(())
    }

    /// Pointer to `len` bytes at `offset`, or `None` past the capacity.
    pub fn page(&self, offset: u64, len: usize) -> Option<NonNull<u8>> {
        let start = self.span(offset, len)?;
        // SAFETY: `start <= capacity`, so the result stays inside the view.
        NonNull::new(unsafe { self.ptr.as_ptr().add(start) })
    }
}

/// Resolves an address named by an open request into a view.
pub trait RegionSource<'a>: Send + Sync {
    /// Returns a view of `capacity` bytes at `address`, or `None` when the
    /// address is not known to cover that many bytes.
    fn resolve(&self, address: usize, capacity: usize) -> Option<MemoryRegion<'a>>;
}

struct Lent(NonNull<u8>, usize);

// SAFETY: the pointer came from a `&'a mut [u8]` surrendered to the table;
// the table never dereferences it except under its own lock.
unsafe impl Send for Lent {}

/// Buffers lent by the application, addressable by their start address.
///
/// Lending surrenders the mutable borrow for `'a`; the bytes are only reached
/// through views handed out by [`RegionSource::resolve`] and through
/// [`LentRegions::copy_out`].
#[derive(Default)]
pub struct LentRegions<'a> {
    lent: Mutex<BTreeMap<usize, Lent>>,
    _borrow: PhantomData<&'a mut [u8]>,
}

impl<'a> LentRegions<'a> {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lends `buf` and returns the address open requests should name.
    pub fn lend(&self, buf: &'a mut [u8]) -> usize {
        let len = buf.len();
        let ptr = NonNull::from(buf).cast::<u8>();
        let address = ptr.as_ptr() as usize;
        debug!(address = format_args!("{address:#x}"), len, "region.lend");
        self.lent.lock().insert(address, Lent(ptr, len));
        address
    }

    /// Stops resolving `address`. Views already handed out stay valid for
    /// `'a`. Returns whether the address was lent.
    pub fn withdraw(&self, address: usize) -> bool {
        let removed = self.lent.lock().remove(&address).is_some();
        debug!(address = format_args!("{address:#x}"), removed, "region.withdraw");
        removed
    }

    /// Length of the buffer lent at `address`.
    pub fn lent_len(&self, address: usize) -> Option<usize> {
        self.lent.lock().get(&address).map(|lent| lent.1)
    }

    /// Copies the first `len` bytes of the buffer lent at `address`.
    pub fn copy_out(&self, address: usize, len: usize) -> Option<Vec<u8>> {
        let guard = self.lent.lock();
        let lent = guard.get(&address)?;
        if len > lent.1 {
            return None;
        }
        let mut out = vec![0u8; len];
        // SAFETY: the lent buffer is valid for `lent.1 >= len` bytes for `'a`.
        unsafe {
            ptr::copy_nonoverlapping(lent.0.as_ptr(), out.as_mut_ptr(), len);
        }
        Some(out)
    }
}

impl<'a> RegionSource<'a> for LentRegions<'a> {
    fn resolve(&self, address: usize, capacity: usize) -> Option<MemoryRegion<'a>> {
        let guard = self.lent.lock();
        let (start, lent) = guard.range(..=address).next_back()?;
        let skip = address - start;
        let fits = skip
            .checked_add(capacity)
            .is_some_and(|end| end <= lent.1);
        if !fits {
            return None;
        }
        // SAFETY: `[address, address + capacity)` lies inside a buffer lent
        // for `'a`.
        let ptr = unsafe { NonNull::new_unchecked(lent.0.as_ptr().add(skip)) };
        Some(unsafe { MemoryRegion::from_raw(ptr, capacity) })
    }
}

/// Accepts any non-null address as naming `capacity` valid bytes.
///
/// This is what a C caller passing `ptr=` into a URI expects; it cannot be
/// checked.
#[derive(Debug)]
pub struct RawAddresses {
    _private: (),
}

impl RawAddresses {
    /// Creates the source.
    ///
    /// # Safety
    ///
    /// Every address that reaches an open request must point to a live,
    /// writable allocation of at least the requested capacity that outlives
    /// the file handle, and no Rust reference may alias it meanwhile.
    pub unsafe fn new() -> Self {
        Self { _private: () }
    }
}

impl RegionSource<'static> for RawAddresses {
    fn resolve(&self, address: usize, capacity: usize) -> Option<MemoryRegion<'static>> {
        let ptr = NonNull::new(address as *mut u8)?;
        // SAFETY: upheld by the caller of `RawAddresses::new`.
        Some(unsafe { MemoryRegion::from_raw(ptr, capacity) })
    }
}
