//! Append-only text shared between the accumulator and published snapshots.
//!
//! A [`SharedText`] is a `(buffer, len)` view. Clones share the buffer and
//! see only their own prefix. Appending through the view that ends at the
//! buffer's filled mark writes in place; any other view copies first. Taking
//! a snapshot therefore never copies text, and appends stay amortized O(1)
//! while older snapshots are still held.

use std::cell::UnsafeCell;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

const MIN_CAPACITY: usize = 64;

struct Buffer {
    bytes: Box<[UnsafeCell<u8>]>,
    /// Bytes below this mark are initialized and never written again.
    filled: AtomicUsize,
}

// SAFETY: bytes below `filled` are immutable. Bytes at or above it are only
// written by the single view that moved `filled` past them with a successful
// compare-exchange, and no view reads beyond its own `len <= filled`.
unsafe impl Sync for Buffer {}

impl Buffer {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: (0..capacity).map(|_| UnsafeCell::new(0)).collect(),
            filled: AtomicUsize::new(0),
        }
    }

    fn capacity(&self) -> usize {
        self.bytes.len()
    }

    /// Writes `src` at `offset`.
    ///
    /// # Safety
    ///
    /// The caller must have claimed `offset..offset + src.len()` by advancing
    /// `filled` over it, and the range must be in bounds.
    unsafe fn write(&self, offset: usize, src: &[u8]) {
        debug_assert!(offset + src.len() <= self.capacity());
        // SAFETY: in bounds per the caller; the claimed range is not aliased.
        unsafe {
            let dst = UnsafeCell::raw_get(self.bytes.as_ptr().add(offset));
            std::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len());
        }
    }
}

/// Cheaply cloneable, append-only UTF-8 text.
#[derive(Clone)]
pub struct SharedText {
    buf: Arc<Buffer>,
    len: usize,
}

impl SharedText {
    pub fn new() -> Self {
        Self {
            buf: Arc::new(Buffer::with_capacity(0)),
            len: 0,
        }
    }

    pub fn as_str(&self) -> &str {
        // SAFETY: the first `len` bytes were written from `&str` values by
        // `push_str` and are never modified afterwards.
        unsafe {
            let bytes = std::slice::from_raw_parts(
                UnsafeCell::raw_get(self.buf.bytes.as_ptr()).cast_const(),
                self.len,
            );
            std::str::from_utf8_unchecked(bytes)
        }
    }

    pub fn push_str(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        let new_len = self.len + text.len();
        let in_place = new_len <= self.buf.capacity()
            && self
                .buf
                .filled
                .compare_exchange(self.len, new_len, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
        if in_place {
            // SAFETY: the compare-exchange claimed `self.len..new_len`.
            unsafe { self.buf.write(self.len, text.as_bytes()) };
        } else {
            let capacity = new_len.max(self.buf.capacity() * 2).max(MIN_CAPACITY);
            let buf = Buffer::with_capacity(capacity);
            // SAFETY: a fresh buffer is unshared, and both ranges are in bounds.
            unsafe {
                buf.write(0, self.as_str().as_bytes());
                buf.write(self.len, text.as_bytes());
            }
            buf.filled.store(new_len, Ordering::Release);
            self.buf = Arc::new(buf);
        }
        self.len = new_len;
    }

    #[cfg(test)]
    fn shares_buffer_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.buf, &other.buf)
    }
}

impl Default for SharedText {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for SharedText {
    type Target = str;

    fn deref(&self) -> &str {
        self.as_str()
    }
}

impl AsRef<str> for SharedText {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl From<&str> for SharedText {
    fn from(text: &str) -> Self {
        let mut shared = Self::new();
        shared.push_str(text);
        shared
    }
}

impl PartialEq for SharedText {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for SharedText {}

impl PartialEq<str> for SharedText {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl PartialEq<&str> for SharedText {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

impl fmt::Debug for SharedText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl fmt::Display for SharedText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl serde::Serialize for SharedText {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> serde::Deserialize<'de> for SharedText {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Ok(Self::from(text.as_str()))
    }
}
