//! Growable accumulation buffer.
//!
//! Each connection accumulates the bytes of its current, unterminated line
//! in a `GrowableBuffer`. The buffer is cleared after every completed line
//! but keeps its allocation, so a steady stream of messages settles into a
//! single allocation per connection.
//!
//! ## Growth Policy
//!
//! - First append allocates `MIN_CAPACITY` slots.
//! - When full, the new capacity is `max(MIN_CAPACITY, n + min(n / 2, MAX_GROWTH_STEP))`
//!   where `n` is the element count after the pending append.
//! - Capacity never shrinks.

use std::iter;
use std::mem;

/// Capacity of the first allocation.
pub const MIN_CAPACITY: usize = 1024;

/// Upper bound on the extra slots added by a single reallocation.
pub const MAX_GROWTH_STEP: usize = 16 * 1024;

/// Append-only buffer with amortized growth.
///
/// Slots in `[0, len)` hold appended values in insertion order. Slots in
/// `[len, capacity)` are stale and never exposed.
#[derive(Debug)]
pub struct GrowableBuffer<T> {
    slots: Box<[T]>,
    len: usize,
}

impl<T: Default> GrowableBuffer<T> {
    /// Create an empty buffer. Nothing is allocated until the first append.
    pub fn new() -> Self {
        Self {
            slots: Box::default(),
            len: 0,
        }
    }

    /// Append a value, growing the allocation if it is full.
    pub fn append(&mut self, item: T) {
        self.ensure_capacity(self.len + 1);
        self.slots[self.len] = item;
        self.len += 1;
    }

    /// Reset the length to zero without releasing the allocation.
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// View of the valid prefix.
    pub fn snapshot(&self) -> &[T] {
        &self.slots[..self.len]
    }

    /// Number of valid elements.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if there are no valid elements.
    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of allocated slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn ensure_capacity(&mut self, required: usize) {
        if self.slots.len() >= required {
            return;
        }

        let new_capacity = if self.slots.is_empty() {
            required.max(MIN_CAPACITY)
        } else {
            let extra = (required / 2).min(MAX_GROWTH_STEP);
            MIN_CAPACITY.max(required + extra)
        };

        let mut slots: Box<[T]> = iter::repeat_with(T::default).take(new_capacity).collect();
        for (dst, src) in slots.iter_mut().zip(&mut self.slots[..self.len]) {
            *dst = mem::take(src);
        }
        self.slots = slots;
    }
}

impl<T: Default> Default for GrowableBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_growth_law() {
        let mut buf = GrowableBuffer::new();
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.capacity(), 0);
        assert!(buf.snapshot().is_empty());

        buf.append(0u32);
        assert_eq!(buf.capacity(), 1024);
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.snapshot()[0], 0);

        for i in 1..=1024 {
            buf.append(i);
        }
        assert_eq!(buf.capacity(), 1537);
        assert_eq!(buf.len(), 1025);

        for i in 0..16 * 1024 {
            buf.append(1025 + i);
        }
        assert_eq!(buf.len(), 17409);
        assert!(buf.capacity() > buf.len());

        for (i, value) in buf.snapshot().iter().enumerate() {
            assert_eq!(*value, i as u32);
        }
    }

    #[test]
    fn test_growth_step_is_capped() {
        let mut buf = GrowableBuffer::new();
        for i in 0..100_000u32 {
            buf.append(i);
        }
        // Each reallocation adds at most MAX_GROWTH_STEP spare slots.
        assert!(buf.capacity() - buf.len() <= MAX_GROWTH_STEP);
        assert_eq!(buf.snapshot().last(), Some(&99_999));
    }

    #[test]
    fn test_clear_retains_capacity() {
        let mut buf = GrowableBuffer::new();
        for i in 0..2000u64 {
            buf.append(i);
        }
        let capacity = buf.capacity();
        assert!(capacity > MIN_CAPACITY);

        buf.clear();
        assert_eq!(buf.len(), 0);
        assert!(buf.is_empty());
        assert!(buf.snapshot().is_empty());
        assert_eq!(buf.capacity(), capacity);

        buf.append(7);
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.capacity(), capacity);
        assert_eq!(buf.snapshot(), &[7]);
    }

    #[test]
    fn test_snapshot_hides_stale_slots() {
        let mut buf = GrowableBuffer::new();
        buf.append(b'a');
        buf.append(b'b');
        buf.append(b'c');
        buf.clear();
        buf.append(b'x');
        assert_eq!(buf.snapshot(), b"x");
    }

    #[test]
    fn test_non_copy_elements() {
        let mut buf: GrowableBuffer<String> = GrowableBuffer::new();
        for i in 0..1500 {
            buf.append(i.to_string());
        }
        assert_eq!(buf.len(), 1500);
        assert_eq!(buf.snapshot()[0], "0");
        assert_eq!(buf.snapshot()[1499], "1499");
    }
}
