use std::sync::atomic::{AtomicUsize, Ordering};

/// Provides circular read-only access to the elements of an array. This is
/// what round robin boils down to: return the element at the cursor and move
/// the cursor one step forward, wrapping around at the end. The cursor is
/// atomic so the ring can be shared between threads.
#[derive(Debug)]
pub(crate) struct Ring<T> {
    /// All the elements in this ring.
    values: Vec<T>,

    /// Index of the next value that we should return.
    next: AtomicUsize,
}

impl<T> Ring<T> {
    /// Creates a new [`Ring`]. The first value returned by
    /// [`Ring::next_as_ref`] is going to be located at index 0 in `values`.
    /// Subsequent calls will return the value at the next index until the last
    /// one is reached, after that it starts again from the beginning.
    pub fn new(values: Vec<T>) -> Self {
        Self {
            values,
            next: AtomicUsize::new(0),
        }
    }

    /// Computes the index of the next value that has to be returned.
    #[inline]
    fn next_index(&self) -> usize {
        if self.values.len() == 1 {
            0
        } else {
            self.next.fetch_add(1, Ordering::Relaxed) % self.values.len()
        }
    }

    /// Returns a reference to the next value in the ring.
    #[inline]
    pub fn next_as_ref(&self) -> &T {
        &self.values[self.next_index()]
    }

    /// All the values in their original order.
    pub fn values(&self) -> &[T] {
        &self.values
    }
}
