//! Module providing a splittable byte container abstraction.
use bytes::Bytes;
use std::ops::Deref;

/// Trait respresenting a contiguous container that can be split at a given position.
pub trait SplitAt<T>: Deref<Target = [T]> + Sized {
    /// Splits this container at the given position. The left half contains elements in the
    /// `[0, at)` index range while the right half contains elements in the `[at, self.len())`
    /// index range.
    ///
    /// Returns [`None`] if `at` lies beyond the end of this container.
    fn split_at(self, at: usize) -> Option<(Self, Self)>;
}

impl<T> SplitAt<T> for Vec<T> {
    fn split_at(mut self, at: usize) -> Option<(Self, Self)> {
        if at > self.len() {
            None
        } else {
            let other = self.split_off(at);
            Some((self, other))
        }
    }
}

impl SplitAt<u8> for Bytes {
    fn split_at(mut self, at: usize) -> Option<(Self, Self)> {
        (at <= self.len()).then(|| {
            let left = self.split_to(at);
            (left, self)
        })
    }
}
