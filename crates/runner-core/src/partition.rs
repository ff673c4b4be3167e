//! Deterministic splitting of the test inventory across runner instances.
//!
//! Boundary `i` of `count` partitions over `len` items is
//! `round(i * len / count)`, rounding halves away from zero. Each boundary is
//! computed on its own rather than accumulated, so sizes never drift and
//! differ by at most one.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PartitionError {
    #[error("partition count must be at least 1")]
    ZeroCount,
    #[error("partition index {index} out of range for {count} partition(s)")]
    IndexOutOfRange { index: usize, count: usize },
}

pub type Result<T> = std::result::Result<T, PartitionError>;

/// `round(i * len / count)` in integer arithmetic.
fn boundary(i: usize, len: usize, count: usize) -> usize {
    (2 * i * len + count) / (2 * count)
}

/// Split `items` into exactly `count` contiguous slices.
pub fn partition<T>(items: &[T], count: usize) -> Result<Vec<&[T]>> {
    if count == 0 {
        return Err(PartitionError::ZeroCount);
    }

    let len = items.len();
    Ok((0..count)
        .map(|i| &items[boundary(i, len, count)..boundary(i + 1, len, count)])
        .collect())
}

/// The slice of `items` assigned to partition `index` of `count`.
pub fn select<T>(items: &[T], index: usize, count: usize) -> Result<&[T]> {
    if count == 0 {
        return Err(PartitionError::ZeroCount);
    }
    if index >= count {
        return Err(PartitionError::IndexOutOfRange { index, count });
    }

    let len = items.len();
    Ok(&items[boundary(index, len, count)..boundary(index + 1, len, count)])
}
