//! Element reductions for `all_reduce`.

use crate::error::{Error, Result};
use crate::wire::ReduceOp;

/// A value that can be combined with another of its kind.
///
/// The hub folds contributions in rank order, `((r0 ⊕ r1) ⊕ r2) ⊕ ...`, so
/// non-associative reductions (float sums) are still identical on every
/// member.
pub trait Reduce: Sized {
    /// Combine `self` with `other`.
    fn combine(self, other: Self, op: ReduceOp) -> Result<Self>;
}

macro_rules! reduce_int {
    ($($t:ty),*) => {$(
        impl Reduce for $t {
            fn combine(self, other: Self, op: ReduceOp) -> Result<Self> {
                Ok(match op {
                    ReduceOp::Sum => self.wrapping_add(other),
                    ReduceOp::Product => self.wrapping_mul(other),
                    ReduceOp::Min => self.min(other),
                    ReduceOp::Max => self.max(other),
                })
            }
        }
    )*};
}

macro_rules! reduce_float {
    ($($t:ty),*) => {$(
        impl Reduce for $t {
            fn combine(self, other: Self, op: ReduceOp) -> Result<Self> {
                Ok(match op {
                    ReduceOp::Sum => self + other,
                    ReduceOp::Product => self * other,
                    ReduceOp::Min => self.min(other),
                    ReduceOp::Max => self.max(other),
                })
            }
        }
    )*};
}

reduce_int!(i8, i16, i32, i64, u8, u16, u32, u64, usize);
reduce_float!(f32, f64);

impl<T: Reduce> Reduce for Vec<T> {
    fn combine(self, other: Self, op: ReduceOp) -> Result<Self> {
        if self.len() != other.len() {
            return Err(Error::InvalidArgument(format!(
                "cannot reduce buffers of length {} and {}",
                self.len(),
                other.len()
            )));
        }
        self.into_iter()
            .zip(other)
            .map(|(a, b)| a.combine(b, op))
            .collect()
    }
}

/// Fold values in order.
pub(crate) fn fold<T: Reduce>(values: impl IntoIterator<Item = T>, op: ReduceOp) -> Result<T> {
    let mut values = values.into_iter();
    let first = values
        .next()
        .ok_or_else(|| Error::InvalidArgument("nothing to reduce".into()))?;
    values.try_fold(first, |acc, next| acc.combine(next, op))
}
