//! The row-level transform capability.
//!
//! A [`RowApplier`] turns one row (no line terminator) into a new row, or
//! returns `None` to drop it from the output entirely. Stages, pipelines and
//! the batch [`Flow`](crate::Flow) are all generic over this trait, so a
//! single [`Transform`], a [`TransformList`](crate::TransformList) or a
//! whole pipeline blueprint can be used interchangeably.

use std::fmt;
use std::sync::Arc;

/// Anything that can transform a single row.
///
/// `None` means "drop this row"; `Some(vec![])` is a kept empty row.
pub trait RowApplier: Send + Sync {
    fn apply_row(&self, row: &[u8]) -> Option<Vec<u8>>;
}

impl<A: RowApplier + ?Sized> RowApplier for &A {
    fn apply_row(&self, row: &[u8]) -> Option<Vec<u8>> {
        (**self).apply_row(row)
    }
}

impl<A: RowApplier + ?Sized> RowApplier for Box<A> {
    fn apply_row(&self, row: &[u8]) -> Option<Vec<u8>> {
        (**self).apply_row(row)
    }
}

impl<A: RowApplier + ?Sized> RowApplier for Arc<A> {
    fn apply_row(&self, row: &[u8]) -> Option<Vec<u8>> {
        (**self).apply_row(row)
    }
}

type RowFn = dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync;

/// A single pure row transform.
///
/// Cloning is cheap; clones share the underlying function.
#[derive(Clone)]
pub struct Transform {
    func: Arc<RowFn>,
}

impl Transform {
    /// Wrap a function or closure as a transform.
    ///
    /// ```
    /// use linepipe_rs::{RowApplier, Transform};
    ///
    /// let shout = Transform::new(|row| Some(row.to_ascii_uppercase()));
    /// assert_eq!(shout.apply_row(b"hey"), Some(b"HEY".to_vec()));
    /// ```
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        Self {
            func: Arc::new(func),
        }
    }

    /// A transform that returns every row unchanged.
    pub fn identity() -> Self {
        Self::new(|row| Some(row.to_vec()))
    }
}

impl RowApplier for Transform {
    fn apply_row(&self, row: &[u8]) -> Option<Vec<u8>> {
        (self.func)(row)
    }
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transform").finish_non_exhaustive()
    }
}
