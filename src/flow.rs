//! Synchronous, newline-aware application of a row applier to a buffer.
//!
//! The batch path has to produce exactly what a running [`Stage`](crate::Stage)
//! would emit for the same rows, so the terminator handling here mirrors the
//! streaming loop: one `\n` after every kept row, nothing for a dropped row.

use crate::applier::RowApplier;

/// Buffers shorter than this with no embedded newline are treated as a
/// single row without scanning.
pub const BATCH_SHORTCUT_LIMIT: usize = 1024;

/// Apply `applier` to every `\n`-separated row of `buf`.
///
/// If `buf` does not end in a newline, a terminator is assumed for the last
/// row and one trailing newline is removed from the output again, so the
/// "no trailing newline" shape of the input is preserved. A dropped final
/// row may already have removed it, in which case nothing is stripped.
pub fn apply_batch<A: RowApplier + ?Sized>(applier: &A, buf: &[u8]) -> Vec<u8> {
    if buf.len() < BATCH_SHORTCUT_LIMIT && !buf.contains(&b'\n') {
        return applier.apply_row(buf).unwrap_or_default();
    }

    let (body, added_newline) = match buf.strip_suffix(b"\n") {
        Some(body) => (body, false),
        None => (buf, true),
    };

    let mut out = Vec::with_capacity(buf.len() + 1);
    for row in body.split(|&b| b == b'\n') {
        if let Some(res) = applier.apply_row(row) {
            out.extend_from_slice(&res);
            out.push(b'\n');
        }
    }

    if added_newline && out.last() == Some(&b'\n') {
        out.pop();
    }

    out
}

/// Batch wrapper around any [`RowApplier`].
#[derive(Debug, Clone)]
pub struct Flow<A> {
    applier: A,
}

impl<A: RowApplier> Flow<A> {
    pub fn new(applier: A) -> Self {
        Self { applier }
    }

    /// Run every row of `buf` through the wrapped applier.
    pub fn apply(&self, buf: &[u8]) -> Vec<u8> {
        apply_batch(&self.applier, buf)
    }

    pub fn applier(&self) -> &A {
        &self.applier
    }

    pub fn into_inner(self) -> A {
        self.applier
    }
}
