//! Ordered composition of row transforms.

use std::borrow::Cow;
use std::io::{Read, Write};

use crate::applier::{RowApplier, Transform};
use crate::error::PipelineError;
use crate::flow::apply_batch;
use crate::pipeline::Pipeline;
use crate::stage::Stage;

/// An ordered list of transforms applied one after another.
///
/// Insertion order is application order. The first transform that drops a
/// row ends processing for that row; later transforms never see it. An
/// empty list is the identity.
#[derive(Debug, Clone, Default)]
pub struct TransformList {
    transforms: Vec<Transform>,
}

/// Compose transforms into a [`TransformList`].
pub fn compose_transforms<I>(transforms: I) -> TransformList
where
    I: IntoIterator<Item = Transform>,
{
    transforms.into_iter().collect()
}

impl TransformList {
    pub fn new(transforms: Vec<Transform>) -> Self {
        Self { transforms }
    }

    pub fn push(&mut self, transform: Transform) {
        self.transforms.push(transform);
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Transform> {
        self.transforms.iter()
    }

    /// Apply the list to a buffer of zero or more `\n`-separated rows.
    ///
    /// See [`apply_batch`] for the terminator rules.
    pub fn apply(&self, buf: &[u8]) -> Vec<u8> {
        apply_batch(self, buf)
    }

    /// Bind the whole list to one running stage.
    pub fn into_stage<W, R>(self, output: W, input: R) -> Stage
    where
        W: Write + Send + 'static,
        R: Read + Send + 'static,
    {
        Stage::spawn(output, input, self)
    }

    /// Run each transform as its own concurrent stage, wired through pipes.
    pub fn into_pipeline<W, R>(self, output: W, input: R) -> Result<Pipeline, PipelineError>
    where
        W: Write + Send + 'static,
        R: Read + Send + 'static,
    {
        self.transforms
            .into_iter()
            .fold(Pipeline::builder(), |builder, t| builder.stage(t))
            .build(output, input)
    }
}

impl RowApplier for TransformList {
    fn apply_row(&self, row: &[u8]) -> Option<Vec<u8>> {
        let mut current = Cow::Borrowed(row);
        for t in &self.transforms {
            current = Cow::Owned(t.apply_row(&current)?);
        }
        Some(current.into_owned())
    }
}

impl FromIterator<Transform> for TransformList {
    fn from_iter<I: IntoIterator<Item = Transform>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl From<Vec<Transform>> for TransformList {
    fn from(transforms: Vec<Transform>) -> Self {
        Self::new(transforms)
    }
}

impl IntoIterator for TransformList {
    type Item = Transform;
    type IntoIter = std::vec::IntoIter<Transform>;

    fn into_iter(self) -> Self::IntoIter {
        self.transforms.into_iter()
    }
}
