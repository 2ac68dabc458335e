//! Chains of stages wired together through OS pipes.
//!
//! A pipeline of N stages creates N-1 anonymous pipes. Stage `i` writes into
//! pipe `i` and stage `i+1` reads from it, so every stage runs on its own
//! threads and rows flow through the chain the way they would through a
//! shell pipeline. The only backpressure is the pipe buffer: a slow stage
//! blocks the writer upstream of it once its pipe fills.

use std::borrow::Cow;
use std::fmt;
use std::io::{self, Read, Write};
use std::iter;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::applier::RowApplier;
use crate::error::PipelineError;
use crate::stage::{Input, Output, Stage};

/// When the stages of a freshly built pipeline begin running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartMode {
    /// Start every stage as part of `build`.
    #[default]
    Eager,
    /// Leave stages idle until [`Pipeline::start`].
    Deferred,
}

#[derive(Clone)]
struct PlannedStage {
    name: Option<String>,
    applier: Arc<dyn RowApplier>,
}

/// Blueprint for a [`Pipeline`].
///
/// The builder is itself a [`RowApplier`] that runs its stages' appliers in
/// order, so a whole chain can be nested inside another stage or applied to
/// an in-memory buffer with [`Flow`](crate::Flow).
#[derive(Clone, Default)]
pub struct PipelineBuilder {
    stages: Vec<PlannedStage>,
    start_mode: StartMode,
    read_ahead: usize,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage named after its position (`stage-0`, `stage-1`, ...).
    pub fn stage<A: RowApplier + 'static>(mut self, applier: A) -> Self {
        self.stages.push(PlannedStage {
            name: None,
            applier: Arc::new(applier),
        });
        self
    }

    pub fn named_stage<A: RowApplier + 'static>(
        mut self,
        name: impl Into<String>,
        applier: A,
    ) -> Self {
        self.stages.push(PlannedStage {
            name: Some(name.into()),
            applier: Arc::new(applier),
        });
        self
    }

    pub fn start_mode(mut self, start_mode: StartMode) -> Self {
        self.start_mode = start_mode;
        self
    }

    /// Rows each stage may scan ahead of its worker. See
    /// [`StageConfig::read_ahead`](crate::StageConfig::read_ahead).
    pub fn read_ahead(mut self, read_ahead: usize) -> Self {
        self.read_ahead = read_ahead;
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Wire the stages between `input` and `output`.
    ///
    /// All pipes are allocated before any stage is bound; if one fails the
    /// pipes created so far are dropped and nothing is left running.
    pub fn build<W, R>(self, output: W, input: R) -> Result<Pipeline, PipelineError>
    where
        W: Write + Send + 'static,
        R: Read + Send + 'static,
    {
        let Self {
            stages: planned,
            start_mode,
            read_ahead,
        } = self;

        if planned.is_empty() {
            return Err(PipelineError::Empty);
        }

        let mut readers = Vec::with_capacity(planned.len() - 1);
        let mut writers = Vec::with_capacity(planned.len() - 1);
        for index in 0..planned.len() - 1 {
            let (reader, writer) = io::pipe().map_err(|source| {
                warn!(index, error = %source, "pipe allocation failed");
                PipelineError::Pipe {
                    index,
                    source: Arc::new(source),
                }
            })?;
            readers.push(reader);
            writers.push(writer);
        }

        let inputs = iter::once(Box::new(input) as Input)
            .chain(readers.into_iter().map(|r| Box::new(r) as Input));
        let outputs = writers
            .into_iter()
            .map(|w| Box::new(w) as Output)
            .chain(iter::once(Box::new(output) as Output));

        let stages = planned
            .into_iter()
            .zip(inputs.zip(outputs))
            .enumerate()
            .map(|(index, (plan, (input, output)))| {
                let name = plan.name.unwrap_or_else(|| format!("stage-{index}"));
                Stage::bind(name, output, input, plan.applier, read_ahead)
            })
            .collect::<Vec<_>>();

        debug!(stages = stages.len(), ?start_mode, "pipeline wired");

        let pipeline = Pipeline { stages };
        if start_mode == StartMode::Eager {
            pipeline.start();
        }
        Ok(pipeline)
    }
}

impl RowApplier for PipelineBuilder {
    fn apply_row(&self, row: &[u8]) -> Option<Vec<u8>> {
        let mut current = Cow::Borrowed(row);
        for plan in &self.stages {
            current = Cow::Owned(plan.applier.apply_row(&current)?);
        }
        Some(current.into_owned())
    }
}

impl fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self
            .stages
            .iter()
            .map(|plan| plan.name.as_deref().unwrap_or("-"))
            .collect();
        f.debug_struct("PipelineBuilder")
            .field("stages", &names)
            .field("start_mode", &self.start_mode)
            .field("read_ahead", &self.read_ahead)
            .finish()
    }
}

/// A running (or ready-to-run) chain of stages.
#[derive(Debug)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    /// Wire `appliers` between `input` and `output` and start them.
    pub fn new<W, R, I, A>(output: W, input: R, appliers: I) -> Result<Self, PipelineError>
    where
        W: Write + Send + 'static,
        R: Read + Send + 'static,
        I: IntoIterator<Item = A>,
        A: RowApplier + 'static,
    {
        appliers
            .into_iter()
            .fold(Self::builder(), PipelineBuilder::stage)
            .build(output, input)
    }

    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    /// Group stages that were bound by the caller.
    ///
    /// The stages are not rewired; whatever they read and write is up to
    /// how they were constructed. Their lifecycle is left as is.
    pub fn from_stages(stages: Vec<Stage>) -> Result<Self, PipelineError> {
        if stages.is_empty() {
            return Err(PipelineError::Empty);
        }
        Ok(Self { stages })
    }

    /// Start every idle stage. Repeated calls have no further effect.
    pub fn start(&self) {
        for stage in &self.stages {
            stage.start();
        }
    }

    /// Wait for every stage in order, returning the errors they reported.
    ///
    /// An empty list means every stage finished cleanly.
    pub fn wait(&self) -> Vec<PipelineError> {
        self.stages
            .iter()
            .filter_map(|stage| stage.wait().err())
            .collect()
    }

    /// Close every stage front to back, returning the errors they reported.
    ///
    /// Closing stage 0 drops its pipe writer, so the stages behind it see
    /// end-of-input. Rows still in flight when a stage's own close arrives
    /// are discarded; for a lossless shutdown end the source input and call
    /// [`Pipeline::wait`] instead.
    pub fn close(&self) -> Vec<PipelineError> {
        self.stages
            .iter()
            .filter_map(|stage| stage.close().err())
            .collect()
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}
