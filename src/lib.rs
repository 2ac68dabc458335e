//! # linepipe-rs
//!
//! Composable line-oriented byte transforms, run either over an in-memory
//! buffer or as concurrent stages wired together with OS pipes.
//!
//! ## Overview
//!
//! - **Transform**: a pure row function, `&[u8] -> Option<Vec<u8>>`, where
//!   `None` drops the row
//! - **TransformList**: transforms applied in order, stopping at the first drop
//! - **Flow / apply_batch**: newline-aware application to a whole buffer
//! - **Stage**: a background loop reading rows from one stream and writing
//!   results to another
//! - **Pipeline**: several stages chained through pipes, all running at once
//!
//! ## Example
//!
//! ```
//! use linepipe_rs::{Transform, compose_transforms, transforms};
//!
//! let list = compose_transforms([
//!     Transform::new(transforms::trim_space),
//!     Transform::new(transforms::drop_empty),
//!     Transform::new(transforms::to_upper),
//! ]);
//!
//! assert_eq!(list.apply(b" hello \n\n world"), b"HELLO\nWORLD");
//! ```
//!
//! The same list can be streamed, one stage per transform:
//!
//! ```
//! use std::io::Cursor;
//! use linepipe_rs::{Pipeline, Transform, transforms};
//!
//! let pipeline = Pipeline::new(
//!     std::io::sink(),
//!     Cursor::new(b"a\nb\n".to_vec()),
//!     [Transform::new(transforms::to_upper), Transform::identity()],
//! )
//! .unwrap();
//!
//! assert!(pipeline.wait().is_empty());
//! ```

pub mod applier;
pub mod error;
pub mod flow;
pub mod pipeline;
pub mod stage;
pub mod transform_list;
pub mod transforms;

#[cfg(test)]
mod test_support;

pub use applier::{RowApplier, Transform};
pub use error::PipelineError;
pub use flow::{BATCH_SHORTCUT_LIMIT, Flow, apply_batch};
pub use pipeline::{Pipeline, PipelineBuilder, StartMode};
pub use stage::{DEFAULT_STAGE_NAME, Stage, StageConfig, StageState};
pub use transform_list::{TransformList, compose_transforms};
