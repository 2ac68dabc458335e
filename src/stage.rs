//! Streaming execution of a row applier between a reader and a writer.
//!
//! A started [`Stage`] runs two background threads:
//! - a reader that scans `\n`-terminated rows from the input, and
//! - a worker that applies the row applier and writes each kept row plus a
//!   single `\n` to the output.
//!
//! The two are joined by a bounded channel, which lets `close` cut the worker
//! loop short even while the reader is parked in a blocking read.
//!
//! The reader owns the input. Once the worker stops taking rows it either
//! drains the input to end-of-file (after a write failure, so an upstream
//! writer is not cut off) or drops it (after `close`). A reader parked in a
//! blocking read only notices `close` when that read returns, so a pipe's
//! read end is released at the producer's next write or at end-of-file.
//!
//! Unterminated trailing rows: when the input reaches end-of-file, a final
//! row without a terminator is emitted like any other row (with a `\n`
//! appended). When the stage is closed before end-of-file, whatever partial
//! row is buffered is discarded.

use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::mem;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, debug_span, trace, warn};

use crate::applier::RowApplier;
use crate::error::PipelineError;

/// Name used for stages constructed without one.
pub const DEFAULT_STAGE_NAME: &str = "stage";

pub(crate) type Input = Box<dyn Read + Send>;
pub(crate) type Output = Box<dyn Write + Send>;

type Scanned = io::Result<Vec<u8>>;
type Outcome = Arc<OnceLock<Result<(), PipelineError>>>;

/// Construction options for a [`Stage`].
#[derive(Debug, Clone, Default)]
pub struct StageConfig {
    /// Name used in logs, thread names and errors.
    pub name: Option<String>,
    /// Rows the reader may scan ahead of the worker. Zero keeps the
    /// hand-off synchronous, so only the pipe buffer absorbs bursts.
    pub read_ahead: usize,
}

impl StageConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_read_ahead(mut self, read_ahead: usize) -> Self {
        self.read_ahead = read_ahead;
        self
    }
}

/// Observable lifecycle of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    /// Bound but not started.
    Idle,
    /// Background loop active (or exited but not yet waited on).
    Running,
    /// Loop exited and its result is frozen.
    Finished,
}

const FORWARD: u8 = 0;
const DRAIN: u8 = 1;
const RELEASE: u8 = 2;

/// What the reader does with rows the worker no longer takes.
#[derive(Clone, Default)]
struct ReaderMode(Arc<AtomicU8>);

impl ReaderMode {
    /// Keep reading and discard everything until end-of-file. Never
    /// overrides a release.
    fn drain(&self) {
        let _ = self
            .0
            .compare_exchange(FORWARD, DRAIN, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// Drop the input at the next opportunity.
    fn release(&self) {
        self.0.store(RELEASE, Ordering::SeqCst);
    }

    fn get(&self) -> u8 {
        self.0.load(Ordering::SeqCst)
    }
}

struct Bound {
    input: Input,
    output: Output,
    applier: Arc<dyn RowApplier>,
    read_ahead: usize,
}

struct Running {
    close_tx: Sender<()>,
    done_rx: Receiver<()>,
    outcome: Outcome,
}

enum Lifecycle {
    Idle(Bound),
    Running(Running),
    Finished(Result<(), PipelineError>),
}

/// One concurrently running line-processing unit.
///
/// The stage owns both its input and its output: the output is dropped when
/// the loop exits, which is what signals end-of-input to a downstream stage
/// reading the other end of a pipe. Dropping a running stage closes it
/// without waiting.
pub struct Stage {
    name: String,
    lifecycle: Mutex<Lifecycle>,
    reader: ReaderMode,
}

impl Stage {
    /// Bind `applier` between `input` and `output` without starting it.
    pub fn new<W, R, A>(output: W, input: R, applier: A) -> Self
    where
        W: Write + Send + 'static,
        R: Read + Send + 'static,
        A: RowApplier + 'static,
    {
        Self::with_config(output, input, applier, StageConfig::default())
    }

    /// Bind and immediately start a stage.
    pub fn spawn<W, R, A>(output: W, input: R, applier: A) -> Self
    where
        W: Write + Send + 'static,
        R: Read + Send + 'static,
        A: RowApplier + 'static,
    {
        let stage = Self::new(output, input, applier);
        stage.start();
        stage
    }

    pub fn with_config<W, R, A>(output: W, input: R, applier: A, config: StageConfig) -> Self
    where
        W: Write + Send + 'static,
        R: Read + Send + 'static,
        A: RowApplier + 'static,
    {
        let name = config
            .name
            .unwrap_or_else(|| DEFAULT_STAGE_NAME.to_string());
        Self::bind(
            name,
            Box::new(output),
            Box::new(input),
            Arc::new(applier),
            config.read_ahead,
        )
    }

    pub(crate) fn bind(
        name: String,
        output: Output,
        input: Input,
        applier: Arc<dyn RowApplier>,
        read_ahead: usize,
    ) -> Self {
        Self {
            name,
            lifecycle: Mutex::new(Lifecycle::Idle(Bound {
                input,
                output,
                applier,
                read_ahead,
            })),
            reader: ReaderMode::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> StageState {
        match &*self.lifecycle.lock() {
            Lifecycle::Idle(_) => StageState::Idle,
            Lifecycle::Running(_) => StageState::Running,
            Lifecycle::Finished(_) => StageState::Finished,
        }
    }

    /// Start the background loop.
    ///
    /// Only the first call on an idle stage has any effect; later calls,
    /// and calls after `close`, do nothing.
    pub fn start(&self) {
        let mut lifecycle = self.lifecycle.lock();
        let bound = match mem::replace(&mut *lifecycle, Lifecycle::Finished(Ok(()))) {
            Lifecycle::Idle(bound) => bound,
            other => {
                *lifecycle = other;
                return;
            }
        };

        *lifecycle = match launch(&self.name, bound, self.reader.clone()) {
            Ok(running) => Lifecycle::Running(running),
            Err(err) => {
                warn!(stage = %self.name, error = %err, "stage failed to start");
                Lifecycle::Finished(Err(err))
            }
        };
    }

    /// Block until the background loop has exited and return its error.
    ///
    /// An idle stage has no loop to wait for and returns `Ok(())` at once.
    pub fn wait(&self) -> Result<(), PipelineError> {
        let (done, outcome) = match &*self.lifecycle.lock() {
            Lifecycle::Idle(_) => return Ok(()),
            Lifecycle::Finished(result) => return result.clone(),
            Lifecycle::Running(running) => {
                (running.done_rx.clone(), Arc::clone(&running.outcome))
            }
        };

        // Nothing is ever sent; the channel disconnects when the worker exits.
        let _ = done.recv();

        let result = outcome.get().cloned().unwrap_or_else(|| {
            Err(PipelineError::Panicked {
                stage: self.name.clone(),
            })
        });

        let mut lifecycle = self.lifecycle.lock();
        if matches!(*lifecycle, Lifecycle::Running(_)) {
            *lifecycle = Lifecycle::Finished(result.clone());
        }
        result
    }

    /// Stop reading input, then wait for the loop like [`Stage::wait`].
    ///
    /// Rows not yet taken by the worker, including a buffered unterminated
    /// row, are discarded and the input is dropped. A stage that already
    /// failed and is draining its input stops draining.
    pub fn close(&self) -> Result<(), PipelineError> {
        self.reader.release();
        {
            let mut lifecycle = self.lifecycle.lock();
            if let Lifecycle::Running(running) = &*lifecycle {
                debug!(stage = %self.name, "close requested");
                let _ = running.close_tx.try_send(());
            } else if matches!(*lifecycle, Lifecycle::Idle(_)) {
                // Releases the input and output without ever running.
                *lifecycle = Lifecycle::Finished(Ok(()));
            }
        }
        self.wait()
    }
}

impl Drop for Stage {
    fn drop(&mut self) {
        self.reader.release();
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

fn spawn_error(stage: &str, source: io::Error) -> PipelineError {
    PipelineError::Spawn {
        stage: stage.to_string(),
        source: Arc::new(source),
    }
}

fn launch(name: &str, bound: Bound, mode: ReaderMode) -> Result<Running, PipelineError> {
    let Bound {
        input,
        output,
        applier,
        read_ahead,
    } = bound;

    let (rows_tx, rows_rx) = crossbeam_channel::bounded::<Scanned>(read_ahead);
    let (close_tx, close_rx) = crossbeam_channel::bounded::<()>(1);
    let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(0);
    let outcome: Outcome = Arc::new(OnceLock::new());

    // The reader goes first: if the worker then fails to spawn, the reader
    // notices the dropped receiver on its first row and exits.
    let reader_mode = mode.clone();
    thread::Builder::new()
        .name(format!("linepipe-read-{name}"))
        .spawn(move || scan_rows(input, rows_tx, reader_mode))
        .map_err(|source| spawn_error(name, source))?;

    let worker = Worker {
        name: name.to_string(),
        applier,
        output,
        rows: rows_rx,
        close: close_rx,
        reader: mode,
    };
    let published = Arc::clone(&outcome);
    thread::Builder::new()
        .name(format!("linepipe-{name}"))
        .spawn(move || {
            let _done = done_tx;
            let result = worker.run();
            let _ = published.set(result);
        })
        .map_err(|source| spawn_error(name, source))?;

    Ok(Running {
        close_tx,
        done_rx,
        outcome,
    })
}

/// Reader half: scan rows off the input until EOF, an error, or a release.
///
/// Returning drops the input.
fn scan_rows(input: Input, rows: Sender<Scanned>, mode: ReaderMode) {
    let mut reader = BufReader::new(input);
    loop {
        if mode.get() == RELEASE {
            debug!("input released");
            return;
        }

        let mut row = Vec::new();
        let scanned = match reader.read_until(b'\n', &mut row) {
            Ok(0) => return,
            Ok(_) => {
                if row.last() == Some(&b'\n') {
                    row.pop();
                }
                Ok(row)
            }
            Err(err) => Err(err),
        };

        match mode.get() {
            RELEASE => return,
            DRAIN => {
                if scanned.is_err() {
                    return;
                }
            }
            _ => {
                let failed = scanned.is_err();
                // A refused row means the worker is gone; the mode it left
                // behind says whether to keep draining.
                if (rows.send(scanned).is_err() && mode.get() != DRAIN) || failed {
                    return;
                }
            }
        }
    }
}

enum Next {
    Row(Vec<u8>),
    Failed(io::Error),
    EndOfInput,
    Closed,
}

struct Worker {
    name: String,
    applier: Arc<dyn RowApplier>,
    output: Output,
    rows: Receiver<Scanned>,
    close: Receiver<()>,
    reader: ReaderMode,
}

impl Worker {
    fn run(mut self) -> Result<(), PipelineError> {
        let span = debug_span!("stage", stage = %self.name);
        let _enter = span.enter();
        debug!("stage started");

        let mut rows_in: u64 = 0;
        let mut rows_out: u64 = 0;

        loop {
            let row = match self.next() {
                Next::Row(row) => row,
                Next::Failed(source) => {
                    warn!(error = %source, rows_in, "read failed");
                    return Err(PipelineError::read(&self.name, source));
                }
                Next::EndOfInput => break,
                Next::Closed => {
                    debug!(rows_in, "input closed");
                    break;
                }
            };
            rows_in += 1;

            let Some(res) = self.applier.apply_row(&row) else {
                trace!(rows_in, "row dropped");
                continue;
            };

            if let Err(source) = write_row(&mut self.output, &res) {
                warn!(error = %source, rows_in, "write failed, draining input");
                self.reader.drain();
                return Err(PipelineError::write(&self.name, source));
            }
            rows_out += 1;
        }

        if let Err(source) = self.output.flush() {
            warn!(error = %source, "flush failed");
            return Err(PipelineError::write(&self.name, source));
        }

        debug!(rows_in, rows_out, "stage finished");
        Ok(())
    }

    /// Close takes priority over rows that are already waiting.
    fn next(&self) -> Next {
        crossbeam_channel::select_biased! {
            recv(self.close) -> _ => Next::Closed,
            recv(self.rows) -> msg => match msg {
                Ok(Ok(row)) => Next::Row(row),
                Ok(Err(err)) => Next::Failed(err),
                Err(_) => Next::EndOfInput,
            },
        }
    }
}

fn write_row(output: &mut dyn Write, row: &[u8]) -> io::Result<()> {
    output.write_all(row)?;
    output.write_all(b"\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applier::Transform;
    use crate::flow::apply_batch;
    use crate::test_support::{FailingReader, FailingWriter, SharedBuffer, wait_until};
    use crate::transform_list::compose_transforms;
    use crate::transforms::{drop_empty, to_upper, trim_space};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn passthrough() -> Transform {
        Transform::identity()
    }

    fn run_to_eof<A: RowApplier + 'static>(applier: A, input: &[u8]) -> Vec<u8> {
        let sink = SharedBuffer::new();
        let stage = Stage::spawn(sink.clone(), Cursor::new(input.to_vec()), applier);
        assert!(stage.wait().is_ok());
        sink.contents()
    }

    #[test]
    fn test_close_before_data() {
        let (reader, _writer) = io::pipe().expect("pipe");
        let sink = SharedBuffer::new();
        let stage = Stage::spawn(sink.clone(), reader, passthrough());

        assert!(stage.close().is_ok());
        assert!(sink.contents().is_empty());
        assert_eq!(stage.state(), StageState::Finished);
    }

    #[test]
    fn test_drop_empty_over_pipe() {
        let (reader, mut writer) = io::pipe().expect("pipe");
        let sink = SharedBuffer::new();
        let applier = compose_transforms([passthrough(), Transform::new(drop_empty)]);
        let stage = Stage::spawn(sink.clone(), reader, applier);

        writer.write_all(b"hello\n\nworld\n").expect("write");
        drop(writer);

        assert!(stage.wait().is_ok());
        assert_eq!(sink.contents(), b"hello\nworld\n");
    }

    #[test]
    fn test_unterminated_row_discarded_on_close() {
        let (reader, mut writer) = io::pipe().expect("pipe");
        let sink = SharedBuffer::new();
        let stage = Stage::spawn(sink.clone(), reader, passthrough());

        writer.write_all(b"first\nhello world").expect("write");
        assert!(wait_until(|| sink.contents() == b"first\n"));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(sink.contents(), b"first\n");

        // The writer is still open, so the partial row can only be lost or
        // emitted by the close itself.
        assert!(stage.close().is_ok());
        drop(writer);
        assert_eq!(sink.contents(), b"first\n");
    }

    #[test]
    fn test_close_releases_input() {
        let (reader, mut writer) = io::pipe().expect("pipe");
        let sink = SharedBuffer::new();
        let stage = Stage::spawn(sink.clone(), reader, passthrough());

        assert!(stage.close().is_ok());

        // A reader parked in a read lets go of the pipe once that read
        // returns, after which the producer sees a broken pipe.
        assert!(wait_until(|| writer.write_all(b"partial-no-newline").is_err()));
        assert!(sink.contents().is_empty());
    }

    #[test]
    fn test_write_error_drains_input() {
        let (reader, mut writer) = io::pipe().expect("pipe");
        let stage = Stage::spawn(FailingWriter, reader, passthrough());

        writer.write_all(b"first\n").expect("write");
        assert!(matches!(stage.wait(), Err(PipelineError::Write { .. })));

        // Far more than a pipe buffer holds: only succeeds if the failed
        // stage keeps reading.
        let row = [b'x'; 1023];
        for _ in 0..512 {
            writer.write_all(&row).expect("drained write");
            writer.write_all(b"\n").expect("drained write");
        }
        drop(writer);
        assert!(stage.close().is_err());
    }

    #[test]
    fn test_terminated_rows_emitted_before_close() {
        let (reader, mut writer) = io::pipe().expect("pipe");
        let sink = SharedBuffer::new();
        let stage = Stage::spawn(sink.clone(), reader, passthrough());

        writer
            .write_all(b"hello world\nhow are you?")
            .expect("write");
        assert!(wait_until(|| sink.contents() == b"hello world\n"));

        assert!(stage.close().is_ok());
        assert_eq!(sink.contents(), b"hello world\n");
    }

    #[test]
    fn test_unterminated_row_flushed_at_eof() {
        assert_eq!(
            run_to_eof(passthrough(), b"hello world\nhow are you?"),
            b"hello world\nhow are you?\n"
        );
        assert_eq!(run_to_eof(passthrough(), b"hello world"), b"hello world\n");
    }

    #[test]
    fn test_idempotent_start() {
        let sink = SharedBuffer::new();
        let stage = Stage::new(
            sink.clone(),
            Cursor::new(b"a\nb\n".to_vec()),
            passthrough(),
        );
        assert_eq!(stage.state(), StageState::Idle);

        stage.start();
        stage.start();
        assert!(stage.wait().is_ok());
        stage.start();

        assert_eq!(sink.contents(), b"a\nb\n");
        assert_eq!(stage.state(), StageState::Finished);
    }

    #[test]
    fn test_idle_stage_wait_and_close() {
        let sink = SharedBuffer::new();
        let stage = Stage::new(sink.clone(), Cursor::new(b"x\n".to_vec()), passthrough());

        assert!(stage.wait().is_ok());
        assert_eq!(stage.state(), StageState::Idle);

        assert!(stage.close().is_ok());
        assert_eq!(stage.state(), StageState::Finished);

        stage.start();
        assert!(stage.wait().is_ok());
        assert!(sink.contents().is_empty());
    }

    #[test]
    fn test_write_error_stops_loop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let applier = Transform::new(move |row| {
            counter.fetch_add(1, Ordering::SeqCst);
            Some(row.to_vec())
        });

        let stage = Stage::with_config(
            FailingWriter,
            Cursor::new(b"one\ntwo\nthree\n".to_vec()),
            applier,
            StageConfig::named("sink"),
        );
        stage.start();

        let err = stage.wait().expect_err("write must fail");
        assert!(matches!(err, PipelineError::Write { .. }), "{err}");
        assert_eq!(err.stage(), Some("sink"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // The frozen result is handed out again.
        assert!(matches!(stage.wait(), Err(PipelineError::Write { .. })));
        assert!(matches!(stage.close(), Err(PipelineError::Write { .. })));
    }

    #[test]
    fn test_read_error_captured() {
        let sink = SharedBuffer::new();
        let stage = Stage::spawn(sink.clone(), FailingReader, passthrough());
        let err = stage.wait().expect_err("read must fail");
        assert!(matches!(err, PipelineError::Read { .. }), "{err}");
        assert_eq!(err.stage(), Some(DEFAULT_STAGE_NAME));
    }

    #[test]
    fn test_panicking_applier_reported() {
        let applier = Transform::new(|_| panic!("boom"));
        let stage = Stage::spawn(SharedBuffer::new(), Cursor::new(b"x\n".to_vec()), applier);
        assert!(matches!(stage.wait(), Err(PipelineError::Panicked { .. })));
    }

    #[test]
    fn test_stream_matches_batch() {
        let list = compose_transforms([
            Transform::new(trim_space),
            Transform::new(drop_empty),
            Transform::new(to_upper),
        ]);
        for input in [
            &b""[..],
            b"\n",
            b"one\n",
            b"  a  \n\n b\n   \nc\n",
            b"x\ny\nz\n\n\n",
        ] {
            let streamed = run_to_eof(list.clone(), input);
            assert_eq!(streamed, apply_batch(&list, input), "input {input:?}");
        }
    }

    #[test]
    fn test_read_ahead_preserves_order() {
        let sink = SharedBuffer::new();
        let input: Vec<u8> = (0..500).flat_map(|n| format!("{n}\n").into_bytes()).collect();
        let stage = Stage::with_config(
            sink.clone(),
            Cursor::new(input.clone()),
            passthrough(),
            StageConfig::named("buffered").with_read_ahead(32),
        );
        stage.start();
        assert!(stage.wait().is_ok());
        assert_eq!(sink.contents(), input);
    }

    #[test]
    fn test_dropped_stage_releases_worker() {
        let (reader, _writer) = io::pipe().expect("pipe");
        let sink = SharedBuffer::new();
        let stage = Stage::spawn(sink.clone(), reader, passthrough());
        drop(stage);
        // The worker owned the sink; once it exits only our handle is left.
        assert!(wait_until(|| sink.handles() == 1));
    }
}
