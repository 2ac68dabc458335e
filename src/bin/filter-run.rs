//! CLI tool to stream text through a chain of line filters.
//!
//! Usage:
//!   filter-run -f trim -f drop-empty -f upper < input.txt
//!   filter-run input.txt -o output.txt -f title --single-stage
//!
//! By default every filter runs as its own concurrent stage, connected to the
//! next by a pipe. Log verbosity follows `RUST_LOG`.

use clap::{Parser, ValueEnum};
use linepipe_rs::{PipelineError, Stage, Transform, TransformList, transforms};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process;
use tracing_subscriber::EnvFilter;

/// Stream input through line filters, one concurrent stage per filter.
#[derive(Parser)]
#[command(name = "filter-run")]
struct Cli {
    /// Input file (default: stdin)
    input: Option<PathBuf>,

    /// Write output to file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Filter to apply; repeat to chain several, in order
    #[arg(short = 'f', long = "filter", value_enum)]
    filters: Vec<FilterName>,

    /// Run all filters inside a single stage instead of one stage each
    #[arg(long)]
    single_stage: bool,

    /// Log stage lifecycle on stderr
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FilterName {
    DropEmpty,
    Trim,
    Lower,
    Upper,
    Title,
    CrazyCaps,
}

impl FilterName {
    fn transform(self) -> Transform {
        match self {
            Self::DropEmpty => Transform::new(transforms::drop_empty),
            Self::Trim => Transform::new(transforms::trim_space),
            Self::Lower => Transform::new(transforms::to_lower),
            Self::Upper => Transform::new(transforms::to_upper),
            Self::Title => Transform::new(transforms::title_case),
            Self::CrazyCaps => Transform::new(transforms::alternating_caps),
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "linepipe_rs=debug"
    } else {
        "linepipe_rs=warn"
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with_writer(io::stderr)
        .with_thread_names(true)
        .try_init();
}

fn open_input(path: Option<&Path>) -> io::Result<Box<dyn Read + Send>> {
    match path {
        Some(path) => Ok(Box::new(File::open(path)?)),
        None => Ok(Box::new(io::stdin())),
    }
}

fn open_output(path: Option<&Path>) -> io::Result<Box<dyn Write + Send>> {
    let Some(path) = path else {
        return Ok(Box::new(io::stdout()));
    };
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    Ok(Box::new(File::create(path)?))
}

fn run(
    cli: &Cli,
    input: Box<dyn Read + Send>,
    output: Box<dyn Write + Send>,
) -> Vec<PipelineError> {
    let list: TransformList = cli.filters.iter().map(|f| f.transform()).collect();

    // An empty chain still copies input to output.
    if cli.single_stage || list.is_empty() {
        let stage = Stage::spawn(output, input, list);
        return stage.wait().err().into_iter().collect();
    }

    match list.into_pipeline(output, input) {
        Ok(pipeline) => pipeline.wait(),
        Err(e) => vec![e],
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let input = match open_input(cli.input.as_deref()) {
        Ok(input) => input,
        Err(e) => {
            eprintln!("Error opening input: {e}");
            process::exit(1);
        }
    };
    let output = match open_output(cli.output.as_deref()) {
        Ok(output) => output,
        Err(e) => {
            eprintln!("Error opening output: {e}");
            process::exit(1);
        }
    };

    if cli.verbose {
        let stages = if cli.single_stage { 1 } else { cli.filters.len().max(1) };
        eprintln!("Filters: {:?}", cli.filters);
        eprintln!("Stages:  {stages}");
    }

    let errs = run(&cli, input, output);
    if !errs.is_empty() {
        for e in &errs {
            eprintln!("Pipeline error: {e}");
        }
        process::exit(1);
    }
}
