//! Extract and build runs.
//!
//! ```text
//! extract:  file ─► container ─► decompress ─► json ─► structure ─► organize ─► source dir
//! build:    source dir ─► collect ─► structure ─► json ─► compress ─► container ─► file
//! ```
//!
//! Every stage reads the previous generation from the run's scratch
//! directory and writes a new one next to it; nothing is modified in place.
//! The output location is touched only by the last stage, so a run that
//! fails earlier leaves it as it was.
//!
//! ```no_run
//! use std::path::Path;
//! use v8unpack::pipeline::{self, ExtractOptions};
//!
//! let report = pipeline::extract(Path::new("Report.epf"), Path::new("src"), &ExtractOptions::default());
//! println!("{}", report.status_line());
//! ```

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tracing::{error, info};

use crate::codec;
use crate::container::{self, ExtractMode};
use crate::error::{self, Error, Result, ResultExt};
use crate::fsutil;
use crate::index::{load_index, IndexMapping};
use crate::metadata;
use crate::organizer::{self, descent, Descent};
use crate::pool::WorkerPool;
use crate::structure;
use crate::version::{VersionProfile, DEFAULT_VERSION};

/// Highest accepted value of the GUI compatibility override.
pub const MAX_GUI: u8 = 3;

// ── Options ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Scratch directory. Cleared before use; a fresh temporary directory
    /// is used when absent.
    pub temp_dir: Option<PathBuf>,
    pub index:    Option<PathBuf>,
    pub version:  String,
    pub descent:  Option<String>,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            temp_dir: None,
            index:    None,
            version:  DEFAULT_VERSION.to_string(),
            descent:  None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub temp_dir: Option<PathBuf>,
    pub index:    Option<PathBuf>,
    pub version:  String,
    pub descent:  Option<String>,
    /// Forced compatibility code for root-level property tables (0..=3).
    pub gui:      Option<u8>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            temp_dir: None,
            index:    None,
            version:  DEFAULT_VERSION.to_string(),
            descent:  None,
            gui:      None,
        }
    }
}

// ── RunReport ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RunReport {
    pub operation: &'static str,
    pub target:    PathBuf,
    pub success:   bool,
    pub elapsed:   Duration,
    /// Full causal chain of the failure.
    pub error:     Option<String>,
}

impl RunReport {
    pub fn status_line(&self) -> String {
        let secs = self.elapsed.as_secs_f64();
        match &self.error {
            None => format!("{} {}: ok in {secs:.2}s", self.operation, self.target.display()),
            Some(err) => format!("{} {}: FAILED after {secs:.2}s: {err}", self.operation, self.target.display()),
        }
    }
}

pub(crate) fn report(operation: &'static str, target: &Path, started: Instant, result: Result<()>) -> RunReport {
    let elapsed = started.elapsed();
    let error = match result {
        Ok(()) => {
            info!(operation, target = %target.display(), elapsed_ms = elapsed.as_millis() as u64, "run complete");
            None
        }
        Err(err) => {
            let chain = error::chain(&err);
            error!(operation, target = %target.display(), error = %chain, "run failed");
            Some(chain)
        }
    };
    RunReport { operation, target: target.to_path_buf(), success: error.is_none(), elapsed, error }
}

// ── Scratch space ────────────────────────────────────────────────────────────

enum Scratch {
    Owned(TempDir),
    Supplied(PathBuf),
}

impl Scratch {
    fn new(supplied: Option<&Path>) -> Result<Self> {
        match supplied {
            Some(dir) => {
                fsutil::clear_dir(dir)?;
                Ok(Scratch::Supplied(dir.to_path_buf()))
            }
            None => tempfile::Builder::new()
                .prefix("v8unpack-")
                .tempdir()
                .map(Scratch::Owned)
                .map_err(|e| Error::io(std::env::temp_dir(), e)),
        }
    }

    /// `decode_stage_0`..`decode_stage_3` or the `encode_` equivalents.
    fn stages(&self, direction: &str) -> [PathBuf; 4] {
        let root = match self {
            Scratch::Owned(dir) => dir.path(),
            Scratch::Supplied(dir) => dir.as_path(),
        };
        [0, 1, 2, 3].map(|n| root.join(format!("{direction}_stage_{n}")))
    }
}

fn timed<F>(stage: &'static str, f: F) -> Result<()>
where
    F: FnOnce() -> Result<()>,
{
    let started = Instant::now();
    f().with_context(|| format!("{stage} stage"))?;
    info!(stage, elapsed_ms = started.elapsed().as_millis() as u64, "stage done");
    Ok(())
}

/// No index means the identity mapping; an index that merges to nothing
/// cancels the run.
fn load_optional_index(path: Option<&Path>) -> Result<IndexMapping> {
    match path {
        None => Ok(IndexMapping::default()),
        Some(path) => {
            let index = load_index(path)?;
            if index.is_empty() {
                return Err(Error::EmptyIndex(path.to_path_buf()));
            }
            info!(index = %path.display(), entries = index.len(), "index loaded");
            Ok(index)
        }
    }
}

fn parse_descent(descent: Option<&str>) -> Result<Option<Descent>> {
    descent.map(Descent::parse).transpose()
}

// ── Extract ──────────────────────────────────────────────────────────────────

pub fn extract(in_file: &Path, out_dir: &Path, options: &ExtractOptions) -> RunReport {
    let started = Instant::now();
    let result = run_extract(in_file, out_dir, options);
    report("extract", in_file, started, result)
}

fn run_extract(in_file: &Path, out_dir: &Path, options: &ExtractOptions) -> Result<()> {
    let profile = VersionProfile::resolve(&options.version)?;
    let descent = parse_descent(options.descent.as_deref())?;
    let index = load_optional_index(options.index.as_deref())?;
    let scratch = Scratch::new(options.temp_dir.as_deref())?;
    let pool = WorkerPool::for_unpack()?;
    info!(file = %in_file.display(), version = %profile, workers = pool.workers(), "extracting");

    let data = fsutil::read(in_file)?;
    let [s0, s1, s2, s3] = scratch.stages("decode");
    timed("container", || {
        container::extract_to_dir(&data, &s0, ExtractMode { compressed: true, recursive: false }).map(|_| ())
    })?;
    timed("decompress", || codec::decompress_and_extract(&s0, &s1, &pool))?;
    timed("json", || metadata::json_decode(&s1, &s2, &profile, &pool))?;
    timed("structure", || structure::decode(&s2, &s3, &profile, &pool))?;
    timed("organize", || match &descent {
        Some(layers) => descent::unpack(&s3, out_dir, layers, &index, &pool),
        None => organizer::unpack(&s3, out_dir, &index, &pool),
    })
}

// ── Build ────────────────────────────────────────────────────────────────────

pub fn build(in_dir: &Path, out_file: &Path, options: &BuildOptions) -> RunReport {
    let started = Instant::now();
    let result = run_build(in_dir, out_file, options);
    report("build", out_file, started, result)
}

fn run_build(in_dir: &Path, out_file: &Path, options: &BuildOptions) -> Result<()> {
    let profile = VersionProfile::resolve(&options.version)?;
    let descent = parse_descent(options.descent.as_deref())?;
    if let Some(gui) = options.gui.filter(|gui| *gui > MAX_GUI) {
        return Err(Error::InvalidOption(format!("gui must be 0..={MAX_GUI}, got {gui}")));
    }
    if !in_dir.is_dir() {
        return Err(Error::io(in_dir, std::io::ErrorKind::NotFound.into()));
    }
    let index = load_optional_index(options.index.as_deref())?;
    let scratch = Scratch::new(options.temp_dir.as_deref())?;
    let pool = WorkerPool::for_pack()?;
    info!(dir = %in_dir.display(), version = %profile, "building");

    let [s0, s1, s2, s3] = scratch.stages("encode");
    timed("collect", || match &descent {
        Some(layers) => descent::pack(in_dir, &s3, layers, &index, &pool),
        None => organizer::pack(in_dir, &s3, &index, &pool),
    })?;
    timed("structure", || structure::encode(&s3, &s2, &profile, options.gui, &pool))?;
    timed("json", || metadata::json_encode(&s2, &s1, &profile, &pool))?;
    timed("compress", || codec::compress_and_build(&s1, &s0, &pool))?;
    timed("container", || {
        let bytes = container::build_from_dir(&s0)?;
        container::write_file(out_file, &bytes)
    })
}
