//! Pool configuration: environment variables and the CSV layout file.
//!
//! One CSV file describes all three pools. Each line is
//! `type, page_size, start_offset, end_offset` with `type` one of `mmap`,
//! `brk`, `file`. A line with page size `-1` declares the pool's total size
//! as `end - start` (exactly one per pool); every other line declares one
//! huge-page interval. The header line is ignored and whitespace around
//! fields is tolerated.

use std::env;
use std::fs::File;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use mosalloc_platform::PageSize;

use crate::interval::MemoryIntervalList;

/// Environment variable naming the CSV layout file.
pub const CONFIG_FILE_ENV: &str = "HPC_CONFIGURATION_FILE";
/// Environment variable sizing the anon-mmap pool's FFA node arena.
pub const MMAP_FFA_SIZE_ENV: &str = "HPC_MMAP_FIRST_FIT_LIST_SIZE";
/// Environment variable sizing the file-mmap pool's FFA node arena.
pub const FILE_FFA_SIZE_ENV: &str = "HPC_FILE_BACKED_FIRST_FIT_LIST_SIZE";
/// Environment variable enabling the exit-time pool-size report.
pub const ANALYZE_ENV: &str = "HPC_ANALYZE_HPBRS";
/// Environment variable selecting diagnostic verbosity.
pub const VERBOSE_LEVEL_ENV: &str = "HPC_VERBOSE_LEVEL";

/// Configuration failures. All of these are fatal at initialization: the
/// process cannot sensibly run half-interposed.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is absent.
    #[error("environment variable {0} is not set")]
    MissingEnv(&'static str),

    /// An environment variable holds something other than a number.
    #[error("environment variable {0} is not a valid number")]
    BadEnvValue(&'static str),

    /// The layout file could not be opened.
    #[error("cannot open layout file: {0}")]
    Io(#[from] std::io::Error),

    /// The layout file is not well-formed CSV.
    #[error("layout file is corrupted: {0}")]
    Csv(#[from] csv::Error),

    /// A layout line names an unsupported page size.
    #[error("unknown page size {0} in layout file")]
    UnknownPageSize(i64),

    /// More than one pool-size line for the same pool.
    #[error("duplicate pool size line for pool '{0}'")]
    DuplicatePoolSize(&'static str),

    /// No pool-size line for the pool.
    #[error("missing pool size line for pool '{0}'")]
    MissingPoolSize(&'static str),

    /// An interval ends beyond the declared pool size.
    #[error("pool '{0}' intervals do not fit the declared pool size")]
    IntervalsExceedPool(&'static str),

    /// The declared layout breaks the alignment rules.
    #[error("invalid pool layout: {0}")]
    Layout(#[from] crate::validator::LayoutError),
}

/// The pool categories described by the layout file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// Anonymous `mmap` allocations.
    AnonMmap,
    /// File-backed `mmap` allocations.
    FileMmap,
    /// The program break.
    Brk,
}

impl PoolKind {
    /// The type tag used in the layout file and in reports.
    pub fn as_str(self) -> &'static str {
        match self {
            PoolKind::AnonMmap => "mmap",
            PoolKind::FileMmap => "file",
            PoolKind::Brk => "brk",
        }
    }
}

/// Shim configuration read from the environment.
#[derive(Debug)]
pub struct EnvConfig {
    /// Path of the CSV layout file.
    pub layout_file: PathBuf,
    /// FFA node-arena capacity for the anon-mmap pool.
    pub anon_ffa_capacity: usize,
    /// FFA node-arena capacity for the file-mmap pool.
    pub file_ffa_capacity: usize,
    /// Whether to write the pool-size analysis files.
    pub analyze_pools: bool,
    /// Diagnostic verbosity (0 = errors only).
    pub verbose_level: u8,
}

impl EnvConfig {
    /// Read the configuration, failing on missing or malformed values.
    ///
    /// `HPC_ANALYZE_HPBRS` and `HPC_VERBOSE_LEVEL` default to off; the layout
    /// file and both arena capacities are mandatory.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            layout_file: PathBuf::from(
                env::var_os(CONFIG_FILE_ENV).ok_or(ConfigError::MissingEnv(CONFIG_FILE_ENV))?,
            ),
            anon_ffa_capacity: required_number(MMAP_FFA_SIZE_ENV)?,
            file_ffa_capacity: required_number(FILE_FFA_SIZE_ENV)?,
            analyze_pools: optional_number(ANALYZE_ENV)?.unwrap_or(0) != 0,
            verbose_level: optional_number(VERBOSE_LEVEL_ENV)?.unwrap_or(0) as u8,
        })
    }
}

fn required_number(name: &'static str) -> Result<usize, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::BadEnvValue(name)),
        Err(_) => Err(ConfigError::MissingEnv(name)),
    }
}

fn optional_number(name: &'static str) -> Result<Option<u64>, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::BadEnvValue(name)),
        Err(_) => Ok(None),
    }
}

/// One data line of the layout file, mapped by position so the header line
/// carries no meaning.
#[derive(Debug, Deserialize)]
struct LayoutRow {
    pool: String,
    page_size: i64,
    start_offset: u64,
    end_offset: u64,
}

/// The declared layout of one pool: its total size and huge-page intervals.
pub struct PoolLayout {
    /// Total pool size in bytes.
    pub size: u64,
    /// The pool's huge-page intervals, sorted by start offset.
    pub intervals: MemoryIntervalList,
}

impl PoolLayout {
    /// Parse the rows of `kind` out of the layout file at `path`.
    ///
    /// The interval list storage comes from the raw mmap path; the transient
    /// parsing state does not, which is safe because configuration is read
    /// before the interposer starts serving from the pools.
    pub fn from_csv(path: &Path, kind: PoolKind) -> Result<Self, ConfigError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(File::open(path)?);

        let mut size: Option<u64> = None;
        let mut rows: Vec<(u64, u64, PageSize)> = Vec::new();

        for record in reader.records() {
            let row: LayoutRow = record?.deserialize(None)?;
            if row.pool != kind.as_str() {
                continue;
            }
            if row.page_size == -1 {
                if size.is_some() {
                    return Err(ConfigError::DuplicatePoolSize(kind.as_str()));
                }
                size = Some(row.end_offset.saturating_sub(row.start_offset));
                continue;
            }
            let page_size = u64::try_from(row.page_size)
                .ok()
                .and_then(PageSize::from_bytes)
                .filter(|ps| *ps != PageSize::Base4Kb)
                .ok_or(ConfigError::UnknownPageSize(row.page_size))?;
            rows.push((row.start_offset, row.end_offset, page_size));
        }

        let size = size.ok_or(ConfigError::MissingPoolSize(kind.as_str()))?;

        let mut intervals = MemoryIntervalList::new(rows.len());
        for (start, end, page_size) in rows {
            intervals.push(start, end, page_size);
        }
        intervals.sort();

        if intervals.max_end() > size {
            return Err(ConfigError::IntervalsExceedPool(kind.as_str()));
        }

        Ok(Self { size, intervals })
    }
}
