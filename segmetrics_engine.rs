//! # Segmetrics Engine - Trailing-Window Aggregates for Metric Streams
//!
//! An in-memory time-series aggregation engine. It ingests one sample per
//! second for any number of named metrics, keeps a bounded trailing window of
//! them, and answers "last N seconds" sum/min/max/average queries in
//! logarithmic time relative to the window size.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                            SEGMETRICS ENGINE                                │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  TICKER → METRIC REGISTRY → METRICS ENGINE → WINDOW MANAGER + SAMPLE BUFFER │
//! │                                           └→ SUM / MIN / MAX SEGMENT TREES  │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Logarithmic queries**: one segment tree per aggregate kind, all sharing
//!   the circular buffer's index space
//! - **Consistent reads**: a per-metric reader/writer lock spans a whole ingest
//!   or a whole query, so no reader ever sees a half-propagated tree
//! - **Graceful startup**: ranges are clamped to the samples that actually exist
//! - **Wrap-aware windows**: trailing ranges that cross slot 0 are split in two
//!   and merged per aggregate kind

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================
// External crate imports grouped by concern.
// ============================================================================

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]
#![allow(dead_code)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::fmt::{self, Debug, Display, Formatter};
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::signal;
use tokio::sync::Notify;
use tokio::time::{interval, MissedTickBehavior};

// ----------------------------------------------------------------------------
// Concurrency Primitives
// ----------------------------------------------------------------------------
use dashmap::DashMap;
use parking_lot::RwLock;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// String & Memory Optimization
// ----------------------------------------------------------------------------
use compact_str::CompactString;
use smallvec::{smallvec, SmallVec};

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, info, trace, warn};
use tracing_subscriber::{fmt as tracing_fmt, layer::SubscriberExt, EnvFilter};

// ----------------------------------------------------------------------------
// Time & Timestamps
// ----------------------------------------------------------------------------
use chrono::{DateTime, Utc};

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};

// ----------------------------------------------------------------------------
// CLI
// ----------------------------------------------------------------------------
use clap::{Parser, Subcommand, ValueEnum};

// ----------------------------------------------------------------------------
// Prometheus
// ----------------------------------------------------------------------------
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry as PrometheusRegistry, TextEncoder};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Engine version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "segmetrics-engine";
pub const ENGINE_FULL_NAME: &str = "Segmetrics Trailing-Window Engine";

/// Reported by the health check as the backing structure.
pub const TREE_TYPE: &str = "segment_tree";

// ----------------------------------------------------------------------------
// Window & Cadence
// ----------------------------------------------------------------------------

/// Default trailing window per metric: one hour at 1 Hz.
pub const DEFAULT_WINDOW_CAPACITY: usize = 3600;

/// Upper bound accepted from configuration (16M slots).
pub const MAX_WINDOW_CAPACITY: usize = 1 << 24;

/// Fixed sampling cadence used to turn "seconds ago" into sample offsets.
pub const SAMPLES_PER_SECOND: u64 = 1;

// ----------------------------------------------------------------------------
// Timing & Intervals
// ----------------------------------------------------------------------------

/// Default simulated ticker interval (milliseconds)
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 1000;

/// Minimum allowed ticker interval (milliseconds)
pub const MIN_TICK_INTERVAL_MS: u64 = 10;

/// Maximum allowed ticker interval (milliseconds)
pub const MAX_TICK_INTERVAL_MS: u64 = 60_000;

/// Ticks between two summary log lines
pub const DEFAULT_SUMMARY_EVERY_TICKS: u64 = 10;

/// Trailing range used by the periodic summary (seconds)
pub const SUMMARY_RANGE_SECS: u64 = 60;

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// Timestamps, samples, aggregate kinds and the query result shape.
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Timestamp - Sample Wall-Clock Stamps
// ----------------------------------------------------------------------------

/// Wall-clock stamp in nanoseconds since the Unix epoch. Informational only:
/// windows are positioned by tick count, never by timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    #[inline]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs.saturating_mul(1_000_000_000))
    }

    /// Current wall-clock time; clocks set before 1970 read as the epoch.
    #[inline]
    pub fn now() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| i64::try_from(elapsed.as_nanos()).unwrap_or(i64::MAX))
            .unwrap_or(0);
        Self(nanos)
    }

    #[inline]
    pub const fn as_secs(&self) -> i64 {
        self.0 / 1_000_000_000
    }

    /// Elapsed time since `earlier`, zero when `earlier` is the later stamp.
    #[inline]
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        let nanos = self.0.saturating_sub(earlier.0).max(0);
        Duration::from_nanos(nanos as u64)
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        let secs = self.0.div_euclid(1_000_000_000);
        let nanos = self.0.rem_euclid(1_000_000_000) as u32;
        DateTime::from_timestamp(secs, nanos).unwrap_or_default()
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().format("%Y-%m-%d %H:%M:%S%.3f UTC"))
    }
}

// ----------------------------------------------------------------------------
// 3.2 Sample - One Observation Written Per Tick
// ----------------------------------------------------------------------------

/// A single timestamped observation. Immutable once written; a slot is
/// overwritten in place when it falls out of the window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: Timestamp,
    pub value: f64,
}

impl Sample {
    #[inline]
    pub fn new(timestamp: Timestamp, value: f64) -> Self {
        Self { timestamp, value }
    }
}

// ----------------------------------------------------------------------------
// 3.3 Aggregate Kinds - Closed Set of Merge Functions
// ----------------------------------------------------------------------------

/// The aggregate kinds maintained per metric. Average is derived from the sum
/// and the covered sample count, so it has no tree of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateKind {
    Sum,
    Min,
    Max,
}

impl AggregateKind {
    pub const ALL: [AggregateKind; 3] = [AggregateKind::Sum, AggregateKind::Min, AggregateKind::Max];

    /// Neutral element of the kind's merge function.
    pub const fn identity(&self) -> f64 {
        match self {
            AggregateKind::Sum => SumAggregate::IDENTITY,
            AggregateKind::Min => MinAggregate::IDENTITY,
            AggregateKind::Max => MaxAggregate::IDENTITY,
        }
    }

    /// Combine two partial aggregates of this kind.
    #[inline]
    pub fn merge(&self, a: f64, b: f64) -> f64 {
        match self {
            AggregateKind::Sum => SumAggregate::merge(a, b),
            AggregateKind::Min => MinAggregate::merge(a, b),
            AggregateKind::Max => MaxAggregate::merge(a, b),
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            AggregateKind::Sum => "sum",
            AggregateKind::Min => "min",
            AggregateKind::Max => "max",
        }
    }
}

impl Display for AggregateKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----------------------------------------------------------------------------
// 3.4 Trailing Range - Validated "Seconds Ago" Bounds
// ----------------------------------------------------------------------------

/// A trailing time range expressed as offsets from the most recent sample.
/// `end_secs_ago == 0` includes the most recent sample; the range is closed.
/// Deserialization goes through [`TrailingRange::new`], so a decoded range is
/// always ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawTrailingRange")]
pub struct TrailingRange {
    start_secs_ago: u64,
    end_secs_ago: u64,
}

impl TrailingRange {
    /// Validate and build a range. `start` must be at least `end`; a reversed
    /// range is a caller bug and is never swapped or clamped.
    pub fn new(start_secs_ago: u64, end_secs_ago: u64) -> EngineResult<Self> {
        if start_secs_ago < end_secs_ago {
            return Err(EngineError::InvalidRange {
                start: saturating_i64(start_secs_ago),
                end: saturating_i64(end_secs_ago),
            });
        }
        Ok(Self {
            start_secs_ago,
            end_secs_ago,
        })
    }

    /// Build a range from signed offsets as they arrive from loosely typed
    /// callers. Negative offsets are rejected like reversed ones.
    pub fn from_signed(start_secs_ago: i64, end_secs_ago: i64) -> EngineResult<Self> {
        if start_secs_ago < 0 || end_secs_ago < 0 || start_secs_ago < end_secs_ago {
            return Err(EngineError::InvalidRange {
                start: start_secs_ago,
                end: end_secs_ago,
            });
        }
        Self::new(start_secs_ago as u64, end_secs_ago as u64)
    }

    /// The last `secs` seconds up to and including the most recent sample.
    pub const fn last_seconds(secs: u64) -> Self {
        Self {
            start_secs_ago: secs,
            end_secs_ago: 0,
        }
    }

    /// Only the most recent sample.
    pub const fn latest() -> Self {
        Self::last_seconds(0)
    }

    #[inline]
    pub const fn start_secs_ago(&self) -> u64 {
        self.start_secs_ago
    }

    #[inline]
    pub const fn end_secs_ago(&self) -> u64 {
        self.end_secs_ago
    }
}

/// Unvalidated wire form of a [`TrailingRange`].
#[derive(Debug, Deserialize)]
struct RawTrailingRange {
    start_secs_ago: u64,
    end_secs_ago: u64,
}

impl TryFrom<RawTrailingRange> for TrailingRange {
    type Error = EngineError;

    fn try_from(raw: RawTrailingRange) -> EngineResult<Self> {
        Self::new(raw.start_secs_ago, raw.end_secs_ago)
    }
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

// ----------------------------------------------------------------------------
// 3.5 Window Stats - Query Result
// ----------------------------------------------------------------------------

/// Aggregates over a resolved trailing range. Serializes to the JSON object
/// dashboards consume (`sum`, `min`, `max`, `avg`, `count`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowStats {
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub count: u64,
}

impl WindowStats {
    /// Zeroed stats returned when a range covers no samples.
    pub const fn empty() -> Self {
        Self {
            sum: 0.0,
            min: 0.0,
            max: 0.0,
            avg: 0.0,
            count: 0,
        }
    }

    /// Assemble the final stats from merged partial aggregates.
    pub fn from_partials(sum: f64, min: f64, max: f64, count: u64) -> Self {
        if count == 0 {
            return Self::empty();
        }
        Self {
            sum,
            min,
            max,
            avg: sum / count as f64,
            count,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Read the value for one aggregate kind.
    pub fn value(&self, kind: AggregateKind) -> f64 {
        match kind {
            AggregateKind::Sum => self.sum,
            AggregateKind::Min => self.min,
            AggregateKind::Max => self.max,
        }
    }
}

impl Default for WindowStats {
    fn default() -> Self {
        Self::empty()
    }
}

impl Display for WindowStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "count={} sum={:.3} min={:.3} max={:.3} avg={:.3}",
            self.count, self.sum, self.min, self.max, self.avg
        )
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// Only InvalidRange is surfaced to callers as a failure; invalid samples are
// dropped and reported through logs and counters, and missing data degrades to
// zeroed stats.
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Core Engine Errors
// ----------------------------------------------------------------------------

/// The main error type for the engine.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid range: start {start}s ago must be non-negative and not after end {end}s ago")]
    InvalidRange { start: i64, end: i64 },

    #[error("Invalid sample for '{metric}': {value} is not a finite number")]
    InvalidSample { metric: String, value: f64 },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Replay input line {line}: {message}")]
    Replay { line: usize, message: String },

    #[error("Metrics registry error: {0}")]
    Metrics(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Check if the caller can keep going after this error
    pub fn is_recoverable(&self) -> bool {
        match self {
            EngineError::InvalidRange { .. } => true,
            EngineError::InvalidSample { .. } => true,
            EngineError::Replay { .. } => true,
            EngineError::Io(_) => true,
            EngineError::Config(_) => false,
            EngineError::Metrics(_) => false,
            EngineError::Serialization(_) => false,
            EngineError::Internal(_) => false,
        }
    }

    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            EngineError::InvalidRange { .. } => "invalid_range",
            EngineError::InvalidSample { .. } => "invalid_sample",
            EngineError::Config(_) => "config",
            EngineError::Replay { .. } => "replay",
            EngineError::Metrics(_) => "metrics",
            EngineError::Serialization(_) => "serialization",
            EngineError::Io(_) => "io",
            EngineError::Internal(_) => "internal",
        }
    }
}

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// TOML file + environment overrides, validated once at startup. The window
// capacity and cadence are not reconfigurable while running.
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Trailing window settings
    #[serde(default)]
    pub window: WindowConfig,

    /// Simulated sources driven by the built-in ticker
    #[serde(default)]
    pub simulation: SimulationConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("SEGMETRICS_").split("__"));

        let config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML string (no environment overrides)
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window.capacity == 0 || self.window.capacity > MAX_WINDOW_CAPACITY {
            return Err(ConfigError::invalid_value(
                "window.capacity",
                format!("must be between 1 and {}", MAX_WINDOW_CAPACITY),
            ));
        }

        let tick = self.simulation.tick_interval_ms;
        if !(MIN_TICK_INTERVAL_MS..=MAX_TICK_INTERVAL_MS).contains(&tick) {
            return Err(ConfigError::invalid_value(
                "simulation.tick_interval_ms",
                format!(
                    "must be between {}ms and {}ms",
                    MIN_TICK_INTERVAL_MS, MAX_TICK_INTERVAL_MS
                ),
            ));
        }

        if self.simulation.summary_every_ticks == 0 {
            return Err(ConfigError::invalid_value(
                "simulation.summary_every_ticks",
                "must be at least 1",
            ));
        }

        for (i, source) in self.simulation.sources.iter().enumerate() {
            if source.name.trim().is_empty() {
                return Err(ConfigError::invalid_value(
                    format!("simulation.sources[{}].name", i),
                    "must not be empty",
                ));
            }
            if !source.min.is_finite() || !source.max.is_finite() || source.min > source.max {
                return Err(ConfigError::invalid_value(
                    format!("simulation.sources[{}]", i),
                    format!("range {}..{} is not a finite ascending range", source.min, source.max),
                ));
            }
        }

        Ok(())
    }

    /// Render the default configuration as TOML
    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// 5.2 Window Configuration
// ----------------------------------------------------------------------------

/// Window settings shared by every metric
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Number of retained samples per metric
    #[serde(default = "default_window_capacity")]
    pub capacity: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            capacity: default_window_capacity(),
        }
    }
}

fn default_window_capacity() -> usize {
    DEFAULT_WINDOW_CAPACITY
}

// ----------------------------------------------------------------------------
// 5.3 Simulation Configuration
// ----------------------------------------------------------------------------

/// Built-in ticker that feeds simulated samples while no real source exists
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Ticker interval (milliseconds)
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// Log a summary every N ticks
    #[serde(default = "default_summary_every_ticks")]
    pub summary_every_ticks: u64,

    #[serde(default = "default_sources")]
    pub sources: Vec<SimulatedSource>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_ms: default_tick_interval(),
            summary_every_ticks: default_summary_every_ticks(),
            sources: default_sources(),
        }
    }
}

/// One simulated metric: a uniform draw in `[min, max]` per tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedSource {
    pub name: String,
    pub min: f64,
    pub max: f64,
    /// Round draws to whole numbers (request counts and the like)
    #[serde(default)]
    pub integer: bool,
}

impl SimulatedSource {
    pub fn new(name: impl Into<String>, min: f64, max: f64) -> Self {
        Self {
            name: name.into(),
            min,
            max,
            integer: false,
        }
    }

    pub fn integer(mut self) -> Self {
        self.integer = true;
        self
    }

    /// Draw one value from the source's range.
    pub fn draw(&self, rng: &mut fastrand::Rng) -> f64 {
        let value = self.min + rng.f64() * (self.max - self.min);
        if self.integer {
            value.round()
        } else {
            value
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_tick_interval() -> u64 {
    DEFAULT_TICK_INTERVAL_MS
}

fn default_summary_every_ticks() -> u64 {
    DEFAULT_SUMMARY_EVERY_TICKS
}

fn default_sources() -> Vec<SimulatedSource> {
    vec![
        SimulatedSource::new("cpu", 20.0, 80.0),
        SimulatedSource::new("memory", 30.0, 90.0),
        SimulatedSource::new("requests", 100.0, 1000.0).integer(),
    ]
}

// ----------------------------------------------------------------------------
// 5.4 Logging Configuration
// ----------------------------------------------------------------------------

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================

/// Initialize the logging system based on configuration.
/// Logs go to stderr so command output on stdout stays machine-readable.
pub fn init_logging(config: &LoggingConfig) -> EngineResult<()> {
    let level_filter = match config.level.to_lowercase().as_str() {
        "trace" => tracing::level_filters::LevelFilter::TRACE,
        "debug" => tracing::level_filters::LevelFilter::DEBUG,
        "info" => tracing::level_filters::LevelFilter::INFO,
        "warn" | "warning" => tracing::level_filters::LevelFilter::WARN,
        "error" => tracing::level_filters::LevelFilter::ERROR,
        _ => tracing::level_filters::LevelFilter::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    match config.format.as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| EngineError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        "compact" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .compact()
                    .with_writer(std::io::stderr)
                    .with_ansi(config.colors)
                    .with_target(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| EngineError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        _ => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .pretty()
                    .with_writer(std::io::stderr)
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| EngineError::Internal(format!("Failed to set logger: {}", e)))?;
        }
    }

    info!(
        target: "segmetrics::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ============================================================================
// SECTION 7: AGGREGATE TREES
// ============================================================================
// Array-backed segment trees over the buffer's slot index space. The merge
// function and identity are bound per kind at compile time through the
// `Aggregate` marker types; every kind is associative and commutative, so the
// canonical decomposition may combine nodes in any grouping.
// ============================================================================

// ----------------------------------------------------------------------------
// 7.1 Aggregate Markers
// ----------------------------------------------------------------------------

/// A merge function and its neutral element.
pub trait Aggregate: Debug + Send + Sync + 'static {
    const KIND: AggregateKind;
    const IDENTITY: f64;

    fn merge(a: f64, b: f64) -> f64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SumAggregate;

#[derive(Debug, Clone, Copy, Default)]
pub struct MinAggregate;

#[derive(Debug, Clone, Copy, Default)]
pub struct MaxAggregate;

impl Aggregate for SumAggregate {
    const KIND: AggregateKind = AggregateKind::Sum;
    const IDENTITY: f64 = 0.0;

    #[inline]
    fn merge(a: f64, b: f64) -> f64 {
        a + b
    }
}

impl Aggregate for MinAggregate {
    const KIND: AggregateKind = AggregateKind::Min;
    const IDENTITY: f64 = f64::INFINITY;

    #[inline]
    fn merge(a: f64, b: f64) -> f64 {
        a.min(b)
    }
}

impl Aggregate for MaxAggregate {
    const KIND: AggregateKind = AggregateKind::Max;
    const IDENTITY: f64 = f64::NEG_INFINITY;

    #[inline]
    fn merge(a: f64, b: f64) -> f64 {
        a.max(b)
    }
}

// ----------------------------------------------------------------------------
// 7.2 Segment Tree
// ----------------------------------------------------------------------------

/// Complete binary tree stored in a flat array. Node 1 is the root, node `i`
/// has children `2i` and `2i + 1`, and leaf `j` lives at `leaves + j` where
/// `leaves` is the next power of two at or above the capacity. Leaves past the
/// capacity, and leaves never written, hold the identity.
///
/// Every internal node equals the merge of its two children whenever no
/// `update` call is in progress.
#[derive(Debug, Clone)]
pub struct AggregateTree<A: Aggregate> {
    nodes: Box<[f64]>,
    leaves: usize,
    capacity: usize,
    _kind: PhantomData<A>,
}

pub type SumTree = AggregateTree<SumAggregate>;
pub type MinTree = AggregateTree<MinAggregate>;
pub type MaxTree = AggregateTree<MaxAggregate>;

impl<A: Aggregate> AggregateTree<A> {
    /// Create a tree whose leaves all hold the identity.
    pub fn new(capacity: usize) -> Self {
        Self::build(&[], capacity)
    }

    /// Build a tree in O(n). `values[i]` becomes leaf `i`; slots from
    /// `values.len()` up to `capacity` are treated as never written.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or smaller than `values.len()`.
    pub fn build(values: &[f64], capacity: usize) -> Self {
        assert!(capacity > 0, "aggregate tree capacity must be non-zero");
        assert!(
            values.len() <= capacity,
            "{} initial values exceed tree capacity {}",
            values.len(),
            capacity
        );

        let leaves = capacity.next_power_of_two();
        let mut nodes = vec![A::IDENTITY; 2 * leaves].into_boxed_slice();
        nodes[leaves..leaves + values.len()].copy_from_slice(values);
        for node in (1..leaves).rev() {
            nodes[node] = A::merge(nodes[2 * node], nodes[2 * node + 1]);
        }

        Self {
            nodes,
            leaves,
            capacity,
            _kind: PhantomData,
        }
    }

    /// Overwrite leaf `index` and re-merge every ancestor up to the root.
    ///
    /// # Panics
    ///
    /// Panics if `index >= capacity`.
    #[inline]
    pub fn update(&mut self, index: usize, value: f64) {
        assert!(
            index < self.capacity,
            "leaf index {} out of bounds for capacity {}",
            index,
            self.capacity
        );

        let mut node = self.leaves + index;
        self.nodes[node] = value;
        while node > 1 {
            node >>= 1;
            self.nodes[node] = A::merge(self.nodes[2 * node], self.nodes[2 * node + 1]);
        }
    }

    /// Merge-fold of leaves `[lo, hi]` inclusive. An empty range (`lo > hi`)
    /// yields the identity. Walks at most two nodes per level, bottom-up,
    /// without recursion or allocation.
    ///
    /// # Panics
    ///
    /// Panics if `lo <= hi` and `hi >= capacity`.
    #[inline]
    pub fn query(&self, lo: usize, hi: usize) -> f64 {
        if lo > hi {
            return A::IDENTITY;
        }
        assert!(
            hi < self.capacity,
            "range end {} out of bounds for capacity {}",
            hi,
            self.capacity
        );

        let mut left_acc = A::IDENTITY;
        let mut right_acc = A::IDENTITY;
        let mut l = lo + self.leaves;
        let mut r = hi + self.leaves + 1;

        while l < r {
            if l & 1 == 1 {
                left_acc = A::merge(left_acc, self.nodes[l]);
                l += 1;
            }
            if r & 1 == 1 {
                r -= 1;
                right_acc = A::merge(self.nodes[r], right_acc);
            }
            l >>= 1;
            r >>= 1;
        }

        A::merge(left_acc, right_acc)
    }

    /// Value currently held by leaf `index`.
    #[inline]
    pub fn get(&self, index: usize) -> f64 {
        assert!(index < self.capacity, "leaf index {} out of bounds", index);
        self.nodes[self.leaves + index]
    }

    /// Root value: the merge of every leaf.
    #[inline]
    pub fn total(&self) -> f64 {
        self.nodes[1]
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn kind(&self) -> AggregateKind {
        A::KIND
    }
}

// ============================================================================
// SECTION 8: SAMPLE BUFFER
// ============================================================================

/// Fixed-capacity circular store of raw samples. Slots are written in place;
/// the write cursor and fill count live in the `WindowManager`.
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    slots: Box<[Option<Sample>]>,
}

impl SampleBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "sample buffer capacity must be non-zero");
        Self {
            slots: vec![None; capacity].into_boxed_slice(),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Sample stored at `index`, or `None` if the slot was never written.
    #[inline]
    pub fn get(&self, index: usize) -> Option<Sample> {
        self.slots.get(index).copied().flatten()
    }

    /// Write `sample` into `index`, returning the evicted sample if any.
    #[inline]
    pub fn write(&mut self, index: usize, sample: Sample) -> Option<Sample> {
        self.slots[index].replace(sample)
    }

    /// Slot values in index order, `None` for unwritten slots.
    pub fn slots(&self) -> impl Iterator<Item = Option<f64>> + '_ {
        self.slots.iter().map(|slot| slot.map(|s| s.value))
    }
}

// ============================================================================
// SECTION 9: WINDOW MANAGER
// ============================================================================
// Owns the circular write cursor and all wrap arithmetic. Translates trailing
// "seconds ago" ranges into at most two contiguous slot spans.
// ============================================================================

// ----------------------------------------------------------------------------
// 9.1 Resolved Ranges
// ----------------------------------------------------------------------------

/// A contiguous, non-wrapping slot range `[lo, hi]` (inclusive).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSpan {
    pub lo: usize,
    pub hi: usize,
}

impl IndexSpan {
    #[inline]
    pub const fn new(lo: usize, hi: usize) -> Self {
        Self { lo, hi }
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.hi - self.lo + 1
    }
}

/// Slot spans covering a trailing range, oldest span first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedWindow {
    spans: SmallVec<[IndexSpan; 2]>,
    count: usize,
}

impl ResolvedWindow {
    pub fn empty() -> Self {
        Self {
            spans: SmallVec::new(),
            count: 0,
        }
    }

    #[inline]
    pub fn spans(&self) -> &[IndexSpan] {
        &self.spans
    }

    /// Number of valid samples covered.
    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Whether the range crosses the end of the buffer.
    #[inline]
    pub fn wraps(&self) -> bool {
        self.spans.len() > 1
    }

    /// Covered slot indices in chronological order.
    pub fn indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.spans.iter().flat_map(|span| span.lo..=span.hi)
    }
}

// ----------------------------------------------------------------------------
// 9.2 Window Manager
// ----------------------------------------------------------------------------

/// Circular cursor state. Exactly `min(total_ingested, capacity)` slots are
/// valid and the oldest valid slot is `(head - filled) mod capacity`.
#[derive(Debug, Clone)]
pub struct WindowManager {
    capacity: usize,
    head: usize,
    filled: usize,
    total_ingested: u64,
}

impl WindowManager {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "window capacity must be non-zero");
        Self {
            capacity,
            head: 0,
            filled: 0,
            total_ingested: 0,
        }
    }

    /// Claim the slot for this tick and advance the cursor. Once the buffer is
    /// full the returned slot holds the oldest sample, which the caller's
    /// overwrite evicts.
    #[inline]
    pub fn record_tick(&mut self) -> usize {
        let index = self.head;
        self.head = (self.head + 1) % self.capacity;
        if self.filled < self.capacity {
            self.filled += 1;
        }
        self.total_ingested += 1;
        index
    }

    /// Resolve raw offsets, rejecting `start < end`.
    pub fn resolve_range(&self, start_secs_ago: u64, end_secs_ago: u64) -> EngineResult<ResolvedWindow> {
        let range = TrailingRange::new(start_secs_ago, end_secs_ago)?;
        Ok(self.resolve(range))
    }

    /// Map a validated trailing range onto slot spans.
    ///
    /// The start is clamped to the oldest available sample. A range whose end
    /// lies before the oldest sample resolves to nothing.
    pub fn resolve(&self, range: TrailingRange) -> ResolvedWindow {
        let newest = match self.newest_index() {
            Some(newest) => newest,
            None => return ResolvedWindow::empty(),
        };

        let oldest_offset = (self.filled - 1) as u64;
        let end = range.end_secs_ago().saturating_mul(SAMPLES_PER_SECOND);
        if end > oldest_offset || range.start_secs_ago() < range.end_secs_ago() {
            return ResolvedWindow::empty();
        }
        let start = range
            .start_secs_ago()
            .saturating_mul(SAMPLES_PER_SECOND)
            .min(oldest_offset);

        // Both offsets are below `filled <= capacity`, so the casts are lossless.
        let (start, end) = (start as usize, end as usize);
        let c = self.capacity;
        let lo = (newest + c - start) % c;
        let hi = (newest + c - end) % c;

        let spans: SmallVec<[IndexSpan; 2]> = if lo <= hi {
            smallvec![IndexSpan::new(lo, hi)]
        } else {
            smallvec![IndexSpan::new(lo, c - 1), IndexSpan::new(0, hi)]
        };

        ResolvedWindow {
            spans,
            count: start - end + 1,
        }
    }

    /// Slot holding the most recent sample.
    #[inline]
    pub fn newest_index(&self) -> Option<usize> {
        if self.filled == 0 {
            None
        } else {
            Some((self.head + self.capacity - 1) % self.capacity)
        }
    }

    /// Slot holding the oldest valid sample.
    #[inline]
    pub fn oldest_index(&self) -> Option<usize> {
        if self.filled == 0 {
            None
        } else {
            Some((self.head + self.capacity - self.filled) % self.capacity)
        }
    }

    /// Next slot to be written.
    #[inline]
    pub fn head(&self) -> usize {
        self.head
    }

    #[inline]
    pub fn filled(&self) -> usize {
        self.filled
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.filled == self.capacity
    }

    #[inline]
    pub fn total_ingested(&self) -> u64 {
        self.total_ingested
    }
}

// ============================================================================
// SECTION 10: METRICS ENGINE
// ============================================================================
// Per-metric coordinator. One reader/writer lock guards the buffer, the cursor
// and all three trees together: an ingest holds the write side until every
// tree is updated, a query holds the read side until every tree is read.
// parking_lot's lock is task-fair, so a steady read load cannot starve the
// once-per-second writer.
// ============================================================================

// ----------------------------------------------------------------------------
// 10.1 Metric State
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct MetricState {
    buffer: SampleBuffer,
    window: WindowManager,
    sum: SumTree,
    min: MinTree,
    max: MaxTree,
}

impl MetricState {
    fn new(capacity: usize) -> Self {
        Self {
            buffer: SampleBuffer::new(capacity),
            window: WindowManager::new(capacity),
            sum: SumTree::new(capacity),
            min: MinTree::new(capacity),
            max: MaxTree::new(capacity),
        }
    }

    fn apply(&mut self, sample: Sample) -> usize {
        let index = self.window.record_tick();
        self.buffer.write(index, sample);
        self.sum.update(index, sample.value);
        self.min.update(index, sample.value);
        self.max.update(index, sample.value);
        index
    }

    fn aggregate(&self, window: &ResolvedWindow) -> WindowStats {
        if window.is_empty() {
            return WindowStats::empty();
        }

        let mut sum = SumAggregate::IDENTITY;
        let mut min = MinAggregate::IDENTITY;
        let mut max = MaxAggregate::IDENTITY;
        for span in window.spans() {
            sum = SumAggregate::merge(sum, self.sum.query(span.lo, span.hi));
            min = MinAggregate::merge(min, self.min.query(span.lo, span.hi));
            max = MaxAggregate::merge(max, self.max.query(span.lo, span.hi));
        }

        WindowStats::from_partials(sum, min, max, window.count() as u64)
    }
}

// ----------------------------------------------------------------------------
// 10.2 Metrics Engine
// ----------------------------------------------------------------------------

/// Trailing-window aggregates for one named metric.
#[derive(Debug)]
pub struct MetricsEngine {
    name: CompactString,
    capacity: usize,
    state: RwLock<MetricState>,
    dropped: AtomicU64,
    created_at: Timestamp,
}

impl MetricsEngine {
    /// Create an engine with the default one-hour window.
    pub fn new(name: impl Into<CompactString>) -> Self {
        Self::with_capacity(name, DEFAULT_WINDOW_CAPACITY)
    }

    /// Create an engine retaining `capacity` samples.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero. [`EngineConfig::validate`] rejects that
    /// value before any engine is built from configuration.
    pub fn with_capacity(name: impl Into<CompactString>, capacity: usize) -> Self {
        assert!(capacity > 0, "metric window capacity must be non-zero");
        Self {
            name: name.into(),
            capacity,
            state: RwLock::new(MetricState::new(capacity)),
            dropped: AtomicU64::new(0),
            created_at: Timestamp::now(),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append one sample and return the slot it was written to.
    ///
    /// Non-finite values are rejected before any state is touched and counted
    /// as dropped.
    pub fn ingest(&self, value: f64, timestamp: Timestamp) -> EngineResult<usize> {
        if !value.is_finite() {
            self.dropped.fetch_add(1, AtomicOrdering::Relaxed);
            return Err(EngineError::InvalidSample {
                metric: self.name.to_string(),
                value,
            });
        }

        let index = self.state.write().apply(Sample::new(timestamp, value));
        trace!(
            target: "segmetrics::ingest",
            metric = %self.name,
            slot = index,
            value,
            "Sample ingested"
        );
        Ok(index)
    }

    /// Aggregates over `[start_secs_ago, end_secs_ago]`.
    pub fn query(&self, start_secs_ago: u64, end_secs_ago: u64) -> EngineResult<WindowStats> {
        let range = TrailingRange::new(start_secs_ago, end_secs_ago)?;
        Ok(self.query_range(range))
    }

    /// Aggregates over an already validated range. Ranges with no data yield
    /// zeroed stats.
    pub fn query_range(&self, range: TrailingRange) -> WindowStats {
        let state = self.state.read();
        let window = state.window.resolve(range);
        state.aggregate(&window)
    }

    /// Most recent sample, if any.
    pub fn latest(&self) -> Option<Sample> {
        let state = self.state.read();
        state
            .window
            .newest_index()
            .and_then(|index| state.buffer.get(index))
    }

    /// Raw samples of a trailing range, oldest first.
    pub fn samples(&self, range: TrailingRange) -> Vec<Sample> {
        let state = self.state.read();
        let window = state.window.resolve(range);
        window
            .indices()
            .filter_map(|index| state.buffer.get(index))
            .collect()
    }

    /// Number of valid samples currently retained.
    pub fn filled(&self) -> usize {
        self.state.read().window.filled()
    }

    pub fn total_ingested(&self) -> u64 {
        self.state.read().window.total_ingested()
    }

    /// Samples rejected as non-finite.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(AtomicOrdering::Relaxed)
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    /// Point-in-time status for health reporting.
    pub fn status(&self) -> MetricStatus {
        let state = self.state.read();
        MetricStatus {
            name: self.name.to_string(),
            capacity: self.capacity,
            filled: state.window.filled(),
            total_ingested: state.window.total_ingested(),
            dropped: self.dropped(),
            created_at: self.created_at,
            latest: state
                .window
                .newest_index()
                .and_then(|index| state.buffer.get(index)),
        }
    }
}

/// Per-metric status line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricStatus {
    pub name: String,
    pub capacity: usize,
    pub filled: usize,
    pub total_ingested: u64,
    pub dropped: u64,
    pub created_at: Timestamp,
    pub latest: Option<Sample>,
}

// ============================================================================
// SECTION 11: METRIC REGISTRY
// ============================================================================

/// Name → engine map. Engines are created on first reference and live for the
/// lifetime of the registry; there is no removal.
#[derive(Debug)]
pub struct MetricRegistry {
    engines: DashMap<CompactString, Arc<MetricsEngine>>,
    capacity: usize,
    metrics: Option<Arc<EngineMetrics>>,
}

impl MetricRegistry {
    /// Create a registry whose engines retain `capacity` samples each.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "registry window capacity must be non-zero");
        Self {
            engines: DashMap::new(),
            capacity,
            metrics: None,
        }
    }

    /// Create a registry that reports ingests, drops and queries.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn with_metrics(capacity: usize, metrics: Arc<EngineMetrics>) -> Self {
        assert!(capacity > 0, "registry window capacity must be non-zero");
        Self {
            engines: DashMap::new(),
            capacity,
            metrics: Some(metrics),
        }
    }

    /// Return the engine for `name`, creating it on first use.
    pub fn get_or_create(&self, name: &str) -> Arc<MetricsEngine> {
        if let Some(engine) = self.engines.get(name) {
            return Arc::clone(engine.value());
        }

        let engine = Arc::clone(
            self.engines
                .entry(CompactString::from(name))
                .or_insert_with(|| {
                    debug!(
                        target: "segmetrics::registry",
                        metric = name,
                        capacity = self.capacity,
                        "Metric created"
                    );
                    Arc::new(MetricsEngine::with_capacity(name, self.capacity))
                })
                .value(),
        );

        if let Some(metrics) = &self.metrics {
            metrics.set_metrics_tracked(self.engines.len());
        }
        engine
    }

    /// Engine for `name` if it has been referenced before.
    pub fn get(&self, name: &str) -> Option<Arc<MetricsEngine>> {
        self.engines.get(name).map(|engine| Arc::clone(engine.value()))
    }

    /// Ingest one sample. Invalid samples are dropped, logged and counted;
    /// nothing is returned to the caller.
    pub fn ingest(&self, name: &str, value: f64, timestamp: Timestamp) {
        let engine = self.get_or_create(name);
        match engine.ingest(value, timestamp) {
            Ok(_) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_ingest(name);
                }
            }
            Err(error) => {
                warn!(
                    target: "segmetrics::ingest",
                    metric = name,
                    value,
                    category = error.category(),
                    "Dropping sample: {}",
                    error
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_drop(name);
                }
            }
        }
    }

    /// Query a metric's trailing range. Only a reversed range fails; unknown
    /// metrics and ranges without data yield zeroed stats.
    pub fn query(&self, name: &str, start_secs_ago: u64, end_secs_ago: u64) -> EngineResult<WindowStats> {
        let range = TrailingRange::new(start_secs_ago, end_secs_ago);
        self.query_validated(name, range)
    }

    /// Query with signed offsets; negatives are rejected as invalid ranges.
    pub fn query_signed(&self, name: &str, start_secs_ago: i64, end_secs_ago: i64) -> EngineResult<WindowStats> {
        let range = TrailingRange::from_signed(start_secs_ago, end_secs_ago);
        self.query_validated(name, range)
    }

    fn query_validated(&self, name: &str, range: EngineResult<TrailingRange>) -> EngineResult<WindowStats> {
        let range = match range {
            Ok(range) => range,
            Err(error) => {
                debug!(target: "segmetrics::query", metric = name, "Rejected query: {}", error);
                if let Some(metrics) = &self.metrics {
                    metrics.record_query(QueryOutcome::InvalidRange);
                }
                return Err(error);
            }
        };

        let stats = self.get_or_create(name).query_range(range);
        if let Some(metrics) = &self.metrics {
            let outcome = if stats.is_empty() {
                QueryOutcome::Empty
            } else {
                QueryOutcome::Ok
            };
            metrics.record_query(outcome);
        }
        Ok(stats)
    }

    /// Known metric names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.engines.iter().map(|entry| entry.key().to_string()).collect();
        names.sort();
        names
    }

    /// Status of every known metric, sorted by name.
    pub fn statuses(&self) -> Vec<MetricStatus> {
        let mut statuses: Vec<MetricStatus> = self.engines.iter().map(|entry| entry.value().status()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.engines.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

// ============================================================================
// SECTION 12: ENGINE METRICS (PROMETHEUS)
// ============================================================================

/// Outcome label for the query counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOutcome {
    Ok,
    Empty,
    InvalidRange,
}

impl QueryOutcome {
    pub const fn as_str(&self) -> &'static str {
        match self {
            QueryOutcome::Ok => "ok",
            QueryOutcome::Empty => "empty",
            QueryOutcome::InvalidRange => "invalid_range",
        }
    }
}

/// Self-observability counters kept in a private Prometheus registry.
pub struct EngineMetrics {
    registry: PrometheusRegistry,
    samples_ingested: IntCounterVec,
    samples_dropped: IntCounterVec,
    queries: IntCounterVec,
    metrics_tracked: IntGauge,
}

impl EngineMetrics {
    pub fn new() -> EngineResult<Self> {
        let registry = PrometheusRegistry::new();

        let samples_ingested = IntCounterVec::new(
            Opts::new("segmetrics_samples_ingested_total", "Samples written into a metric window"),
            &["metric"],
        )
        .map_err(metrics_error)?;
        let samples_dropped = IntCounterVec::new(
            Opts::new("segmetrics_samples_dropped_total", "Samples rejected as non-finite"),
            &["metric"],
        )
        .map_err(metrics_error)?;
        let queries = IntCounterVec::new(
            Opts::new("segmetrics_queries_total", "Trailing-window queries by outcome"),
            &["outcome"],
        )
        .map_err(metrics_error)?;
        let metrics_tracked =
            IntGauge::new("segmetrics_metrics", "Metrics currently tracked").map_err(metrics_error)?;

        registry
            .register(Box::new(samples_ingested.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(samples_dropped.clone()))
            .map_err(metrics_error)?;
        registry.register(Box::new(queries.clone())).map_err(metrics_error)?;
        registry
            .register(Box::new(metrics_tracked.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            samples_ingested,
            samples_dropped,
            queries,
            metrics_tracked,
        })
    }

    #[inline]
    pub fn record_ingest(&self, metric: &str) {
        self.samples_ingested.with_label_values(&[metric]).inc();
    }

    #[inline]
    pub fn record_drop(&self, metric: &str) {
        self.samples_dropped.with_label_values(&[metric]).inc();
    }

    #[inline]
    pub fn record_query(&self, outcome: QueryOutcome) {
        self.queries.with_label_values(&[outcome.as_str()]).inc();
    }

    pub fn set_metrics_tracked(&self, count: usize) {
        self.metrics_tracked.set(count as i64);
    }

    pub fn ingested(&self, metric: &str) -> u64 {
        self.samples_ingested.with_label_values(&[metric]).get()
    }

    pub fn dropped(&self, metric: &str) -> u64 {
        self.samples_dropped.with_label_values(&[metric]).get()
    }

    pub fn queries(&self, outcome: QueryOutcome) -> u64 {
        self.queries.with_label_values(&[outcome.as_str()]).get()
    }

    /// Render all counters in the Prometheus text exposition format.
    pub fn render(&self) -> EngineResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| EngineError::Metrics(e.to_string()))
    }
}

impl Debug for EngineMetrics {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineMetrics")
            .field("metrics_tracked", &self.metrics_tracked.get())
            .finish_non_exhaustive()
    }
}

fn metrics_error(error: prometheus::Error) -> EngineError {
    EngineError::Metrics(error.to_string())
}

// ============================================================================
// SECTION 13: ENGINE RUNTIME
// ============================================================================

/// Health report mirroring the dashboard's health endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub tree_type: String,
    pub version: String,
    pub uptime_secs: u64,
    pub metrics: Vec<MetricStatus>,
}

/// The process-level engine: owns the registry and drives the ticker.
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    registry: Arc<MetricRegistry>,
    metrics: Arc<EngineMetrics>,
    shutdown: Arc<Notify>,
    running: AtomicBool,
    start_time: Timestamp,
}

impl Engine {
    /// Create a new engine instance
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        let metrics = Arc::new(EngineMetrics::new()?);
        let registry = Arc::new(MetricRegistry::with_metrics(
            config.window.capacity,
            Arc::clone(&metrics),
        ));

        Ok(Self {
            config,
            registry,
            metrics,
            shutdown: Arc::new(Notify::new()),
            running: AtomicBool::new(false),
            start_time: Timestamp::now(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Registry handle for API layers.
    pub fn registry(&self) -> &Arc<MetricRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    pub fn is_running(&self) -> bool {
        self.running.load(AtomicOrdering::Acquire)
    }

    pub fn uptime(&self) -> Duration {
        Timestamp::now().duration_since(self.start_time)
    }

    pub fn health(&self) -> HealthReport {
        HealthReport {
            status: "healthy".into(),
            tree_type: TREE_TYPE.into(),
            version: ENGINE_VERSION.into(),
            uptime_secs: self.uptime().as_secs(),
            metrics: self.registry.statuses(),
        }
    }

    /// Signal shutdown
    pub fn shutdown(&self) {
        info!(target: "segmetrics::engine", "Shutdown requested");
        self.running.store(false, AtomicOrdering::Release);
        self.shutdown.notify_one();
    }

    /// Ingest one simulated sample per configured source.
    pub fn tick(&self, rng: &mut fastrand::Rng) {
        let now = Timestamp::now();
        for source in &self.config.simulation.sources {
            self.registry.ingest(&source.name, source.draw(rng), now);
        }
    }

    /// Log the last minute of every known metric.
    pub fn log_summary(&self) {
        let range = TrailingRange::last_seconds(SUMMARY_RANGE_SECS);
        for name in self.registry.names() {
            if let Some(engine) = self.registry.get(&name) {
                let stats = engine.query_range(range);
                info!(
                    target: "segmetrics::engine",
                    metric = %name,
                    count = stats.count,
                    min = stats.min,
                    max = stats.max,
                    avg = stats.avg,
                    "Trailing {}s summary",
                    SUMMARY_RANGE_SECS
                );
            }
        }
    }

    /// Run the ticker until shutdown or SIGINT/SIGTERM.
    pub async fn run(&self) -> EngineResult<()> {
        let simulation = &self.config.simulation;
        info!(
            target: "segmetrics::engine",
            version = ENGINE_VERSION,
            capacity = self.config.window.capacity,
            simulation = simulation.enabled,
            sources = simulation.sources.len(),
            "Starting engine"
        );

        self.running.store(true, AtomicOrdering::Release);

        let shutdown = Arc::clone(&self.shutdown);
        let signal_task = tokio::spawn(async move {
            wait_for_signal().await;
            shutdown.notify_one();
        });

        let mut ticker = interval(Duration::from_millis(simulation.tick_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut rng = fastrand::Rng::new();
        let mut ticks: u64 = 0;

        while self.running.load(AtomicOrdering::Acquire) {
            tokio::select! {
                _ = ticker.tick() => {
                    if simulation.enabled {
                        self.tick(&mut rng);
                    }
                    ticks += 1;
                    if ticks % simulation.summary_every_ticks == 0 {
                        self.log_summary();
                    }
                }
                _ = self.shutdown.notified() => {
                    info!(target: "segmetrics::engine", "Shutdown notification received");
                    break;
                }
            }
        }

        self.running.store(false, AtomicOrdering::Release);
        signal_task.abort();

        info!(
            target: "segmetrics::engine",
            ticks,
            metrics = self.registry.len(),
            uptime_secs = self.uptime().as_secs(),
            "Engine stopped"
        );
        Ok(())
    }
}

async fn wait_for_signal() {
    let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!(target: "segmetrics::engine", "SIGTERM handler unavailable: {}", e);
            if signal::ctrl_c().await.is_ok() {
                info!(target: "segmetrics::engine", "Received SIGINT");
            }
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {
            info!(target: "segmetrics::engine", "Received SIGTERM");
        }
        result = signal::ctrl_c() => match result {
            Ok(()) => info!(target: "segmetrics::engine", "Received SIGINT"),
            Err(e) => warn!(target: "segmetrics::engine", "SIGINT handler failed: {}", e),
        },
    }
}

// ----------------------------------------------------------------------------
// 13.1 Replay - Offline Ingestion From JSON Lines
// ----------------------------------------------------------------------------

/// One replayed sample: `{"metric": "cpu", "value": 42.0, "timestamp": 1700000000}`.
/// `timestamp` is optional and given in Unix seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayRecord {
    pub metric: String,
    pub value: f64,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// Feed JSON-lines records into `registry` in order, one tick per record.
/// Blank lines are skipped. Returns the number of records read.
pub fn replay_samples<R: BufRead>(registry: &MetricRegistry, reader: R) -> EngineResult<usize> {
    let mut records = 0;
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let record: ReplayRecord = serde_json::from_str(line).map_err(|e| EngineError::Replay {
            line: i + 1,
            message: e.to_string(),
        })?;
        let timestamp = record
            .timestamp
            .map(Timestamp::from_secs)
            .unwrap_or_else(Timestamp::now);
        registry.ingest(&record.metric, record.value, timestamp);
        records += 1;
    }
    Ok(records)
}

// ============================================================================
// SECTION 14: CLI & COMMAND LINE INTERFACE
// ============================================================================

// ----------------------------------------------------------------------------
// 14.1 CLI Argument Parser
// ----------------------------------------------------------------------------

/// Segmetrics Engine CLI
#[derive(Parser, Debug)]
#[command(
    name = "segmetrics",
    version,
    about = "Trailing-window metric aggregation engine backed by segment trees",
    long_about = "Segmetrics keeps a bounded trailing window of one-per-second samples \
                  for each named metric and answers sum/min/max/avg queries over any \
                  trailing range in logarithmic time."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "segmetrics.toml", env = "SEGMETRICS_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "SEGMETRICS_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug logging
    #[arg(short, long, env = "SEGMETRICS_DEBUG")]
    pub debug: bool,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the engine with its simulated ticker
    Run,

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show engine version
    Version,

    /// Ingest JSON-lines samples from a file and query one metric
    Replay {
        /// JSON-lines input (`{"metric": "...", "value": ...}` per line)
        #[arg(short, long)]
        input: PathBuf,

        /// Metric to query after replay
        #[arg(short, long)]
        metric: String,

        /// Range start, in seconds before the most recent sample
        #[arg(long, default_value_t = 60)]
        start: u64,

        /// Range end, in seconds before the most recent sample
        #[arg(long, default_value_t = 0)]
        end: u64,

        /// Output format
        #[arg(short = 'o', long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,
    },
}

/// Output format for query results
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Text,
}

// ----------------------------------------------------------------------------
// 14.2 CLI Handler Functions
// ----------------------------------------------------------------------------

/// Handle the validate subcommand
fn handle_validate(config_path: &Path, verbose: bool) -> EngineResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    match EngineConfig::load(config_path) {
        Ok(config) => {
            println!("Configuration is valid");

            if verbose {
                println!();
                println!("{}", "=".repeat(60));
                match toml::to_string_pretty(&config) {
                    Ok(s) => println!("{}", s),
                    Err(e) => println!("Failed to serialize: {}", e),
                }
            }

            println!();
            println!("  • Window capacity: {} samples", config.window.capacity);
            println!("  • Cadence: {} sample(s)/second", SAMPLES_PER_SECOND);
            println!(
                "  • Simulation: {} ({} sources, every {}ms)",
                if config.simulation.enabled { "enabled" } else { "disabled" },
                config.simulation.sources.len(),
                config.simulation.tick_interval_ms
            );
            Ok(())
        }
        Err(e) => {
            println!("Configuration validation failed: {}", e);
            Err(EngineError::Config(e))
        }
    }
}

/// Handle the generate-config subcommand
fn handle_generate_config(output: Option<&Path>) -> EngineResult<()> {
    let config_str = EngineConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("Default configuration written to: {}", path.display());
        }
        None => println!("{}", config_str),
    }

    Ok(())
}

/// Handle the version subcommand
fn handle_version() {
    println!("{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    println!();
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!("  • Backing structure: {}", TREE_TYPE);
    println!("  • Aggregates: sum, min, max (avg derived)");
}

/// Handle the replay subcommand
fn handle_replay(
    config: &EngineConfig,
    input: &Path,
    metric: &str,
    start: u64,
    end: u64,
    format: OutputFormat,
) -> EngineResult<WindowStats> {
    let started = Instant::now();
    let registry = MetricRegistry::new(config.window.capacity);
    let reader = BufReader::new(File::open(input)?);
    let records = replay_samples(&registry, reader)?;

    let stats = registry.query(metric, start, end)?;
    info!(
        target: "segmetrics::replay",
        records,
        metrics = registry.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Replay complete"
    );

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
        OutputFormat::Text => {
            println!("{}: {}", metric, stats);
            if let Some(latest) = registry.get(metric).and_then(|engine| engine.latest()) {
                println!("  latest sample at {}", latest.timestamp);
            }
        }
    }
    Ok(stats)
}

// ============================================================================
// SECTION 15: MAIN ENTRY POINT
// ============================================================================

/// Main entry point for the segmetrics binary
#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    // Subcommands that don't need logging or a loaded config
    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        _ => {}
    }

    let config_found = cli.config.exists();
    let config = if config_found {
        EngineConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    } else {
        EngineConfig::default()
    };

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }
    init_logging(&logging_config)?;

    if !config_found {
        warn!(
            target: "segmetrics::init",
            "Config file not found at {}, using defaults",
            cli.config.display()
        );
    }

    match cli.command {
        Some(Commands::Replay {
            input,
            metric,
            start,
            end,
            format,
        }) => {
            handle_replay(&config, &input, &metric, start, end, format)
                .with_context(|| format!("Replay of {} failed", input.display()))?;
        }
        Some(Commands::Run) | None => {
            info!("{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
            let engine = Engine::new(config)?;
            engine.run().await?;
        }
        Some(Commands::Version) | Some(Commands::GenerateConfig { .. }) | Some(Commands::Validate { .. }) => {}
    }

    Ok(())
}

// ============================================================================
// SECTION 16: TESTS
// ============================================================================


#[cfg(test)]
mod window_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn ticked(capacity: usize, ticks: usize) -> WindowManager {
        let mut window = WindowManager::new(capacity);
        for _ in 0..ticks {
            window.record_tick();
        }
        window
    }

    #[test]
    fn test_record_tick_advances_and_wraps() {
        let mut window = WindowManager::new(3);
        assert_eq!(window.record_tick(), 0);
        assert_eq!(window.record_tick(), 1);
        assert_eq!(window.record_tick(), 2);
        assert!(window.is_full());
        assert_eq!(window.record_tick(), 0);
        assert_eq!(window.filled(), 3);
        assert_eq!(window.total_ingested(), 4);
        assert_eq!(window.head(), 1);
    }

    #[test]
    fn test_empty_window_resolves_to_nothing() {
        let window = WindowManager::new(8);
        let resolved = window.resolve(TrailingRange::last_seconds(60));
        assert!(resolved.is_empty());
        assert!(resolved.spans().is_empty());
        assert_eq!(window.newest_index(), None);
        assert_eq!(window.oldest_index(), None);
    }

    #[test]
    fn test_reversed_range_rejected() {
        let window = ticked(8, 4);
        let err = window.resolve_range(5, 10).unwrap_err();
        assert!(matches!(err, EngineError::InvalidRange { start: 5, end: 10 }));
    }

    #[test]
    fn test_startup_clamps_start() {
        let window = ticked(3600, 10);
        let resolved = window.resolve_range(60, 0).unwrap();
        assert_eq!(resolved.count(), 10);
        assert_eq!(resolved.spans(), &[IndexSpan::new(0, 9)]);
    }

    #[test]
    fn test_end_before_oldest_sample_is_empty() {
        let window = ticked(3600, 10);
        assert!(window.resolve_range(30, 10).unwrap().is_empty());
        assert_eq!(window.resolve_range(30, 9).unwrap().count(), 1);
    }

    #[test]
    fn test_latest_only() {
        let window = ticked(5, 7);
        let resolved = window.resolve_range(0, 0).unwrap();
        assert_eq!(resolved.count(), 1);
        assert_eq!(resolved.spans(), &[IndexSpan::new(1, 1)]);
    }

    #[test]
    fn test_full_window_wraps_into_two_spans() {
        // head = 2 after seven ticks into five slots; slots 2..=4 are oldest
        let window = ticked(5, 7);
        assert_eq!(window.oldest_index(), Some(2));
        assert_eq!(window.newest_index(), Some(1));

        let resolved = window.resolve_range(3600, 0).unwrap();
        assert!(resolved.wraps());
        assert_eq!(resolved.count(), 5);
        assert_eq!(resolved.spans(), &[IndexSpan::new(2, 4), IndexSpan::new(0, 1)]);
        assert_eq!(resolved.indices().collect::<Vec<_>>(), vec![2, 3, 4, 0, 1]);
    }

    #[test]
    fn test_full_window_aligned_is_single_span() {
        let window = ticked(5, 10);
        let resolved = window.resolve_range(4, 0).unwrap();
        assert!(!resolved.wraps());
        assert_eq!(resolved.spans(), &[IndexSpan::new(0, 4)]);
    }

    #[rstest]
    // capacity, ticks, start, end, expected spans, expected count
    #[case(5, 7, 1, 0, vec![IndexSpan::new(0, 1)], 2)]
    #[case(5, 7, 2, 0, vec![IndexSpan::new(4, 4), IndexSpan::new(0, 1)], 3)]
    #[case(5, 7, 4, 2, vec![IndexSpan::new(2, 4)], 3)]
    #[case(5, 7, 3, 1, vec![IndexSpan::new(3, 4), IndexSpan::new(0, 0)], 3)]
    #[case(8, 3, 2, 1, vec![IndexSpan::new(0, 1)], 2)]
    #[case(1, 9, 10, 0, vec![IndexSpan::new(0, 0)], 1)]
    fn test_resolve_cases(
        #[case] capacity: usize,
        #[case] ticks: usize,
        #[case] start: u64,
        #[case] end: u64,
        #[case] spans: Vec<IndexSpan>,
        #[case] count: usize,
    ) {
        let window = ticked(capacity, ticks);
        let resolved = window.resolve_range(start, end).unwrap();
        assert_eq!(resolved.spans(), spans.as_slice());
        assert_eq!(resolved.count(), count);
        let covered: usize = resolved.spans().iter().map(IndexSpan::len).sum();
        assert_eq!(covered, count);
    }

    #[test]
    fn test_trailing_range_validation() {
        assert!(TrailingRange::new(10, 10).is_ok());
        assert!(TrailingRange::new(9, 10).is_err());
        assert!(TrailingRange::from_signed(-1, 0).is_err());
        assert!(TrailingRange::from_signed(5, -2).is_err());
        assert_eq!(
            TrailingRange::from_signed(60, 0).unwrap(),
            TrailingRange::last_seconds(60)
        );
        assert_eq!(TrailingRange::latest().start_secs_ago(), 0);
    }

    #[test]
    fn test_deserialized_range_is_validated() {
        let reversed = serde_json::from_str::<TrailingRange>(r#"{"start_secs_ago":1,"end_secs_ago":3}"#);
        assert!(reversed.is_err());

        let range: TrailingRange = serde_json::from_str(r#"{"start_secs_ago":60,"end_secs_ago":0}"#).unwrap();
        assert_eq!(range, TrailingRange::last_seconds(60));
        assert_eq!(serde_json::to_value(range).unwrap()["start_secs_ago"], 60);
    }

    #[test]
    fn test_unordered_range_resolves_to_nothing() {
        let window = ticked(5, 5);
        let reversed = TrailingRange {
            start_secs_ago: 1,
            end_secs_ago: 3,
        };
        assert!(window.resolve(reversed).is_empty());
    }
}

#[cfg(test)]
mod engine_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn filled_engine(capacity: usize, values: impl IntoIterator<Item = f64>) -> MetricsEngine {
        let engine = MetricsEngine::with_capacity("test", capacity);
        for (i, value) in values.into_iter().enumerate() {
            engine.ingest(value, Timestamp::from_secs(i as i64)).unwrap();
        }
        engine
    }

    #[test]
    fn test_one_minute_of_samples() {
        let engine = filled_engine(DEFAULT_WINDOW_CAPACITY, (1..=60).map(f64::from));
        let stats = engine.query(60, 0).unwrap();

        assert_eq!(
            stats,
            WindowStats {
                sum: 1830.0,
                min: 1.0,
                max: 60.0,
                avg: 30.5,
                count: 60,
            }
        );
    }

    #[test]
    fn test_boundary_query_returns_latest() {
        let engine = filled_engine(DEFAULT_WINDOW_CAPACITY, [3.0, 9.0, 4.5]);
        let stats = engine.query(0, 0).unwrap();

        assert_eq!(stats.count, 1);
        assert_eq!(stats.min, 4.5);
        assert_eq!(stats.max, 4.5);
        assert_eq!(stats.avg, 4.5);
        assert_eq!(engine.latest().map(|s| s.value), Some(4.5));
    }

    #[test]
    fn test_startup_clamp() {
        let engine = filled_engine(DEFAULT_WINDOW_CAPACITY, (1..=10).map(f64::from));
        let stats = engine.query(60, 0).unwrap();

        assert_eq!(stats.count, 10);
        assert_eq!(stats.sum, 55.0);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 10.0);
    }

    #[test]
    fn test_wrap_around() {
        let engine = filled_engine(5, [10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0]);

        let slots: Vec<Option<f64>> = engine.state.read().buffer.slots().collect();
        assert_eq!(slots, vec![Some(60.0), Some(70.0), Some(30.0), Some(40.0), Some(50.0)]);

        let stats = engine.query(3600, 0).unwrap();
        assert_eq!(stats.sum, 250.0);
        assert_eq!(stats.min, 30.0);
        assert_eq!(stats.max, 70.0);
        assert_eq!(stats.count, 5);
        assert_eq!(stats.avg, 50.0);
    }

    #[test]
    fn test_invalid_range_rejected() {
        let engine = filled_engine(10, [1.0, 2.0]);
        let err = engine.query(5, 10).unwrap_err();
        assert!(matches!(err, EngineError::InvalidRange { .. }));
        assert_eq!(err.category(), "invalid_range");
    }

    #[test]
    fn test_no_data_returns_zeroed_stats() {
        let engine = MetricsEngine::with_capacity("idle", 10);
        assert_eq!(engine.query(60, 0).unwrap(), WindowStats::empty());
        assert_eq!(engine.latest(), None);

        let engine = filled_engine(10, [1.0, 2.0, 3.0]);
        assert_eq!(engine.query(8, 5).unwrap(), WindowStats::empty());
    }

    #[test]
    fn test_non_finite_samples_dropped() {
        let engine = filled_engine(4, [1.0, 2.0]);
        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let err = engine.ingest(bad, Timestamp::now()).unwrap_err();
            assert!(matches!(err, EngineError::InvalidSample { .. }));
        }

        assert_eq!(engine.dropped(), 3);
        assert_eq!(engine.filled(), 2);
        assert_eq!(engine.total_ingested(), 2);
        let stats = engine.query(10, 0).unwrap();
        assert_eq!(stats.sum, 3.0);
        assert_eq!(stats.max, 2.0);
    }

    #[test]
    fn test_update_reflection_with_eviction() {
        let engine = filled_engine(4, [5.0, 6.0, 7.0, 8.0]);
        let before = engine.query(3, 0).unwrap();
        assert_eq!(before.sum, 26.0);

        // Buffer is full: ingesting 2.0 evicts the 5.0
        engine.ingest(2.0, Timestamp::now()).unwrap();
        let after = engine.query(3, 0).unwrap();

        assert!(after.max >= 2.0);
        assert!(after.min <= 2.0);
        assert_eq!(after.sum, before.sum - 5.0 + 2.0);
        assert_eq!(after.count, 4);
    }

    #[test]
    fn test_update_reflection_while_filling() {
        let engine = filled_engine(8, [5.0, 6.0, 7.0]);
        let before = engine.query(60, 0).unwrap();

        engine.ingest(2.5, Timestamp::now()).unwrap();
        let after = engine.query(60, 0).unwrap();

        assert_eq!(after.sum, before.sum + 2.5);
        assert_eq!(after.count, before.count + 1);
        assert_eq!(after.min, 2.5);
        assert_eq!(after.max, before.max);
    }

    #[test]
    #[should_panic(expected = "non-zero")]
    fn test_zero_capacity_engine_panics() {
        let _ = MetricsEngine::with_capacity("empty", 0);
    }

    #[test]
    fn test_interior_range() {
        let engine = filled_engine(10, (1..=10).map(f64::from));
        // 9s..3s ago covers values 1..=7
        let stats = engine.query(9, 3).unwrap();
        assert_eq!(stats.count, 7);
        assert_eq!(stats.sum, 28.0);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 7.0);
    }

    #[test]
    fn test_samples_are_chronological() {
        let engine = filled_engine(5, [10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0]);
        let values: Vec<f64> = engine
            .samples(TrailingRange::last_seconds(10))
            .iter()
            .map(|s| s.value)
            .collect();
        assert_eq!(values, vec![30.0, 40.0, 50.0, 60.0, 70.0]);

        let recent = engine.samples(TrailingRange::new(1, 0).unwrap());
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].timestamp, Timestamp::from_secs(6));
    }

    #[test]
    fn test_status() {
        let engine = filled_engine(3, [1.0, 2.0, 3.0, 4.0]);
        let status = engine.status();
        assert_eq!(status.name, "test");
        assert_eq!(status.capacity, 3);
        assert_eq!(status.filled, 3);
        assert_eq!(status.total_ingested, 4);
        assert_eq!(status.latest.map(|s| s.value), Some(4.0));
        assert_eq!(status.created_at, engine.created_at());
        assert!(status.created_at <= Timestamp::now());
    }

    #[test]
    fn test_timestamp_display() {
        let stamp = Timestamp::from_secs(1_700_000_000);
        assert_eq!(stamp.to_string(), "2023-11-14 22:13:20.000 UTC");
        assert_eq!(stamp.as_secs(), 1_700_000_000);
        assert_eq!(
            Timestamp::from_secs(5).duration_since(Timestamp::from_secs(2)),
            Duration::from_secs(3)
        );
        assert_eq!(Timestamp::from_secs(2).duration_since(Timestamp::from_secs(5)), Duration::ZERO);
    }

    #[test]
    fn test_stats_wire_shape() {
        let stats = WindowStats::from_partials(10.0, 1.0, 4.0, 4);
        let json = serde_json::to_value(stats).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "sum": 10.0, "min": 1.0, "max": 4.0, "avg": 2.5, "count": 4 })
        );
        assert_eq!(stats.value(AggregateKind::Max), 4.0);
    }

    #[test]
    fn test_concurrent_readers_see_consistent_trees() {
        const CAPACITY: usize = 64;
        const WRITES: usize = 5_000;

        let engine = MetricsEngine::with_capacity("concurrent", CAPACITY);
        engine.ingest(0.0, Timestamp::now()).unwrap();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for i in 1..WRITES {
                    engine.ingest(i as f64, Timestamp::now()).unwrap();
                }
            });

            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..2_000 {
                        // The window always holds consecutive integers, so the
                        // three trees must agree with each other exactly.
                        let stats = engine.query(CAPACITY as u64, 0).unwrap();
                        let n = stats.count as f64;
                        assert_eq!(stats.max - stats.min, n - 1.0);
                        assert_eq!(stats.sum, n * (stats.min + stats.max) / 2.0);
                    }
                });
            }
        });

        assert_eq!(engine.total_ingested(), WRITES as u64);
        assert_eq!(engine.latest().map(|s| s.value), Some((WRITES - 1) as f64));
    }

    proptest! {
        #[test]
        fn prop_capacity_invariant(capacity in 1usize..20, extra in 0usize..50) {
            let total = capacity + extra;
            let engine = filled_engine(capacity, (0..total).map(|i| i as f64));

            prop_assert_eq!(engine.filled(), capacity);
            let retained: Vec<f64> = engine
                .samples(TrailingRange::last_seconds(u64::MAX))
                .iter()
                .map(|s| s.value)
                .collect();
            let expected: Vec<f64> = (extra..total).map(|i| i as f64).collect();
            prop_assert_eq!(retained, expected);
        }
    }
}


#[cfg(test)]
mod config_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.window.capacity, DEFAULT_WINDOW_CAPACITY);
        assert_eq!(config.simulation.tick_interval_ms, DEFAULT_TICK_INTERVAL_MS);
        assert_eq!(config.simulation.sources.len(), 3);
        assert!(config.simulation.sources[2].integer);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config_round_trips_through_toml() {
        let rendered = EngineConfig::generate_default_config();
        let parsed = EngineConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(parsed.window.capacity, DEFAULT_WINDOW_CAPACITY);
        assert_eq!(parsed.simulation.sources, default_sources());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config = EngineConfig::from_toml_str("[window]\ncapacity = 120\n").unwrap();
        assert_eq!(config.window.capacity, 120);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = EngineConfig::from_toml_str("[window]\ncapacity = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "window.capacity"));

        let err = EngineConfig::from_toml_str("[simulation]\ntick_interval_ms = 1\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let toml = "[[simulation.sources]]\nname = \"cpu\"\nmin = 90.0\nmax = 10.0\n";
        assert!(EngineConfig::from_toml_str(toml).is_err());

        assert!(matches!(
            EngineConfig::from_toml_str("[window\n"),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[window]\ncapacity = 300\n\n[simulation]\nenabled = false").unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.window.capacity, 300);
        assert!(!config.simulation.enabled);

        let missing = EngineConfig::load("/nonexistent/segmetrics.toml");
        assert!(matches!(missing, Err(ConfigError::FileNotFound { .. })));
    }

    #[test]
    fn test_simulated_source_draws_within_range() {
        let mut rng = fastrand::Rng::with_seed(7);
        let source = SimulatedSource::new("requests", 100.0, 1000.0).integer();
        for _ in 0..1_000 {
            let value = source.draw(&mut rng);
            assert!((100.0..=1000.0).contains(&value));
            assert_eq!(value.fract(), 0.0);
        }
    }
}

#[cfg(test)]
mod runtime_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn fast_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.window.capacity = 32;
        config.simulation.tick_interval_ms = MIN_TICK_INTERVAL_MS;
        config.simulation.summary_every_ticks = 2;
        config
    }

    #[test]
    fn test_tick_ingests_every_source() {
        let engine = Engine::new(fast_config()).unwrap();
        let mut rng = fastrand::Rng::with_seed(1);
        engine.tick(&mut rng);
        engine.tick(&mut rng);

        let health = engine.health();
        assert_eq!(health.status, "healthy");
        assert_eq!(health.tree_type, TREE_TYPE);
        let names: Vec<&str> = health.metrics.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["cpu", "memory", "requests"]);
        assert!(health.metrics.iter().all(|m| m.filled == 2));

        let cpu = engine.registry().query("cpu", 60, 0).unwrap();
        assert!(cpu.min >= 20.0 && cpu.max <= 80.0);
    }

    #[test]
    fn test_engine_rejects_invalid_config() {
        let mut config = fast_config();
        config.window.capacity = 0;
        assert!(matches!(Engine::new(config), Err(EngineError::Config(_))));
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let engine = Arc::new(Engine::new(fast_config()).unwrap());
        let runner = Arc::clone(&engine);
        let handle = tokio::spawn(async move { runner.run().await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        engine.shutdown();
        handle.await.unwrap().unwrap();

        assert!(!engine.is_running());
        assert!(engine.registry().get_or_create("cpu").total_ingested() > 0);
        assert!(engine.metrics().ingested("cpu") > 0);
    }
}
