//! Unified logging module for ValveLink services
//!
//! Console output plus an optional daily-rolling file, both behind a single
//! reloadable filter so the level can change at runtime.

use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{reload, EnvFilter, Registry};

/// Custom format for log level with brackets: `[INFO]`, `[WARN]`, etc.
fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// Event formatter that outputs: `timestamp [LEVEL] message`
///
/// Example output: `2026-03-02T00:50:44.809123Z [INFO] Link connected`
struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m",
                Level::DEBUG => "\x1b[34m",
                Level::INFO => "\x1b[32m",
                Level::WARN => "\x1b[33m",
                Level::ERROR => "\x1b[31m",
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

// Keeps the non-blocking file writer alive for the process lifetime
static GUARD: OnceLock<Mutex<Option<WorkerGuard>>> = OnceLock::new();

// ============================================================================
// Log Root Directory Configuration
// ============================================================================

/// Global log root directory (initialized once from config or env)
/// Priority: VALVE_LOG_DIR env > config_dir > default "logs"
static LOG_ROOT: OnceLock<PathBuf> = OnceLock::new();

/// Environment variable that overrides the log directory
pub const LOG_DIR_ENV: &str = "VALVE_LOG_DIR";

/// Initialize log root directory from config or environment
pub fn init_log_root(config_dir: Option<&str>) {
    LOG_ROOT.get_or_init(|| resolve_log_root(std::env::var(LOG_DIR_ENV).ok(), config_dir));
}

/// Get log root directory, falling back to env or "logs" if not initialized
pub fn get_log_root() -> PathBuf {
    LOG_ROOT
        .get()
        .cloned()
        .unwrap_or_else(|| resolve_log_root(std::env::var(LOG_DIR_ENV).ok(), None))
}

fn resolve_log_root(env_dir: Option<String>, config_dir: Option<&str>) -> PathBuf {
    env_dir
        .filter(|d| !d.is_empty())
        .map(PathBuf::from)
        .or_else(|| config_dir.map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("logs"))
}

// ============================================================================
// Initialization
// ============================================================================

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub service_name: String,
    pub log_dir: PathBuf,
    /// Bare level (`debug`) or an `EnvFilter` directive list; RUST_LOG wins
    pub filter: String,
    /// Write a daily-rolling `{service}.log.YYYY-MM-DD` file
    pub enable_file: bool,
    /// JSON lines in the file layer instead of bracketed text
    pub enable_json: bool,
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "valvesrv".to_string(),
            log_dir: get_log_root(),
            filter: "info".to_string(),
            enable_file: true,
            enable_json: false,
            ansi: true,
        }
    }
}

/// Reload handle plus the directives it currently holds
struct FilterControl {
    handle: reload::Handle<EnvFilter, Registry>,
    current: Mutex<String>,
}

static FILTER: OnceLock<FilterControl> = OnceLock::new();

/// Expand a bare level so the service's own target follows it
fn directives(service_name: &str, filter: &str) -> String {
    let filter = filter.trim();
    match filter.parse::<Level>() {
        Ok(level) => {
            let level = level.as_str().to_lowercase();
            format!("{},{}={}", level, service_name, level)
        },
        Err(_) if filter.is_empty() => "info".to_string(),
        Err(_) => filter.to_string(),
    }
}

/// Initialize the global subscriber
pub fn init_with_config(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    let initial = match std::env::var("RUST_LOG") {
        Ok(env) if !env.trim().is_empty() => env,
        _ => directives(&config.service_name, &config.filter),
    };
    let (filter_layer, handle) = reload::Layer::new(EnvFilter::try_new(&initial)?);
    let _ = FILTER.set(FilterControl {
        handle,
        current: Mutex::new(initial),
    });

    let console_layer = fmt::layer()
        .with_ansi(config.ansi)
        .event_format(BracketedLevelFormat)
        .boxed();

    let file_layer = if config.enable_file {
        std::fs::create_dir_all(&config.log_dir)?;
        let appender = tracing_appender::rolling::daily(
            &config.log_dir,
            format!("{}.log", config.service_name),
        );
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        let slot = GUARD.get_or_init(|| Mutex::new(None));
        match slot.lock() {
            Ok(mut g) => *g = Some(guard),
            Err(poisoned) => *poisoned.into_inner() = Some(guard),
        }

        let layer = if config.enable_json {
            fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_target(true)
                .boxed()
        } else {
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .event_format(BracketedLevelFormat)
                .boxed()
        };
        Some(layer)
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    tracing::info!("Logging: {} @ {:?}", config.service_name, config.log_dir);
    Ok(())
}

/// Swap the active filter without restarting
///
/// Takes the same forms as [`LogConfig::filter`].
pub fn set_log_level(filter: &str) -> Result<(), String> {
    let control = FILTER
        .get()
        .ok_or_else(|| "logging is not initialized".to_string())?;
    let parsed = EnvFilter::try_new(filter).map_err(|e| format!("bad filter '{}': {}", filter, e))?;
    control
        .handle
        .reload(parsed)
        .map_err(|e| format!("filter reload failed: {}", e))?;

    match control.current.lock() {
        Ok(mut current) => *current = filter.to_string(),
        Err(poisoned) => *poisoned.into_inner() = filter.to_string(),
    }
    tracing::info!("Log filter now: {}", filter);
    Ok(())
}

/// Active filter directives, `None` before initialization
pub fn get_log_level() -> Option<String> {
    let control = FILTER.get()?;
    let current = match control.current.lock() {
        Ok(current) => current.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    };
    Some(current)
}
