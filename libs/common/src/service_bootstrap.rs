//! Unified service bootstrap utilities
//!
//! Startup banner, logging initialization and development environment setup.

use crate::logging::{self, LogConfig};
use tracing::info;

/// Service metadata for startup
pub struct ServiceInfo {
    /// Service name (e.g., "valvesrv")
    pub name: String,
    /// Service version from Cargo.toml
    pub version: String,
    /// Service description
    pub description: String,
}

impl ServiceInfo {
    /// Create new service info
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: description.into(),
        }
    }
}

/// Logging options resolved from the service configuration
#[derive(Debug, Clone, Default)]
pub struct LoggingOptions<'a> {
    /// Level or filter directives, `info` when unset
    pub level: Option<&'a str>,
    pub dir: Option<&'a str>,
    pub file: bool,
    pub json: bool,
    pub no_color: bool,
}

/// Print unified startup banner
pub fn print_startup_banner(service: &ServiceInfo) {
    let banner = r#"
 ██╗   ██╗ █████╗ ██╗    ██╗   ██╗███████╗
 ██║   ██║██╔══██╗██║    ██║   ██║██╔════╝
 ██║   ██║███████║██║    ██║   ██║█████╗
 ╚██╗ ██╔╝██╔══██║██║    ╚██╗ ██╔╝██╔══╝
  ╚████╔╝ ██║  ██║███████╗╚████╔╝ ███████╗
   ╚═══╝  ╚═╝  ╚═╝╚══════╝ ╚═══╝  ╚══════╝
            "#;

    info!("{}", banner);
    info!("");
    info!(" {} v{}", service.name.to_uppercase(), service.version);
    info!(" {}", service.description);
    info!("");
}

/// Initialize logging for a service
///
/// Log root directory priority:
/// 1. VALVE_LOG_DIR environment variable
/// 2. `options.dir` from the service config
/// 3. Default "logs"
pub fn init_logging(service: &ServiceInfo, options: &LoggingOptions<'_>) -> anyhow::Result<()> {
    logging::init_log_root(options.dir);

    let log_config = LogConfig {
        service_name: service.name.clone(),
        log_dir: logging::get_log_root().join(&service.name),
        filter: options.level.unwrap_or("info").to_string(),
        enable_file: options.file,
        enable_json: options.json,
        ansi: !options.no_color,
    };

    logging::init_with_config(log_config).map_err(|e| anyhow::anyhow!("{}", e))?;

    Ok(())
}

/// Load environment variables in development mode
///
/// In debug builds, reads a `.env` file without overriding variables that
/// are already set. No-op in release builds.
pub fn load_development_env() {
    #[cfg(debug_assertions)]
    {
        if let Ok(content) = std::fs::read_to_string(".env") {
            for (key, value) in parse_env_lines(&content) {
                if std::env::var(key).is_err() {
                    std::env::set_var(key, value);
                }
            }
        }
    }
}

/// Parse `KEY=VALUE` lines, skipping comments and blanks
fn parse_env_lines(content: &str) -> Vec<(&str, &str)> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| l.split_once('='))
        .map(|(k, v)| (k.trim(), v.trim()))
        .collect()
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_service_info_creation() {
        let service = ServiceInfo::new("valvesrv", "0.1.0", "Valve safety service");
        assert_eq!(service.name, "valvesrv");
        assert_eq!(service.version, "0.1.0");
        assert_eq!(service.description, "Valve safety service");
    }

    #[test]
    fn test_parse_env_lines() {
        let parsed = parse_env_lines("# comment\n\nVALVESRV_LINK__BAUD = 9600\nbroken\nA=b=c\n");
        assert_eq!(parsed, vec![("VALVESRV_LINK__BAUD", "9600"), ("A", "b=c")]);
    }
}
