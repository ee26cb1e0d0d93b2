//! Startup flags shared by ValveLink binaries
//!
//! Services flatten [`ServiceArgs`] into their own clap `Args`. Anything left
//! unset on the command line falls back to the service's configuration file.

#[cfg(feature = "cli")]
use clap::Args;

#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "cli", derive(Args))]
pub struct ServiceArgs {
    /// Console log level or filter; overrides `logging.level`
    #[cfg_attr(feature = "cli", arg(short = 'l', long, env = "RUST_LOG"))]
    pub log_level: Option<String>,

    /// Shorthand for `--log-level debug`
    #[cfg_attr(feature = "cli", arg(long, env = "DEBUG"))]
    pub debug: bool,

    /// Plain console output, no banner
    #[cfg_attr(feature = "cli", arg(long))]
    pub no_color: bool,

    /// Load and check the configuration, then exit
    #[cfg_attr(feature = "cli", arg(long))]
    pub validate: bool,

    /// Log directory; overrides `logging.dir`
    #[cfg_attr(feature = "cli", arg(long, env = "VALVE_LOG_DIR"))]
    pub log_dir: Option<String>,
}

impl ServiceArgs {
    /// Level to log at, given the configured fallback
    ///
    /// `--debug` wins over `--log-level`, which wins over the config.
    pub fn effective_level<'a>(&'a self, configured: &'a str) -> &'a str {
        if self.debug {
            return "debug";
        }
        self.log_level
            .as_deref()
            .filter(|l| !l.trim().is_empty())
            .unwrap_or(configured)
    }

    pub fn effective_log_dir<'a>(&'a self, configured: Option<&'a str>) -> Option<&'a str> {
        self.log_dir.as_deref().or(configured)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_config_level_used_when_flag_absent() {
        let args = ServiceArgs::default();
        assert_eq!(args.effective_level("warn"), "warn");
        assert_eq!(args.effective_log_dir(Some("/var/log/valve")), Some("/var/log/valve"));
    }

    #[test]
    fn test_flags_override_config() {
        let args = ServiceArgs {
            log_level: Some("trace".to_string()),
            log_dir: Some("logs".to_string()),
            ..Default::default()
        };
        assert_eq!(args.effective_level("info"), "trace");
        assert_eq!(args.effective_log_dir(Some("/var/log/valve")), Some("logs"));

        let args = ServiceArgs {
            debug: true,
            ..args
        };
        assert_eq!(args.effective_level("info"), "debug");
    }

    #[test]
    fn test_blank_level_falls_back() {
        let args = ServiceArgs {
            log_level: Some("  ".to_string()),
            ..Default::default()
        };
        assert_eq!(args.effective_level("error"), "error");
    }
}
