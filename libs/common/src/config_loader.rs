//! Configuration loading helper functions
//!
//! Layers, lowest to highest priority:
//! 1. Compiled defaults
//! 2. Config file (yaml, yml, json or toml by extension)
//! 3. Prefixed environment variables, nested keys split on `__`

use std::path::Path;

use errors::{ValveError, ValveResult};
use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};

/// Build the layered [`Figment`] without extracting it
pub fn layered_figment<T>(defaults: &T, file: Option<&Path>, env_prefix: &str) -> ValveResult<Figment>
where
    T: Serialize,
{
    let mut figment = Figment::from(Serialized::defaults(defaults));

    if let Some(path) = file {
        if !path.exists() {
            return Err(ValveError::InvalidConfig {
                field: "config".to_string(),
                reason: format!("file not found: {}", path.display()),
            });
        }

        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or_default();

        figment = match extension {
            "yaml" | "yml" => figment.merge(Yaml::file(path)),
            "json" => figment.merge(Json::file(path)),
            "toml" => figment.merge(Toml::file(path)),
            other => {
                return Err(ValveError::InvalidConfig {
                    field: "config".to_string(),
                    reason: format!("unsupported config format: '{}'", other),
                })
            },
        };
        info!("Config file: {}", path.display());
    }

    debug!("Env overrides: {}*", env_prefix);
    Ok(figment.merge(Env::prefixed(env_prefix).split("__")))
}

/// Load a configuration struct from defaults, an optional file and environment
pub fn load_layered<T>(defaults: &T, file: Option<&Path>, env_prefix: &str) -> ValveResult<T>
where
    T: Serialize + DeserializeOwned,
{
    layered_figment(defaults, file, env_prefix)?
        .extract()
        .map_err(|e| ValveError::Configuration(format!("Failed to load configuration: {}", e)))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::io::Write;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Sample {
        name: String,
        port: u16,
        nested: Nested,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Nested {
        limit: u32,
    }

    fn defaults() -> Sample {
        Sample {
            name: "default".into(),
            port: 1000,
            nested: Nested { limit: 5 },
        }
    }

    #[test]
    fn test_defaults_only() {
        let loaded: Sample = load_layered(&defaults(), None, "CLTEST_DEFAULTS_").unwrap();
        assert_eq!(loaded, defaults());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "port: 2000\nnested:\n  limit: 9").unwrap();

        let loaded: Sample =
            load_layered(&defaults(), Some(file.path()), "CLTEST_FILE_").unwrap();
        assert_eq!(loaded.name, "default");
        assert_eq!(loaded.port, 2000);
        assert_eq!(loaded.nested.limit, 9);
    }

    #[test]
    fn test_env_overrides_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "port: 2000").unwrap();
        std::env::set_var("CLTEST_ENV_PORT", "3000");
        std::env::set_var("CLTEST_ENV_NESTED__LIMIT", "42");

        let loaded: Sample = load_layered(&defaults(), Some(file.path()), "CLTEST_ENV_").unwrap();
        assert_eq!(loaded.port, 3000);
        assert_eq!(loaded.nested.limit, 42);

        std::env::remove_var("CLTEST_ENV_PORT");
        std::env::remove_var("CLTEST_ENV_NESTED__LIMIT");
    }

    #[test]
    fn test_missing_file_is_error() {
        let result: ValveResult<Sample> = load_layered(
            &defaults(),
            Some(Path::new("/nonexistent/valve.yaml")),
            "CLTEST_MISSING_",
        );
        assert!(matches!(result, Err(ValveError::InvalidConfig { .. })));
    }

    #[test]
    fn test_unsupported_extension() {
        let file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        let result: ValveResult<Sample> =
            load_layered(&defaults(), Some(file.path()), "CLTEST_INI_");
        assert!(matches!(result, Err(ValveError::InvalidConfig { .. })));
    }
}
