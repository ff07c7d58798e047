//! Configuration loading
//!
//! Layers, lowest priority first:
//! 1. Serialized `T::default()`
//! 2. Optional config file, format chosen by extension (toml, yaml/yml, json)
//! 3. Environment variables `{PREFIX}_SECTION__FIELD`

use std::path::Path;

use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{Error, Result};

/// Builds the layered figment without extracting it
pub fn figment_for<T>(path: Option<&Path>, env_prefix: &str) -> Result<Figment>
where
    T: Serialize + Default,
{
    let mut figment = Figment::from(Serialized::defaults(T::default()));

    if let Some(path) = path {
        if !path.exists() {
            return Err(Error::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .ok_or_else(|| Error::Config("Config file must have an extension".to_string()))?;

        figment = match extension {
            "toml" => figment.merge(Toml::file(path)),
            "yaml" | "yml" => figment.merge(Yaml::file(path)),
            "json" => figment.merge(Json::file(path)),
            _ => {
                return Err(Error::Config(format!(
                    "Unsupported config file format: {}",
                    extension
                )))
            },
        };
        debug!("Config file: {}", path.display());
    }

    Ok(figment.merge(Env::prefixed(&format!("{}_", env_prefix)).split("__")))
}

/// Loads `T` from defaults, an optional file and prefixed environment variables
pub fn load_config<T>(path: Option<&Path>, env_prefix: &str) -> Result<T>
where
    T: Serialize + for<'de> Deserialize<'de> + Default,
{
    let config = figment_for::<T>(path, env_prefix)?
        .extract()
        .map_err(|e| Error::Config(format!("Failed to load configuration: {}", e)))?;
    match path {
        Some(path) => info!("Config loaded: {}", path.display()),
        None => info!("Config loaded: defaults + {}_*", env_prefix),
    }
    Ok(config)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use std::io::Write;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    struct Sample {
        name: String,
        port: u16,
        inner: Inner,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    struct Inner {
        retries: u32,
        enabled: bool,
    }

    impl Default for Sample {
        fn default() -> Self {
            Self {
                name: "plc".to_string(),
                port: 502,
                inner: Inner::default(),
            }
        }
    }

    impl Default for Inner {
        fn default() -> Self {
            Self {
                retries: 3,
                enabled: true,
            }
        }
    }

    fn write_temp(suffix: &str, content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_without_file() {
        let config: Sample = load_config(None, "CFGTEST_NONE").unwrap();
        assert_eq!(config, Sample::default());
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let file = write_temp(".toml", "port = 1502\n\n[inner]\nretries = 7\n");
        let config: Sample = load_config(Some(file.path()), "CFGTEST_TOML").unwrap();
        assert_eq!(config.port, 1502);
        assert_eq!(config.inner.retries, 7);
        assert!(config.inner.enabled);
        assert_eq!(config.name, "plc");
    }

    #[test]
    fn test_yaml_and_json_files() {
        let yaml = write_temp(".yaml", "name: boiler\ninner:\n  enabled: false\n");
        let config: Sample = load_config(Some(yaml.path()), "CFGTEST_YAML").unwrap();
        assert_eq!(config.name, "boiler");
        assert!(!config.inner.enabled);

        let json = write_temp(".json", r#"{"port": 10502}"#);
        let config: Sample = load_config(Some(json.path()), "CFGTEST_JSON").unwrap();
        assert_eq!(config.port, 10502);
    }

    #[test]
    fn test_unsupported_extension() {
        let file = write_temp(".ini", "port=1");
        let err = load_config::<Sample>(Some(file.path()), "CFGTEST_INI").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = load_config::<Sample>(Some(Path::new("/nonexistent/plc.toml")), "CFGTEST_MISSING")
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_env_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("link.toml", "port = 1502\n[inner]\nretries = 7\n")?;
            jail.set_env("CFGTEST_ENV_PORT", "2502");
            jail.set_env("CFGTEST_ENV_INNER__RETRIES", "9");

            let config: Sample = load_config(Some(Path::new("link.toml")), "CFGTEST_ENV")
                .map_err(|e| e.to_string())?;
            assert_eq!(config.port, 2502);
            assert_eq!(config.inner.retries, 9);
            Ok(())
        });
    }

    #[test]
    fn test_type_mismatch_reported() {
        let file = write_temp(".toml", "port = \"not a number\"\n");
        let err = load_config::<Sample>(Some(file.path()), "CFGTEST_BAD").unwrap_err();
        assert!(err.to_string().contains("Failed to load configuration"));
    }
}
