//! Configuration loading
//!
//! JSON5 configuration with `${VAR}` environment substitution. A missing file
//! is not an error: it loads as an empty object and every section falls back
//! to its defaults.

use regex::Regex;
use serde_json::Value;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use thiserror::Error;

/// Config file name inside the state directory
pub const CONFIG_FILE_NAME: &str = "clawgate.json5";

/// Explicit config path override
pub const CONFIG_PATH_ENV: &str = "CLAWGATE_CONFIG_PATH";

/// State directory override
pub const STATE_DIR_ENV: &str = "CLAWGATE_STATE_DIR";

/// Top-level keys the gateway understands
const KNOWN_KEYS: [&str; 2] = ["gateway", "logging"];

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse JSON5 at {path}: {message}")]
    ParseError { path: String, message: String },

    #[error("Failed to read config file {path}: {message}")]
    ReadError { path: String, message: String },

    #[error("Missing environment variable: {var}")]
    MissingEnvVar { var: String },

    #[error("Validation error at {path}: {message}")]
    ValidationError { path: String, message: String },
}

/// Resolve the state directory.
/// Priority: CLAWGATE_STATE_DIR > ~/.clawgate
pub fn resolve_state_dir() -> PathBuf {
    if let Ok(dir) = env::var(STATE_DIR_ENV) {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".clawgate")
}

/// Get the config file path.
/// Priority: CLAWGATE_CONFIG_PATH > CLAWGATE_STATE_DIR/clawgate.json5 > ~/.clawgate/clawgate.json5
pub fn get_config_path() -> PathBuf {
    if let Ok(path) = env::var(CONFIG_PATH_ENV) {
        return PathBuf::from(path);
    }
    resolve_state_dir().join(CONFIG_FILE_NAME)
}

/// Load the configuration from the resolved path.
pub fn load_config() -> Result<Value, ConfigError> {
    load_config_from(&get_config_path())
}

/// Load, parse and env-substitute a config file.
/// Returns an empty object if the file doesn't exist.
pub fn load_config_from(path: &Path) -> Result<Value, ConfigError> {
    if !path.exists() {
        return Ok(Value::Object(serde_json::Map::new()));
    }

    let content = fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let mut value = parse_json5(&content, path)?;
    if !value.is_object() {
        return Err(ConfigError::ValidationError {
            path: ".".to_string(),
            message: "config root must be an object".to_string(),
        });
    }
    substitute_env_vars(&mut value)?;
    Ok(value)
}

/// Log every validation issue as a warning and return how many there were.
/// Called once logging is up, since the logging section comes from the same
/// file.
pub fn report_validation_issues(config: &Value) -> usize {
    let issues = validate_config(config);
    for issue in &issues {
        tracing::warn!(target: "config", path = %issue.path, "{}", issue.message);
    }
    issues.len()
}

fn parse_json5(content: &str, path: &Path) -> Result<Value, ConfigError> {
    json5::from_str(content).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

/// Substitute environment variables in string values.
/// Pattern: ${VAR} where VAR matches [A-Z_][A-Z0-9_]*
/// Escape with $${VAR} to get literal ${VAR}
fn substitute_env_vars(value: &mut Value) -> Result<(), ConfigError> {
    match value {
        Value::String(s) => {
            *s = substitute_env_in_string(s)?;
        }
        Value::Object(obj) => {
            for (_, v) in obj.iter_mut() {
                substitute_env_vars(v)?;
            }
        }
        Value::Array(arr) => {
            for item in arr.iter_mut() {
                substitute_env_vars(item)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn substitute_env_in_string(s: &str) -> Result<String, ConfigError> {
    static ENV_VAR_PATTERN: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\$\$?\{([A-Z_][A-Z0-9_]*)\}").unwrap());

    let mut result = String::with_capacity(s.len());
    let mut last_end = 0;

    for caps in ENV_VAR_PATTERN.captures_iter(s) {
        let (Some(full_match), Some(var_name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let var_name = var_name.as_str();

        result.push_str(&s[last_end..full_match.start()]);

        if full_match.as_str().starts_with("$$") {
            result.push_str(&format!("${{{}}}", var_name));
        } else {
            let value = env::var(var_name).map_err(|_| ConfigError::MissingEnvVar {
                var: var_name.to_string(),
            })?;
            result.push_str(&value);
        }

        last_end = full_match.end();
    }

    result.push_str(&s[last_end..]);
    Ok(result)
}

/// Validation issue with path context
#[derive(Debug)]
pub struct ValidationIssue {
    pub path: String,
    pub message: String,
}

/// Structural checks. Issues are warnings; loading still succeeds.
pub fn validate_config(config: &Value) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    let Value::Object(obj) = config else {
        issues.push(ValidationIssue {
            path: ".".to_string(),
            message: "Config root must be an object".to_string(),
        });
        return issues;
    };

    for key in obj.keys() {
        if !KNOWN_KEYS.contains(&key.as_str()) {
            issues.push(ValidationIssue {
                path: format!(".{}", key),
                message: format!("Unknown configuration key: {}", key),
            });
        }
    }

    if let Some(Value::Object(gateway)) = obj.get("gateway") {
        if let Some(port) = gateway.get("port") {
            if !port.is_u64() || port.as_u64().is_some_and(|p| p > u16::MAX as u64) {
                issues.push(ValidationIssue {
                    path: ".gateway.port".to_string(),
                    message: "port must be a number between 0 and 65535".to_string(),
                });
            }
        }
        if let Some(origins) = gateway.get("allowedOrigins") {
            if !origins.is_array() {
                issues.push(ValidationIssue {
                    path: ".gateway.allowedOrigins".to_string(),
                    message: "allowedOrigins must be an array of strings".to_string(),
                });
            }
        }
    }

    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Serializes tests that modify environment variables
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn write_config(dir: &TempDir, content: &str) -> PathBuf {
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_parse_json5_comments_and_unquoted_keys() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"{
                // gateway settings
                gateway: { port: 9000, allowedOrigins: ['https://app.example.com'], },
            }"#,
        );
        let value = load_config_from(&path).unwrap();
        assert_eq!(value["gateway"]["port"], 9000);
        assert_eq!(
            value["gateway"]["allowedOrigins"][0],
            "https://app.example.com"
        );
    }

    #[test]
    fn test_parse_error_reports_path() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "{ gateway: ");
        let result = load_config_from(&path);
        assert!(matches!(result, Err(ConfigError::ParseError { .. })));
    }

    #[test]
    fn test_non_object_root_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "[1, 2, 3]");
        assert!(matches!(
            load_config_from(&path),
            Err(ConfigError::ValidationError { .. })
        ));
    }

    #[test]
    fn test_missing_file_is_empty_object() {
        let value = load_config_from(Path::new("/nonexistent/clawgate.json5")).unwrap();
        assert_eq!(value, serde_json::json!({}));
    }

    #[test]
    fn test_env_var_substitution() {
        let _lock = ENV_LOCK.lock().unwrap();
        env::set_var("CLAWGATE_TEST_SECRET", "s3cret");

        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"{ gateway: { auth: { secret: "${CLAWGATE_TEST_SECRET}" } } }"#,
        );
        let value = load_config_from(&path).unwrap();
        assert_eq!(value["gateway"]["auth"]["secret"], "s3cret");

        env::remove_var("CLAWGATE_TEST_SECRET");
    }

    #[test]
    fn test_env_var_escaped() {
        let result = substitute_env_in_string("$${ESCAPED_VAR}").unwrap();
        assert_eq!(result, "${ESCAPED_VAR}");
    }

    #[test]
    fn test_env_var_missing() {
        let _lock = ENV_LOCK.lock().unwrap();
        env::remove_var("CLAWGATE_NONEXISTENT_12345");
        let result = substitute_env_in_string("${CLAWGATE_NONEXISTENT_12345}");
        assert!(
            matches!(result, Err(ConfigError::MissingEnvVar { var }) if var == "CLAWGATE_NONEXISTENT_12345")
        );
    }

    #[test]
    fn test_env_var_partial_string() {
        let _lock = ENV_LOCK.lock().unwrap();
        env::set_var("CLAWGATE_TEST_HOST", "app.example.com");
        let result = substitute_env_in_string("https://${CLAWGATE_TEST_HOST}/").unwrap();
        assert_eq!(result, "https://app.example.com/");
        env::remove_var("CLAWGATE_TEST_HOST");
    }

    #[test]
    fn test_get_config_path_override() {
        let _lock = ENV_LOCK.lock().unwrap();
        env::remove_var(STATE_DIR_ENV);
        env::set_var(CONFIG_PATH_ENV, "/custom/path/gateway.json5");

        assert_eq!(
            get_config_path(),
            PathBuf::from("/custom/path/gateway.json5")
        );

        env::remove_var(CONFIG_PATH_ENV);
    }

    #[test]
    fn test_get_config_path_state_dir() {
        let _lock = ENV_LOCK.lock().unwrap();
        env::remove_var(CONFIG_PATH_ENV);
        env::set_var(STATE_DIR_ENV, "/custom/state");

        assert_eq!(
            get_config_path(),
            PathBuf::from("/custom/state/clawgate.json5")
        );

        env::remove_var(STATE_DIR_ENV);
    }

    #[test]
    fn test_get_config_path_default() {
        let _lock = ENV_LOCK.lock().unwrap();
        env::remove_var(CONFIG_PATH_ENV);
        env::remove_var(STATE_DIR_ENV);
        assert!(get_config_path().ends_with(".clawgate/clawgate.json5"));
    }

    #[test]
    fn test_validation_unknown_key_and_bad_port() {
        let config = serde_json::json!({
            "gateway": { "port": "not-a-port" },
            "unknownKey": "value"
        });
        let issues = validate_config(&config);
        assert_eq!(issues.len(), 2);
        assert!(issues.iter().any(|i| i.path == ".unknownKey"));
        assert!(issues.iter().any(|i| i.path == ".gateway.port"));
    }

    #[test]
    fn test_validation_known_keys_pass() {
        let config = serde_json::json!({
            "gateway": { "port": 18789, "allowedOrigins": [] },
            "logging": { "level": "debug" }
        });
        assert!(validate_config(&config).is_empty());
    }
}
