//! Configuration loading for the relay engine
//!
//! Files are YAML or JSON. `${VAR}` references are interpolated from the
//! environment before parsing, then the result is validated as a whole.

mod env;
mod error;
mod schema;
mod secrets;
mod validator;

pub use env::interpolate_env_vars;
pub use error::{ConfigError, ConfigResult, ValidationError, ValidationErrorKind};
pub use schema::{
    AuditConfig, ConnectionConfig, GatewayConfig, HealthConfig, QuotaConfig, RelayConfig,
};
pub use secrets::SecretString;
pub use validator::ConfigValidator;

use std::fs;
use std::path::Path;

fn read_interpolated(path: &Path) -> ConfigResult<String> {
    let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError {
        path: path.to_string_lossy().to_string(),
        source: e,
    })?;
    env::interpolate_env_vars(&content)
}

/// Load a configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> ConfigResult<GatewayConfig> {
    let path = path.as_ref();
    let interpolated = read_interpolated(path)?;

    let config: GatewayConfig =
        serde_yaml::from_str(&interpolated).map_err(|e| ConfigError::ParseError {
            path: path.to_string_lossy().to_string(),
            line: e.location().map(|l| l.line()),
            column: e.location().map(|l| l.column()),
            message: e.to_string(),
        })?;

    ConfigValidator::new().validate(&config)?;
    Ok(config)
}

/// Load a configuration from a JSON file
pub fn load_from_json<P: AsRef<Path>>(path: P) -> ConfigResult<GatewayConfig> {
    let path = path.as_ref();
    let interpolated = read_interpolated(path)?;

    let config: GatewayConfig =
        serde_json::from_str(&interpolated).map_err(|e| ConfigError::ParseError {
            path: path.to_string_lossy().to_string(),
            line: Some(e.line()),
            column: Some(e.column()),
            message: e.to_string(),
        })?;

    ConfigValidator::new().validate(&config)?;
    Ok(config)
}
