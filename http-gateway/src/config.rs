use std::env;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("invalid value for environment variable {name}: {value}")]
    InvalidEnvVar { name: String, value: String },
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub rust_log: String,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = match env::var("PORT") {
            Ok(v) => v
                .parse()
                .map_err(|_| ConfigError::InvalidEnvVar { name: "PORT".to_string(), value: v })?,
            Err(_) => 8080,
        };
        let rust_log = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
        let config = Self { port, rust_log };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidEnvVar {
                name: "PORT".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_port_zero() {
        let config = GatewayConfig { port: 0, rust_log: "info".to_string() };
        assert!(config.validate().is_err());
    }
}
