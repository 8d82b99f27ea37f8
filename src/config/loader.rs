use std::path::Path;

use config::{Config, File, FileFormat};
use eyre::{Context, Result};

use crate::config::models::GatewayConfig;

/// Load configuration from a file using the config crate
/// Supports multiple formats: TOML, YAML, JSON, INI.
pub async fn load_config(config_path: &str) -> Result<GatewayConfig> {
    load_config_sync(config_path)
}

/// Load configuration synchronously
pub fn load_config_sync(config_path: &str) -> Result<GatewayConfig> {
    let config_path = Path::new(config_path);

    // Determine file format based on extension
    let format = match config_path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("ini") => FileFormat::Ini,
        _ => FileFormat::Toml, // Default to TOML
    };

    let settings = Config::builder()
        .add_source(File::new(
            config_path
                .to_str()
                .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", config_path.display()))?,
            format,
        ))
        .build()
        .with_context(|| format!("Failed to build config from {}", config_path.display()))?;

    let gateway_config: GatewayConfig = settings.try_deserialize().with_context(|| {
        format!(
            "Failed to deserialize config from {}",
            config_path.display()
        )
    })?;

    Ok(gateway_config)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;
    use crate::config::LoadBalanceStrategy;

    #[tokio::test]
    async fn test_load_toml_config() {
        let toml_content = r#"
listen_addr = "127.0.0.1:3000"
load_balancing = "least_connections"
health_check_interval_ms = 5000

[circuit_breaker]
failure_threshold = 3
reset_timeout_ms = 1000

[[upstreams]]
name = "weather"
endpoint = "http://weather:9000"
tool_prefix = "weather_"

[[upstreams]]
name = "news"
endpoint = "http://news:9000"
tool_prefix = "news_"
weight = 3
"#;

        let mut temp_file = NamedTempFile::with_suffix(".toml").unwrap();
        write!(temp_file, "{}", toml_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:3000");
        assert_eq!(config.load_balancing, LoadBalanceStrategy::LeastConnections);
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.circuit_breaker.failure_window_ms, 60_000);
        assert_eq!(config.upstreams.len(), 2);
        assert_eq!(config.upstreams[1].weight, 3);
    }

    #[tokio::test]
    async fn test_load_json_config() {
        let json_content = r#"
{
  "listen_addr": "127.0.0.1:3000",
  "health_check": false,
  "upstreams": [
    { "name": "weather", "endpoint": "http://weather:9000", "tool_prefix": "weather_" }
  ]
}
"#;

        let mut temp_file = NamedTempFile::with_suffix(".json").unwrap();
        write!(temp_file, "{}", json_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert!(!config.health_check);
        assert_eq!(config.upstreams.len(), 1);
        assert_eq!(
            config.upstreams[0].tool_prefix.as_deref(),
            Some("weather_")
        );
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(load_config_sync("/definitely/not/here.toml").is_err());
    }
}
