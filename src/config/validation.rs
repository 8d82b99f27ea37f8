use std::{collections::HashSet, net::SocketAddr};

use crate::{
    config::models::{CircuitBreakerConfig, GatewayConfig, MiddlewareConfig, UpstreamConfig},
    core::{scope::ScopeMatcher, upstream::UpstreamEndpoint},
};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Duplicate upstream name: {name}")]
    DuplicateUpstream { name: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Gateway configuration validator
pub struct GatewayConfigValidator;

impl GatewayConfigValidator {
    /// Validate the entire gateway configuration, reporting every problem at once
    pub fn validate(config: &GatewayConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        if config.upstreams.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "upstreams".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for upstream in &config.upstreams {
            if !upstream.name.is_empty() && !seen.insert(upstream.name.as_str()) {
                errors.push(ValidationError::DuplicateUpstream {
                    name: upstream.name.clone(),
                });
            }
            errors.extend(Self::validate_upstream(upstream));
        }

        if config.timeout_ms == 0 {
            errors.push(ValidationError::InvalidField {
                field: "timeout_ms".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if config.health_check && config.health_check_interval_ms == 0 {
            errors.push(ValidationError::InvalidField {
                field: "health_check_interval_ms".to_string(),
                message: "Must be greater than 0 when health checking is enabled".to_string(),
            });
        }

        errors.extend(Self::validate_circuit_breaker(&config.circuit_breaker));
        errors.extend(Self::validate_middleware(&config.middleware));

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:3000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_upstream(upstream: &UpstreamConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let label = if upstream.name.is_empty() {
            "<unnamed>"
        } else {
            upstream.name.as_str()
        };

        if upstream.name.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "upstreams[].name".to_string(),
            });
        }

        if let Err(e) = UpstreamEndpoint::new(&upstream.endpoint) {
            errors.push(ValidationError::InvalidField {
                field: format!("upstream '{label}' endpoint"),
                message: e.to_string(),
            });
        }

        if upstream.weight == 0 {
            errors.push(ValidationError::InvalidField {
                field: format!("upstream '{label}' weight"),
                message: "Must be at least 1".to_string(),
            });
        }

        if upstream.timeout_ms == Some(0) {
            errors.push(ValidationError::InvalidField {
                field: format!("upstream '{label}' timeout_ms"),
                message: "Must be greater than 0".to_string(),
            });
        }

        if upstream.health_check_enabled && !upstream.health_path.starts_with('/') {
            errors.push(ValidationError::InvalidField {
                field: format!("upstream '{label}' health_path"),
                message: "Must start with '/'".to_string(),
            });
        }

        for (field, prefix) in [
            ("tool_prefix", &upstream.tool_prefix),
            ("resource_prefix", &upstream.resource_prefix),
            ("prompt_prefix", &upstream.prompt_prefix),
        ] {
            if prefix.as_deref() == Some("") {
                errors.push(ValidationError::InvalidField {
                    field: format!("upstream '{label}' {field}"),
                    message: "Must not be empty when set".to_string(),
                });
            }
        }

        errors
    }

    fn validate_circuit_breaker(config: &CircuitBreakerConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if config.failure_threshold == 0 {
            errors.push(ValidationError::InvalidField {
                field: "circuit_breaker.failure_threshold".to_string(),
                message: "Must be at least 1".to_string(),
            });
        }
        if config.reset_timeout_ms == 0 {
            errors.push(ValidationError::InvalidField {
                field: "circuit_breaker.reset_timeout_ms".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }
        if config.failure_window_ms == 0 {
            errors.push(ValidationError::InvalidField {
                field: "circuit_breaker.failure_window_ms".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }
        errors
    }

    fn validate_middleware(config: &MiddlewareConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if config.request_timeout_ms == Some(0) {
            errors.push(ValidationError::InvalidField {
                field: "middleware.request_timeout_ms".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }
        if let Some(custom) = &config.custom_headers {
            if let Err(e) = ScopeMatcher::compile(&custom.scope) {
                errors.push(ValidationError::InvalidField {
                    field: "middleware.custom_headers.scope".to_string(),
                    message: e.to_string(),
                });
            }
            for (name, value) in &custom.headers {
                if http::HeaderName::from_bytes(name.as_bytes()).is_err()
                    || http::HeaderValue::from_str(value).is_err()
                {
                    errors.push(ValidationError::InvalidField {
                        field: format!("middleware.custom_headers.headers.{name}"),
                        message: "Invalid header name or value".to_string(),
                    });
                }
            }
        }
        errors
    }

    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.len() == 1 {
            return errors[0].to_string();
        }
        let mut message = format!("{} configuration errors found:", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("\n  {}. {}", i + 1, error));
        }
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::models::CustomHeadersConfig, core::scope::MiddlewareScope};

    fn minimal_valid_config() -> GatewayConfig {
        GatewayConfig::builder()
            .upstream(UpstreamConfig::new("weather", "http://weather:9000"))
            .upstream(UpstreamConfig::new("news", "https://news.example.com"))
            .build()
            .unwrap()
    }

    fn failure_message(config: &GatewayConfig) -> String {
        match GatewayConfigValidator::validate(config) {
            Err(ValidationError::ValidationFailed { message }) => message,
            other => panic!("expected validation failure, got {other:?}"),
        }
    }

    #[test]
    fn validate_accepts_minimal_config() {
        assert!(GatewayConfigValidator::validate(&minimal_valid_config()).is_ok());
    }

    #[test]
    fn validate_rejects_missing_upstreams() {
        let config = GatewayConfig::default();
        assert!(failure_message(&config).contains("upstreams"));
    }

    #[test]
    fn validate_rejects_duplicate_names() {
        let mut config = minimal_valid_config();
        config
            .upstreams
            .push(UpstreamConfig::new("weather", "http://other:9000"));
        assert!(failure_message(&config).contains("Duplicate upstream name: weather"));
    }

    #[test]
    fn validate_rejects_bad_endpoint_and_weight() {
        let mut config = minimal_valid_config();
        config.upstreams[0].endpoint = "weather:9000".to_string();
        config.upstreams[1].weight = 0;
        let message = failure_message(&config);
        assert!(message.contains("2 configuration errors found"));
        assert!(message.contains("endpoint"));
        assert!(message.contains("weight"));
    }

    #[test]
    fn validate_rejects_zero_interval_when_enabled() {
        let mut config = minimal_valid_config();
        config.health_check_interval_ms = 0;
        assert!(failure_message(&config).contains("health_check_interval_ms"));

        config.health_check = false;
        assert!(GatewayConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn validate_rejects_zero_failure_threshold() {
        let mut config = minimal_valid_config();
        config.circuit_breaker.failure_threshold = 0;
        assert!(failure_message(&config).contains("failure_threshold"));
    }

    #[test]
    fn validate_rejects_invalid_listen_address() {
        let mut config = minimal_valid_config();
        config.listen_addr = "localhost".to_string();
        assert!(failure_message(&config).contains("Invalid listen address"));
    }

    #[test]
    fn validate_rejects_malformed_middleware_scope() {
        let mut config = minimal_valid_config();
        config.middleware.custom_headers = Some(CustomHeadersConfig {
            headers: [("x-served-by".to_string(), "gantry".to_string())].into(),
            scope: MiddlewareScope::default().paths(["/api/**/tools"]),
        });
        assert!(failure_message(&config).contains("middleware.custom_headers.scope"));
    }
}
