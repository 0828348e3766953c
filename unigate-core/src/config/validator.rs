//! Semantic checks that serde cannot express

use super::env::referenced_vars;
use super::error::{ValidationError, ValidationErrorKind};
use super::schema::GatewayConfig;
use std::collections::HashSet;
use tracing::warn;

/// Configuration validator
#[derive(Debug, Default)]
pub struct ConfigValidator;

impl ConfigValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(&self, config: &GatewayConfig) -> Result<(), ValidationError> {
        self.validate_version(config)?;
        self.validate_relay(config)?;
        self.validate_quota(config)?;
        self.validate_channels(config)?;
        Ok(())
    }

    fn validate_version(&self, config: &GatewayConfig) -> Result<(), ValidationError> {
        if config.version != GatewayConfig::SCHEMA_VERSION {
            return Err(ValidationError::new(
                "version",
                ValidationErrorKind::InvalidVersion {
                    expected: GatewayConfig::SCHEMA_VERSION.to_string(),
                    actual: config.version.clone(),
                },
            ));
        }
        Ok(())
    }

    fn validate_relay(&self, config: &GatewayConfig) -> Result<(), ValidationError> {
        if config.relay.max_attempts == 0 {
            return Err(ValidationError::out_of_range(
                "relay.max_attempts",
                "must be at least 1",
            ));
        }
        if config.relay.dispatch_timeout_ms == 0 {
            return Err(ValidationError::out_of_range(
                "relay.dispatch_timeout_ms",
                "must be positive",
            ));
        }
        if config.relay.dispatch_timeout_ms > config.connection.request_timeout_ms {
            return Err(ValidationError::out_of_range(
                "relay.dispatch_timeout_ms",
                format!(
                    "must not exceed connection.request_timeout_ms ({})",
                    config.connection.request_timeout_ms
                ),
            )
            .with_context("the HTTP client cuts every request, streams included, at that ceiling"));
        }
        let retry = &config.relay.retry;
        if retry.exponential_base < 1.0 {
            return Err(ValidationError::out_of_range(
                "relay.retry.exponential_base",
                format!("must be >= 1.0, got {}", retry.exponential_base),
            ));
        }
        if !(0.0..=1.0).contains(&retry.jitter_factor) {
            return Err(ValidationError::out_of_range(
                "relay.retry.jitter_factor",
                format!("must be within [0, 1], got {}", retry.jitter_factor),
            ));
        }
        if retry.initial_delay_ms > retry.max_delay_ms {
            return Err(ValidationError::out_of_range(
                "relay.retry.initial_delay_ms",
                "must not exceed max_delay_ms",
            ));
        }
        if config.health.auto_disable && config.health.failure_threshold == 0 {
            return Err(ValidationError::out_of_range(
                "health.failure_threshold",
                "must be at least 1 when auto_disable is on",
            ));
        }
        Ok(())
    }

    fn validate_quota(&self, config: &GatewayConfig) -> Result<(), ValidationError> {
        let quota = &config.quota;
        if quota.pre_consume_quota < 0 {
            return Err(ValidationError::out_of_range(
                "quota.pre_consume_quota",
                "must not be negative",
            ));
        }
        let ratios = [
            ("quota.default_ratio".to_string(), quota.default_ratio),
            ("quota.completion_ratio".to_string(), quota.completion_ratio),
        ];
        let model_ratios = quota
            .model_ratios
            .iter()
            .map(|(model, ratio)| (format!("quota.model_ratios.{}", model), *ratio));
        for (path, ratio) in ratios.into_iter().chain(model_ratios) {
            if !ratio.is_finite() || ratio < 0.0 {
                return Err(ValidationError::out_of_range(
                    path,
                    format!("must be a non-negative number, got {}", ratio),
                ));
            }
        }
        Ok(())
    }

    fn validate_channels(&self, config: &GatewayConfig) -> Result<(), ValidationError> {
        let mut names = HashSet::new();
        for (i, channel) in config.channels.iter().enumerate() {
            if channel.name.trim().is_empty() {
                return Err(ValidationError::required(format!("channels[{i}].name")));
            }
            if !names.insert(channel.name.as_str()) {
                return Err(ValidationError::new(
                    format!("channels[{i}].name"),
                    ValidationErrorKind::DuplicateChannel {
                        name: channel.name.clone(),
                    },
                ));
            }
            if let Some(var) = referenced_vars(channel.key.expose_secret()).into_iter().next() {
                return Err(ValidationError::new(
                    format!("channels[{i}].key"),
                    ValidationErrorKind::UnresolvedPlaceholder { var },
                ));
            }
            if channel.key.is_blank() {
                return Err(ValidationError::required(format!("channels[{i}].key")));
            }
            let models = channel.normalized_models();
            if models.is_empty() {
                return Err(ValidationError::required(format!("channels[{i}].models"))
                    .with_context("a channel must serve at least one model"));
            }
            let mut mapped: Vec<&String> = channel.model_mapping.keys().collect();
            mapped.sort();
            if let Some(model) = mapped.into_iter().find(|m| !models.contains(*m)) {
                return Err(ValidationError::new(
                    format!("channels[{i}].model_mapping"),
                    ValidationErrorKind::UnservedMapping {
                        model: model.clone(),
                    },
                ));
            }
            if let Some(base_url) = channel.base_url.as_deref() {
                if let Err(e) = url::Url::parse(base_url) {
                    return Err(ValidationError::new(
                        format!("channels[{i}].base_url"),
                        ValidationErrorKind::InvalidUrl {
                            message: e.to_string(),
                        },
                    ));
                }
            }
            if channel.weight == 0 {
                warn!(
                    "Channel '{}' has weight 0; it will be selected as if weight were 1",
                    channel.name
                );
            }
        }
        Ok(())
    }
}
