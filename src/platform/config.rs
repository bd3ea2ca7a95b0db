use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::performance::scheduler::SchedulingStrategy;

const DEFAULT_CONFIG_PATH: &str = "configs/platform.toml";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PlatformConfig {
    pub metadata: MetadataSettings,
    pub observability: ObservabilitySettings,
    pub redis: RedisSettings,
    pub realtime: RealtimeSettings,
    pub alerts: AlertSettings,
    pub auth: AuthSettings,
}

impl PlatformConfig {
    pub fn load() -> Result<Self> {
        Self::load_from_path(None::<PathBuf>)
    }

    pub fn load_from_path<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let mut builder = Config::builder().add_source(
            File::from(PathBuf::from(DEFAULT_CONFIG_PATH))
                .format(FileFormat::Toml)
                .required(false),
        );

        if let Some(path) = path {
            builder = builder.add_source(
                File::from(path.as_ref())
                    .format(FileFormat::Toml)
                    .required(true),
            );
        }

        builder = builder.add_source(Environment::with_prefix("STORYWEAVE").separator("__"));

        let config: PlatformConfig = builder
            .build()?
            .try_deserialize()
            .context("invalid platform configuration")?;

        config
            .validate()
            .map_err(|errors| anyhow::anyhow!("configuration validation failed: {}", errors))?;

        Ok(config)
    }

    /// Consistency checks beyond what deserialization enforces. Returns the
    /// full list of violations joined with "; " so operators see everything
    /// at once.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let mut errors = Vec::new();
        let rt = &self.realtime;

        if rt.enabled {
            if rt.websocket.heartbeat_interval <= 0.0 {
                errors.push("websocket.heartbeat_interval must be positive".to_string());
            }
            if rt.websocket.connection_timeout <= 0.0 {
                errors.push("websocket.connection_timeout must be positive".to_string());
            }
            if rt.websocket.auth_timeout <= 0.0 {
                errors.push("websocket.auth_timeout must be positive".to_string());
            }
            if rt.websocket.max_connections == 0 {
                errors.push("websocket.max_connections must be positive".to_string());
            }
            if rt.websocket.outbound_queue_size == 0 {
                errors.push("websocket.outbound_queue_size must be positive".to_string());
            }
            if rt.events.buffer_size == 0 {
                errors.push("events.buffer_size must be positive".to_string());
            }
        }

        let feedback = &rt.progressive_feedback;
        if feedback.enabled {
            if !rt.enabled {
                errors.push("progressive_feedback requires realtime to be enabled".to_string());
            }
            if feedback.update_interval <= 0.0 {
                errors.push("progressive_feedback.update_interval must be positive".to_string());
            }
            if feedback.max_updates_per_operation == 0 {
                errors.push(
                    "progressive_feedback.max_updates_per_operation must be positive".to_string(),
                );
            }
            if feedback.cleanup_interval <= 0.0 {
                errors.push("progressive_feedback.cleanup_interval must be positive".to_string());
            }
            if feedback.operation_timeout <= 0.0 {
                errors.push("progressive_feedback.operation_timeout must be positive".to_string());
            }
        }

        let opt = &rt.optimization;
        if !(0.0..=1.0).contains(&opt.speed_creativity_balance) {
            errors.push("optimization.speed_creativity_balance must be within [0, 1]".to_string());
        }
        if opt.target_response_time <= 0.0 {
            errors.push("optimization.target_response_time must be positive".to_string());
        }
        if opt.profile_update_interval <= 0.0 {
            errors.push("optimization.profile_update_interval must be positive".to_string());
        }

        if rt.recovery.enabled && rt.recovery.timeout <= 0.0 {
            errors.push("recovery.timeout must be positive".to_string());
        }

        if self.alerts.check_interval <= 0.0 {
            errors.push("alerts.check_interval must be positive".to_string());
        }
        if self.alerts.cooldown < 0.0 {
            errors.push("alerts.cooldown must not be negative".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataSettings {
    pub name: String,
    pub environment: String,
    pub node: String,
}

impl Default for MetadataSettings {
    fn default() -> Self {
        Self {
            name: "storyweave".to_string(),
            environment: "development".to_string(),
            node: "node-0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilitySettings {
    pub log_level: String,
    pub metrics_port: u16,
    pub enable_metrics: bool,
}

impl Default for ObservabilitySettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_port: 9090,
            enable_metrics: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    pub url: String,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    pub jwt_secret: String,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: "change-me".to_string(),
        }
    }
}

/// Master switch plus the nested realtime sections. `enabled = false` makes
/// the publisher short-circuit and the upgrade endpoint refuse.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeSettings {
    pub enabled: bool,
    pub websocket: WebSocketSettings,
    pub events: EventSettings,
    pub progressive_feedback: FeedbackSettings,
    pub optimization: OptimizationSettings,
    pub recovery: RecoverySettings,
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            websocket: WebSocketSettings::default(),
            events: EventSettings::default(),
            progressive_feedback: FeedbackSettings::default(),
            optimization: OptimizationSettings::default(),
            recovery: RecoverySettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketSettings {
    pub path: String,
    pub heartbeat_interval: f64,
    pub connection_timeout: f64,
    pub auth_timeout: f64,
    pub max_connections: usize,
    pub auth_required: bool,
    pub outbound_queue_size: usize,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            path: "/ws".to_string(),
            heartbeat_interval: 30.0,
            connection_timeout: 60.0,
            auth_timeout: 10.0,
            max_connections: 1000,
            auth_required: true,
            outbound_queue_size: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventSettings {
    pub redis_channel_prefix: String,
    pub buffer_size: usize,
    pub broadcast_agent_status: bool,
    pub broadcast_workflow_progress: bool,
    pub broadcast_system_metrics: bool,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            redis_channel_prefix: "sw:events".to_string(),
            buffer_size: 1000,
            broadcast_agent_status: true,
            broadcast_workflow_progress: true,
            broadcast_system_metrics: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackSettings {
    pub enabled: bool,
    pub update_interval: f64,
    pub max_updates_per_operation: u32,
    pub stream_intermediate_results: bool,
    pub auto_publish_updates: bool,
    pub cleanup_interval: f64,
    pub operation_timeout: f64,
}

impl Default for FeedbackSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            update_interval: 1.0,
            max_updates_per_operation: 100,
            stream_intermediate_results: true,
            auto_publish_updates: true,
            cleanup_interval: 300.0,
            operation_timeout: 3600.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizationSettings {
    pub strategy: SchedulingStrategy,
    pub speed_creativity_balance: f64,
    pub target_response_time: f64,
    pub profile_update_interval: f64,
}

impl Default for OptimizationSettings {
    fn default() -> Self {
        Self {
            strategy: SchedulingStrategy::Adaptive,
            speed_creativity_balance: 0.5,
            target_response_time: 2.0,
            profile_update_interval: 30.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoverySettings {
    pub enabled: bool,
    pub timeout: f64,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: 300.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertSettings {
    pub check_interval: f64,
    pub cooldown: f64,
    pub webhook_url: Option<String>,
    pub metrics_broadcast_interval: f64,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            check_interval: 30.0,
            cooldown: 300.0,
            webhook_url: None,
            metrics_broadcast_interval: 15.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = PlatformConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_non_positive_intervals() {
        let mut config = PlatformConfig::default();
        config.realtime.websocket.heartbeat_interval = 0.0;
        let err = config.validate().unwrap_err();
        assert!(err.contains("heartbeat_interval"));
    }

    #[test]
    fn test_rejects_out_of_range_balance() {
        let mut config = PlatformConfig::default();
        config.realtime.optimization.speed_creativity_balance = 1.5;
        let err = config.validate().unwrap_err();
        assert!(err.contains("speed_creativity_balance"));
    }

    #[test]
    fn test_feedback_requires_realtime() {
        let mut config = PlatformConfig::default();
        config.realtime.enabled = false;
        config.realtime.progressive_feedback.enabled = true;
        let err = config.validate().unwrap_err();
        assert!(err.contains("progressive_feedback requires realtime"));
    }

    #[test]
    fn test_collects_all_violations() {
        let mut config = PlatformConfig::default();
        config.realtime.websocket.max_connections = 0;
        config.realtime.events.buffer_size = 0;
        let err = config.validate().unwrap_err();
        assert!(err.contains("max_connections"));
        assert!(err.contains("buffer_size"));
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("platform.toml");
        std::fs::write(
            &path,
            r#"
[realtime.websocket]
max_connections = 64
heartbeat_interval = 5.0

[realtime.events]
redis_channel_prefix = "test:events"
"#,
        )
        .unwrap();

        let config = PlatformConfig::load_from_path(Some(&path)).unwrap();
        assert_eq!(config.realtime.websocket.max_connections, 64);
        assert_eq!(config.realtime.events.redis_channel_prefix, "test:events");
        // Untouched sections keep defaults.
        assert_eq!(config.realtime.websocket.connection_timeout, 60.0);
    }
}
