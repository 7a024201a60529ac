//! tilescale.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::duration::parse_duration;
use crate::error::{ConfigError, ConfigResult};
use crate::types::ScalingPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TilescaleConfig {
    pub stack: StackConfig,
    #[serde(default)]
    pub scaling: ScalingConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub ingress: IngressConfig,
    pub orchestrator: OrchestratorConfig,
}

/// Deployment parameters handed to the orchestrator untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_stage")]
    pub stage: String,
    pub owner: Option<String>,
    pub client: Option<String>,
    #[serde(default = "default_image_version")]
    pub image_version: String,
    /// Bucket/prefix the tile server reads `.mbtiles` from.
    #[serde(default)]
    pub mbtiles_path_prefix: String,
    #[serde(default = "default_task_cpu")]
    pub task_cpu: u32,
    #[serde(default = "default_task_memory")]
    pub task_memory: u32,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    pub target_requests_per_replica: f64,
    pub scale_out_cooldown: String,
    pub scale_in_cooldown: String,
    pub min_count: u32,
    pub max_count: u32,
    /// How often the request aggregator emits a sample.
    pub sample_interval: String,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            target_requests_per_replica: 50.0,
            scale_out_cooldown: "30s".to_string(),
            scale_in_cooldown: "240s".to_string(),
            min_count: 2,
            max_count: 10,
            sample_interval: "60s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// HTTP path probed on each replica.
    pub path: String,
    pub interval: String,
    pub timeout: String,
    /// Consecutive failures before a ready replica is demoted.
    pub unhealthy_threshold: u32,
    /// Consecutive successes before a replica is admitted.
    pub healthy_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            path: "/services".to_string(),
            interval: "10s".to_string(),
            timeout: "2s".to_string(),
            unhealthy_threshold: 3,
            healthy_threshold: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngressConfig {
    /// Public port on the load balancer.
    pub listener_port: u16,
    /// Port the tile server listens on inside each replica.
    pub container_port: u16,
    /// CIDR allowed to reach the listener.
    pub allow_from: String,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            listener_port: 80,
            container_port: 8000,
            allow_from: "0.0.0.0/0".to_string(),
        }
    }
}

/// Commands used to create and destroy replicas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// argv run to launch one replica; prints `<id> <address>` on stdout.
    pub launch: Vec<String>,
    /// argv run to terminate a replica; the id is appended as the last arg.
    pub terminate: Vec<String>,
}

fn default_name() -> String {
    "mbtileserver".to_string()
}

fn default_stage() -> String {
    "production".to_string()
}

fn default_image_version() -> String {
    "latest".to_string()
}

fn default_task_cpu() -> u32 {
    1024
}

fn default_task_memory() -> u32 {
    3072
}

/// Prefix of environment variables that override `[stack]` fields,
/// e.g. `TILESCALE_STACK_IMAGE_VERSION=1.4.2`.
pub const STACK_ENV_PREFIX: &str = "TILESCALE_STACK_";

impl TilescaleConfig {
    /// Load a config file, applying `TILESCALE_STACK_*` overrides from the
    /// process environment.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str_with_env(&content, |key| std::env::var(key).ok())
    }

    /// Parse and validate a config document.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        Self::from_toml_str_with_env(content, |_| None)
    }

    /// Parse a config document, override `[stack]` fields from `env`, then
    /// validate the result.
    pub fn from_toml_str_with_env(
        content: &str,
        env: impl Fn(&str) -> Option<String>,
    ) -> ConfigResult<Self> {
        let mut config: TilescaleConfig = toml::from_str(content)?;
        config.stack.apply_env(env)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.stack.mbtiles_path_prefix.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "stack.mbtiles_path_prefix is required (or set {STACK_ENV_PREFIX}MBTILES_PATH_PREFIX)"
            )));
        }
        self.scaling_policy()?;
        if self.sample_interval()?.is_zero() {
            return Err(ConfigError::Invalid(
                "scaling.sample_interval must be non-zero".to_string(),
            ));
        }
        if self.health_interval()?.is_zero() {
            return Err(ConfigError::Invalid(
                "health.interval must be non-zero".to_string(),
            ));
        }
        if self.health_timeout()?.is_zero() {
            return Err(ConfigError::Invalid(
                "health.timeout must be non-zero".to_string(),
            ));
        }
        if self.health.unhealthy_threshold == 0 || self.health.healthy_threshold == 0 {
            return Err(ConfigError::Invalid(
                "health thresholds must be at least 1".to_string(),
            ));
        }
        if !self.health.path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "health.path must start with '/', got {:?}",
                self.health.path
            )));
        }
        if self.orchestrator.launch.is_empty() || self.orchestrator.terminate.is_empty() {
            return Err(ConfigError::Invalid(
                "orchestrator.launch and orchestrator.terminate must be non-empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Build the validated scaling policy from the `[scaling]` section.
    pub fn scaling_policy(&self) -> ConfigResult<ScalingPolicy> {
        let s = &self.scaling;
        ScalingPolicy::new(
            s.target_requests_per_replica,
            duration_field("scaling.scale_out_cooldown", &s.scale_out_cooldown)?,
            duration_field("scaling.scale_in_cooldown", &s.scale_in_cooldown)?,
            s.min_count,
            s.max_count,
        )
    }

    pub fn sample_interval(&self) -> ConfigResult<Duration> {
        duration_field("scaling.sample_interval", &self.scaling.sample_interval)
    }

    pub fn health_interval(&self) -> ConfigResult<Duration> {
        duration_field("health.interval", &self.health.interval)
    }

    pub fn health_timeout(&self) -> ConfigResult<Duration> {
        duration_field("health.timeout", &self.health.timeout)
    }

    /// Resource tags applied to everything the orchestrator creates.
    pub fn tags(&self) -> BTreeMap<String, String> {
        let mut tags = BTreeMap::new();
        tags.insert("Project".to_string(), self.stack.name.clone());
        tags.insert("Stack".to_string(), self.stack.stage.clone());
        if let Some(owner) = &self.stack.owner {
            tags.insert("Owner".to_string(), owner.clone());
        }
        if let Some(client) = &self.stack.client {
            tags.insert("Client".to_string(), client.clone());
        }
        tags
    }

    /// Environment for the tile-server container; `LOG_LEVEL` is pinned.
    pub fn container_env(&self) -> BTreeMap<String, String> {
        let mut env = self.stack.env.clone();
        env.insert("LOG_LEVEL".to_string(), "error".to_string());
        env
    }

    /// Name of the deployed service, e.g. `mbtileserver-ecs-production`.
    pub fn service_name(&self) -> String {
        format!("{}-ecs-{}", self.stack.name, self.stack.stage)
    }
}

impl StackConfig {
    fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) -> ConfigResult<()> {
        let var = |field: &str| env(&format!("{STACK_ENV_PREFIX}{field}"));

        for (field, slot) in [
            ("NAME", &mut self.name),
            ("STAGE", &mut self.stage),
            ("IMAGE_VERSION", &mut self.image_version),
            ("MBTILES_PATH_PREFIX", &mut self.mbtiles_path_prefix),
        ] {
            if let Some(value) = var(field) {
                *slot = value;
            }
        }
        for (field, slot) in [("OWNER", &mut self.owner), ("CLIENT", &mut self.client)] {
            if let Some(value) = var(field) {
                *slot = Some(value);
            }
        }
        for (field, slot) in [("TASK_CPU", &mut self.task_cpu), ("TASK_MEMORY", &mut self.task_memory)] {
            if let Some(value) = var(field) {
                *slot = value.parse().map_err(|_| {
                    ConfigError::Invalid(format!(
                        "{STACK_ENV_PREFIX}{field} must be an integer, got {value:?}"
                    ))
                })?;
            }
        }
        Ok(())
    }
}

fn duration_field(field: &'static str, value: &str) -> ConfigResult<Duration> {
    parse_duration(value).ok_or_else(|| ConfigError::Duration {
        field,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[stack]
mbtiles_path_prefix = "tiles-bucket/mbtiles/"

[orchestrator]
launch = ["./launch.sh"]
terminate = ["./terminate.sh"]
"#;

    #[test]
    fn parse_minimal_uses_defaults() {
        let config = TilescaleConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.stack.name, "mbtileserver");
        assert_eq!(config.stack.task_cpu, 1024);
        assert_eq!(config.stack.task_memory, 3072);
        assert_eq!(config.health.path, "/services");
        assert_eq!(config.ingress.listener_port, 80);
        assert_eq!(config.ingress.container_port, 8000);
        assert_eq!(config.scaling_policy().unwrap(), ScalingPolicy::default());
        assert_eq!(config.sample_interval().unwrap(), Duration::from_secs(60));
        assert_eq!(config.service_name(), "mbtileserver-ecs-production");
    }

    #[test]
    fn parse_overrides_scaling() {
        let toml_str = format!(
            "{MINIMAL}\n[scaling]\ntarget_requests_per_replica = 80.0\nscale_in_cooldown = \"5m\"\nmin_count = 1\nmax_count = 50\n"
        );
        let config = TilescaleConfig::from_toml_str(&toml_str).unwrap();
        let policy = config.scaling_policy().unwrap();
        assert_eq!(policy.target_requests_per_replica(), 80.0);
        assert_eq!(policy.scale_in_cooldown(), Duration::from_secs(300));
        assert_eq!(policy.scale_out_cooldown(), Duration::from_secs(30));
        assert_eq!((policy.min_count(), policy.max_count()), (1, 50));
    }

    #[test]
    fn rejects_inverted_bounds() {
        let toml_str = format!("{MINIMAL}\n[scaling]\nmin_count = 8\nmax_count = 4\n");
        let err = TilescaleConfig::from_toml_str(&toml_str).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_bad_duration() {
        let toml_str = format!("{MINIMAL}\n[scaling]\nscale_out_cooldown = \"soon\"\n");
        let err = TilescaleConfig::from_toml_str(&toml_str).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Duration { field: "scaling.scale_out_cooldown", .. }
        ));
    }

    #[test]
    fn rejects_empty_orchestrator_commands() {
        let toml_str = r#"
[stack]
mbtiles_path_prefix = "tiles-bucket/mbtiles/"

[orchestrator]
launch = []
terminate = ["./terminate.sh"]
"#;
        assert!(TilescaleConfig::from_toml_str(toml_str).is_err());
    }

    #[test]
    fn missing_orchestrator_is_parse_error() {
        let toml_str = r#"
[stack]
mbtiles_path_prefix = "tiles-bucket/mbtiles/"
"#;
        let err = TilescaleConfig::from_toml_str(toml_str).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    const NO_PREFIX: &str = r#"
[stack]
name = "tiles"

[orchestrator]
launch = ["a"]
terminate = ["b"]
"#;

    #[test]
    fn missing_prefix_is_invalid() {
        let err = TilescaleConfig::from_toml_str(NO_PREFIX).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("mbtiles_path_prefix")));
    }

    #[test]
    fn rejects_zero_health_interval() {
        let toml_str = format!("{MINIMAL}\n[health]\ninterval = \"0s\"\n");
        let err = TilescaleConfig::from_toml_str(&toml_str).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("health.interval")));
    }

    #[test]
    fn rejects_zero_health_timeout() {
        let toml_str = format!("{MINIMAL}\n[health]\ntimeout = \"0ms\"\n");
        let err = TilescaleConfig::from_toml_str(&toml_str).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("health.timeout")));
    }

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn env_overrides_stack_fields() {
        let env = env_of(&[
            ("TILESCALE_STACK_STAGE", "staging"),
            ("TILESCALE_STACK_IMAGE_VERSION", "1.4.2"),
            ("TILESCALE_STACK_OWNER", "maps-team"),
            ("TILESCALE_STACK_TASK_MEMORY", "4096"),
        ]);
        let config = TilescaleConfig::from_toml_str_with_env(MINIMAL, env).unwrap();
        assert_eq!(config.stack.stage, "staging");
        assert_eq!(config.stack.image_version, "1.4.2");
        assert_eq!(config.stack.owner.as_deref(), Some("maps-team"));
        assert_eq!(config.stack.task_memory, 4096);
        assert_eq!(config.stack.task_cpu, 1024);
        assert_eq!(config.service_name(), "mbtileserver-ecs-staging");
    }

    #[test]
    fn env_supplies_missing_prefix() {
        let env = env_of(&[("TILESCALE_STACK_MBTILES_PATH_PREFIX", "bucket/tiles/")]);
        let config = TilescaleConfig::from_toml_str_with_env(NO_PREFIX, env).unwrap();
        assert_eq!(config.stack.mbtiles_path_prefix, "bucket/tiles/");
        assert_eq!(config.stack.name, "tiles");
    }

    #[test]
    fn env_rejects_non_numeric_cpu() {
        let env = env_of(&[("TILESCALE_STACK_TASK_CPU", "lots")]);
        let err = TilescaleConfig::from_toml_str_with_env(MINIMAL, env).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("TASK_CPU")));
    }

    #[test]
    fn tags_skip_unset_owner() {
        let mut config = TilescaleConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.tags().len(), 2);
        config.stack.owner = Some("maps-team".to_string());
        assert_eq!(config.tags().get("Owner").map(String::as_str), Some("maps-team"));
    }

    #[test]
    fn container_env_pins_log_level() {
        let mut config = TilescaleConfig::from_toml_str(MINIMAL).unwrap();
        config.stack.env.insert("LOG_LEVEL".to_string(), "debug".to_string());
        config.stack.env.insert("TILE_CACHE".to_string(), "1".to_string());
        let env = config.container_env();
        assert_eq!(env.get("LOG_LEVEL").map(String::as_str), Some("error"));
        assert_eq!(env.get("TILE_CACHE").map(String::as_str), Some("1"));
    }

    #[test]
    fn round_trips_through_toml() {
        let config = TilescaleConfig::from_toml_str(MINIMAL).unwrap();
        let rendered = config.to_toml_string().unwrap();
        assert!(rendered.contains("tiles-bucket/mbtiles/"));
        assert!(TilescaleConfig::from_toml_str(&rendered).is_ok());
    }
}
