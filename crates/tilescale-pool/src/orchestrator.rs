//! Orchestration substrate seam.
//!
//! The pool never creates containers itself. It asks an `Orchestrator`
//! to launch or terminate one replica at a time and tracks what it was
//! handed back.

use std::collections::BTreeMap;

use anyhow::{Context, bail};
use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tracing::debug;

use tilescale_core::{ReplicaId, TilescaleConfig};

/// A replica as reported by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Replica {
    pub id: ReplicaId,
    /// Address the health gate probes (`host:port`).
    pub address: String,
}

#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Start one replica. Returns once the substrate has accepted it,
    /// not once it is serving.
    async fn launch(&self) -> anyhow::Result<Replica>;

    /// Stop a replica previously returned by `launch`.
    async fn terminate(&self, id: &str) -> anyhow::Result<()>;
}

/// Orchestrator that shells out to operator-supplied commands.
///
/// Deployment parameters from the config are exported to both commands
/// as `TILESCALE_*` environment variables. The launch command must print
/// `<id> <address>` on the first line of stdout; the terminate command
/// receives the replica id as its final argument.
pub struct CommandOrchestrator {
    launch: Vec<String>,
    terminate: Vec<String>,
    env: BTreeMap<String, String>,
}

impl CommandOrchestrator {
    pub fn new(launch: Vec<String>, terminate: Vec<String>) -> Self {
        Self {
            launch,
            terminate,
            env: BTreeMap::new(),
        }
    }

    /// Build from config, exporting the deployment parameters verbatim.
    pub fn from_config(config: &TilescaleConfig) -> Self {
        let mut env = BTreeMap::new();
        let stack = &config.stack;
        env.insert("TILESCALE_SERVICE".to_string(), config.service_name());
        env.insert("TILESCALE_IMAGE_VERSION".to_string(), stack.image_version.clone());
        env.insert(
            "TILESCALE_MBTILES_PATH_PREFIX".to_string(),
            stack.mbtiles_path_prefix.clone(),
        );
        env.insert("TILESCALE_TASK_CPU".to_string(), stack.task_cpu.to_string());
        env.insert("TILESCALE_TASK_MEMORY".to_string(), stack.task_memory.to_string());
        env.insert(
            "TILESCALE_CONTAINER_PORT".to_string(),
            config.ingress.container_port.to_string(),
        );
        env.insert(
            "TILESCALE_LISTENER_PORT".to_string(),
            config.ingress.listener_port.to_string(),
        );
        env.insert("TILESCALE_ALLOW_FROM".to_string(), config.ingress.allow_from.clone());
        env.insert("TILESCALE_HEALTH_PATH".to_string(), config.health.path.clone());
        env.insert("TILESCALE_TAGS".to_string(), join_pairs(&config.tags()));
        env.insert(
            "TILESCALE_CONTAINER_ENV".to_string(),
            join_pairs(&config.container_env()),
        );

        Self {
            launch: config.orchestrator.launch.clone(),
            terminate: config.orchestrator.terminate.clone(),
            env,
        }
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    fn command(&self, argv: &[String]) -> anyhow::Result<Command> {
        let (program, args) = argv.split_first().context("empty orchestrator command")?;
        let mut cmd = Command::new(program);
        cmd.args(args).envs(&self.env).kill_on_drop(true);
        Ok(cmd)
    }
}

#[async_trait]
impl Orchestrator for CommandOrchestrator {
    async fn launch(&self) -> anyhow::Result<Replica> {
        let output = self
            .command(&self.launch)?
            .output()
            .await
            .context("failed to run launch command")?;

        if !output.status.success() {
            bail!(
                "launch command exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let replica = parse_launch_output(&stdout)?;
        debug!(id = %replica.id, address = %replica.address, "launch command accepted");
        Ok(replica)
    }

    async fn terminate(&self, id: &str) -> anyhow::Result<()> {
        let status = self
            .command(&self.terminate)?
            .arg(id)
            .status()
            .await
            .context("failed to run terminate command")?;

        if !status.success() {
            bail!("terminate command exited with {status} for replica {id}");
        }
        Ok(())
    }
}

/// Parse `<id> <address>` from the first non-empty line.
fn parse_launch_output(stdout: &str) -> anyhow::Result<Replica> {
    let line = stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .context("launch command printed nothing")?;

    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(id), Some(address)) => Ok(Replica {
            id: id.to_string(),
            address: address.to_string(),
        }),
        _ => bail!("launch output must be `<id> <address>`, got {line:?}"),
    }
}

fn join_pairs(pairs: &BTreeMap<String, String>) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> TilescaleConfig {
        TilescaleConfig::from_toml_str(
            r#"
[stack]
mbtiles_path_prefix = "tiles-bucket/mbtiles/"
owner = "maps"

[orchestrator]
launch = ["sh", "-c", "echo task-1 10.0.0.5:8000"]
terminate = ["true"]
"#,
        )
        .unwrap()
    }

    #[test]
    fn parse_launch_output_takes_first_line() {
        let replica = parse_launch_output("\n task-7 10.0.1.2:8000 \nnoise\n").unwrap();
        assert_eq!(replica.id, "task-7");
        assert_eq!(replica.address, "10.0.1.2:8000");
    }

    #[test]
    fn parse_launch_output_rejects_missing_address() {
        assert!(parse_launch_output("task-7\n").is_err());
        assert!(parse_launch_output("").is_err());
    }

    #[test]
    fn from_config_exports_deployment_parameters() {
        let orch = CommandOrchestrator::from_config(&test_config());
        let env = orch.env();
        assert_eq!(env["TILESCALE_HEALTH_PATH"], "/services");
        assert_eq!(env["TILESCALE_CONTAINER_PORT"], "8000");
        assert_eq!(env["TILESCALE_LISTENER_PORT"], "80");
        assert_eq!(env["TILESCALE_ALLOW_FROM"], "0.0.0.0/0");
        assert_eq!(env["TILESCALE_SERVICE"], "mbtileserver-ecs-production");
        assert_eq!(env["TILESCALE_CONTAINER_ENV"], "LOG_LEVEL=error");
        assert_eq!(
            env["TILESCALE_TAGS"],
            "Owner=maps,Project=mbtileserver,Stack=production"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn launch_runs_command_and_parses_replica() {
        let orch = CommandOrchestrator::from_config(&test_config());
        let replica = orch.launch().await.unwrap();
        assert_eq!(replica.id, "task-1");
        assert_eq!(replica.address, "10.0.0.5:8000");
        orch.terminate(&replica.id).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn launch_failure_is_an_error() {
        let orch = CommandOrchestrator::new(
            vec!["sh".into(), "-c".into(), "echo boom >&2; exit 3".into()],
            vec!["false".into()],
        );
        let err = orch.launch().await.unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert!(orch.terminate("task-1").await.is_err());
    }
}
