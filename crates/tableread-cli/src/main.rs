//! Command line front end for the render worker supervisor.
//!
//! Starts a worker, runs one operation against it, and always shuts the
//! worker down again before exiting.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tableread::{
    ApiKey, BackendSupervisor, Character, Line, RenderJob, Script, SupervisorConfig, WorkerCommand,
};
use tracing::info;

#[derive(Parser)]
#[command(name = "tableread", version, about = "Drive the dialogue-to-video render worker")]
struct Cli {
    /// Path to the worker entry point: a binary, or a .py script run
    /// through the system Python
    #[arg(long, global = true, env = "TABLEREAD_WORKER")]
    worker: Option<PathBuf>,

    /// Readiness probes before a start is declared failed
    #[arg(long, global = true)]
    attempts: Option<u32>,

    /// Delay between readiness probes, in milliseconds
    #[arg(long, global = true)]
    interval_ms: Option<u64>,

    /// Timeout for render and query requests, in seconds
    #[arg(long, global = true)]
    request_timeout_secs: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a starter script file
    New {
        /// Where to write the script JSON
        path: PathBuf,
        /// Title for the new script
        #[arg(long, default_value = "Untitled Script")]
        title: String,
    },
    /// List the characters the worker can render
    Characters,
    /// Render a script and print the video URL
    Render {
        /// Script JSON to render
        path: PathBuf,
        /// API key to configure on the worker first
        #[arg(long, env = "TABLEREAD_API_KEY", hide_env_values = true)]
        api_key: Option<String>,
    },
}

impl Cli {
    fn supervisor_config(&self) -> anyhow::Result<SupervisorConfig> {
        let mut config = SupervisorConfig::new(worker_command(self.worker.clone())?);
        if let Some(attempts) = self.attempts {
            config = config.with_readiness_attempts(attempts);
        }
        if let Some(ms) = self.interval_ms {
            config = config.with_readiness_interval(Duration::from_millis(ms));
        }
        if let Some(secs) = self.request_timeout_secs {
            config = config.with_request_timeout(Duration::from_secs(secs));
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tableread::init_tracing();
    let cli = Cli::parse();

    match &cli.command {
        Command::New { path, title } => create_script(path, title.clone()).await,
        Command::Characters => list_characters(cli.supervisor_config()?).await,
        Command::Render { path, api_key } => {
            render_script(cli.supervisor_config()?, path, api_key.clone()).await
        }
    }
}

fn worker_command(worker: Option<PathBuf>) -> anyhow::Result<WorkerCommand> {
    match worker {
        Some(path) if path.extension().is_some_and(|ext| ext == "py") => {
            Ok(WorkerCommand::python_script(path))
        }
        Some(path) => Ok(WorkerCommand::executable(path)),
        None => WorkerCommand::bundled()
            .context("no --worker given and no bundled worker next to this binary"),
    }
}

async fn create_script(path: &Path, title: String) -> anyhow::Result<()> {
    if tokio::fs::try_exists(path).await? {
        anyhow::bail!("{} already exists", path.display());
    }

    let mut script = Script::new(title);
    let narrator = Character::new("Narrator").with_voice("zundamon");
    let guest = Character::new("Guest").with_voice("metan");
    script
        .lines
        .push(Line::new(narrator.id, "Welcome to the table read."));
    script.lines.push(Line::new(guest.id, "Glad to be here."));
    script.lines.push(Line::new(
        narrator.id,
        "Edit this script, then render it when you are ready.",
    ));
    script.characters.push(narrator);
    script.characters.push(guest);

    script
        .save(path)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    println!("created {}", path.display());
    Ok(())
}

async fn list_characters(config: SupervisorConfig) -> anyhow::Result<()> {
    let supervisor = BackendSupervisor::new(config);
    supervisor
        .start()
        .await
        .context("failed to start the render worker")?;
    let result = supervisor.characters().await;
    supervisor.stop().await;

    for character in result.context("failed to fetch characters")? {
        match &character.default_voice_id {
            Some(voice) => println!("{}  {} (voice: {voice})", character.id, character.name),
            None => println!("{}  {}", character.id, character.name),
        }
    }
    Ok(())
}

async fn render_script(
    config: SupervisorConfig,
    path: &Path,
    api_key: Option<String>,
) -> anyhow::Result<()> {
    let script = Script::load(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?
        .with_context(|| format!("no script found at {}", path.display()))?;
    anyhow::ensure!(
        !script.lines.is_empty(),
        "script {:?} has no lines to render",
        script.title
    );

    let supervisor = BackendSupervisor::new(config);
    supervisor
        .start()
        .await
        .context("failed to start the render worker")?;

    let result = async {
        if let Some(key) = api_key {
            supervisor.set_credential(ApiKey::from(key)).await?;
        }
        supervisor
            .submit_render(&RenderJob::from_script(&script))
            .await
    }
    .await;
    supervisor.stop().await;

    let url = result.context("render failed")?;
    info!(%url, "render complete");
    println!("{url}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn python_workers_are_detected_by_extension() {
        let command = worker_command(Some(PathBuf::from("backend/main.py"))).unwrap();
        assert_eq!(command.entry_point, PathBuf::from("backend/main.py"));
        assert_ne!(command.program, PathBuf::from("backend/main.py"));

        let command = worker_command(Some(PathBuf::from("worker-bin"))).unwrap();
        assert_eq!(command.program, PathBuf::from("worker-bin"));
    }

    #[tokio::test]
    async fn new_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scene.json");

        create_script(&path, "Scene".to_string()).await.unwrap();
        let written = Script::load(&path).await.unwrap().unwrap();
        assert_eq!(written.title, "Scene");
        assert_eq!(written.characters.len(), 2);
        assert_eq!(written.lines.len(), 3);

        let err = create_script(&path, "Scene".to_string())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn cli_parses_render_with_worker_override() {
        let cli = Cli::try_parse_from([
            "tableread",
            "--worker",
            "/opt/worker/main.py",
            "render",
            "scene.json",
            "--api-key",
            "sk-1",
        ])
        .unwrap();
        assert_eq!(cli.worker, Some(PathBuf::from("/opt/worker/main.py")));
        match cli.command {
            Command::Render { path, api_key } => {
                assert_eq!(path, PathBuf::from("scene.json"));
                assert_eq!(api_key.as_deref(), Some("sk-1"));
            }
            _ => panic!("expected render subcommand"),
        }
    }

    #[test]
    fn tuning_flags_override_the_config_defaults() {
        let cli = Cli::try_parse_from([
            "tableread",
            "characters",
            "--worker",
            "worker-bin",
            "--attempts",
            "3",
            "--interval-ms",
            "100",
            "--request-timeout-secs",
            "30",
        ])
        .unwrap();
        let config = cli.supervisor_config().unwrap();
        assert_eq!(config.readiness_attempts, 3);
        assert_eq!(config.readiness_interval, Duration::from_millis(100));
        assert_eq!(config.request_timeout, Duration::from_secs(30));

        let cli = Cli::try_parse_from(["tableread", "--worker", "worker-bin", "characters"])
            .unwrap();
        let config = cli.supervisor_config().unwrap();
        assert_eq!(config.readiness_attempts, 10);
        assert_eq!(config.readiness_interval, Duration::from_millis(500));
    }
}
