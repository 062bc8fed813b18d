use std::path::PathBuf;
use std::time::Duration;

use clap::{Arg, ArgAction, ArgMatches, Command};
use podloom_core::app::{BuildError, ConfigError, Engine, EngineConfig};
use podloom_core::domain::{EngineError, InstanceId, NewSettings, TaskStatus, UserId};
use podloom_core::impls::{
    DockerOrchestrator, FakeBehavior, FakeOrchestrator, InMemoryRegistry, InMemorySettingsStore,
};
use podloom_core::ports::OrchestratorError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid settings file: {0}")]
    Settings(#[from] serde_json::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

fn cli() -> Command {
    Command::new("podloom")
        .about("Runs task templates as containers and follows them to completion")
        .version(env!("CARGO_PKG_VERSION"))
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("run")
                .about("Creates a template from a JSON file and runs it for a user")
                .arg(
                    Arg::new("settings")
                        .short('s')
                        .long("settings")
                        .help("Path to the task settings JSON file")
                        .required(true)
                        .value_parser(clap::value_parser!(PathBuf))
                        .action(ArgAction::Set),
                )
                .arg(
                    Arg::new("user")
                        .short('u')
                        .long("user")
                        .help("User the instances are run for")
                        .env("PODLOOM_USER")
                        .default_value("local")
                        .action(ArgAction::Set),
                )
                .arg(
                    Arg::new("fake")
                        .long("fake")
                        .help("Use the in-process fake orchestrator instead of Docker")
                        .action(ArgAction::SetTrue),
                ),
        )
}

#[tokio::main]
async fn main() {
    // .env は任意
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let matches = cli().get_matches();
    let result = match matches.subcommand() {
        Some(("run", args)) => run(args).await,
        _ => unreachable!("subcommand_required"),
    };

    match result {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(err) => {
            error!(error = %err, "podloom failed");
            std::process::exit(2);
        }
    }
}

/// Returns whether every instance succeeded.
async fn run(args: &ArgMatches) -> Result<bool, CliError> {
    let path = args
        .get_one::<PathBuf>("settings")
        .cloned()
        .unwrap_or_default();
    let raw = std::fs::read_to_string(&path).map_err(|source| CliError::Read {
        path: path.clone(),
        source,
    })?;
    let request: NewSettings = serde_json::from_str(&raw)?;
    let user = UserId::new(
        args.get_one::<String>("user")
            .cloned()
            .unwrap_or_else(|| "local".to_string()),
    );

    let builder = Engine::builder()
        .registry(InMemoryRegistry::new())
        .settings_store(InMemorySettingsStore::new())
        .config(EngineConfig::from_env()?);
    let engine = if args.get_flag("fake") {
        let fake = FakeOrchestrator::new();
        let log = format!("(fake) {}", request.container_config.commands.join(" && "));
        fake.script(
            request.container_config.image.clone(),
            FakeBehavior::exits_after(Duration::from_secs(2), 0, log),
        )
        .await;
        builder.orchestrator(fake).build()?
    } else {
        builder.orchestrator(DockerOrchestrator::connect()?).build()?
    };

    engine.start().await?;
    let settings = engine.create_settings(request).await?;
    info!(template = %settings.id, name = %settings.name, "template created");

    let ids = engine.submit(settings.id, &user).await?;
    let finished = tokio::select! {
        finished = wait_until_terminal(&engine, &ids) => finished?,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted; deleting instances");
            for &id in &ids {
                engine.request_deletion(id).await?;
            }
            false
        }
    };

    let mut all_succeeded = finished;
    for &id in &ids {
        let Ok(row) = engine.get_task(id).await else {
            println!("{id}: removed");
            all_succeeded = false;
            continue;
        };
        println!(
            "{id}: status={} exit_code={}",
            row.status,
            row.exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string())
        );
        if let Some(log) = row.log.filter(|l| !l.is_empty()) {
            println!("{log}");
        }
        all_succeeded &= row.status == TaskStatus::Succeeded;
    }
    println!("{:?}", engine.status_counts(Some(settings.id)).await);

    engine.shutdown().await;
    Ok(all_succeeded)
}

async fn wait_until_terminal(engine: &Engine, ids: &[InstanceId]) -> Result<bool, CliError> {
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    loop {
        ticker.tick().await;
        let mut done = true;
        for &id in ids {
            if !engine.get_task(id).await?.status.is_terminal() {
                done = false;
                break;
            }
        }
        if done {
            return Ok(true);
        }
    }
}
