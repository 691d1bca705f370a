use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use avatar_core::assets::{AssetPreparer, uploader_from_config};
use avatar_core::config::AvatarConfig;
use avatar_core::models::{CoreError, CoreErrorKind, NewTask, TaskId};
use avatar_core::orchestration::TaskOrchestrator;
use avatar_core::persistence::MigrationStore;
use avatar_core::probe::FfprobeDurationProbe;
use avatar_core::sqlite::SqliteStore;
use avatar_core::vision::build_client;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

type CliResult<T> = Result<T, CoreError>;

#[derive(Debug, Parser)]
#[command(name = "avatar", about = "Avatar video generation task runner")]
pub struct Cli {
    /// JSON configuration file; `AVATAR_*` variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply schema migrations to the configured database
    Migrate,
    /// Create a task and process it until it completes, fails or waits for a subject
    Create(CreateArgs),
    /// Print one task
    Get(TaskArg),
    /// List an owner's tasks, newest first
    List {
        #[arg(long)]
        owner: String,
    },
    /// Pick a subject for a task waiting on selection and continue processing
    Select {
        #[arg(value_name = "TASK_ID")]
        id: u64,
        #[arg(value_name = "MASK_INDEX")]
        mask_index: usize,
    },
    /// Resume a failed task from its last checkpoint
    Retry(TaskArg),
    /// Delete a task and its events
    Delete(TaskArg),
    /// Print a task's event log
    Events(TaskArg),
    /// Fail tasks whose processing lease expired mid-flight so they can be retried
    Recover,
}

#[derive(Debug, Args)]
struct TaskArg {
    #[arg(value_name = "TASK_ID")]
    id: u64,
}

#[derive(Debug, Args)]
struct CreateArgs {
    #[arg(long)]
    owner: String,
    /// Public URL or local path of the portrait
    #[arg(long)]
    image: String,
    /// Public URL or local path of the driving audio
    #[arg(long)]
    audio: String,
    #[arg(long)]
    linked_record: Option<String>,
    #[arg(long)]
    prompt: Option<String>,
    #[arg(long, allow_negative_numbers = true)]
    seed: Option<i64>,
    #[arg(long)]
    fast: bool,
    #[arg(long)]
    multi_subject: bool,
    /// Skip probing and use this audio duration in seconds
    #[arg(long)]
    duration: Option<f64>,
}

impl CreateArgs {
    fn into_request(self) -> NewTask {
        let mut request = NewTask::new(self.owner, self.image, self.audio)
            .fast_mode(self.fast)
            .multi_subject(self.multi_subject);
        if let Some(record_id) = self.linked_record {
            request = request.linked_record(record_id);
        }
        if let Some(prompt) = self.prompt {
            request = request.prompt(prompt);
        }
        if let Some(seed) = self.seed {
            request = request.seed(seed);
        }
        request.duration_seconds = self.duration;
        request
    }
}

impl Cli {
    pub async fn run(self) -> CliResult<()> {
        let config = AvatarConfig::load(self.config.as_deref())?;
        let store = Arc::new(SqliteStore::new(&config.database_path));

        if let Command::Migrate = self.command {
            let migrating = store.clone();
            let version = blocking(move || {
                migrating.migrate_to_latest()?;
                migrating.current_version()
            })
            .await?;
            tracing::info!(
                database = %config.database_path.display(),
                version,
                "schema is up to date"
            );
            return Ok(());
        }

        let orchestrator = build_orchestrator(&config, store)?;
        match self.command {
            Command::Migrate => Ok(()),
            Command::Create(args) => {
                let task = orchestrator.create_task(args.into_request()).await?;
                settle(&orchestrator, task.id).await
            }
            Command::Get(arg) => print_json(&orchestrator.get_task(TaskId(arg.id)).await?),
            Command::List { owner } => {
                print_json(&orchestrator.list_tasks_for_owner(&owner).await?)
            }
            Command::Select { id, mask_index } => {
                let task = orchestrator
                    .select_subject_and_continue(TaskId(id), mask_index)
                    .await?;
                settle(&orchestrator, task.id).await
            }
            Command::Retry(arg) => {
                let task = orchestrator.retry_task(TaskId(arg.id)).await?;
                settle(&orchestrator, task.id).await
            }
            Command::Delete(arg) => {
                orchestrator.delete_task(TaskId(arg.id)).await?;
                print_json(&serde_json::json!({ "deleted": arg.id }))
            }
            Command::Events(arg) => print_json(&orchestrator.task_events(TaskId(arg.id)).await?),
            Command::Recover => {
                let interrupted = orchestrator.recover_interrupted().await?;
                let ids: Vec<u64> = interrupted.into_iter().map(|id| id.0).collect();
                print_json(&serde_json::json!({ "interrupted": ids }))
            }
        }
    }
}

fn build_orchestrator(config: &AvatarConfig, store: Arc<SqliteStore>) -> CliResult<TaskOrchestrator> {
    let vision = build_client(&config.vision, None, |key| std::env::var(key).ok())?;
    let assets = AssetPreparer::new(uploader_from_config(&config.assets), &config.assets.local_root)
        .with_linked_records(store.clone());

    Ok(TaskOrchestrator::new(store, vision, assets)
        .with_probe(Arc::new(FfprobeDurationProbe::from_config(&config.probe)))
        .with_polling(config.polling)
        .with_max_concurrent_tasks(config.max_concurrent_tasks)
        .with_lease_ttl(config.lease_ttl()))
}

/// Waits for the task's routine to stop, then prints the task. Ctrl-C
/// cancels the routine so the task is left in a retryable stage.
async fn settle(orchestrator: &TaskOrchestrator, id: TaskId) -> CliResult<()> {
    tokio::select! {
        waited = orchestrator.wait_for_idle(id, None) => waited?,
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => {
                tracing::warn!(task_id = id.0, "interrupted; cancelling processing");
                orchestrator.shutdown(SHUTDOWN_GRACE).await?;
            }
            Err(error) => {
                tracing::warn!(error = %error, "failed to listen for ctrl-c");
                orchestrator.wait_for_idle(id, None).await?;
            }
        },
    }
    print_json(&orchestrator.get_task(id).await?)
}

fn print_json<T: Serialize>(value: &T) -> CliResult<()> {
    let rendered = serde_json::to_string_pretty(value).map_err(|error| {
        CoreError::new(
            CoreErrorKind::Internal,
            format!("failed to render output: {error}"),
        )
    })?;
    println!("{rendered}");
    Ok(())
}

async fn blocking<T: Send + 'static>(
    operation: impl FnOnce() -> CliResult<T> + Send + 'static,
) -> CliResult<T> {
    tokio::task::spawn_blocking(operation)
        .await
        .map_err(|join_error| {
            CoreError::new(
                CoreErrorKind::Internal,
                format!("blocking call join failure: {join_error}"),
            )
        })?
}
