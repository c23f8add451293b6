use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use todosync::config::{CONFIG_ENV, SyncConfig, TOKEN_ENV};
use todosync::core::{Notice, Occurrence};
use todosync::parser::parse_occurrences;
use todosync::remote::{InMemoryTaskStore, RemoteTaskStore, RestTaskStore};
use todosync::session::{Coordinator, SessionHandle, SessionOptions};
use todosync::surface::{DocumentSurface, FileSurface};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "todosync",
    about = "Keep checklist items in notes in sync with a remote to-do service",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// Config file (TOML). Defaults to $XDG_CONFIG_HOME/todosync/config.toml.
    #[arg(long, global = true, env = CONFIG_ENV)]
    config: Option<PathBuf>,
    /// API token. Overrides the config file.
    #[arg(long, global = true, env = TOKEN_ENV, hide_env_values = true)]
    api_token: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse a note and print its checklist items.
    Parse(ParseArgs),

    /// Run one reconciliation pass against a note and wait for it to settle.
    Sync(SyncArgs),

    /// Keep a note in sync until interrupted.
    Watch(WatchArgs),

    /// List the projects of the account.
    Projects,

    /// Show the account the token belongs to.
    Whoami,
}

#[derive(Debug, Args)]
struct ParseArgs {
    /// Note to parse.
    file: PathBuf,
    /// Emit JSON instead of a human-readable list.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct SyncArgs {
    /// Note to sync.
    file: PathBuf,
    /// Use an in-process store seeded from the note instead of the remote service.
    #[arg(long)]
    offline: bool,
    /// How long the session must be quiet before the run ends.
    #[arg(long, default_value_t = 750)]
    settle_ms: u64,
}

#[derive(Debug, Args)]
struct WatchArgs {
    /// Note to keep in sync.
    file: PathBuf,
    /// Use an in-process store seeded from the note instead of the remote service.
    #[arg(long)]
    offline: bool,
    /// How often the file is checked for outside changes.
    #[arg(long, default_value_t = 500)]
    check_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let Cli {
        config,
        api_token,
        command,
        ..
    } = cli;
    match command {
        Commands::Parse(args) => handle_parse(args),
        Commands::Sync(args) => handle_sync(args, load_config(config.as_deref(), api_token)?).await,
        Commands::Watch(args) => {
            handle_watch(args, load_config(config.as_deref(), api_token)?).await
        }
        Commands::Projects => handle_projects(load_config(config.as_deref(), api_token)?).await,
        Commands::Whoami => handle_whoami(load_config(config.as_deref(), api_token)?).await,
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "todosync=debug"
    } else {
        "todosync=info"
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_config(path: Option<&Path>, api_token: Option<String>) -> Result<SyncConfig> {
    let mut config = SyncConfig::load_or_default(path).context("loading configuration")?;
    if api_token.is_some() {
        config.api_token = api_token;
    }
    Ok(config)
}

fn remote_store(config: &SyncConfig) -> Result<Arc<dyn RemoteTaskStore>> {
    let token = config.api_token.clone().with_context(|| {
        format!("no API token: set {TOKEN_ENV}, pass --api-token or add api_token to the config")
    })?;
    Ok(Arc::new(RestTaskStore::new(
        &config.api_url,
        &config.sync_url,
        token,
        config.retry_policy(),
    )))
}

/// In-process store holding every durable task the note already mentions, so polling
/// does not mistake them for remote deletions.
async fn offline_store(surface: &FileSurface) -> Result<Arc<dyn RemoteTaskStore>> {
    let text = surface
        .read()
        .await
        .with_context(|| format!("reading {:?}", surface.path()))?;
    let known = parse_occurrences(&text)
        .into_iter()
        .map(|occ| occ.task)
        .filter(|task| !task.id.is_provisional());
    Ok(Arc::new(InMemoryTaskStore::with_tasks(known)))
}

fn describe_occurrence(occ: &Occurrence) -> String {
    format!(
        "{:>4}  [{}] {}  {}{}",
        occ.line_number + 1,
        if occ.task.checked { 'x' } else { ' ' },
        occ.task.content,
        occ.task.id,
        if occ.is_new { " (new)" } else { "" }
    )
}

fn handle_parse(args: ParseArgs) -> Result<()> {
    let ParseArgs { file, json } = args;
    let text = fs::read_to_string(&file).with_context(|| format!("reading {:?}", file))?;
    let occurrences = parse_occurrences(&text);
    if json {
        println!("{}", serde_json::to_string_pretty(&occurrences)?);
    } else {
        for occ in &occurrences {
            println!("{}", describe_occurrence(occ));
        }
    }
    Ok(())
}

struct PreparedSession {
    coordinator: Coordinator,
    handle: SessionHandle,
    notices: mpsc::UnboundedReceiver<Notice>,
}

async fn prepare_session(
    file: &Path,
    offline: bool,
    config: &SyncConfig,
) -> Result<PreparedSession> {
    let path = fs::canonicalize(file).with_context(|| format!("resolving path {:?}", file))?;
    let surface = Arc::new(FileSurface::new(&path));
    let store = if offline {
        info!("offline mode, using an in-process store");
        offline_store(&surface).await?
    } else {
        remote_store(config)?
    };

    let mut options = SessionOptions::from_config(config);
    options.snapshot_path = Some(config.snapshot_path_for(&path));
    let (notice_tx, notices) = mpsc::unbounded_channel();
    let coordinator = Coordinator::new(store, options).with_notice_sink(notice_tx);
    let handle = coordinator.handle();
    handle.open(path.display().to_string(), surface)?;
    Ok(PreparedSession {
        coordinator,
        handle,
        notices,
    })
}

async fn handle_sync(args: SyncArgs, config: SyncConfig) -> Result<()> {
    let PreparedSession {
        mut coordinator,
        handle,
        mut notices,
    } = prepare_session(&args.file, args.offline, &config).await?;
    let settle = Duration::from_millis(args.settle_ms);

    coordinator.run_until_idle(settle).await;
    let tracked = coordinator.state().cache.len();
    handle.shutdown()?;
    coordinator.run_until_idle(settle).await;

    let mut failures = 0;
    while let Ok(notice) = notices.try_recv() {
        eprintln!("notice: {}", notice.message);
        failures += 1;
    }
    println!("{tracked} task(s) in sync, {failures} notice(s)");
    Ok(())
}

async fn handle_watch(args: WatchArgs, config: SyncConfig) -> Result<()> {
    let PreparedSession {
        coordinator,
        handle,
        mut notices,
    } = prepare_session(&args.file, args.offline, &config).await?;

    tokio::spawn(async move {
        while let Some(notice) = notices.recv().await {
            eprintln!("notice: {}", notice.message);
        }
    });

    let surface = FileSurface::new(fs::canonicalize(&args.file)?);
    let watcher = tokio::spawn(watch_file(
        surface,
        handle.clone(),
        Duration::from_millis(args.check_ms),
    ));

    let interrupt = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, shutting down");
            let _ = interrupt.shutdown();
        }
    });

    coordinator.run().await;
    watcher.abort();
    Ok(())
}

/// Report mtime changes as external modifications until the session goes away.
async fn watch_file(surface: FileSurface, handle: SessionHandle, every: Duration) {
    let mut last = surface.modified().await.ok().flatten();
    loop {
        tokio::time::sleep(every).await;
        match surface.modified().await {
            Ok(current) if current != last => {
                last = current;
                if handle.external_modify().is_err() {
                    break;
                }
            }
            Ok(_) => {}
            Err(err) => warn!(path = ?surface.path(), %err, "cannot stat note"),
        }
    }
}

async fn handle_projects(config: SyncConfig) -> Result<()> {
    let store = remote_store(&config)?;
    let projects = store.list_projects().await.context("listing projects")?;
    for project in projects {
        println!("{}\t{}", project.id, project.name);
    }
    Ok(())
}

async fn handle_whoami(config: SyncConfig) -> Result<()> {
    let store = remote_store(&config)?;
    let user = store.current_user().await.context("fetching the current user")?;
    println!("{} <{}>", user.full_name, user.email);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use todosync::core::TaskId;

    #[test]
    fn sync_arguments_parse() {
        let cli = Cli::try_parse_from([
            "todosync",
            "--verbose",
            "sync",
            "notes/today.md",
            "--offline",
            "--settle-ms",
            "200",
        ])
        .expect("parse");
        assert!(cli.verbose);
        match cli.command {
            Commands::Sync(args) => {
                assert_eq!(args.file, PathBuf::from("notes/today.md"));
                assert!(args.offline);
                assert_eq!(args.settle_ms, 200);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn flag_token_overrides_config_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("config.toml");
        fs::write(&path, "api_token = \"from-file\"\ndebounce_ms = 300\n").expect("write config");

        let config = load_config(Some(&path), None).expect("load");
        assert_eq!(config.api_token.as_deref(), Some("from-file"));
        assert_eq!(config.debounce, Duration::from_millis(300));

        let config = load_config(Some(&path), Some("from-flag".into())).expect("load");
        assert_eq!(config.api_token.as_deref(), Some("from-flag"));
    }

    #[test]
    fn missing_token_is_reported() {
        let err = remote_store(&SyncConfig::default()).err().expect("error");
        assert!(err.to_string().contains(TOKEN_ENV));
    }

    #[test]
    fn occurrences_render_one_per_line() {
        let occurrences = parse_occurrences("intro\n- [x] Call mom %%[tid:: 42]%%\n");
        assert_eq!(
            describe_occurrence(&occurrences[0]),
            "   2  [x] Call mom  42"
        );
    }

    #[tokio::test]
    async fn offline_store_knows_durable_tasks_only() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("today.md");
        fs::write(&path, "- [ ] a %%[tid:: 42]%%\n- [ ] b\n").expect("write note");

        let store = offline_store(&FileSurface::new(&path)).await.expect("store");
        let value = store.get_task(&TaskId::from("42")).await.expect("get");
        assert!(matches!(value, todosync::core::RemoteValue::Present(task) if task.content == "a"));
    }

    #[tokio::test]
    async fn offline_sync_assigns_ids_in_the_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("today.md");
        fs::write(&path, "# Today\n- [ ] write report\n").expect("write note");

        let config = SyncConfig {
            snapshot_path: Some(tmp.path().join("snapshot.json")),
            ..SyncConfig::default()
        };
        handle_sync(
            SyncArgs {
                file: path.clone(),
                offline: true,
                settle_ms: 100,
            },
            config,
        )
        .await
        .expect("sync");

        let text = fs::read_to_string(&path).expect("read note");
        assert_eq!(text, "# Today\n- [ ] write report %%[tid:: T1]%%\n");
        assert!(tmp.path().join("snapshot.json").is_file());
    }
}
