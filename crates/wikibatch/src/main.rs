use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use wikibatch_core::config::{WikiConfig, bot_credentials, load_config};
use wikibatch_core::http::HttpTransport;
use wikibatch_core::namespace::NamespaceId;
use wikibatch_core::pages;
use wikibatch_core::{ChunkedUpload, FailedTask, Session, Task, TaskRunner};

#[derive(Debug, Parser)]
#[command(
    name = "wikibatch",
    version,
    about = "Batch reads and bulk edits against a MediaWiki API"
)]
struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[arg(long, global = true, value_name = "PATH", default_value = "wikibatch.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List the wiki's namespaces
    Namespaces,
    #[command(name = "all-pages")]
    AllPages(AllPagesArgs),
    /// List members of a category
    Members(MembersArgs),
    /// Report which titles exist
    Exists(TitlesArgs),
    /// Upload a file in chunks
    Upload(UploadArgs),
    Delete(ReasonArgs),
    Undelete(ReasonArgs),
}

#[derive(Debug, Args)]
struct AllPagesArgs {
    #[arg(short, long, default_value_t = 0)]
    namespace: NamespaceId,
    #[arg(long, help = "Stop after this many titles")]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
struct MembersArgs {
    category: String,
    #[arg(long, help = "Stop after this many titles")]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
struct TitlesArgs {
    titles: Vec<String>,
    #[arg(long, value_name = "PATH", help = "Read additional titles, one per line")]
    from_file: Option<PathBuf>,
    #[arg(long, help = "Print results as JSON")]
    json: bool,
}

#[derive(Debug, Args)]
struct UploadArgs {
    path: PathBuf,
    #[arg(long, help = "Target title; defaults to File:<file name>")]
    title: Option<String>,
    #[arg(long, default_value = "")]
    description: String,
    #[arg(long, default_value = "")]
    summary: String,
}

#[derive(Debug, Args)]
struct ReasonArgs {
    titles: Vec<String>,
    #[arg(long, value_name = "PATH", help = "Read additional titles, one per line")]
    from_file: Option<PathBuf>,
    #[arg(long, default_value = "")]
    reason: String,
    #[arg(long, help = "Override [tasks].max_parallel")]
    parallel: Option<usize>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    // Before tracing, so RUST_LOG may come from .env.
    dotenvy::dotenv().ok();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: u8) {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(verbose))
        .with_writer(std::io::stderr)
        .init();
}

fn log_filter(verbose: u8) -> EnvFilter {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

fn run(cli: Cli) -> Result<ExitCode> {
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Namespaces => run_namespaces(&config),
        Commands::AllPages(args) => run_all_pages(&config, args),
        Commands::Members(args) => run_members(&config, args),
        Commands::Exists(args) => run_exists(&config, args),
        Commands::Upload(args) => run_upload(&config, args),
        Commands::Delete(args) => run_tasks(&config, args, Task::delete),
        Commands::Undelete(args) => run_tasks(&config, args, Task::undelete),
    }
}

fn open_session(config: &WikiConfig, mutating: bool) -> Result<Session> {
    let transport = HttpTransport::new(config.transport_config()?)?;
    let session = Session::open(Arc::new(transport), config.session_settings())
        .context("failed to read site metadata")?;
    if mutating {
        let Some((username, password)) = bot_credentials() else {
            bail!("set WIKI_BOT_USER and WIKI_BOT_PASS for commands that modify the wiki");
        };
        session.login(&username, &password)?;
    }
    Ok(session)
}

fn run_namespaces(config: &WikiConfig) -> Result<ExitCode> {
    let session = open_session(config, false)?;
    let namespaces = session.namespaces();
    for (id, name) in namespaces.iter() {
        let label = if name.is_empty() { "(Main)" } else { name };
        println!("{id}\t{label}");
    }
    Ok(ExitCode::SUCCESS)
}

fn run_all_pages(config: &WikiConfig, args: AllPagesArgs) -> Result<ExitCode> {
    let session = open_session(config, false)?;
    let titles = pages::all_pages(&session, args.namespace, args.limit)?;
    for title in &titles {
        println!("{title}");
    }
    info!(count = titles.len(), requests = session.request_count(), "listed pages");
    Ok(ExitCode::SUCCESS)
}

fn run_members(config: &WikiConfig, args: MembersArgs) -> Result<ExitCode> {
    let session = open_session(config, false)?;
    let titles = pages::category_members(&session, &args.category, args.limit)?;
    for title in &titles {
        println!("{title}");
    }
    info!(count = titles.len(), "listed category members");
    Ok(ExitCode::SUCCESS)
}

fn run_exists(config: &WikiConfig, args: TitlesArgs) -> Result<ExitCode> {
    let titles = collect_titles(args.titles, args.from_file.as_deref())?;
    let session = open_session(config, false)?;
    let found = pages::exists(&session, &titles)?;

    if args.json {
        let report = titles
            .iter()
            .map(|title| {
                let exists = found.get(title).copied().unwrap_or(false);
                (title.clone(), serde_json::Value::Bool(exists))
            })
            .collect::<serde_json::Map<_, _>>();
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(ExitCode::SUCCESS);
    }
    for title in &titles {
        let flag = if found.get(title).copied().unwrap_or(false) {
            "yes"
        } else {
            "no"
        };
        println!("{flag}\t{title}");
    }
    Ok(ExitCode::SUCCESS)
}

fn run_upload(config: &WikiConfig, args: UploadArgs) -> Result<ExitCode> {
    let title = match args.title {
        Some(title) => title,
        None => {
            let name = args
                .path
                .file_name()
                .and_then(|name| name.to_str())
                .context("upload path has no usable file name")?;
            format!("File:{name}")
        }
    };
    let session = open_session(config, true)?;
    let mut upload = ChunkedUpload::new(&session, &title, &args.description, &args.summary);
    match upload.run_from_path(&args.path) {
        Ok(outcome) => {
            println!(
                "uploaded {} ({} bytes, {} chunks{})",
                outcome.filename,
                outcome.bytes,
                outcome.chunks,
                if outcome.salvaged { ", salvaged" } else { "" }
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(error) => {
            if let Some(filekey) = error.filekey() {
                eprintln!("stash key for manual recovery: {filekey}");
            }
            Err(error.into())
        }
    }
}

fn run_tasks(
    config: &WikiConfig,
    args: ReasonArgs,
    build: fn(&str, &str) -> Task,
) -> Result<ExitCode> {
    let titles = collect_titles(args.titles, args.from_file.as_deref())?;
    if titles.is_empty() {
        bail!("no titles given");
    }
    let tasks = titles
        .iter()
        .map(|title| build(title, &args.reason))
        .collect::<Vec<_>>();

    let session = open_session(config, true)?;
    let runner = TaskRunner::new(args.parallel.unwrap_or_else(|| config.max_parallel()))
        .context("failed to build worker pool")?;
    let failed = runner.run(&session, tasks);
    print_failures(&failed);
    if failed.is_empty() {
        Ok(ExitCode::SUCCESS)
    } else {
        warn!(failed = failed.len(), "some tasks failed");
        Ok(ExitCode::FAILURE)
    }
}

fn print_failures(failed: &[FailedTask]) {
    for failure in failed {
        println!("failed\t{}\t{}", failure.task.title, failure.error);
    }
}

fn collect_titles(mut titles: Vec<String>, from_file: Option<&Path>) -> Result<Vec<String>> {
    if let Some(path) = from_file {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        titles.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(ToString::to_string),
        );
    }
    Ok(titles)
}
