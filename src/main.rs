//! linux-cleaner - scan, review and clean disk space on Linux

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use linux_cleaner::file_cleaner::duplicate_detector::DEFAULT_MIN_SIZE;
use linux_cleaner::{humanize, App, CleanerError, DuplicateOptions};

#[derive(Parser)]
#[command(name = "linux-cleaner")]
#[command(author, version, about = "Interactive Linux disk cleaner")]
struct Cli {
    /// Use this configuration file instead of the XDG default
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan enabled categories and save the results for `clean`
    Scan,
    /// Delete the files found by the last scan
    Clean {
        /// Report what would be deleted without touching anything
        #[arg(long)]
        dry_run: bool,
        /// Skip the confirmation prompt
        #[arg(long, short = 'y')]
        yes: bool,
    },
    /// Find files with identical content
    Duplicates {
        /// Directories to search
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Ignore files smaller than this many bytes
        #[arg(long, default_value_t = DEFAULT_MIN_SIZE)]
        min_size: u64,
        /// Basename glob to skip (repeatable)
        #[arg(long = "ignore")]
        ignore: Vec<String>,
        /// Delete every copy except the oldest in each group
        #[arg(long)]
        remove: bool,
    },
    /// List deletion manifests, newest first
    Manifests,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {}", err);
            for suggestion in err.suggestions() {
                eprintln!("  hint: {}", suggestion);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), CleanerError> {
    let app = App::from_process(cli.config)?;

    let token = CancellationToken::new();
    let on_interrupt = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted, stopping");
            on_interrupt.cancel();
        }
    });

    let outcome = match cli.command {
        Commands::Scan => scan(&app, &token).await,
        Commands::Clean { dry_run, yes } => clean(&app, &token, dry_run, yes).await,
        Commands::Duplicates {
            paths,
            min_size,
            ignore,
            remove,
        } => {
            let options = DuplicateOptions {
                min_size,
                ignore_patterns: ignore,
                ..DuplicateOptions::new(paths)
            };
            duplicates(&app, &token, options, remove).await
        }
        Commands::Manifests => manifests(&app),
    };
    app.close()?;
    outcome
}

async fn scan(app: &App, token: &CancellationToken) -> Result<(), CleanerError> {
    let cache = app.scan_and_save(token).await?;
    println!(
        "Found {} files ({}) in {} locations",
        cache.total_files,
        humanize(cache.total_size),
        cache.scan_results.paths.len()
    );
    println!("Saved to {}", app.session().path().display());
    Ok(())
}

async fn clean(
    app: &App,
    token: &CancellationToken,
    dry_run: bool,
    yes: bool,
) -> Result<(), CleanerError> {
    let dry_run = dry_run || app.config().scan.dry_run_default;
    let cache = app.session().load()?;
    println!(
        "{} files ({}) from the scan at {}",
        cache.total_files,
        humanize(cache.total_size),
        cache.scanned_at.to_rfc3339()
    );

    if !dry_run && app.config().safety.require_confirmation && !yes && !confirm("Delete them?")? {
        println!("Nothing deleted");
        return Ok(());
    }

    let completion = app
        .clean_cached(token, dry_run, |progress| {
            log::debug!(
                "[{}/{}] {}",
                progress.files_processed + 1,
                progress.total_files,
                progress.current_file.display()
            );
        })
        .await?;

    let verb = if dry_run { "Would delete" } else { "Deleted" };
    println!(
        "{} {} files, {}",
        verb,
        completion.files_deleted,
        humanize(completion.bytes_freed)
    );
    if let Some(path) = &completion.backup_path {
        println!("Manifest: {}", path.display());
    }
    for err in &completion.errors {
        println!("  failed: {}", err);
    }
    Ok(())
}

async fn duplicates(
    app: &App,
    token: &CancellationToken,
    options: DuplicateOptions,
    remove: bool,
) -> Result<(), CleanerError> {
    let result = app
        .find_duplicates(token, options, |progress| {
            log::debug!("{}: {} files", progress.phase, progress.files_scanned);
        })
        .await?;

    for group in &result.groups {
        println!(
            "{} x {} ({} wasted)",
            group.files.len(),
            humanize(group.size),
            humanize(group.wasted)
        );
        for file in &group.files {
            println!("  {}", file.path.display());
        }
    }
    println!(
        "{} groups, {} redundant copies, {} recoverable",
        result.groups.len(),
        result.total_dupes,
        humanize(result.wasted_space)
    );

    if remove && !result.groups.is_empty() {
        let redundant: Vec<PathBuf> = result
            .groups
            .iter()
            .flat_map(|g| g.redundant().map(|f| f.path.clone()))
            .collect();
        let removal = app.remove_duplicates(&redundant);
        println!(
            "Removed {} files, {}",
            removal.removed,
            humanize(removal.bytes_freed)
        );
        for err in &removal.errors {
            println!("  failed: {}", err);
        }
    }
    Ok(())
}

fn manifests(app: &App) -> Result<(), CleanerError> {
    for path in app.manifests()? {
        println!("{}", path.display());
    }
    Ok(())
}

fn confirm(prompt: &str) -> Result<bool, CleanerError> {
    print!("{} [y/N] ", prompt);
    let io_err = |err| CleanerError::io(err, std::path::Path::new("<stdin>"));
    io::stdout().flush().map_err(io_err)?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer).map_err(io_err)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}
