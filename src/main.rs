//! CLI entry point for `attachflow`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use clap::{CommandFactory, Parser, Subcommand};
use humansize::{format_size, BINARY};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use attachflow::config::{self, Config};
use attachflow::parser::mime;
use attachflow::provider::ThumbnailDir;
use attachflow::{
    failure_notice, AttachmentRecord, Engine, Metadata, Operation, SharedRecord, TransferEncoding,
};

#[derive(Parser)]
#[command(name = "attachflow", version, about = "Load, save and extract mail attachments")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a file or directory and show its metadata
    Load {
        path: PathBuf,
        /// Directory holding pre-rendered `<name>.png` thumbnails
        #[arg(long, value_name = "DIR")]
        thumbnails: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Load a file or directory and save it somewhere else
    Save {
        path: PathBuf,
        /// Destination file or directory
        #[arg(short, long)]
        output: PathBuf,
        /// Also unpack the payload if it is an archive
        #[arg(short = 'x', long)]
        extract: bool,
        /// With --extract, skip writing the archive itself
        #[arg(long, requires = "extract")]
        extract_only: bool,
    },
    /// List or save the attachments of a message
    Attachments {
        /// Raw RFC 5322 message (.eml)
        path: PathBuf,
        /// Save every attachment into this directory
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Show the configuration, or write the defaults with --init
    Config {
        #[arg(long)]
        init: bool,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = config::load_config();

    let log_level = match cli.verbose {
        0 => config.general.log_level.as_str(),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    setup_logging(log_level, &config);

    match cli.command {
        Commands::Load {
            path,
            thumbnails,
            json,
        } => cmd_load(config, &path, thumbnails, json).await,
        Commands::Save {
            path,
            output,
            extract,
            extract_only,
        } => cmd_save(config, &path, &output, extract, extract_only).await,
        Commands::Attachments { path, output, json } => {
            cmd_attachments(config, &path, output.as_deref(), json).await
        }
        Commands::Config { init } => cmd_config(&config, init),
        Commands::Completions { shell } => cmd_completions(shell),
    }
}

/// Set up tracing with stderr output and optional file logging.
fn setup_logging(level: &str, config: &Config) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let log_dir = config::cache_dir(config);
    if std::fs::create_dir_all(&log_dir).is_ok() {
        let file_appender = tracing_appender::rolling::never(&log_dir, "attachflow.log");
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(file_appender);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();
    }
}

fn new_record(config: &Config) -> SharedRecord {
    Arc::new(AttachmentRecord::with_cancel_delay(
        config.transfer.cancel_reset_delay(),
    ))
}

/// Mirror the record's progress on a bar until `work` resolves.
///
/// Ctrl-C cancels the record instead of killing the process, so the
/// pipeline gets to clean up after itself.
async fn with_progress<T>(
    record: &SharedRecord,
    label: &str,
    work: impl std::future::Future<Output = T>,
) -> T {
    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} {msg} [{bar:40.cyan/blue}] {pos}%")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb.set_message(label.to_string());

    let mut status = record.subscribe_status();
    let bar = pb.clone();
    let watcher = tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let percent = status.borrow_and_update().percent;
            bar.set_position(u64::from(percent));
        }
    });

    let canceller = Arc::clone(record);
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            canceller.cancel();
        }
    });

    let result = work.await;
    watcher.abort();
    interrupt.abort();
    pb.finish_and_clear();
    result
}

/// Print the error the way a front end would present it and fail.
fn report(op: Operation, record: &SharedRecord, err: attachflow::AttachError) -> anyhow::Error {
    let name = record.display_name();
    match failure_notice(op, name.as_deref(), &err) {
        Some(notice) => anyhow::anyhow!("{notice}"),
        None => anyhow::anyhow!("{op} cancelled"),
    }
}

#[derive(Serialize)]
struct LoadSummary<'a> {
    #[serde(flatten)]
    metadata: &'a Metadata,
    disposition: &'static str,
    /// Encoding a composer would use to send the part.
    wire_encoding: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    charset: Option<String>,
    elapsed_ms: u128,
}

async fn cmd_load(
    config: Config,
    path: &Path,
    thumbnails: Option<PathBuf>,
    json: bool,
) -> anyhow::Result<()> {
    if !path.exists() {
        anyhow::bail!("File not found: {}", path.display());
    }
    let record = new_record(&config);
    record.set_source(Some(path.to_path_buf()));
    let default_charset = config.compose.default_charset.clone();
    let mut builder = Engine::builder().config(config);
    if let Some(dir) = thumbnails {
        builder = builder.thumbnails(Arc::new(ThumbnailDir::new(dir)));
    }
    let engine = builder.build()?;

    let start = Instant::now();
    let part = with_progress(&record, "Loading", engine.load(&record))
        .await
        .map_err(|e| report(Operation::Load, &record, e))?;
    let elapsed = start.elapsed();

    let Some(metadata) = record.metadata() else {
        anyhow::bail!("load finished without metadata");
    };
    let mime_type = part.mime_type();
    let wire_encoding = TransferEncoding::preferred_for(&mime_type, &part.data);
    let charset = mime_type
        .starts_with("text/")
        .then(|| part.charset_or(&default_charset));

    if json {
        let summary = LoadSummary {
            metadata: &metadata,
            disposition: part.disposition.as_str(),
            wire_encoding: wire_encoding.as_str(),
            charset,
            elapsed_ms: elapsed.as_millis(),
        };
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("Name:        {}", metadata.display_name);
        println!("Type:        {}", metadata.content_type);
        println!("Size:        {}", format_size(metadata.size, BINARY));
        println!("Encoding:    {}", wire_encoding.as_str());
        if let Some(charset) = &charset {
            println!("Charset:     {charset}");
        }
        let icon = record.icon();
        match &icon.thumbnail {
            Some(thumbnail) => println!("Thumbnail:   {}", thumbnail.display()),
            None => println!("Icon:        {}", icon.name),
        }
        if let Some(description) = &metadata.description {
            println!("Description: {description}");
        }
        if let Some(modified) = metadata.modified {
            println!("Modified:    {}", modified.format("%Y-%m-%d %H:%M:%S UTC"));
        }
        if let Some(source) = record.source() {
            println!("Source:      {}", source.display());
        }
        println!("Loaded in:   {:.2?}", elapsed);
    }
    Ok(())
}

async fn cmd_save(
    config: Config,
    path: &Path,
    output: &Path,
    extract: bool,
    extract_only: bool,
) -> anyhow::Result<()> {
    if !path.exists() {
        anyhow::bail!("File not found: {}", path.display());
    }
    let record = new_record(&config);
    record.set_source(Some(path.to_path_buf()));
    record.set_save_self(!extract_only);
    record.set_save_extracted(extract);
    let engine = Engine::new(config)?;

    with_progress(&record, "Loading", engine.load(&record))
        .await
        .map_err(|e| report(Operation::Load, &record, e))?;

    let saved = with_progress(&record, "Saving", engine.save(&record, output))
        .await
        .map_err(|e| report(Operation::Save, &record, e))?;

    println!("Saved to {}", saved.display());
    Ok(())
}

#[derive(Serialize)]
struct AttachmentRow {
    filename: Option<String>,
    content_type: String,
    disposition: &'static str,
    size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    saved_to: Option<PathBuf>,
}

async fn cmd_attachments(
    config: Config,
    path: &Path,
    output: Option<&Path>,
    json: bool,
) -> anyhow::Result<()> {
    let raw = std::fs::read(path)?;
    let parts = mime::attachments_from_message(&raw);
    if parts.is_empty() {
        if !json {
            println!("No attachments in {}", path.display());
        } else {
            println!("[]");
        }
        return Ok(());
    }

    if let Some(dir) = output {
        std::fs::create_dir_all(dir)?;
    }
    let engine = Engine::new(config.clone())?;

    let mut rows = Vec::with_capacity(parts.len());
    for part in parts {
        let mut row = AttachmentRow {
            filename: part.filename.clone(),
            content_type: part.content_type.clone(),
            disposition: part.disposition.as_str(),
            size: part.encoded_len(),
            saved_to: None,
        };

        if let Some(dir) = output {
            let record = new_record(&config);
            record.set_content(Some(part));
            row.saved_to = Some(
                with_progress(&record, "Saving", engine.save(&record, dir))
                    .await
                    .map_err(|e| report(Operation::Save, &record, e))?,
            );
        }
        rows.push(row);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!("{:<40} {:<30} {:<10} {:>10}", "Filename", "Type", "Disp.", "Size");
    println!("{}", "-".repeat(93));
    for row in &rows {
        println!(
            "{:<40} {:<30} {:<10} {:>10}",
            row.filename.as_deref().unwrap_or("-"),
            row.content_type,
            row.disposition,
            format_size(row.size, BINARY)
        );
        if let Some(saved) = &row.saved_to {
            println!("  -> {}", saved.display());
        }
    }
    Ok(())
}

fn cmd_config(config: &Config, init: bool) -> anyhow::Result<()> {
    if init {
        let path = config::save_config(config)?;
        println!("Wrote {}", path.display());
        return Ok(());
    }
    match config::config_file_path() {
        Some(path) => println!("# {}", path.display()),
        None => println!("# no config path available"),
    }
    println!("# log file: {}", config::log_file_path(config).display());
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

/// Generate shell completions and print to stdout.
fn cmd_completions(shell: clap_complete::Shell) -> anyhow::Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "attachflow", &mut std::io::stdout());
    Ok(())
}
