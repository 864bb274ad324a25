use anyhow::Context;
use clap::Parser;
use dialoguer::Confirm;
use dsfetch::{get_dataset, ApiClient, DatasetError, GetConfig, Prompter};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "dsfetch")]
#[command(about = "Download datasets from object storage", long_about = None)]
#[command(version)]
struct Args {
    /// Dataset name, optionally with a sub-path (e.g. "demo/raw/train")
    name: String,

    /// Number of files downloaded concurrently
    #[arg(short, long, default_value_t = 10)]
    thread: usize,

    /// Aggregate bandwidth limit in KB/s (0 = unlimited)
    #[arg(short, long, default_value_t = 0, allow_negative_numbers = true)]
    limit_speed: i64,

    /// Download the uncompressed files instead of the compressed archive
    #[arg(long)]
    no_compressed: bool,

    /// Parent directory for the dataset folder
    #[arg(short, long, default_value = ".")]
    output: PathBuf,

    /// Metadata API base URL
    #[arg(long, env = "DSFETCH_API_URL", default_value = "https://opendatalab.com/api")]
    api_url: String,

    /// API access token
    #[arg(long, env = "DSFETCH_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Answer yes to every prompt
    #[arg(short, long)]
    yes: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

struct TerminalPrompter {
    assume_yes: bool,
}

impl TerminalPrompter {
    fn confirm(&self, prompt: &str, default: bool) -> bool {
        if self.assume_yes {
            return true;
        }
        if !atty::is(atty::Stream::Stdin) {
            return false;
        }
        Confirm::new()
            .with_prompt(prompt)
            .default(default)
            .interact()
            .unwrap_or(false)
    }
}

impl Prompter for TerminalPrompter {
    fn accept_agreement(&self, notice: &str) -> bool {
        self.confirm(notice, false)
    }

    fn confirm_directory(&self, dir: &Path) -> bool {
        let dir = std::path::absolute(dir).unwrap_or_else(|_| dir.to_path_buf());
        self.confirm(
            &format!("Do you want to download files into local directory: {} ?", dir.display()),
            true,
        )
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("dsfetch={}", log_level))
        .init();

    info!("🚀 dsfetch - Dataset Downloader");
    info!("Dataset: {}", args.name);
    info!("Threads: {}, limit: {} KB/s", args.thread, args.limit_speed);

    if args.thread == 0 {
        eprintln!("Error: --thread must be at least 1");
        std::process::exit(1);
    }

    let client = reqwest::Client::builder()
        .user_agent(concat!("dsfetch/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build HTTP client")?;
    let api = ApiClient::new(client, args.api_url, args.token);

    let config = GetConfig {
        name: args.name,
        threads: args.thread,
        limit_speed: args.limit_speed,
        compressed: !args.no_compressed,
        output_dir: args.output,
        show_progress: atty::is(atty::Stream::Stderr),
        ..GetConfig::default()
    };
    let prompter = TerminalPrompter {
        assume_yes: args.yes,
    };

    match get_dataset(&api, &config, &prompter).await {
        Ok(report) if report.retry.is_complete() => {
            println!("{}", report.message());
            Ok(())
        }
        Ok(report) => {
            eprintln!("❌ {}", report.message());
            std::process::exit(2);
        }
        Err(DatasetError::Declined) => {
            eprintln!("bye~");
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("❌ Error: {}", e);
            std::process::exit(1);
        }
    }
}
