//! Z-DMR CLI - command-line download manager and headless daemon.
//!
//! Embeds `zdmr-core` directly for local commands; `serve` instead runs
//! the Control API as a long-lived process other tools talk to over
//! the loopback HTTP surface.

mod commands;
mod output;
mod progress;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Z-DMR - concurrent, resumable download manager
#[derive(Parser)]
#[command(name = "zdmr")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Application data directory (database, default download path)
    #[arg(long, env = "ZDMR_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "human")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Human,
    Json,
    Table,
}

#[derive(Subcommand)]
enum Commands {
    /// Add one or more downloads
    Add {
        /// URL(s) to download
        urls: Vec<String>,

        /// Destination directory
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Group a list of URLs into a batch
    Batch {
        /// Batch name
        #[arg(long)]
        name: Option<String>,

        /// Destination directory for every download in the batch
        #[arg(short, long)]
        output: PathBuf,

        /// URL(s) to add
        #[arg(short, long)]
        url: Vec<String>,

        /// Path to a file with one URL per line, merged with `--url`
        #[arg(long)]
        url_file: Option<PathBuf>,

        /// Force every download in this batch through the proxy rules
        #[arg(long)]
        proxy: bool,
    },

    /// List downloads
    List,

    /// Show one download's full detail
    Info {
        /// Download ID
        id: String,
    },

    /// Pause a download
    Pause {
        /// Download ID
        id: String,
    },

    /// Resume a paused download
    Resume {
        /// Download ID
        id: String,
    },

    /// Retry an errored download
    Retry {
        /// Download ID
        id: String,
    },

    /// Cancel and delete a download
    Delete {
        /// Download ID
        id: String,
    },

    /// Route a failing download's host through a proxy and retry it
    UseProxy {
        /// Download ID
        id: String,
        /// Proxy URL to route the failing host through
        proxy_url: String,
    },

    /// Remove every completed download from the list
    ClearCompleted,

    /// Watch live progress for active downloads until they finish
    Watch,

    /// Probe one or more URLs without starting a download
    Probe {
        /// URLs to probe
        urls: Vec<String>,
    },

    /// Hostname-pattern rule management
    Rule {
        #[command(subcommand)]
        action: RuleAction,
    },

    /// Show or update settings
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Run the Control API as a headless daemon
    Serve {
        /// Port to bind on 127.0.0.1 (defaults to the configured setting)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum RuleAction {
    /// List all rules
    List,

    /// Add a proxy rule
    Proxy {
        /// Hostname pattern (`*`, `*.example.com`, or an exact host)
        host_pattern: String,
        /// Proxy URL to route matching hosts through
        proxy_url: String,
    },

    /// Add a header-injection rule
    Header {
        host_pattern: String,
        name: String,
        value: String,
        /// Always replace any existing value for this header, rather
        /// than only filling it in when absent
        #[arg(long)]
        override_existing: bool,
    },

    /// Add a mirror-fallback rule
    Mirror {
        host_pattern: String,
        /// Fallback base hosts to try, in order
        mirror_hosts: Vec<String>,
    },

    /// Remove a rule by ID
    Remove { id: i64 },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show all settings
    Show,

    /// Set the global speed limit in bytes/sec (omit to clear it)
    SpeedLimit { bytes_per_sec: Option<u64> },

    /// Set the maximum number of concurrent downloads
    MaxConcurrent { count: u32 },

    /// Set the default download directory
    DefaultPath { path: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let data_dir = cli.data_dir.unwrap_or_else(|| {
        directories::ProjectDirs::from("", "", "zdmr")
            .map(|d| d.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".zdmr"))
    });

    let _log_guard = zdmr_core::init_logging(data_dir.join("logs"));

    let runtime = zdmr_core::bootstrap(data_dir.join("zdmr.sqlite"), data_dir.join("tmp")).await?;

    match cli.command {
        Commands::Add { urls, output } => commands::add_downloads(&runtime, urls, output, cli.output).await?,

        Commands::Batch {
            name,
            output,
            url,
            url_file,
            proxy,
        } => commands::create_batch(&runtime, name, output, url, url_file, proxy, cli.output).await?,

        Commands::List => commands::list_downloads(&runtime, cli.output).await?,

        Commands::Info { id } => commands::show_info(&runtime, &id, cli.output).await?,

        Commands::Pause { id } => commands::pause_download(&runtime, &id).await?,

        Commands::Resume { id } => commands::resume_download(&runtime, &id).await?,

        Commands::Retry { id } => commands::retry_download(&runtime, &id).await?,

        Commands::Delete { id } => commands::delete_download(&runtime, &id).await?,

        Commands::UseProxy { id, proxy_url } => commands::add_host_to_proxy_and_retry(&runtime, &id, proxy_url).await?,

        Commands::ClearCompleted => commands::clear_completed(&runtime).await?,

        Commands::Watch => commands::watch(&runtime).await?,

        Commands::Probe { urls } => commands::probe_urls(urls, cli.output).await?,

        Commands::Rule { action } => commands::rule_action(&runtime, action, cli.output).await?,

        Commands::Config { action } => commands::config_action(&runtime, action, cli.output).await?,

        Commands::Serve { port } => commands::serve(&runtime, port).await?,

        Commands::Completions { shell } => {
            use clap::CommandFactory;
            clap_complete::generate(shell, &mut Cli::command(), "zdmr", &mut std::io::stdout());
        }
    }

    Ok(())
}
