//! Maktab - offline Quran reader backend
//! Command-line shell over the offline cache and download jobs

mod commands;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use maktab_lib::{AppState, ChapterId, Config, PageNumber};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "maktab=info,maktab_lib=info,reqwest=warn";

#[derive(Parser)]
#[command(name = "maktab", version, about = "Offline Quran pages and recitations")]
struct Cli {
    /// Configuration file (defaults to <data_dir>/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show a page, from the offline store when possible
    Page {
        page: Option<PageNumber>,
        /// Open the first page of a juz instead
        #[arg(long, conflicts_with = "page")]
        juz: Option<u8>,
        #[arg(long)]
        lang: Option<String>,
    },
    /// Resolve the recitations for a page
    Audio {
        page: PageNumber,
        #[arg(long)]
        reciter: Option<String>,
        #[arg(long)]
        lang: Option<String>,
    },
    /// List known reciters
    Reciters,
    /// Cache the text of every page
    DownloadText {
        #[arg(long)]
        lang: Option<String>,
    },
    /// Download recitations for chapters
    DownloadAudio {
        chapters: Vec<ChapterId>,
        /// Every chapter
        #[arg(long, conflicts_with = "chapters")]
        all: bool,
        #[arg(long)]
        reciter: Option<String>,
        #[arg(long)]
        lang: Option<String>,
    },
    /// Download recitations for the chapters on one page
    DownloadPageAudio {
        page: PageNumber,
        #[arg(long)]
        reciter: Option<String>,
        #[arg(long)]
        lang: Option<String>,
    },
    /// List chapters with downloaded audio
    Downloaded {
        #[arg(long)]
        reciter: Option<String>,
    },
    /// Delete a chapter's downloaded audio
    Delete {
        chapter: ChapterId,
        #[arg(long)]
        reciter: Option<String>,
    },
    /// Show storage usage
    Usage,
    /// Remove everything from the offline store
    Clear {
        #[arg(long)]
        yes: bool,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    tracing::debug!(data_dir = ?config.data_dir, "using data directory");
    let state = AppState::new(config).context("Failed to initialize offline store")?;
    let json = cli.json;

    match cli.command {
        Command::Page { page, juz, lang } => commands::page(&state, page, juz, lang, json).await,
        Command::Audio { page, reciter, lang } => {
            commands::audio(&state, page, reciter.as_deref(), lang, json).await
        }
        Command::Reciters => commands::reciters(json),
        Command::DownloadText { lang } => commands::download_text(&state, lang, json).await,
        Command::DownloadAudio {
            chapters,
            all,
            reciter,
            lang,
        } => commands::download_audio(&state, &chapters, all, reciter.as_deref(), lang, json).await,
        Command::DownloadPageAudio { page, reciter, lang } => {
            commands::download_page_audio(&state, page, reciter.as_deref(), lang, json).await
        }
        Command::Downloaded { reciter } => commands::downloaded(&state, reciter.as_deref(), json).await,
        Command::Delete { chapter, reciter } => commands::delete(&state, chapter, reciter.as_deref()).await,
        Command::Usage => commands::usage(&state, json).await,
        Command::Clear { yes } => commands::clear(&state, yes).await,
    }
}
