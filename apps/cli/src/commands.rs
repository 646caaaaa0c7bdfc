//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::Result;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use novelkb_chunker::ChunkerConfig;
use novelkb_core::{
    BuildDocsJob, ChunkJob, ExtractJob, MergeJob, ProgressReporter, backend_from_config,
    run_build_docs, run_chunk, run_extract, run_merge,
};
use novelkb_docs::{DocsOptions, NotesPrompt, NotesSource};
use novelkb_extract::{ExtractOptions, ExtractPrompt};
use novelkb_shared::{AppConfig, DirectionPolicy, init_config, load_config};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// novelkb: novel text in, character-relation knowledge base out.
#[derive(Parser)]
#[command(
    name = "novelkb",
    version,
    about = "Build a character and relation knowledge base from a novel with an LLM.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.novelkb/novelkb.toml).
    #[arg(long, env = "NOVELKB_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long = "log_format", default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Split a novel into overlapping, chapter-tagged chunks (JSONL).
    Chunk {
        /// Raw UTF-8 novel text.
        #[arg(long)]
        input: PathBuf,

        /// Chunk file to write.
        #[arg(long)]
        out: PathBuf,

        /// Chapters per chunk group (0 = no limit).
        #[arg(long = "max_chapters")]
        max_chapters: Option<usize>,

        /// Character cap per chunk.
        #[arg(long = "max_chars")]
        max_chars: Option<usize>,

        /// Characters shared by consecutive chunks.
        #[arg(long)]
        overlap: Option<usize>,

        /// Only chunk the first N chapters (0 = all).
        #[arg(long = "chapter_limit", default_value_t = 0)]
        chapter_limit: usize,

        /// Stop after N chunks (0 = all).
        #[arg(long = "max_chunks", default_value_t = 0)]
        max_chunks: usize,

        /// Only chunk the N-th volume (第N卷); 0 = whole text.
        #[arg(long, default_value_t = 0)]
        volume: usize,
    },

    /// Run LLM extraction over every chunk, appending to a resumable log.
    Extract {
        /// Chunk file from `chunk`.
        #[arg(long)]
        chunks: PathBuf,

        /// Extraction log (JSONL, appended).
        #[arg(long)]
        out: PathBuf,

        /// Prompt template file (built-in prompt when omitted).
        #[arg(long)]
        prompt: Option<PathBuf>,

        /// Concurrent requests.
        #[arg(long)]
        workers: Option<usize>,

        /// Process chunks that only have failed records again.
        #[arg(long = "retry_failed")]
        retry_failed: bool,
    },

    /// Merge the extraction log into characters.json and relations.json.
    Merge {
        /// Extraction log from `extract`.
        #[arg(long)]
        extractions: PathBuf,

        /// Directory for the knowledge-base files.
        #[arg(long = "out_dir")]
        out_dir: PathBuf,

        /// Alias table (TOML: canonical = ["alias", ...]).
        #[arg(long)]
        aliases: Option<PathBuf>,

        /// Relation direction policy: majority, bidirectional or strict.
        #[arg(long = "direction_policy")]
        direction_policy: Option<DirectionPolicy>,
    },

    /// Render Markdown documents and LLM study notes from a merged knowledge base.
    BuildDocs {
        /// Output directory for the documents.
        #[arg(long = "out_dir")]
        out_dir: PathBuf,

        /// Directory holding the merged tables (defaults to --out_dir).
        #[arg(long = "kb_dir")]
        kb_dir: Option<PathBuf>,

        /// Study-notes prompt template (built-in prompt when omitted).
        #[arg(long)]
        prompt: Option<PathBuf>,

        /// Write offline study notes without calling the model.
        #[arg(long = "no_llm")]
        no_llm: bool,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "novelkb=info",
        1 => "novelkb=debug",
        _ => "novelkb=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Chunk {
            input,
            out,
            max_chapters,
            max_chars,
            overlap,
            chapter_limit,
            max_chunks,
            volume,
        } => {
            let config = load_config(config_path)?;
            let chunker = ChunkerConfig {
                max_chars: max_chars.unwrap_or(config.chunking.max_chars),
                overlap: overlap.unwrap_or(config.chunking.overlap),
                max_chapters: max_chapters.unwrap_or(config.chunking.max_chapters),
                chapter_limit,
                max_chunks,
                volume,
            };
            cmd_chunk(input, out, chunker)
        }
        Command::Extract {
            chunks,
            out,
            prompt,
            workers,
            retry_failed,
        } => {
            let config = load_config(config_path)?;
            let mut options = ExtractOptions::from_config(&config);
            if let Some(workers) = workers {
                options.workers = workers;
            }
            options.retry_failed = retry_failed;
            cmd_extract(&config, chunks, out, prompt.as_deref(), options).await
        }
        Command::Merge {
            extractions,
            out_dir,
            aliases,
            direction_policy,
        } => {
            let config = load_config(config_path)?;
            let policy = direction_policy.unwrap_or(config.merge.direction_policy);
            cmd_merge(extractions, out_dir, aliases, policy)
        }
        Command::BuildDocs {
            out_dir,
            kb_dir,
            prompt,
            no_llm,
        } => {
            let config = load_config(config_path)?;
            let kb_dir = kb_dir.unwrap_or_else(|| out_dir.clone());
            cmd_build_docs(&config, kb_dir, out_dir, prompt.as_deref(), no_llm).await
        }
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(config_path),
        },
    }
}

// ---------------------------------------------------------------------------
// Stage commands
// ---------------------------------------------------------------------------

fn cmd_chunk(input: PathBuf, out: PathBuf, config: ChunkerConfig) -> Result<()> {
    info!(
        input = %input.display(),
        max_chars = config.max_chars,
        overlap = config.overlap,
        max_chapters = config.max_chapters,
        volume = config.volume,
        "chunking"
    );
    let reporter = CliProgress::new();
    let report = run_chunk(&ChunkJob { input, out: out.clone(), config }, &reporter)?;

    println!();
    println!("  Chunking complete!");
    if let Some(title) = &report.volume_title {
        println!("  Volume:   {title}");
    }
    println!(
        "  Chapters: {} used / {} detected",
        report.chapters_used, report.chapters_detected
    );
    println!("  Chunks:   {}", report.chunks);
    println!("  Output:   {}", out.display());
    println!();
    Ok(())
}

async fn cmd_extract(
    config: &AppConfig,
    chunks: PathBuf,
    out: PathBuf,
    prompt: Option<&Path>,
    options: ExtractOptions,
) -> Result<()> {
    // Validate API key and prompt before doing anything
    let backend = backend_from_config(config)?;
    let prompt = ExtractPrompt::load(prompt)?;

    info!(
        model = %config.llm.model,
        workers = options.workers,
        retry_failed = options.retry_failed,
        "extracting"
    );
    let reporter = CliProgress::new();
    let job = ExtractJob {
        chunks,
        out: out.clone(),
        prompt,
        options,
    };
    let summary = run_extract(job, backend, &reporter).await?;

    println!();
    println!("  Extraction complete!");
    println!("  Chunks:    {}", summary.total);
    println!("  Skipped:   {}", summary.skipped);
    println!("  Processed: {}", summary.processed);
    println!("  Succeeded: {}", summary.succeeded);
    println!("  Failed:    {}", summary.failed);
    if summary.unreadable_log_lines > 0 {
        println!("  Unreadable log lines: {}", summary.unreadable_log_lines);
    }
    println!("  Log:       {}", out.display());
    if summary.failed > 0 {
        println!("  Re-run with --retry_failed to process failed chunks again.");
    }
    println!();
    Ok(())
}

fn cmd_merge(
    extractions: PathBuf,
    out_dir: PathBuf,
    aliases: Option<PathBuf>,
    policy: DirectionPolicy,
) -> Result<()> {
    let reporter = CliProgress::new();
    let job = MergeJob {
        extractions,
        out_dir: out_dir.clone(),
        aliases,
        policy,
    };
    let report = run_merge(&job, &reporter)?;

    println!();
    println!("  Merge complete!");
    println!(
        "  Records:    {} ({} failed, {} duplicate)",
        report.stats.records, report.stats.failed_records, report.stats.duplicate_records
    );
    println!("  Characters: {}", report.characters);
    println!("  Relations:  {}", report.relations);
    println!("  Conflicts:  {}", report.conflicts);
    println!("  Output:     {}", out_dir.display());
    println!();
    Ok(())
}

async fn cmd_build_docs(
    config: &AppConfig,
    kb_dir: PathBuf,
    out_dir: PathBuf,
    prompt: Option<&Path>,
    no_llm: bool,
) -> Result<()> {
    let backend = if no_llm {
        None
    } else {
        Some(backend_from_config(config)?)
    };
    let mut options = DocsOptions::from_config(config);
    options.no_llm = no_llm;

    let reporter = CliProgress::new();
    let job = BuildDocsJob {
        kb_dir,
        out_dir: out_dir.clone(),
        prompt: NotesPrompt::load(prompt)?,
        options,
    };
    let report = run_build_docs(job, backend, &reporter).await?;

    let notes = match report.manifest.study_notes {
        NotesSource::Llm => "generated",
        NotesSource::EmptyKb => "skipped (empty knowledge base)",
        NotesSource::Offline => "offline",
        NotesSource::Failed => "offline (model call failed)",
    };

    println!();
    println!("  Documents written!");
    println!("  Build:       {}", report.manifest.build_id);
    println!("  Documents:   {}", report.manifest.documents.len());
    println!("  Study notes: {notes}");
    if let Some(error) = &report.notes_error {
        println!("  Error:       {error}");
    }
    println!("  Output:      {}", out_dir.display());
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using indicatif spinners/bars.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        bar.enable_steady_tick(Duration::from_millis(80));
        Self { bar }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.bar.set_message(name.to_string());
    }

    fn extract_started(&self, to_process: usize, skipped: usize) {
        self.bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} [{bar:30}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        self.bar.set_length(to_process as u64);
        self.bar.set_position(0);
        if skipped > 0 {
            self.bar.set_message(format!("{skipped} already done"));
        }
    }

    fn chunk_extracted(&self, chunk_id: &str, ok: bool, done: usize, _total: usize) {
        self.bar.set_position(done as u64);
        let status = if ok { "ok" } else { "failed" };
        self.bar.set_message(format!("{chunk_id} {status}"));
    }

    fn done(&self, _stage: &str, _elapsed: Duration) {
        self.bar.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// Config commands
// ---------------------------------------------------------------------------

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(path: Option<&Path>) -> Result<()> {
    let config: AppConfig = load_config(path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_underscore_flags() {
        let cli = Cli::try_parse_from([
            "novelkb",
            "chunk",
            "--input",
            "novel.txt",
            "--out",
            "chunks.jsonl",
            "--max_chars",
            "2800",
            "--overlap",
            "200",
        ])
        .unwrap();
        match cli.command {
            Command::Chunk {
                max_chars,
                overlap,
                max_chapters,
                chapter_limit,
                ..
            } => {
                assert_eq!(max_chars, Some(2800));
                assert_eq!(overlap, Some(200));
                assert_eq!(max_chapters, None);
                assert_eq!(chapter_limit, 0);
            }
            _ => panic!("expected chunk"),
        }
    }

    #[test]
    fn parses_volume_flag() {
        let cli = Cli::try_parse_from([
            "novelkb", "chunk", "--input", "novel.txt", "--out", "chunks.jsonl", "--volume", "2",
        ])
        .unwrap();
        assert!(matches!(cli.command, Command::Chunk { volume: 2, .. }));

        let cli = Cli::try_parse_from([
            "novelkb", "chunk", "--input", "novel.txt", "--out", "chunks.jsonl",
        ])
        .unwrap();
        assert!(matches!(cli.command, Command::Chunk { volume: 0, .. }));
    }

    #[test]
    fn parses_direction_policy() {
        let cli = Cli::try_parse_from([
            "novelkb",
            "merge",
            "--extractions",
            "log.jsonl",
            "--out_dir",
            "kb",
            "--direction_policy",
            "strict",
        ])
        .unwrap();
        match cli.command {
            Command::Merge {
                direction_policy, ..
            } => assert_eq!(direction_policy, Some(DirectionPolicy::Strict)),
            _ => panic!("expected merge"),
        }
    }

    #[test]
    fn rejects_unknown_direction_policy() {
        let result = Cli::try_parse_from([
            "novelkb",
            "merge",
            "--extractions",
            "log.jsonl",
            "--out_dir",
            "kb",
            "--direction_policy",
            "sideways",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn build_docs_subcommand_name() {
        let cli = Cli::try_parse_from([
            "novelkb",
            "build-docs",
            "--out_dir",
            "kb",
            "--no_llm",
            "--log_format",
            "json",
        ])
        .unwrap();
        assert!(matches!(cli.log_format, LogFormat::Json));
        assert!(matches!(cli.command, Command::BuildDocs { no_llm: true, .. }));
    }
}
