//! The four file-to-file stages: chunk → extract → merge → build-docs.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, instrument, warn};

use novelkb_chunker::{Chunker, ChunkerConfig};
use novelkb_docs::{DocBuilder, DocsOptions, DocsReport, NotesPrompt};
use novelkb_extract::{ExtractOptions, ExtractProgress, ExtractPrompt, ExtractionSummary, Extractor};
use novelkb_llm::{LlmBackend, OpenAiBackend};
use novelkb_merge::{AliasTable, KbAccumulator, KnowledgeBase, MergeStats};
use novelkb_shared::{
    AppConfig, Chunk, DirectionPolicy, ExtractionRecord, NovelKbError, Result,
};
use novelkb_storage::{ArtifactMeta, ReadMode, read_jsonl, write_jsonl_atomic};

/// Progress callback for reporting stage status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called once the extraction work list is known.
    fn extract_started(&self, _to_process: usize, _skipped: usize) {}
    /// Called after each extraction record is written.
    fn chunk_extracted(&self, chunk_id: &str, ok: bool, done: usize, total: usize);
    /// Called when a stage completes.
    fn done(&self, stage: &str, elapsed: Duration);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn chunk_extracted(&self, _chunk_id: &str, _ok: bool, _done: usize, _total: usize) {}
    fn done(&self, _stage: &str, _elapsed: Duration) {}
}

/// Adapter bridging `ProgressReporter` to the extractor's progress hook.
struct ExtractProgressAdapter<'a> {
    inner: &'a dyn ProgressReporter,
}

impl ExtractProgress for ExtractProgressAdapter<'_> {
    fn started(&self, to_process: usize, skipped: usize) {
        self.inner.extract_started(to_process, skipped);
    }

    fn record_written(&self, record: &ExtractionRecord, done: usize, total: usize) {
        self.inner
            .chunk_extracted(&record.chunk_id, record.is_ok(), done, total);
    }
}

/// HTTP backend from config; fails early when the API key is missing.
pub fn backend_from_config(config: &AppConfig) -> Result<Arc<dyn LlmBackend>> {
    let backend = OpenAiBackend::from_config(config)?;
    info!(endpoint = backend.endpoint(), model = backend.model(), "using LLM backend");
    Ok(Arc::new(backend))
}

// ---------------------------------------------------------------------------
// chunk
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ChunkJob {
    /// Raw UTF-8 novel text.
    pub input: PathBuf,
    /// Chunk JSONL to write.
    pub out: PathBuf,
    pub config: ChunkerConfig,
}

#[derive(Debug, Clone)]
pub struct ChunkReport {
    pub chunks: usize,
    pub chapters_detected: usize,
    pub chapters_used: usize,
    pub volume_title: Option<String>,
    pub artifact: ArtifactMeta,
}

#[instrument(skip_all, fields(input = %job.input.display(), out = %job.out.display()))]
pub fn run_chunk(job: &ChunkJob, progress: &dyn ProgressReporter) -> Result<ChunkReport> {
    let start = Instant::now();
    let chunker = Chunker::new(job.config.clone())?;

    progress.phase("chunking");
    let text =
        std::fs::read_to_string(&job.input).map_err(|e| NovelKbError::io(&job.input, e))?;
    let chunking = chunker.chunk_text(&text);
    let artifact = write_jsonl_atomic(&job.out, &chunking.chunks)?;

    info!(
        chunks = chunking.chunks.len(),
        chapters = chunking.chapters_used,
        "chunking complete"
    );
    progress.done("chunk", start.elapsed());

    Ok(ChunkReport {
        chunks: chunking.chunks.len(),
        chapters_detected: chunking.chapters_detected,
        chapters_used: chunking.chapters_used,
        volume_title: chunking.volume_title,
        artifact,
    })
}

// ---------------------------------------------------------------------------
// extract
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ExtractJob {
    /// Chunk JSONL from the chunk stage.
    pub chunks: PathBuf,
    /// Extraction log; appended to, never rewritten.
    pub out: PathBuf,
    pub prompt: ExtractPrompt,
    pub options: ExtractOptions,
}

#[instrument(skip_all, fields(chunks = %job.chunks.display(), out = %job.out.display()))]
pub async fn run_extract(
    job: ExtractJob,
    backend: Arc<dyn LlmBackend>,
    progress: &dyn ProgressReporter,
) -> Result<ExtractionSummary> {
    let start = Instant::now();
    let extractor = Extractor::new(backend, job.prompt, job.options)?;

    progress.phase("reading chunks");
    let chunks: Vec<Chunk> = read_jsonl(&job.chunks, ReadMode::Strict)?.records;

    progress.phase("extracting");
    let adapter = ExtractProgressAdapter { inner: progress };
    let summary = extractor.run(chunks, &job.out, &adapter).await?;

    progress.done("extract", start.elapsed());
    Ok(summary)
}

// ---------------------------------------------------------------------------
// merge
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MergeJob {
    /// Extraction log from the extract stage.
    pub extractions: PathBuf,
    pub out_dir: PathBuf,
    /// Optional TOML alias table.
    pub aliases: Option<PathBuf>,
    pub policy: DirectionPolicy,
}

#[derive(Debug, Clone)]
pub struct MergeReport {
    pub stats: MergeStats,
    pub characters: usize,
    pub relations: usize,
    pub conflicts: usize,
    /// Unreadable lines skipped in the extraction log.
    pub unreadable_log_lines: usize,
    pub artifacts: Vec<ArtifactMeta>,
}

#[instrument(skip_all, fields(extractions = %job.extractions.display(), out_dir = %job.out_dir.display(), policy = job.policy.as_str()))]
pub fn run_merge(job: &MergeJob, progress: &dyn ProgressReporter) -> Result<MergeReport> {
    let start = Instant::now();
    let aliases = match &job.aliases {
        Some(path) => AliasTable::load(path)?,
        None => AliasTable::default(),
    };

    progress.phase("reading extractions");
    let log = read_jsonl::<ExtractionRecord>(&job.extractions, ReadMode::Lenient)?;
    if log.skipped > 0 {
        warn!(skipped = log.skipped, "skipped unreadable extraction log lines");
    }

    progress.phase("merging");
    let mut acc = KbAccumulator::new();
    for record in log.records {
        acc.absorb(record);
    }
    let output = acc.finish(&aliases, job.policy);
    let artifacts = output.write_to(&job.out_dir)?;

    info!(
        characters = output.kb.characters.len(),
        relations = output.kb.relations.len(),
        conflicts = output.report.conflicts.len(),
        failed_records = output.stats.failed_records,
        "merge complete"
    );
    progress.done("merge", start.elapsed());

    Ok(MergeReport {
        stats: output.stats,
        characters: output.kb.characters.len(),
        relations: output.kb.relations.len(),
        conflicts: output.report.conflicts.len(),
        unreadable_log_lines: log.skipped,
        artifacts,
    })
}

// ---------------------------------------------------------------------------
// build-docs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BuildDocsJob {
    /// Directory holding `characters.json` and `relations.json`.
    pub kb_dir: PathBuf,
    pub out_dir: PathBuf,
    pub prompt: NotesPrompt,
    pub options: DocsOptions,
}

#[instrument(skip_all, fields(kb_dir = %job.kb_dir.display(), out_dir = %job.out_dir.display()))]
pub async fn run_build_docs(
    job: BuildDocsJob,
    backend: Option<Arc<dyn LlmBackend>>,
    progress: &dyn ProgressReporter,
) -> Result<DocsReport> {
    let start = Instant::now();

    progress.phase("loading knowledge base");
    let kb = KnowledgeBase::load(&job.kb_dir)?;

    progress.phase("writing documents");
    let builder = DocBuilder::new(backend, job.prompt, job.options);
    let report = builder.build(&kb, &job.out_dir).await?;

    progress.done("build-docs", start.elapsed());
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Mutex;

    use novelkb_docs::{CHARACTER_SHEET_FILE, NotesSource};
    use novelkb_llm::{RetryPolicy, ScriptedBackend};
    use novelkb_merge::{CHARACTERS_FILE, EVIDENCE_FILE};
    use novelkb_shared::Character;
    use novelkb_storage::read_json;

    const ONE_ENTITY: &str = r#"{"entities":[{"name":"王林","type":"person"}],"relations":[]}"#;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("nkb-core-test-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Three chapters, 9000 characters in total.
    fn novel() -> String {
        let mut text = String::new();
        for chapter in 1..=3 {
            text.push_str(&format!("第{chapter}章 修炼\n"));
            text.push_str(&"山".repeat(2992));
            text.push('\n');
        }
        assert_eq!(text.chars().count(), 9000);
        text
    }

    fn write_novel(dir: &Path) -> PathBuf {
        let path = dir.join("novel.txt");
        std::fs::write(&path, novel()).unwrap();
        path
    }

    #[derive(Default)]
    struct RecordingProgress {
        events: Mutex<Vec<String>>,
    }

    impl RecordingProgress {
        fn push(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl ProgressReporter for RecordingProgress {
        fn phase(&self, name: &str) {
            self.push(format!("phase:{name}"));
        }
        fn chunk_extracted(&self, chunk_id: &str, ok: bool, _done: usize, _total: usize) {
            self.push(format!("chunk:{chunk_id}:{ok}"));
        }
        fn done(&self, stage: &str, _elapsed: Duration) {
            self.push(format!("done:{stage}"));
        }
    }

    #[tokio::test]
    async fn end_to_end_with_echoing_backend() {
        let dir = temp_dir();
        let chunks_path = dir.join("chunks.jsonl");
        let log_path = dir.join("extractions.jsonl");
        let kb_dir = dir.join("kb");

        let chunked = run_chunk(
            &ChunkJob {
                input: write_novel(&dir),
                out: chunks_path.clone(),
                config: ChunkerConfig {
                    max_chars: 2800,
                    overlap: 200,
                    ..Default::default()
                },
            },
            &SilentProgress,
        )
        .unwrap();
        assert_eq!(chunked.chunks, 4);
        assert_eq!(chunked.chapters_detected, 3);

        let backend = Arc::new(ScriptedBackend::fixed(ONE_ENTITY));
        let progress = RecordingProgress::default();
        let summary = run_extract(
            ExtractJob {
                chunks: chunks_path,
                out: log_path.clone(),
                prompt: ExtractPrompt::builtin().unwrap(),
                options: ExtractOptions {
                    workers: 2,
                    request_timeout: Duration::from_secs(5),
                    retry: RetryPolicy::new(1, 0, 0),
                    retry_failed: false,
                },
            },
            backend.clone(),
            &progress,
        )
        .await
        .unwrap();
        assert_eq!(summary.succeeded, 4);
        assert_eq!(backend.calls(), 4);

        let events = progress.events.lock().unwrap().clone();
        assert_eq!(events.iter().filter(|e| e.starts_with("chunk:")).count(), 4);
        assert_eq!(events.last().map(String::as_str), Some("done:extract"));

        let merged = run_merge(
            &MergeJob {
                extractions: log_path,
                out_dir: kb_dir.clone(),
                aliases: None,
                policy: DirectionPolicy::Majority,
            },
            &SilentProgress,
        )
        .unwrap();
        assert_eq!(merged.characters, 1);
        assert_eq!(merged.relations, 0);
        assert_eq!(merged.artifacts.len(), 5);
        assert!(kb_dir.join(EVIDENCE_FILE).exists());

        let characters: Vec<Character> = read_json(&kb_dir.join(CHARACTERS_FILE)).unwrap();
        assert_eq!(characters.len(), 1);
        assert_eq!(characters[0].name, "王林");
        assert_eq!(characters[0].mentions.len(), 4);

        let docs = run_build_docs(
            BuildDocsJob {
                kb_dir: kb_dir.clone(),
                out_dir: kb_dir.clone(),
                prompt: NotesPrompt::builtin().unwrap(),
                options: DocsOptions {
                    no_llm: true,
                    request_timeout: Duration::from_secs(5),
                    retry: RetryPolicy::new(0, 0, 0),
                },
            },
            None,
            &SilentProgress,
        )
        .await
        .unwrap();
        assert_eq!(docs.manifest.study_notes, NotesSource::Offline);
        let sheet = std::fs::read_to_string(kb_dir.join(CHARACTER_SHEET_FILE)).unwrap();
        assert!(sheet.contains("## 王林"));
    }

    #[test]
    fn bad_chunker_config_fails_before_reading_input() {
        let dir = temp_dir();
        let job = ChunkJob {
            input: dir.join("missing.txt"),
            out: dir.join("chunks.jsonl"),
            config: ChunkerConfig {
                max_chars: 100,
                overlap: 100,
                ..Default::default()
            },
        };
        let err = run_chunk(&job, &SilentProgress).unwrap_err();
        assert!(matches!(err, NovelKbError::Config { .. }));
        assert!(!job.out.exists());
    }

    #[test]
    fn missing_extraction_log_is_io_error() {
        let dir = temp_dir();
        let job = MergeJob {
            extractions: dir.join("missing.jsonl"),
            out_dir: dir.join("kb"),
            aliases: None,
            policy: DirectionPolicy::Majority,
        };
        let err = run_merge(&job, &SilentProgress).unwrap_err();
        assert!(matches!(err, NovelKbError::Io { .. }));
    }

    #[test]
    fn merge_skips_torn_log_tail() {
        let dir = temp_dir();
        let log = dir.join("extractions.jsonl");
        let good = r#"{"chunk_id":"000000","chapter_start":1,"chapter_end":1,"parse_status":"ok","entities":[{"name":"王林"}],"relations":[]}"#;
        std::fs::write(&log, format!("{good}\n{{\"chunk_id\":\"0000")).unwrap();

        let report = run_merge(
            &MergeJob {
                extractions: log,
                out_dir: dir.join("kb"),
                aliases: None,
                policy: DirectionPolicy::Majority,
            },
            &SilentProgress,
        )
        .unwrap();
        assert_eq!(report.characters, 1);
        assert_eq!(report.unreadable_log_lines, 1);
    }

    #[tokio::test]
    async fn build_docs_requires_merged_tables() {
        let dir = temp_dir();
        let err = run_build_docs(
            BuildDocsJob {
                kb_dir: dir.join("kb"),
                out_dir: dir.join("docs"),
                prompt: NotesPrompt::builtin().unwrap(),
                options: DocsOptions {
                    no_llm: true,
                    request_timeout: Duration::from_secs(1),
                    retry: RetryPolicy::new(0, 0, 0),
                },
            },
            None,
            &SilentProgress,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, NovelKbError::Io { .. }));
        assert!(!dir.join("docs").exists());
    }
}
