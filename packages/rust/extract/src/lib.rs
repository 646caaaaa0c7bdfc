//! Concurrent, resumable chunk extraction.
//!
//! Chunks go through a bounded queue to a fixed set of workers. Each worker
//! owns one in-flight backend request at a time, bounded by a per-attempt
//! timeout and retried with backoff. Finished records flow to a single
//! collector that appends them to the extraction log.
//!
//! Re-running against an existing log skips chunks that already have a
//! record, so an interrupted run picks up where it stopped.

pub mod decode;
pub mod prompt;

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use novelkb_llm::{BackendError, LlmBackend, RetryPolicy, Retryable, complete_with_timeout};
use novelkb_shared::{AppConfig, Chunk, ExtractionRecord, FailureReason, NovelKbError, Result};
use novelkb_storage::{LogWriter, ReadMode, read_jsonl_if_exists};

pub use decode::{DecodeError, decode_response};
pub use prompt::ExtractPrompt;

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Concurrent workers, each with one request in flight.
    pub workers: usize,
    /// Deadline for one backend attempt.
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    /// Process chunks whose only records are failures again.
    pub retry_failed: bool,
}

impl ExtractOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            workers: config.extract.workers,
            request_timeout: Duration::from_secs(config.llm.request_timeout_secs),
            retry: RetryPolicy::from_config(&config.retry),
            retry_failed: false,
        }
    }
}

/// Counts reported at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractionSummary {
    /// Chunks in the input.
    pub total: usize,
    /// Chunks skipped because the log already covers them.
    pub skipped: usize,
    /// Chunks sent through the backend in this run.
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Unreadable lines found in the existing log.
    pub unreadable_log_lines: usize,
}

/// Progress hook for the collector.
pub trait ExtractProgress: Send + Sync {
    /// Called once the work list is known.
    fn started(&self, _to_process: usize, _skipped: usize) {}
    /// Called after each record is durably appended.
    fn record_written(&self, record: &ExtractionRecord, done: usize, total: usize);
}

/// No-op progress hook.
pub struct NoProgress;

impl ExtractProgress for NoProgress {
    fn record_written(&self, _record: &ExtractionRecord, _done: usize, _total: usize) {}
}

/// One failed attempt: either the call failed or its reply did not decode.
#[derive(Debug)]
enum AttemptError {
    Backend(BackendError),
    Decode { raw: String, error: DecodeError },
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backend(e) => write!(f, "{e}"),
            Self::Decode { error, .. } => write!(f, "{error}"),
        }
    }
}

impl Retryable for AttemptError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Backend(e) => e.is_retryable(),
            Self::Decode { .. } => true,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Backend(e) => e.retry_after(),
            Self::Decode { .. } => None,
        }
    }
}

struct Worker {
    backend: Arc<dyn LlmBackend>,
    prompt: ExtractPrompt,
    options: ExtractOptions,
}

impl Worker {
    #[instrument(skip_all, fields(chunk_id = %chunk.id))]
    async fn extract(&self, chunk: &Chunk) -> ExtractionRecord {
        let request = self.prompt.request_for(chunk);

        let outcome = self
            .options
            .retry
            .run("extract_chunk", |attempt| {
                let request = &request;
                async move {
                    debug!(attempt, "calling backend");
                    let raw = match complete_with_timeout(
                        self.backend.as_ref(),
                        request,
                        self.options.request_timeout,
                    )
                    .await
                    {
                        Ok(raw) => raw,
                        Err(e) => return Err(AttemptError::Backend(e)),
                    };
                    match decode_response(&raw) {
                        Ok(payload) => Ok((raw, payload)),
                        Err(error) => Err(AttemptError::Decode { raw, error }),
                    }
                }
            })
            .await;

        match outcome.result {
            Ok((raw, payload)) => ExtractionRecord::success(chunk, raw, payload, outcome.attempts),
            Err(AttemptError::Backend(e)) => {
                let reason = FailureReason {
                    kind: e.failure_kind(),
                    message: e.to_string(),
                };
                ExtractionRecord::failure(chunk, None, reason, outcome.attempts)
            }
            Err(AttemptError::Decode { raw, error }) => {
                ExtractionRecord::failure(chunk, Some(raw), error.into_reason(), outcome.attempts)
            }
        }
    }
}

pub struct Extractor {
    worker: Arc<Worker>,
}

impl Extractor {
    pub fn new(
        backend: Arc<dyn LlmBackend>,
        prompt: ExtractPrompt,
        options: ExtractOptions,
    ) -> Result<Self> {
        if options.workers == 0 {
            return Err(NovelKbError::config("workers must be at least 1"));
        }
        Ok(Self {
            worker: Arc::new(Worker {
                backend,
                prompt,
                options,
            }),
        })
    }

    /// Extract every chunk not yet covered by the log at `log_path`.
    ///
    /// Per-chunk failures become failed records; only log I/O errors abort.
    #[instrument(skip_all, fields(chunks = chunks.len(), log = %log_path.display()))]
    pub async fn run(
        &self,
        chunks: Vec<Chunk>,
        log_path: &Path,
        progress: &dyn ExtractProgress,
    ) -> Result<ExtractionSummary> {
        let existing = read_jsonl_if_exists::<ExtractionRecord>(log_path, ReadMode::Lenient)?;
        let mut ok_ids = HashSet::new();
        let mut seen_ids = HashSet::new();
        for record in &existing.records {
            if record.is_ok() {
                ok_ids.insert(record.chunk_id.clone());
            }
            seen_ids.insert(record.chunk_id.clone());
        }

        let mut summary = ExtractionSummary {
            total: chunks.len(),
            unreadable_log_lines: existing.skipped,
            ..Default::default()
        };

        let retry_failed = self.worker.options.retry_failed;
        let mut queued = HashSet::new();
        let mut todo = Vec::new();
        for chunk in chunks {
            let done = if retry_failed {
                ok_ids.contains(&chunk.id)
            } else {
                seen_ids.contains(&chunk.id)
            };
            if done || !queued.insert(chunk.id.clone()) {
                summary.skipped += 1;
            } else {
                todo.push(chunk);
            }
        }

        info!(
            to_process = todo.len(),
            skipped = summary.skipped,
            workers = self.worker.options.workers,
            "starting extraction"
        );
        progress.started(todo.len(), summary.skipped);

        let mut writer = LogWriter::open(log_path).await?;
        let total = todo.len();
        if total == 0 {
            return Ok(summary);
        }

        let workers = self.worker.options.workers;
        let (task_tx, task_rx) = mpsc::channel::<Chunk>(workers * 2);
        let (record_tx, mut record_rx) = mpsc::channel::<ExtractionRecord>(workers * 2);
        let task_rx = Arc::new(Mutex::new(task_rx));

        let mut tasks = JoinSet::new();

        tasks.spawn(async move {
            for chunk in todo {
                if task_tx.send(chunk).await.is_err() {
                    break;
                }
            }
        });

        for _ in 0..workers {
            let task_rx = Arc::clone(&task_rx);
            let record_tx = record_tx.clone();
            let worker = Arc::clone(&self.worker);
            tasks.spawn(async move {
                loop {
                    let next = task_rx.lock().await.recv().await;
                    let Some(chunk) = next else { break };
                    let record = worker.extract(&chunk).await;
                    if record_tx.send(record).await.is_err() {
                        break;
                    }
                }
            });
        }
        drop(record_tx);

        // Collector: the only writer of the log.
        while let Some(record) = record_rx.recv().await {
            writer.append(&record).await?;
            summary.processed += 1;
            if record.is_ok() {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
                if let Some(failure) = &record.failure {
                    warn!(
                        chunk_id = %record.chunk_id,
                        kind = failure.kind.as_str(),
                        attempts = record.attempts,
                        "chunk extraction failed"
                    );
                }
            }
            progress.record_written(&record, summary.processed, total);
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                return Err(NovelKbError::Internal(format!("extraction worker panicked: {e}")));
            }
        }

        info!(
            processed = summary.processed,
            appended = writer.appended(),
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            "extraction complete"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use novelkb_llm::{CompletionRequest, ScriptedBackend};
    use novelkb_shared::FailureKind;
    use novelkb_storage::read_jsonl;

    const REPLY: &str = r#"{"entities":[{"name":"王林","type":"person"}],"relations":[],"events":[]}"#;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("nkb-extract-test-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn chunks(n: usize) -> Vec<Chunk> {
        (0..n)
            .map(|i| Chunk {
                id: format!("{i:06}"),
                chapter_start: 1,
                chapter_end: 1,
                chapter_title: "第1章 离乡".into(),
                part_index: i + 1,
                char_start: i * 10,
                char_end: i * 10 + 10,
                text: format!("片段{i}"),
            })
            .collect()
    }

    fn options(workers: usize) -> ExtractOptions {
        ExtractOptions {
            workers,
            request_timeout: Duration::from_secs(5),
            retry: RetryPolicy::new(2, 0, 0),
            retry_failed: false,
        }
    }

    fn extractor(backend: ScriptedBackend, opts: ExtractOptions) -> Extractor {
        Extractor::new(Arc::new(backend), ExtractPrompt::builtin().unwrap(), opts).unwrap()
    }

    fn read_log(path: &Path) -> Vec<ExtractionRecord> {
        read_jsonl(path, ReadMode::Strict).unwrap().records
    }

    /// Log contents keyed by chunk id, independent of completion order.
    fn by_chunk(records: Vec<ExtractionRecord>) -> BTreeMap<String, ExtractionRecord> {
        records.into_iter().map(|r| (r.chunk_id.clone(), r)).collect()
    }

    #[tokio::test]
    async fn extracts_every_chunk_with_many_workers() {
        let dir = temp_dir();
        let log = dir.join("extractions.jsonl");

        let summary = extractor(ScriptedBackend::fixed(REPLY), options(4))
            .run(chunks(20), &log, &NoProgress)
            .await
            .unwrap();

        assert_eq!(summary.processed, 20);
        assert_eq!(summary.succeeded, 20);
        let records = by_chunk(read_log(&log));
        assert_eq!(records.len(), 20);
        assert!(records.values().all(|r| r.is_ok() && r.entities[0].name == "王林"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn malformed_reply_is_retried() {
        let dir = temp_dir();
        let log = dir.join("extractions.jsonl");
        let backend = ScriptedBackend::new(|_, call| {
            if call == 0 {
                Ok("我觉得这段没有人物。".into())
            } else {
                Ok(REPLY.into())
            }
        });

        extractor(backend, options(1))
            .run(chunks(1), &log, &NoProgress)
            .await
            .unwrap();

        let records = read_log(&log);
        assert!(records[0].is_ok());
        assert_eq!(records[0].attempts, 2);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn exhausted_retries_write_failed_record() {
        let dir = temp_dir();
        let log = dir.join("extractions.jsonl");
        let backend = ScriptedBackend::fixed("抱歉，无法回答");

        let summary = extractor(backend, options(2))
            .run(chunks(3), &log, &NoProgress)
            .await
            .unwrap();

        assert_eq!(summary.failed, 3);
        let records = read_log(&log);
        assert_eq!(records.len(), 3);
        for record in &records {
            assert!(!record.is_ok());
            assert_eq!(record.attempts, 3);
            assert_eq!(record.failure.as_ref().unwrap().kind, FailureKind::NoJsonObject);
            assert_eq!(record.raw_response.as_deref(), Some("抱歉，无法回答"));
        }

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn non_retryable_backend_error_fails_once() {
        let dir = temp_dir();
        let log = dir.join("extractions.jsonl");
        let backend = ScriptedBackend::new(|_, _| {
            Err(BackendError::Api {
                status: 400,
                message: "unknown model".into(),
            })
        });

        extractor(backend, options(1))
            .run(chunks(1), &log, &NoProgress)
            .await
            .unwrap();

        let record = &read_log(&log)[0];
        assert_eq!(record.attempts, 1);
        assert_eq!(record.failure.as_ref().unwrap().kind, FailureKind::Backend);
        assert!(record.raw_response.is_none());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn slow_backend_times_out() {
        let dir = temp_dir();
        let log = dir.join("extractions.jsonl");
        let backend = ScriptedBackend::fixed(REPLY).with_delay(Duration::from_millis(300));
        let opts = ExtractOptions {
            request_timeout: Duration::from_millis(20),
            retry: RetryPolicy::new(1, 0, 0),
            ..options(1)
        };

        extractor(backend, opts)
            .run(chunks(1), &log, &NoProgress)
            .await
            .unwrap();

        let record = &read_log(&log)[0];
        assert_eq!(record.failure.as_ref().unwrap().kind, FailureKind::Timeout);
        assert_eq!(record.attempts, 2);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn resumed_run_matches_uninterrupted_run() {
        let dir = temp_dir();
        let full_log = dir.join("full.jsonl");
        let resumed_log = dir.join("resumed.jsonl");

        extractor(ScriptedBackend::fixed(REPLY), options(3))
            .run(chunks(6), &full_log, &NoProgress)
            .await
            .unwrap();

        // First run stops after two chunks.
        extractor(ScriptedBackend::fixed(REPLY), options(3))
            .run(chunks(2), &resumed_log, &NoProgress)
            .await
            .unwrap();
        let backend = Arc::new(ScriptedBackend::fixed(REPLY));
        let second = Extractor::new(backend.clone(), ExtractPrompt::builtin().unwrap(), options(3))
            .unwrap()
            .run(chunks(6), &resumed_log, &NoProgress)
            .await
            .unwrap();

        assert_eq!(second.skipped, 2);
        assert_eq!(second.processed, 4);
        assert_eq!(backend.calls(), 4);
        assert_eq!(by_chunk(read_log(&full_log)), by_chunk(read_log(&resumed_log)));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn retry_failed_reprocesses_only_failures() {
        let dir = temp_dir();
        let log = dir.join("extractions.jsonl");

        let flaky = ScriptedBackend::new(|req, _| {
            if req.user.contains("片段1") {
                Ok("not json".into())
            } else {
                Ok(REPLY.into())
            }
        });
        extractor(flaky, options(2))
            .run(chunks(3), &log, &NoProgress)
            .await
            .unwrap();

        // Without the flag, the failed chunk counts as done.
        let plain = extractor(ScriptedBackend::fixed(REPLY), options(2))
            .run(chunks(3), &log, &NoProgress)
            .await
            .unwrap();
        assert_eq!(plain.processed, 0);

        let opts = ExtractOptions {
            retry_failed: true,
            ..options(2)
        };
        let summary = extractor(ScriptedBackend::fixed(REPLY), opts)
            .run(chunks(3), &log, &NoProgress)
            .await
            .unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.skipped, 2);

        let records = read_log(&log);
        assert_eq!(records.len(), 4);
        assert_eq!(records.iter().filter(|r| r.chunk_id == "000001").count(), 2);

        std::fs::remove_dir_all(&dir).ok();
    }

    /// Tracks how many requests are in flight at once.
    #[derive(Default)]
    struct GaugeBackend {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl LlmBackend for GaugeBackend {
        async fn complete(&self, _request: &CompletionRequest) -> std::result::Result<String, BackendError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(REPLY.into())
        }

        fn model(&self) -> &str {
            "gauge"
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn in_flight_requests_never_exceed_workers() {
        let dir = temp_dir();
        let log = dir.join("extractions.jsonl");
        let backend = Arc::new(GaugeBackend::default());

        let summary = Extractor::new(backend.clone(), ExtractPrompt::builtin().unwrap(), options(3))
            .unwrap()
            .run(chunks(30), &log, &NoProgress)
            .await
            .unwrap();

        assert_eq!(summary.processed, 30);
        assert_eq!(summary.succeeded, 30);
        let peak = backend.peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak in-flight {peak} exceeds 3 workers");
        assert_eq!(peak, 3);
        assert_eq!(backend.in_flight.load(Ordering::SeqCst), 0);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn panicking_worker_is_internal_error() {
        let dir = temp_dir();
        let log = dir.join("extractions.jsonl");
        let backend = ScriptedBackend::new(|_, _| -> std::result::Result<String, BackendError> {
            panic!("backend exploded")
        });

        let err = extractor(backend, options(1))
            .run(chunks(2), &log, &NoProgress)
            .await
            .unwrap_err();

        assert!(matches!(err, NovelKbError::Internal(_)), "got {err:?}");
        assert!(err.to_string().contains("worker panicked"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn zero_workers_is_config_error() {
        let err = Extractor::new(
            Arc::new(ScriptedBackend::fixed(REPLY)),
            ExtractPrompt::builtin().unwrap(),
            options(0),
        )
        .err()
        .unwrap();
        assert!(matches!(err, NovelKbError::Config { .. }));
    }
}
