//! Study documents built from a merged knowledge base.
//!
//! ```text
//! out_dir/
//! ├── character_sheet.md
//! ├── relations.md
//! ├── timeline.md
//! ├── study_notes.md
//! └── docs_manifest.json
//! ```
//!
//! The first three are pure templates. `study_notes.md` comes from one
//! summarization request; when that request is skipped or fails, offline
//! notes are written instead and the build still succeeds.

pub mod notes;
pub mod render;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use novelkb_llm::{LlmBackend, RetryPolicy, complete_with_timeout};
use novelkb_merge::KnowledgeBase;
use novelkb_shared::{AppConfig, Result};
use novelkb_storage::{ArtifactMeta, write_json_atomic, write_text_atomic};

pub use notes::NotesPrompt;

pub const CHARACTER_SHEET_FILE: &str = "character_sheet.md";
pub const RELATIONS_DOC_FILE: &str = "relations.md";
pub const TIMELINE_FILE: &str = "timeline.md";
pub const STUDY_NOTES_FILE: &str = "study_notes.md";
pub const MANIFEST_FILE: &str = "docs_manifest.json";

const EMPTY_NOTES: &str = "# 学习笔记\n\n_暂无数据：知识库为空，未生成学习笔记。_\n";

#[derive(Debug, Clone)]
pub struct DocsOptions {
    /// Render study notes without contacting the backend.
    pub no_llm: bool,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl DocsOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            no_llm: false,
            request_timeout: Duration::from_secs(config.llm.request_timeout_secs),
            retry: RetryPolicy::from_config(&config.retry),
        }
    }
}

/// Where `study_notes.md` came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotesSource {
    Llm,
    /// Nothing to summarize.
    EmptyKb,
    /// Backend disabled for this build.
    Offline,
    /// The summarization request failed after retries.
    Failed,
}

/// Contents of `docs_manifest.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocsManifest {
    pub build_id: Uuid,
    pub generated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub study_notes: NotesSource,
    pub characters: usize,
    pub relations: usize,
    pub documents: Vec<ArtifactMeta>,
}

#[derive(Debug, Clone)]
pub struct DocsReport {
    pub out_dir: PathBuf,
    pub manifest: DocsManifest,
    /// Failure message when `study_notes` is [`NotesSource::Failed`].
    pub notes_error: Option<String>,
}

pub struct DocBuilder {
    backend: Option<Arc<dyn LlmBackend>>,
    prompt: NotesPrompt,
    options: DocsOptions,
}

impl DocBuilder {
    pub fn new(
        backend: Option<Arc<dyn LlmBackend>>,
        prompt: NotesPrompt,
        options: DocsOptions,
    ) -> Self {
        Self {
            backend,
            prompt,
            options,
        }
    }

    fn active_backend(&self) -> Option<&Arc<dyn LlmBackend>> {
        if self.options.no_llm {
            None
        } else {
            self.backend.as_ref()
        }
    }

    /// Write every document for `kb` into `out_dir`.
    ///
    /// Only I/O errors are returned; a failed summarization degrades to
    /// offline notes.
    #[instrument(skip_all, fields(out_dir = %out_dir.display(), characters = kb.characters.len(), relations = kb.relations.len()))]
    pub async fn build(&self, kb: &KnowledgeBase, out_dir: &Path) -> Result<DocsReport> {
        let mut documents = vec![
            write_text_atomic(&out_dir.join(CHARACTER_SHEET_FILE), &render::character_sheet(kb))?,
            write_text_atomic(&out_dir.join(RELATIONS_DOC_FILE), &render::relations_doc(kb))?,
            write_text_atomic(&out_dir.join(TIMELINE_FILE), &render::timeline(kb))?,
        ];

        let (notes, source, notes_error) = self.study_notes(kb).await?;
        documents.push(write_text_atomic(&out_dir.join(STUDY_NOTES_FILE), &notes)?);

        let model = match source {
            NotesSource::Llm | NotesSource::Failed => {
                self.active_backend().map(|b| b.model().to_string())
            }
            NotesSource::EmptyKb | NotesSource::Offline => None,
        };

        let manifest = DocsManifest {
            build_id: Uuid::now_v7(),
            generated_at: Utc::now(),
            model,
            study_notes: source,
            characters: kb.characters.len(),
            relations: kb.relations.len(),
            documents,
        };
        write_json_atomic(&out_dir.join(MANIFEST_FILE), &manifest)?;

        info!(
            build_id = %manifest.build_id,
            study_notes = ?manifest.study_notes,
            "documents written"
        );

        Ok(DocsReport {
            out_dir: out_dir.to_path_buf(),
            manifest,
            notes_error,
        })
    }

    async fn study_notes(
        &self,
        kb: &KnowledgeBase,
    ) -> Result<(String, NotesSource, Option<String>)> {
        if kb.is_empty() {
            return Ok((EMPTY_NOTES.to_string(), NotesSource::EmptyKb, None));
        }

        let Some(backend) = self.active_backend() else {
            let notes = notes::offline_notes(kb, "离线生成：未调用模型，仅列出核心人物与主要关系。");
            return Ok((notes, NotesSource::Offline, None));
        };

        let request = self.prompt.request_for(kb)?;
        let outcome = self
            .options
            .retry
            .run("study_notes", |_| {
                let request = &request;
                async move {
                    complete_with_timeout(backend.as_ref(), request, self.options.request_timeout)
                        .await
                }
            })
            .await;

        match outcome.result {
            Ok(text) if !text.trim().is_empty() => {
                let mut text = text.trim().to_string();
                text.push('\n');
                Ok((text, NotesSource::Llm, None))
            }
            Ok(_) => {
                warn!("study notes reply was empty");
                let message = "empty reply".to_string();
                let notes = notes::offline_notes(kb, &failure_notice(&message));
                Ok((notes, NotesSource::Failed, Some(message)))
            }
            Err(e) => {
                warn!(error = %e, attempts = outcome.attempts, "study notes failed");
                let message = e.to_string();
                let notes = notes::offline_notes(kb, &failure_notice(&message));
                Ok((notes, NotesSource::Failed, Some(message)))
            }
        }
    }
}

fn failure_notice(message: &str) -> String {
    format!("学习笔记生成失败（{message}），以下为离线摘要。")
}
