//! Study notes: one summarization call over a compacted knowledge base.

use std::cmp::Ordering;
use std::fmt::Write as _;
use std::path::Path;

use serde::Serialize;

use novelkb_llm::{CompletionRequest, PromptTemplate};
use novelkb_merge::KnowledgeBase;
use novelkb_shared::{Character, Relation, Result};

use crate::render::relation_heading;

pub const PLACEHOLDERS: &[&str] = &["data_json"];

/// Characters sent to the model, by mention count.
pub const MAX_CHARACTERS: usize = 180;
/// Relations sent to the model, by confidence.
pub const MAX_RELATIONS: usize = 450;
/// Evidence items kept per relation in the payload.
const EVIDENCE_PER_RELATION: usize = 5;
/// Confidence assumed for relations that carry none.
const DEFAULT_CONFIDENCE: f64 = 0.5;

pub const SYSTEM_PROMPT: &str = "You write study notes from structured character-relation graphs.";

pub const DEFAULT_PROMPT: &str = r#"你是小说学习笔记的作者。请根据下面给出的结构化人物与关系数据，写一份中文的“人物关系学习文档”，要求条理清晰、便于复习。
文档必须包含以下部分：
1) 核心人物总览（主角、核心圈、主要对立面）
2) 关系网络总览（用文字概括即可）
3) 关系演化时间线（按阶段或章节概括）
4) 重点关系学习卡片（每对关系一小节：如何建立、关键事件、当前状态、证据）
5) 易混人物与别名对照表（如有）

只能依据给定数据写作，不要杜撰。
"#;

const PAYLOAD_NOTE: &str =
    "字段说明：relations[].evidence 为证据片段（chunk_id, quote, span）。只可基于这些信息写作。";

#[derive(Debug, Serialize)]
struct NotesPayload<'a> {
    characters: Vec<&'a Character>,
    relations: Vec<Relation>,
    note: &'static str,
}

/// Keep the most mentioned characters and the most confident relations.
fn compact(kb: &KnowledgeBase) -> NotesPayload<'_> {
    let mut characters: Vec<&Character> = kb.characters.iter().collect();
    characters.sort_by(|a, b| {
        b.mentions
            .len()
            .cmp(&a.mentions.len())
            .then_with(|| a.name.cmp(&b.name))
    });
    characters.truncate(MAX_CHARACTERS);

    let mut relations: Vec<&Relation> = kb.relations.iter().collect();
    relations.sort_by(|a, b| {
        let ca = a.confidence.unwrap_or(DEFAULT_CONFIDENCE);
        let cb = b.confidence.unwrap_or(DEFAULT_CONFIDENCE);
        cb.partial_cmp(&ca)
            .unwrap_or(Ordering::Equal)
            .then_with(|| (&a.from, &a.to).cmp(&(&b.from, &b.to)))
            .then_with(|| a.relation_type.cmp(&b.relation_type))
    });
    relations.truncate(MAX_RELATIONS);

    let relations = relations
        .into_iter()
        .map(|r| {
            let mut r = r.clone();
            r.evidence.truncate(EVIDENCE_PER_RELATION);
            r
        })
        .collect();

    NotesPayload {
        characters,
        relations,
        note: PAYLOAD_NOTE,
    }
}

#[derive(Debug, Clone)]
pub struct NotesPrompt {
    template: PromptTemplate,
}

impl NotesPrompt {
    pub fn builtin() -> Result<Self> {
        Ok(Self {
            template: PromptTemplate::parse(DEFAULT_PROMPT, PLACEHOLDERS)?,
        })
    }

    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Ok(Self {
                template: PromptTemplate::from_file(path, PLACEHOLDERS)?,
            }),
            None => Self::builtin(),
        }
    }

    pub fn from_source(source: &str) -> Result<Self> {
        Ok(Self {
            template: PromptTemplate::parse(source, PLACEHOLDERS)?,
        })
    }

    pub fn request_for(&self, kb: &KnowledgeBase) -> Result<CompletionRequest> {
        let data = serde_json::to_string_pretty(&compact(kb)).map_err(|e| {
            novelkb_shared::NovelKbError::validation(format!("notes payload: {e}"))
        })?;

        let mut user = self
            .template
            .render(&[("data_json", data.as_str())])
            .trim_end()
            .to_string();
        if !self.template.uses("data_json") {
            user.push_str("\n\n=== DATA(JSON) ===\n");
            user.push_str(&data);
        }

        Ok(CompletionRequest {
            system: SYSTEM_PROMPT.to_string(),
            user,
        })
    }
}

/// Notes rendered without the model: the biggest characters and the most
/// confident relations, with `reason` at the top.
pub fn offline_notes(kb: &KnowledgeBase, reason: &str) -> String {
    let mut out = String::from("# 学习笔记\n\n");
    let _ = writeln!(out, "> {reason}\n");

    let payload = compact(kb);

    out.push_str("## 核心人物\n\n");
    if payload.characters.is_empty() {
        out.push_str(crate::render::NO_CHARACTERS);
        out.push('\n');
    }
    for c in payload.characters.iter().take(20) {
        let _ = write!(out, "- {}", c.name);
        if !c.aliases.is_empty() {
            let _ = write!(out, "（{}）", c.aliases.join("、"));
        }
        let _ = writeln!(out, "：出现于 {} 个片段", c.mentions.len());
    }

    out.push_str("\n## 主要关系\n\n");
    if payload.relations.is_empty() {
        out.push_str(crate::render::NO_RELATIONS);
        out.push('\n');
    }
    for r in payload.relations.iter().take(30) {
        let _ = write!(out, "- {}", relation_heading(r));
        if let Some(status) = &r.status {
            let _ = write!(out, "（{status}）");
        }
        out.push('\n');
    }
    out
}
