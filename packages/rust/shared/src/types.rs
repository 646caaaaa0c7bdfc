//! Core domain types shared by the pipeline stages.
//!
//! Every type here is persisted: chunks and extraction records as JSONL lines,
//! characters and relations as pretty JSON tables.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Chunk
// ---------------------------------------------------------------------------

/// A bounded slice of the source text, the unit of extraction work.
///
/// `char_start`/`char_end` count characters (Unicode scalar values), not bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Zero-padded sequence number (`000000`, `000001`, ...).
    pub id: String,
    /// First chapter (1-based) touched by this chunk.
    pub chapter_start: usize,
    /// Last chapter (1-based, inclusive) touched by this chunk.
    pub chapter_end: usize,
    /// Heading of `chapter_start`.
    #[serde(default)]
    pub chapter_title: String,
    /// 1-based position of this chunk inside its chapter group.
    #[serde(default = "default_part_index")]
    pub part_index: usize,
    pub char_start: usize,
    pub char_end: usize,
    pub text: String,
}

fn default_part_index() -> usize {
    1
}

impl Chunk {
    /// Length of the chunk in characters.
    pub fn char_len(&self) -> usize {
        self.char_end.saturating_sub(self.char_start)
    }

    /// Human-readable chapter span, e.g. `3` or `3-5`.
    pub fn chapter_range(&self) -> String {
        if self.chapter_start == self.chapter_end {
            self.chapter_start.to_string()
        } else {
            format!("{}-{}", self.chapter_start, self.chapter_end)
        }
    }
}

// ---------------------------------------------------------------------------
// Extraction payload (what the LLM is asked to return)
// ---------------------------------------------------------------------------

/// A character mentioned in one chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMention {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// Supporting quote for a relation, with offsets relative to the chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    #[serde(default)]
    pub quote: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_char: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_char: Option<usize>,
}

/// A directed relation observed in one chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationMention {
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub relation_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<Evidence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// A plot event that changes a relation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMention {
    pub summary: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub involved: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// Typed content of one successful extraction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionPayload {
    #[serde(default)]
    pub entities: Vec<EntityMention>,
    #[serde(default)]
    pub relations: Vec<RelationMention>,
    #[serde(default)]
    pub events: Vec<EventMention>,
}

// ---------------------------------------------------------------------------
// Extraction record (one JSONL line in the extraction log)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseStatus {
    Ok,
    Failed,
}

/// Reason code for a failed extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Backend,
    RateLimited,
    Timeout,
    EmptyResponse,
    NoJsonObject,
    InvalidJson,
    SchemaMismatch,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backend => "backend",
            Self::RateLimited => "rate_limited",
            Self::Timeout => "timeout",
            Self::EmptyResponse => "empty_response",
            Self::NoJsonObject => "no_json_object",
            Self::InvalidJson => "invalid_json",
            Self::SchemaMismatch => "schema_mismatch",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub kind: FailureKind,
    pub message: String,
}

/// Result (or failure marker) of running one chunk through the extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRecord {
    pub chunk_id: String,
    pub chapter_start: usize,
    pub chapter_end: usize,
    #[serde(default)]
    pub chapter_title: String,
    pub parse_status: ParseStatus,
    /// Backend text of the last attempt, if any response arrived.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
    #[serde(default)]
    pub entities: Vec<EntityMention>,
    #[serde(default)]
    pub relations: Vec<RelationMention>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<EventMention>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    /// Backend calls made for this record.
    #[serde(default)]
    pub attempts: u32,
}

impl ExtractionRecord {
    /// Record a successful extraction.
    pub fn success(chunk: &Chunk, raw: String, payload: ExtractionPayload, attempts: u32) -> Self {
        Self {
            chunk_id: chunk.id.clone(),
            chapter_start: chunk.chapter_start,
            chapter_end: chunk.chapter_end,
            chapter_title: chunk.chapter_title.clone(),
            parse_status: ParseStatus::Ok,
            raw_response: Some(raw),
            entities: payload.entities,
            relations: payload.relations,
            events: payload.events,
            failure: None,
            attempts,
        }
    }

    /// Record an extraction that exhausted its retries.
    pub fn failure(
        chunk: &Chunk,
        raw: Option<String>,
        reason: FailureReason,
        attempts: u32,
    ) -> Self {
        Self {
            chunk_id: chunk.id.clone(),
            chapter_start: chunk.chapter_start,
            chapter_end: chunk.chapter_end,
            chapter_title: chunk.chapter_title.clone(),
            parse_status: ParseStatus::Failed,
            raw_response: raw,
            entities: Vec::new(),
            relations: Vec::new(),
            events: Vec::new(),
            failure: Some(reason),
            attempts,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.parse_status == ParseStatus::Ok
    }
}

// ---------------------------------------------------------------------------
// Knowledge base tables
// ---------------------------------------------------------------------------

/// One merged character (a row of `characters.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Character {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
    /// Chunk ids mentioning this character, sorted.
    #[serde(default)]
    pub mentions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationDirection {
    /// `from` acts on `to`.
    Directed,
    /// Evidence does not settle a direction.
    Bidirectional,
}

/// One piece of evidence backing a merged relation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelationEvidence {
    pub chunk_id: String,
    /// Direction as observed in this chunk (canonical names).
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub quote: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span: Option<(usize, usize)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter_title: Option<String>,
}

/// One merged relation (a row of `relations.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub relation_type: String,
    pub direction: RelationDirection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_seen_chunk: Option<String>,
    #[serde(default)]
    pub evidence: Vec<RelationEvidence>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}
