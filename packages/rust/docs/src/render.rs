//! Templated Markdown documents.
//!
//! Every renderer tolerates sparse data: a missing field drops its line,
//! an empty table yields an explicit placeholder.

use std::fmt::Write as _;

use novelkb_merge::KnowledgeBase;
use novelkb_shared::{Character, Relation, RelationDirection};

/// Evidence quotes shown per relation in `relations.md`.
const EVIDENCE_PER_RELATION: usize = 5;

pub const NO_CHARACTERS: &str = "_暂无数据：知识库中没有人物。_";
pub const NO_RELATIONS: &str = "_暂无数据：知识库中没有人物关系。_";

fn arrow(relation: &Relation) -> &'static str {
    match relation.direction {
        RelationDirection::Directed => "→",
        RelationDirection::Bidirectional => "↔",
    }
}

pub(crate) fn relation_heading(relation: &Relation) -> String {
    format!(
        "{} {} {} · {}",
        relation.from,
        arrow(relation),
        relation.to,
        relation.relation_type
    )
}

fn character_section(out: &mut String, c: &Character) {
    let _ = writeln!(out, "## {}\n", c.name);
    if !c.aliases.is_empty() {
        let _ = writeln!(out, "- 别名：{}", c.aliases.join("、"));
    }
    if let Some(t) = &c.entity_type {
        let _ = writeln!(out, "- 类型：{t}");
    }
    if let Some(first) = c.mentions.first() {
        let _ = writeln!(out, "- 出现片段：{} 个（首次 {first}）", c.mentions.len());
    }
    if let Some(conf) = c.confidence {
        let _ = writeln!(out, "- 置信度：{conf:.2}");
    }
    if !c.notes.is_empty() {
        let _ = writeln!(out, "- 备注：");
        for note in &c.notes {
            let _ = writeln!(out, "  - {note}");
        }
    }
    out.push('\n');
}

pub fn character_sheet(kb: &KnowledgeBase) -> String {
    let mut out = String::from("# 人物表\n\n");
    if kb.characters.is_empty() {
        out.push_str(NO_CHARACTERS);
        out.push('\n');
        return out;
    }
    let _ = writeln!(out, "共 {} 个人物。\n", kb.characters.len());
    for c in &kb.characters {
        character_section(&mut out, c);
    }
    out
}

pub fn relations_doc(kb: &KnowledgeBase) -> String {
    let mut out = String::from("# 人物关系\n\n");
    if kb.relations.is_empty() {
        out.push_str(NO_RELATIONS);
        out.push('\n');
        return out;
    }
    let _ = writeln!(out, "共 {} 条关系。\n", kb.relations.len());

    for r in &kb.relations {
        let _ = writeln!(out, "## {}\n", relation_heading(r));
        if let Some(status) = &r.status {
            let _ = writeln!(out, "- 状态：{status}");
        }
        if let Some(conf) = r.confidence {
            let _ = writeln!(out, "- 置信度：{conf:.2}");
        }
        if let Some(first) = &r.first_seen_chunk {
            let _ = writeln!(out, "- 首次片段：{first}");
        }
        for note in &r.notes {
            let _ = writeln!(out, "- 说明：{note}");
        }
        let quotes: Vec<_> = r.evidence.iter().filter(|e| !e.quote.is_empty()).collect();
        if !quotes.is_empty() {
            let _ = writeln!(out, "- 证据：");
            for e in quotes.iter().take(EVIDENCE_PER_RELATION) {
                let _ = writeln!(out, "  - [{}] 「{}」", e.chunk_id, e.quote);
            }
            if quotes.len() > EVIDENCE_PER_RELATION {
                let _ = writeln!(out, "  - ……另有 {} 条", quotes.len() - EVIDENCE_PER_RELATION);
            }
        }
        out.push('\n');
    }
    out
}

/// Relations ordered by the chunk they first appear in.
pub fn timeline(kb: &KnowledgeBase) -> String {
    let mut out = String::from("# 关系演化时间线\n\n");
    if kb.relations.is_empty() {
        out.push_str(NO_RELATIONS);
        out.push('\n');
        return out;
    }

    let mut ordered: Vec<&Relation> = kb.relations.iter().collect();
    ordered.sort_by(|a, b| {
        // Relations without a first chunk go last.
        let key = |r: &Relation| (r.first_seen_chunk.is_none(), r.first_seen_chunk.clone());
        key(a)
            .cmp(&key(b))
            .then_with(|| (&a.from, &a.to, &a.relation_type).cmp(&(&b.from, &b.to, &b.relation_type)))
    });

    for r in ordered {
        let mut detail = Vec::new();
        if let Some(status) = &r.status {
            detail.push(status.clone());
        }
        if let Some(first) = &r.first_seen_chunk {
            detail.push(format!("首次片段 {first}"));
        }
        let _ = write!(
            out,
            "- {} — {} {} {}",
            r.from,
            r.relation_type,
            arrow(r),
            r.to
        );
        if !detail.is_empty() {
            let _ = write!(out, "（{}）", detail.join("；"));
        }
        out.push('\n');
    }
    out
}
