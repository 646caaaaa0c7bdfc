//! Knowledge-base merger.
//!
//! Folds extraction records into characters and relations. The fold is
//! order-independent: [`KbAccumulator::absorb`] and [`KbAccumulator::merge`]
//! only keep one deterministic record per chunk plus additive counters, and
//! [`KbAccumulator::finish`] walks that set in chunk order. Any permutation
//! or grouping of the same records produces byte-identical tables.

pub mod aliases;
pub mod conflict;
pub mod graph;
pub mod normalize;

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use novelkb_shared::{
    Character, DirectionPolicy, ExtractionRecord, Relation, RelationDirection, RelationEvidence,
    Result,
};
use novelkb_storage::{ArtifactMeta, read_json, write_json_atomic, write_jsonl_atomic};

pub use aliases::AliasTable;
pub use conflict::{AliasVote, Conflict, ConflictReport};
pub use graph::{Graph, GraphEdge, GraphNode};
pub use normalize::normalize_name;

use normalize::most_frequent;

pub const CHARACTERS_FILE: &str = "characters.json";
pub const RELATIONS_FILE: &str = "relations.json";
pub const CONFLICTS_FILE: &str = "conflicts.json";
pub const GRAPH_FILE: &str = "graph.json";
pub const EVIDENCE_FILE: &str = "evidence.jsonl";

/// Evidence quotes are cut to this many characters.
const QUOTE_CHARS: usize = 120;

/// The merged tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeBase {
    pub characters: Vec<Character>,
    pub relations: Vec<Relation>,
}

impl KnowledgeBase {
    pub fn is_empty(&self) -> bool {
        self.characters.is_empty() && self.relations.is_empty()
    }

    /// Read `characters.json` and `relations.json` from `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        Ok(Self {
            characters: read_json(&dir.join(CHARACTERS_FILE))?,
            relations: read_json(&dir.join(RELATIONS_FILE))?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Records absorbed, ok or not.
    pub records: usize,
    pub failed_records: usize,
    /// Ok records for a chunk that already had one.
    pub duplicate_records: usize,
    /// Chunks contributing to the knowledge base.
    pub chunks: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutput {
    pub kb: KnowledgeBase,
    pub report: ConflictReport,
    pub stats: MergeStats,
}

/// One quoted piece of relation evidence (a line of `evidence.jsonl`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRow {
    /// The merged relation this quote supports.
    pub relation: RelationKey,
    #[serde(flatten)]
    pub evidence: RelationEvidence,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationKey {
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub relation_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl MergeOutput {
    /// Write the knowledge-base files into `dir`.
    pub fn write_to(&self, dir: &Path) -> Result<Vec<ArtifactMeta>> {
        Ok(vec![
            write_json_atomic(&dir.join(CHARACTERS_FILE), &self.kb.characters)?,
            write_json_atomic(&dir.join(RELATIONS_FILE), &self.kb.relations)?,
            write_json_atomic(&dir.join(CONFLICTS_FILE), &self.report)?,
            write_json_atomic(&dir.join(GRAPH_FILE), &Graph::from_kb(&self.kb))?,
            write_jsonl_atomic(&dir.join(EVIDENCE_FILE), &self.evidence_rows())?,
        ])
    }

    /// Quoted evidence flattened out of the relation table, in relation order.
    pub fn evidence_rows(&self) -> Vec<EvidenceRow> {
        self.kb
            .relations
            .iter()
            .flat_map(|relation| {
                let key = RelationKey {
                    from: relation.from.clone(),
                    to: relation.to.clone(),
                    relation_type: relation.relation_type.clone(),
                    status: relation.status.clone(),
                };
                relation
                    .evidence
                    .iter()
                    .filter(|e| !e.quote.is_empty())
                    .map(move |e| EvidenceRow {
                        relation: key.clone(),
                        evidence: e.clone(),
                    })
            })
            .collect()
    }
}

/// Commutative, associative accumulator over extraction records.
#[derive(Debug, Clone, Default)]
pub struct KbAccumulator {
    /// chunk id → (ordering key, record). Of several ok records for one
    /// chunk, the one with the smallest serialized form is kept.
    chosen: BTreeMap<String, (String, ExtractionRecord)>,
    records: usize,
    failed: usize,
    duplicates: usize,
}

impl KbAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn absorb(&mut self, record: ExtractionRecord) {
        self.records += 1;
        if !record.is_ok() {
            self.failed += 1;
            return;
        }
        let key = serde_json::to_string(&record).unwrap_or_default();
        self.choose(record.chunk_id.clone(), key, record);
    }

    /// Fold another accumulator into this one.
    pub fn merge(&mut self, other: KbAccumulator) {
        self.records += other.records;
        self.failed += other.failed;
        self.duplicates += other.duplicates;
        for (chunk_id, (key, record)) in other.chosen {
            self.choose(chunk_id, key, record);
        }
    }

    fn choose(&mut self, chunk_id: String, key: String, record: ExtractionRecord) {
        match self.chosen.entry(chunk_id) {
            Entry::Vacant(slot) => {
                slot.insert((key, record));
            }
            Entry::Occupied(mut slot) => {
                self.duplicates += 1;
                if key < slot.get().0 {
                    slot.insert((key, record));
                }
            }
        }
    }

    /// Build the knowledge base and the conflict report.
    #[instrument(skip_all, fields(chunks = self.chosen.len(), policy = policy.as_str()))]
    pub fn finish(&self, aliases: &AliasTable, policy: DirectionPolicy) -> MergeOutput {
        let records: Vec<&ExtractionRecord> = self.chosen.values().map(|(_, r)| r).collect();
        let mut conflicts = Vec::new();

        let names = NameResolver::build(&records, aliases, &mut conflicts);
        let characters = build_characters(&records, &names);
        let relations = build_relations(&records, &names, policy, &mut conflicts);

        conflicts.sort();
        conflicts.dedup();

        let stats = MergeStats {
            records: self.records,
            failed_records: self.failed,
            duplicate_records: self.duplicates,
            chunks: self.chosen.len(),
        };
        info!(
            characters = characters.len(),
            relations = relations.len(),
            conflicts = conflicts.len(),
            failed_records = stats.failed_records,
            "merge complete"
        );

        MergeOutput {
            kb: KnowledgeBase {
                characters,
                relations,
            },
            report: ConflictReport {
                direction_policy: policy.as_str().to_string(),
                conflicts,
            },
            stats,
        }
    }
}

/// Convenience: absorb every record and finish.
pub fn merge_records(
    records: impl IntoIterator<Item = ExtractionRecord>,
    aliases: &AliasTable,
    policy: DirectionPolicy,
) -> MergeOutput {
    let mut acc = KbAccumulator::new();
    for record in records {
        acc.absorb(record);
    }
    acc.finish(aliases, policy)
}

// ---------------------------------------------------------------------------
// Name resolution
// ---------------------------------------------------------------------------

fn bump(counts: &mut BTreeMap<String, usize>, key: &str) {
    *counts.entry(key.to_string()).or_default() += 1;
}

/// Maps every normalized name to the key of its character group.
struct NameResolver<'a> {
    table: &'a AliasTable,
    /// Extracted alias → primary name, for aliases with a strict majority.
    parent: BTreeMap<String, String>,
    /// Surface spellings seen for each normalized name.
    surfaces: BTreeMap<String, BTreeMap<String, usize>>,
}

impl<'a> NameResolver<'a> {
    fn build(
        records: &[&ExtractionRecord],
        table: &'a AliasTable,
        conflicts: &mut Vec<Conflict>,
    ) -> Self {
        let mut surfaces: BTreeMap<String, BTreeMap<String, usize>> = BTreeMap::new();
        let mut claims: BTreeMap<String, BTreeMap<String, usize>> = BTreeMap::new();
        let mut alias_forms: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        for record in records {
            for entity in &record.entities {
                let key = normalize_name(&entity.name);
                if key.is_empty() {
                    continue;
                }
                bump(surfaces.entry(key.clone()).or_default(), entity.name.trim());
                for alias in &entity.aliases {
                    let alias_key = normalize_name(alias);
                    if alias_key.is_empty() || alias_key == key {
                        continue;
                    }
                    bump(claims.entry(alias_key.clone()).or_default(), &key);
                    alias_forms
                        .entry(alias_key)
                        .or_default()
                        .insert(alias.trim().to_string());
                }
            }
            for relation in &record.relations {
                for name in [&relation.from, &relation.to] {
                    let key = normalize_name(name);
                    if !key.is_empty() {
                        bump(surfaces.entry(key).or_default(), name.trim());
                    }
                }
            }
        }

        let display = |key: &str| -> String {
            surfaces
                .get(key)
                .and_then(|counts| most_frequent(counts))
                .unwrap_or_else(|| key.to_string())
        };

        let mut parent = BTreeMap::new();
        for (alias, votes) in &claims {
            if table.canonical(alias).is_some() {
                continue;
            }
            let total: usize = votes.values().sum();
            let Some(best) = most_frequent(votes) else {
                continue;
            };
            let best_votes = votes.get(&best).copied().unwrap_or(0);
            if best_votes * 2 > total {
                parent.insert(alias.clone(), best);
            } else {
                let alias_display = alias_forms
                    .get(alias)
                    .and_then(|forms| forms.iter().next().cloned())
                    .unwrap_or_else(|| alias.clone());
                conflicts.push(Conflict::AmbiguousAlias {
                    alias: alias_display,
                    candidates: votes
                        .iter()
                        .map(|(name, n)| AliasVote {
                            name: display(name),
                            votes: *n,
                        })
                        .collect(),
                });
            }
        }

        debug!(
            names = surfaces.len(),
            extracted_aliases = parent.len(),
            "name observations collected"
        );

        Self {
            table,
            parent,
            surfaces,
        }
    }

    /// Group key for a normalized name. Alias-table entries win; extracted
    /// aliases are followed transitively, and a cycle resolves to its
    /// smallest member.
    fn group(&self, key: &str) -> String {
        let mut path = vec![key.to_string()];
        let mut current = key.to_string();
        loop {
            if let Some(canonical) = self.table.canonical(&current) {
                return normalize_name(canonical);
            }
            let Some(next) = self.parent.get(&current) else {
                return current;
            };
            if let Some(pos) = path.iter().position(|p| p == next) {
                return path[pos..].iter().min().cloned().unwrap_or(current);
            }
            path.push(next.clone());
            current = next.clone();
        }
    }

    /// Display name of a group.
    fn display(&self, group: &str) -> String {
        if let Some(canonical) = self.table.canonical(group) {
            return canonical.to_string();
        }
        self.surfaces
            .get(group)
            .and_then(|counts| most_frequent(counts))
            .unwrap_or_else(|| group.to_string())
    }

    /// Display name of the character `name` belongs to.
    fn resolve(&self, name: &str) -> Option<String> {
        let key = normalize_name(name);
        (!key.is_empty()).then(|| self.display(&self.group(&key)))
    }
}

// ---------------------------------------------------------------------------
// Characters
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CharacterAcc {
    forms: BTreeSet<String>,
    types: BTreeMap<String, usize>,
    notes: BTreeSet<String>,
    mentions: BTreeSet<String>,
    confidence: Option<f64>,
}

fn max_confidence(current: Option<f64>, next: Option<f64>) -> Option<f64> {
    match (current, next.filter(|c| c.is_finite())) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

fn build_characters(records: &[&ExtractionRecord], names: &NameResolver<'_>) -> Vec<Character> {
    let mut groups: BTreeMap<String, CharacterAcc> = BTreeMap::new();

    for record in records {
        for entity in &record.entities {
            let Some(name) = names.resolve(&entity.name) else {
                continue;
            };
            let acc = groups.entry(name.clone()).or_default();
            acc.forms.insert(entity.name.trim().to_string());
            acc.mentions.insert(record.chunk_id.clone());
            acc.confidence = max_confidence(acc.confidence, entity.confidence);
            if let Some(t) = entity.entity_type.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
                bump(&mut acc.types, t);
            }
            if let Some(note) = entity.notes.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
                acc.notes.insert(note.to_string());
            }
            for alias in &entity.aliases {
                if names.resolve(alias).as_deref() == Some(name.as_str()) {
                    acc.forms.insert(alias.trim().to_string());
                }
            }
        }
        for relation in &record.relations {
            for endpoint in [&relation.from, &relation.to] {
                if let Some(name) = names.resolve(endpoint) {
                    let acc = groups.entry(name).or_default();
                    acc.forms.insert(endpoint.trim().to_string());
                    acc.mentions.insert(record.chunk_id.clone());
                }
            }
        }
    }

    groups
        .into_iter()
        .map(|(name, acc)| Character {
            aliases: acc.forms.into_iter().filter(|f| *f != name).collect(),
            entity_type: most_frequent(&acc.types),
            notes: acc.notes.into_iter().collect(),
            mentions: acc.mentions.into_iter().collect(),
            confidence: acc.confidence,
            name,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Relations
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RelationAcc {
    types: BTreeMap<String, usize>,
    /// Observations pointing from the smaller to the larger name.
    forward: usize,
    backward: usize,
    statuses: BTreeMap<String, usize>,
    confidence: Option<f64>,
    evidence: BTreeSet<RelationEvidence>,
    notes: BTreeSet<String>,
}

fn build_relations(
    records: &[&ExtractionRecord],
    names: &NameResolver<'_>,
    policy: DirectionPolicy,
    conflicts: &mut Vec<Conflict>,
) -> Vec<Relation> {
    // (smaller name, larger name, normalized type)
    let mut groups: BTreeMap<(String, String, String), RelationAcc> = BTreeMap::new();

    for record in records {
        for mention in &record.relations {
            let (Some(from), Some(to)) = (names.resolve(&mention.from), names.resolve(&mention.to))
            else {
                continue;
            };
            let type_key = normalize_name(&mention.relation_type);
            if type_key.is_empty() {
                continue;
            }
            if from == to {
                conflicts.push(Conflict::SelfRelation {
                    name: from,
                    relation_type: mention.relation_type.trim().to_string(),
                    chunk_id: record.chunk_id.clone(),
                });
                continue;
            }

            let forward = from < to;
            let (a, b) = if forward {
                (from.clone(), to.clone())
            } else {
                (to.clone(), from.clone())
            };
            let acc = groups.entry((a, b, type_key)).or_default();

            bump(&mut acc.types, mention.relation_type.trim());
            if forward {
                acc.forward += 1;
            } else {
                acc.backward += 1;
            }
            if let Some(status) = mention.status.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
                bump(&mut acc.statuses, status);
            }
            acc.confidence = max_confidence(acc.confidence, mention.confidence);
            if let Some(note) = mention.notes.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
                acc.notes.insert(note.to_string());
            }

            let evidence = mention.evidence.as_ref();
            acc.evidence.insert(RelationEvidence {
                chunk_id: record.chunk_id.clone(),
                from,
                to,
                quote: evidence
                    .map(|e| e.quote.trim().chars().take(QUOTE_CHARS).collect())
                    .unwrap_or_default(),
                span: evidence.and_then(|e| e.start_char.zip(e.end_char)),
                chapter_title: Some(record.chapter_title.clone()).filter(|t| !t.is_empty()),
            });
        }
    }

    let mut relations: Vec<Relation> = groups
        .into_iter()
        .map(|((a, b, type_key), acc)| {
            let relation_type = most_frequent(&acc.types).unwrap_or(type_key);
            let (direction, from, to) = resolve_direction(
                policy,
                &a,
                &b,
                &relation_type,
                acc.forward,
                acc.backward,
                conflicts,
            );
            Relation {
                from,
                to,
                relation_type,
                direction,
                status: most_frequent(&acc.statuses),
                confidence: acc.confidence,
                first_seen_chunk: acc.evidence.iter().next().map(|e| e.chunk_id.clone()),
                evidence: acc.evidence.into_iter().collect(),
                notes: acc.notes.into_iter().collect(),
            }
        })
        .collect();

    relations.sort_by(|x, y| {
        (&x.from, &x.to, &x.relation_type).cmp(&(&y.from, &y.to, &y.relation_type))
    });
    relations
}

fn resolve_direction(
    policy: DirectionPolicy,
    a: &str,
    b: &str,
    relation_type: &str,
    forward: usize,
    backward: usize,
    conflicts: &mut Vec<Conflict>,
) -> (RelationDirection, String, String) {
    let directed = |from: &str, to: &str| (RelationDirection::Directed, from.to_string(), to.to_string());
    let both = (RelationDirection::Bidirectional, a.to_string(), b.to_string());

    if backward == 0 {
        return directed(a, b);
    }
    if forward == 0 {
        return directed(b, a);
    }

    match policy {
        DirectionPolicy::Majority if forward > backward => directed(a, b),
        DirectionPolicy::Majority if backward > forward => directed(b, a),
        DirectionPolicy::Majority => {
            conflicts.push(Conflict::DirectionTie {
                a: a.to_string(),
                b: b.to_string(),
                relation_type: relation_type.to_string(),
                forward,
                backward,
            });
            both
        }
        DirectionPolicy::Bidirectional => both,
        DirectionPolicy::Strict => {
            conflicts.push(Conflict::DirectionDisputed {
                a: a.to_string(),
                b: b.to_string(),
                relation_type: relation_type.to_string(),
                forward,
                backward,
            });
            both
        }
    }
}
