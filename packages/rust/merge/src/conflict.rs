//! Conflicts the merger could not settle on its own.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AliasVote {
    pub name: String,
    pub votes: usize,
}

/// One unresolved or dropped observation. Reports are sorted, so equal
/// inputs give byte-identical `conflicts.json` files.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Conflict {
    /// An alias claimed by several names with no strict majority; left unmerged.
    AmbiguousAlias {
        alias: String,
        candidates: Vec<AliasVote>,
    },
    /// Equal evidence for both directions under the majority policy.
    DirectionTie {
        a: String,
        b: String,
        relation_type: String,
        forward: usize,
        backward: usize,
    },
    /// Any direction disagreement under the strict policy.
    DirectionDisputed {
        a: String,
        b: String,
        relation_type: String,
        forward: usize,
        backward: usize,
    },
    /// A relation whose endpoints resolve to the same character; dropped.
    SelfRelation {
        name: String,
        relation_type: String,
        chunk_id: String,
    },
}

impl Conflict {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AmbiguousAlias { .. } => "ambiguous_alias",
            Self::DirectionTie { .. } => "direction_tie",
            Self::DirectionDisputed { .. } => "direction_disputed",
            Self::SelfRelation { .. } => "self_relation",
        }
    }
}

/// Contents of `conflicts.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictReport {
    pub direction_policy: String,
    pub conflicts: Vec<Conflict>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_kind_tag() {
        let conflict = Conflict::SelfRelation {
            name: "王林".into(),
            relation_type: "师徒".into(),
            chunk_id: "000001".into(),
        };
        let json = serde_json::to_string(&conflict).unwrap();
        assert!(json.contains(r#""kind":"self_relation""#));
        assert_eq!(conflict.kind(), "self_relation");
    }
}
