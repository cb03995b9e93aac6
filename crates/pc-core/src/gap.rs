//! Knowledge-gap set: open questions and unresolved references.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::{GAP_PRIORITY_BUMP, GAP_PRIORITY_MAX};

/// External collaborator whose failure opened a gap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collaborator {
    Math,
    Retrieval,
    Sink,
}

impl Collaborator {
    pub fn as_str(self) -> &'static str {
        match self {
            Collaborator::Math => "math",
            Collaborator::Retrieval => "retrieval",
            Collaborator::Sink => "sink",
        }
    }
}

/// Closed set of gap kinds. Serialized as `open_question`,
/// `unresolved_reference`, `missing_evidence` or `<collaborator>_failure`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum GapType {
    OpenQuestion,
    UnresolvedReference,
    MissingEvidence,
    CollaboratorFailure(Collaborator),
}

impl GapType {
    /// Initial priority for a freshly opened gap.
    pub fn default_priority(self) -> f64 {
        match self {
            GapType::OpenQuestion => 0.5,
            GapType::UnresolvedReference => 0.6,
            GapType::MissingEvidence => 0.4,
            GapType::CollaboratorFailure(_) => 0.7,
        }
    }
}

impl fmt::Display for GapType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GapType::OpenQuestion => f.write_str("open_question"),
            GapType::UnresolvedReference => f.write_str("unresolved_reference"),
            GapType::MissingEvidence => f.write_str("missing_evidence"),
            GapType::CollaboratorFailure(c) => write!(f, "{}_failure", c.as_str()),
        }
    }
}

impl FromStr for GapType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open_question" => Ok(GapType::OpenQuestion),
            "unresolved_reference" => Ok(GapType::UnresolvedReference),
            "missing_evidence" => Ok(GapType::MissingEvidence),
            "math_failure" => Ok(GapType::CollaboratorFailure(Collaborator::Math)),
            "retrieval_failure" => Ok(GapType::CollaboratorFailure(Collaborator::Retrieval)),
            "sink_failure" => Ok(GapType::CollaboratorFailure(Collaborator::Sink)),
            other => Err(format!("unknown gap type '{other}'")),
        }
    }
}

impl From<GapType> for String {
    fn from(t: GapType) -> Self {
        t.to_string()
    }
}

impl TryFrom<String> for GapType {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Gap identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GapKey {
    pub gap_type: GapType,
    pub description: String,
}

impl GapKey {
    pub fn new(gap_type: GapType, description: impl Into<String>) -> Self {
        Self {
            gap_type,
            description: description.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Gap {
    pub gap_type: GapType,
    pub description: String,
    pub context: BTreeMap<String, String>,
    pub priority: f64,
    pub attempts: u32,
}

impl Gap {
    pub fn key(&self) -> GapKey {
        GapKey::new(self.gap_type, self.description.clone())
    }
}

/// Gap set keyed by `(gap_type, description)`, iterated in insertion order.
#[derive(Clone, Debug, Default)]
pub struct GapSet {
    gaps: BTreeMap<u64, Gap>,
    index: HashMap<GapKey, u64>,
    next_seq: u64,
}

impl GapSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a gap. Re-adding an identical key bumps its priority and merges
    /// context keys that were not already present; no duplicate is created.
    pub fn add(
        &mut self,
        gap_type: GapType,
        description: &str,
        context: BTreeMap<String, String>,
    ) -> Gap {
        let key = GapKey::new(gap_type, description);
        if let Some(seq) = self.index.get(&key)
            && let Some(existing) = self.gaps.get_mut(seq)
        {
            existing.priority = (existing.priority + GAP_PRIORITY_BUMP).min(GAP_PRIORITY_MAX);
            for (k, v) in context {
                existing.context.entry(k).or_insert(v);
            }
            return existing.clone();
        }

        let gap = Gap {
            gap_type,
            description: description.to_string(),
            context,
            priority: gap_type.default_priority(),
            attempts: 0,
        };
        self.insert_gap(gap.clone());
        tracing::debug!(gap_type = %gap_type, description, "opened gap");
        gap
    }

    /// Insert a gap as-is (used when restoring snapshots). Replaces any
    /// gap with the same key.
    pub fn insert_gap(&mut self, gap: Gap) {
        let key = gap.key();
        if let Some(seq) = self.index.get(&key) {
            self.gaps.insert(*seq, gap);
            return;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.index.insert(key, seq);
        self.gaps.insert(seq, gap);
    }

    /// Remove a resolved gap. Unknown or already-removed keys are a no-op.
    pub fn remove(&mut self, key: &GapKey) -> Option<Gap> {
        let seq = self.index.remove(key)?;
        self.gaps.remove(&seq)
    }

    pub fn get(&self, key: &GapKey) -> Option<&Gap> {
        self.index.get(key).and_then(|seq| self.gaps.get(seq))
    }

    pub fn get_mut(&mut self, key: &GapKey) -> Option<&mut Gap> {
        let seq = self.index.get(key)?;
        self.gaps.get_mut(seq)
    }

    /// Count an attempt at resolving a gap. Returns the new attempt count.
    pub fn record_attempt(&mut self, key: &GapKey) -> Option<u32> {
        let gap = self.get_mut(key)?;
        gap.attempts += 1;
        Some(gap.attempts)
    }

    /// Insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Gap> {
        self.gaps.values()
    }

    /// Highest priority first; ties keep insertion order.
    pub fn by_priority(&self) -> Vec<&Gap> {
        let mut gaps: Vec<&Gap> = self.gaps.values().collect();
        gaps.sort_by(|a, b| b.priority.total_cmp(&a.priority));
        gaps
    }

    /// Gap with the first matching description, any type.
    pub fn find_by_description(&self, description: &str) -> Option<&Gap> {
        self.gaps
            .values()
            .find(|g| g.description.eq_ignore_ascii_case(description))
    }

    pub fn len(&self) -> usize {
        self.gaps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gaps.is_empty()
    }
}
