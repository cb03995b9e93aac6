//! Paraconsistent fact store.
//!
//! Positive and negative assertions for the same `(predicate, args)` key
//! coexist indefinitely. Contradictions are re-derived per key on insert;
//! the flattened view is a lazily rebuilt cache.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::SOURCE_RETRIEVAL;
use crate::tokenizer::tokenize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    Positive,
    Negative,
}

impl Polarity {
    pub fn opposite(self) -> Self {
        match self {
            Polarity::Positive => Polarity::Negative,
            Polarity::Negative => Polarity::Positive,
        }
    }
}

/// Composite `(predicate, args)` key. Structural equality and ordering.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FactKey {
    pub predicate: String,
    pub args: Vec<String>,
}

impl FactKey {
    pub fn new(predicate: impl Into<String>, args: &[&str]) -> Self {
        Self {
            predicate: predicate.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

impl fmt::Display for FactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.predicate, self.args.join(", "))
    }
}

/// Fact identity: key plus polarity.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FactId {
    pub key: FactKey,
    pub polarity: Polarity,
}

/// An immutable assertion. Identity is [`FactId`]; source, timestamp and
/// confidence are provenance. Deserialization goes through [`Fact::new`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "FactRecord")]
pub struct Fact {
    key: FactKey,
    polarity: Polarity,
    source: String,
    timestamp: u64,
    confidence: f64,
}

impl Fact {
    pub fn new(
        key: FactKey,
        polarity: Polarity,
        source: impl Into<String>,
        timestamp: u64,
        confidence: f64,
    ) -> Self {
        let confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        Self {
            key,
            polarity,
            source: source.into(),
            timestamp,
            confidence,
        }
    }

    pub fn positive(predicate: &str, args: &[&str], source: &str, timestamp: u64) -> Self {
        Self::new(FactKey::new(predicate, args), Polarity::Positive, source, timestamp, 1.0)
    }

    pub fn negative(predicate: &str, args: &[&str], source: &str, timestamp: u64) -> Self {
        Self::new(FactKey::new(predicate, args), Polarity::Negative, source, timestamp, 1.0)
    }

    pub fn key(&self) -> &FactKey {
        &self.key
    }

    pub fn predicate(&self) -> &str {
        &self.key.predicate
    }

    pub fn args(&self) -> &[String] {
        &self.key.args
    }

    pub fn polarity(&self) -> Polarity {
        self.polarity
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn id(&self) -> FactId {
        FactId {
            key: self.key.clone(),
            polarity: self.polarity,
        }
    }

    /// Lowercase word terms of predicate and arguments.
    pub fn terms(&self) -> Vec<String> {
        let mut terms = tokenize(&self.key.predicate);
        for arg in &self.key.args {
            terms.extend(tokenize(arg));
        }
        terms
    }
}

impl fmt::Display for Fact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.polarity {
            Polarity::Positive => write!(f, "{}", self.key),
            Polarity::Negative => write!(f, "¬{}", self.key),
        }
    }
}

#[derive(Deserialize)]
struct FactRecord {
    key: FactKey,
    polarity: Polarity,
    source: String,
    timestamp: u64,
    confidence: f64,
}

impl From<FactRecord> for Fact {
    fn from(r: FactRecord) -> Self {
        Fact::new(r.key, r.polarity, r.source, r.timestamp, r.confidence)
    }
}

/// `(positive, negative)` pair sharing a key.
pub type Contradiction = (Fact, Fact);

#[derive(Clone, Debug, Default)]
struct KeyEntry {
    positives: Vec<Fact>,
    negatives: Vec<Fact>,
    corroborations: u32,
    contradictions: Vec<Contradiction>,
}

impl KeyEntry {
    fn rederive(&mut self) {
        self.contradictions.clear();
        for p in &self.positives {
            for n in &self.negatives {
                self.contradictions.push((p.clone(), n.clone()));
            }
        }
    }
}

/// Paraconsistent store with per-key contradiction tracking and a term
/// index used for novelty and evidence-mismatch signals.
#[derive(Clone, Debug, Default)]
pub struct FactStore {
    entries: BTreeMap<FactKey, KeyEntry>,
    len: usize,
    contradiction_count: usize,
    term_counts: HashMap<String, usize>,
    evidence_term_counts: HashMap<String, usize>,
    flat_contradictions: Vec<Contradiction>,
    cache_dirty: bool,
}

impl FactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fact. Never rejects input. Re-asserting an existing
    /// `(key, polarity)` corroborates it instead of adding a duplicate;
    /// returns whether a new fact was stored.
    pub fn insert(&mut self, fact: Fact) -> bool {
        let entry = self.entries.entry(fact.key.clone()).or_default();
        let side = match fact.polarity {
            Polarity::Positive => &mut entry.positives,
            Polarity::Negative => &mut entry.negatives,
        };
        if side.iter().any(|f| f.polarity == fact.polarity) {
            entry.corroborations += 1;
            tracing::debug!(fact = %fact, "corroborated existing fact");
            return false;
        }

        let terms = fact.terms();
        let is_evidence = fact.source == SOURCE_RETRIEVAL;
        side.push(fact);

        let before = entry.contradictions.len();
        entry.rederive();
        let after = entry.contradictions.len();
        self.contradiction_count = self.contradiction_count + after - before;
        self.len += 1;

        for term in terms {
            if is_evidence {
                *self.evidence_term_counts.entry(term.clone()).or_default() += 1;
            }
            *self.term_counts.entry(term).or_default() += 1;
        }

        self.cache_dirty = true;
        true
    }

    /// Total stored facts (both polarities).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contradiction_count(&self) -> usize {
        self.contradiction_count
    }

    /// Full contradiction set, rebuilt lazily after structural change.
    pub fn contradictions(&mut self) -> &[Contradiction] {
        if self.cache_dirty {
            self.flat_contradictions = self
                .entries
                .values()
                .flat_map(|e| e.contradictions.iter().cloned())
                .collect();
            self.cache_dirty = false;
        }
        &self.flat_contradictions
    }

    /// Contradictions without touching the cache.
    pub fn iter_contradictions(&self) -> impl Iterator<Item = &Contradiction> {
        self.entries.values().flat_map(|e| e.contradictions.iter())
    }

    /// Contradictions for a single key.
    pub fn contradictions_for(&self, key: &FactKey) -> &[Contradiction] {
        self.entries
            .get(key)
            .map(|e| e.contradictions.as_slice())
            .unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Fact> {
        self.entries
            .values()
            .flat_map(|e| e.positives.iter().chain(e.negatives.iter()))
    }

    /// Filtered read in key order.
    pub fn facts(&self, predicate: Option<&str>, polarity: Option<Polarity>) -> Vec<Fact> {
        self.iter()
            .filter(|f| predicate.is_none_or(|p| f.predicate() == p))
            .filter(|f| polarity.is_none_or(|p| f.polarity == p))
            .cloned()
            .collect()
    }

    pub fn contains(&self, id: &FactId) -> bool {
        self.entries.get(&id.key).is_some_and(|e| {
            let side = match id.polarity {
                Polarity::Positive => &e.positives,
                Polarity::Negative => &e.negatives,
            };
            !side.is_empty()
        })
    }

    pub fn corroborations(&self, key: &FactKey) -> u32 {
        self.entries.get(key).map_or(0, |e| e.corroborations)
    }

    /// Facts with at least one term in `terms`.
    pub fn facts_mentioning<'a>(&'a self, terms: &'a BTreeSet<String>) -> impl Iterator<Item = &'a Fact> {
        self.iter()
            .filter(move |f| f.terms().iter().any(|t| terms.contains(t)))
    }

    pub fn knows_term(&self, term: &str) -> bool {
        self.term_counts.contains_key(term)
    }

    pub fn known_term_count(&self) -> usize {
        self.term_counts.len()
    }

    pub fn is_evidence_term(&self, term: &str) -> bool {
        self.evidence_term_counts.contains_key(term)
    }

    pub fn evidence_term_count(&self) -> usize {
        self.evidence_term_counts.len()
    }
}

impl Extend<Fact> for FactStore {
    fn extend<I: IntoIterator<Item = Fact>>(&mut self, iter: I) {
        for fact in iter {
            self.insert(fact);
        }
    }
}
