//! Signal aggregation: store ratios and field triggers combined into one
//! five-channel vector per cycle.
//!
//! Each channel is the max of its contributors, so every channel is
//! monotone non-decreasing in every input it reads.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::fact::FactStore;
use crate::gap::GapSet;
use crate::trigger::FieldTriggers;

/// One trigger class per signal channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerClass {
    Contradiction,
    Gap,
    Novelty,
    Torsion,
    Coherence,
}

impl TriggerClass {
    pub const ALL: [TriggerClass; 5] = [
        TriggerClass::Contradiction,
        TriggerClass::Gap,
        TriggerClass::Novelty,
        TriggerClass::Torsion,
        TriggerClass::Coherence,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TriggerClass::Contradiction => "contradiction",
            TriggerClass::Gap => "gap",
            TriggerClass::Novelty => "novelty",
            TriggerClass::Torsion => "torsion",
            TriggerClass::Coherence => "coherence",
        }
    }

    /// Configuration key of the class threshold.
    pub fn threshold_key(self) -> &'static str {
        match self {
            TriggerClass::Contradiction => "tau_F",
            TriggerClass::Gap => "tau_G",
            TriggerClass::Novelty => "tau_R",
            TriggerClass::Torsion => "tau_T",
            TriggerClass::Coherence => "tau_P",
        }
    }
}

impl fmt::Display for TriggerClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalVector {
    pub contradiction: f64,
    pub gap: f64,
    pub novelty: f64,
    pub torsion: f64,
    pub coherence: f64,
}

impl SignalVector {
    pub fn get(&self, class: TriggerClass) -> f64 {
        match class {
            TriggerClass::Contradiction => self.contradiction,
            TriggerClass::Gap => self.gap,
            TriggerClass::Novelty => self.novelty,
            TriggerClass::Torsion => self.torsion,
            TriggerClass::Coherence => self.coherence,
        }
    }

    /// NaN and negative channels become 0.
    pub fn sanitized(&self) -> Self {
        Self {
            contradiction: non_negative(self.contradiction),
            gap: non_negative(self.gap),
            novelty: non_negative(self.novelty),
            torsion: non_negative(self.torsion),
            coherence: non_negative(self.coherence),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (TriggerClass, f64)> + '_ {
        TriggerClass::ALL.into_iter().map(|c| (c, self.get(c)))
    }
}

/// Raw ratios behind a signal vector, kept for logs and cycle records.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalBreakdown {
    pub contradiction_ratio: f64,
    pub gap_urgency: f64,
    pub novelty: f64,
    pub mismatch: f64,
    pub field: FieldTriggers,
}

/// `|contradictions| / max(|facts|, 1)`.
pub fn contradiction_ratio(facts: &FactStore) -> f64 {
    facts.contradiction_count() as f64 / facts.len().max(1) as f64
}

/// `clip(|gaps| / (|gaps| + |facts|) · (1 + Σp² / Σp), 0, 1)`.
pub fn gap_urgency(gaps: &GapSet, facts: &FactStore) -> f64 {
    if gaps.is_empty() {
        return 0.0;
    }
    let n = gaps.len() as f64;
    let share = n / (n + facts.len() as f64);
    let (sum, sum_sq) = gaps
        .iter()
        .map(|g| g.priority.max(0.0))
        .fold((0.0, 0.0), |(s, sq), p| (s + p, sq + p * p));
    let weight = if sum > 0.0 { 1.0 + sum_sq / sum } else { 1.0 };
    non_negative(share * weight).min(1.0)
}

/// Share of query terms the store has never seen. 1.0 when nothing is known.
pub fn novelty(facts: &FactStore, query: &BTreeSet<String>) -> f64 {
    if query.is_empty() {
        return 0.0;
    }
    if facts.known_term_count() == 0 {
        return 1.0;
    }
    let unknown = query.iter().filter(|t| !facts.knows_term(t)).count();
    unknown as f64 / query.len() as f64
}

/// `1 − Jaccard(query, evidence terms)`. 1.0 when there is no evidence.
pub fn mismatch(facts: &FactStore, query: &BTreeSet<String>) -> f64 {
    if query.is_empty() {
        return 0.0;
    }
    let evidence = facts.evidence_term_count();
    if evidence == 0 {
        return 1.0;
    }
    let shared = query.iter().filter(|t| facts.is_evidence_term(t)).count();
    let union = query.len() + evidence - shared;
    1.0 - shared as f64 / union as f64
}

/// Combine store ratios and field triggers into the cycle's signal vector.
pub fn aggregate(
    facts: &FactStore,
    gaps: &GapSet,
    query: Option<&BTreeSet<String>>,
    field: &FieldTriggers,
) -> (SignalVector, SignalBreakdown) {
    let breakdown = SignalBreakdown {
        contradiction_ratio: contradiction_ratio(facts),
        gap_urgency: gap_urgency(gaps, facts),
        novelty: query.map_or(0.0, |q| novelty(facts, q)),
        mismatch: query.map_or(0.0, |q| mismatch(facts, q)),
        field: *field,
    };
    let signals = SignalVector {
        contradiction: breakdown.contradiction_ratio,
        gap: breakdown.gap_urgency.max(field.grad_l),
        novelty: breakdown.novelty.max(breakdown.mismatch),
        torsion: field.grad_s.max(field.curl).max(field.current),
        coherence: field.correlation,
    }
    .sanitized();
    tracing::debug!(?signals, "aggregated signals");
    (signals, breakdown)
}

fn non_negative(x: f64) -> f64 {
    if x.is_nan() { 0.0 } else { x.max(0.0) }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::constants::SOURCE_RETRIEVAL;
    use crate::fact::Fact;
    use crate::gap::GapType;
    use approx::assert_relative_eq;

    fn terms(words: &[&str]) -> BTreeSet<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn test_empty_state_is_quiet() {
        let (signals, _) = aggregate(
            &FactStore::new(),
            &GapSet::new(),
            None,
            &FieldTriggers::default(),
        );
        assert_eq!(signals, SignalVector::default());
    }

    #[test]
    fn test_contradiction_ratio_half() {
        let mut facts = FactStore::new();
        facts.insert(Fact::positive("is", &["system", "secure"], "input", 1));
        facts.insert(Fact::negative("is", &["system", "secure"], "input", 2));
        assert_relative_eq!(contradiction_ratio(&facts), 0.5);
    }

    #[test]
    fn test_gap_urgency_bounded() {
        let mut gaps = GapSet::new();
        for i in 0..50 {
            gaps.add(GapType::OpenQuestion, &format!("q{i}"), BTreeMap::new());
        }
        let u = gap_urgency(&gaps, &FactStore::new());
        assert!(u > 0.0 && u <= 1.0);
    }

    #[test]
    fn test_gap_urgency_falls_as_facts_arrive() {
        let mut gaps = GapSet::new();
        gaps.add(GapType::OpenQuestion, "q", BTreeMap::new());
        let mut facts = FactStore::new();
        let before = gap_urgency(&gaps, &facts);
        for i in 0..5 {
            facts.insert(Fact::positive("p", &[&i.to_string()], "input", 1));
        }
        assert!(gap_urgency(&gaps, &facts) < before);
    }

    #[test]
    fn test_novelty_against_known_terms() {
        let mut facts = FactStore::new();
        assert_relative_eq!(novelty(&facts, &terms(&["cat"])), 1.0);
        facts.insert(Fact::positive("likes", &["cat", "fish"], "input", 1));
        assert_relative_eq!(novelty(&facts, &terms(&["cat", "dog"])), 0.5);
        assert_relative_eq!(novelty(&facts, &terms(&["cat", "fish"])), 0.0);
    }

    #[test]
    fn test_mismatch_uses_evidence_only() {
        let mut facts = FactStore::new();
        facts.insert(Fact::positive("likes", &["cat"], "input", 1));
        assert_relative_eq!(mismatch(&facts, &terms(&["cat"])), 1.0);

        facts.insert(Fact::positive("evidence", &["doc1", "cat"], SOURCE_RETRIEVAL, 2));
        // evidence terms: evidence, doc1, cat
        assert_relative_eq!(mismatch(&facts, &terms(&["cat"])), 1.0 - 1.0 / 3.0);
    }

    #[test]
    fn test_no_query_zeroes_novelty() {
        let (signals, breakdown) = aggregate(
            &FactStore::new(),
            &GapSet::new(),
            None,
            &FieldTriggers::default(),
        );
        assert_eq!(signals.novelty, 0.0);
        assert_eq!(breakdown.mismatch, 0.0);
    }

    #[test]
    fn test_field_triggers_feed_channels() {
        let field = FieldTriggers {
            grad_l: 0.9,
            curl: 0.8,
            correlation: 0.7,
            ..FieldTriggers::default()
        };
        let (signals, _) = aggregate(&FactStore::new(), &GapSet::new(), None, &field);
        assert_relative_eq!(signals.gap, 0.9);
        assert_relative_eq!(signals.torsion, 0.8);
        assert_relative_eq!(signals.coherence, 0.7);
    }

    #[test]
    fn test_sanitize() {
        let v = SignalVector {
            contradiction: f64::NAN,
            gap: -1.0,
            novelty: 0.3,
            torsion: f64::INFINITY,
            coherence: 0.0,
        }
        .sanitized();
        assert_eq!(v.contradiction, 0.0);
        assert_eq!(v.gap, 0.0);
        assert_eq!(v.novelty, 0.3);
        assert!(v.torsion.is_infinite());
    }

    #[test]
    fn test_threshold_keys() {
        let keys: Vec<_> = TriggerClass::ALL.iter().map(|c| c.threshold_key()).collect();
        assert_eq!(keys, vec!["tau_F", "tau_G", "tau_R", "tau_T", "tau_P"]);
    }
}
