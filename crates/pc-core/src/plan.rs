//! Pending plan steps.
//!
//! Steps are created by input parsing (math and search commands) or by the
//! decompose handler, and consumed FIFO by the `continue` action.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Operation forwarded to the math collaborator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MathOp {
    Solve,
    Differentiate,
    Integrate,
    Simplify,
    Factor,
    Expand,
}

impl MathOp {
    pub const ALL: [MathOp; 6] = [
        MathOp::Solve,
        MathOp::Differentiate,
        MathOp::Integrate,
        MathOp::Simplify,
        MathOp::Factor,
        MathOp::Expand,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MathOp::Solve => "solve",
            MathOp::Differentiate => "differentiate",
            MathOp::Integrate => "integrate",
            MathOp::Simplify => "simplify",
            MathOp::Factor => "factor",
            MathOp::Expand => "expand",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let lower = s.to_lowercase();
        Self::ALL.into_iter().find(|op| op.as_str() == lower)
    }
}

impl fmt::Display for MathOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "op")]
pub enum PlanAction {
    Compute(MathOp),
    Retrieve,
    Answer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Executing,
    Completed,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: u64,
    pub action: PlanAction,
    pub target: String,
    pub params: BTreeMap<String, String>,
    pub status: StepStatus,
    /// Result text or failure reason once finished.
    pub outcome: Option<String>,
}

impl PlanStep {
    /// Unnumbered pending step. The queue assigns the id on push.
    pub fn new(action: PlanAction, target: impl Into<String>) -> Self {
        Self {
            id: 0,
            action,
            target: target.into(),
            params: BTreeMap::new(),
            status: StepStatus::Pending,
            outcome: None,
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<String>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }
}

/// FIFO plan queue with a bounded archive of finished steps.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlanQueue {
    active: VecDeque<PlanStep>,
    finished: VecDeque<PlanStep>,
    next_id: u64,
    archive_capacity: usize,
}

impl PlanQueue {
    pub fn new(archive_capacity: usize) -> Self {
        Self {
            active: VecDeque::new(),
            finished: VecDeque::new(),
            next_id: 1,
            archive_capacity: archive_capacity.max(1),
        }
    }

    /// Enqueue a step and return its id.
    pub fn push(&mut self, mut step: PlanStep) -> u64 {
        step.id = self.next_id;
        step.status = StepStatus::Pending;
        self.next_id += 1;
        let id = step.id;
        self.active.push_back(step);
        id
    }

    pub fn has_pending(&self) -> bool {
        self.active.iter().any(|s| s.status == StepStatus::Pending)
    }

    pub fn pending_count(&self) -> usize {
        self.active
            .iter()
            .filter(|s| s.status == StepStatus::Pending)
            .count()
    }

    /// Mark the oldest pending step as executing and return a copy.
    pub fn begin_next(&mut self) -> Option<PlanStep> {
        let step = self
            .active
            .iter_mut()
            .find(|s| s.status == StepStatus::Pending)?;
        step.status = StepStatus::Executing;
        Some(step.clone())
    }

    /// The step currently executing, if any.
    pub fn executing(&self) -> Option<&PlanStep> {
        self.active
            .iter()
            .find(|s| s.status == StepStatus::Executing)
    }

    /// Record the outcome of an active step and move it to the archive.
    /// Returns false if no active step has this id.
    pub fn finish(&mut self, id: u64, outcome: Result<String, String>) -> bool {
        let Some(pos) = self.active.iter().position(|s| s.id == id) else {
            return false;
        };
        let Some(mut step) = self.active.remove(pos) else {
            return false;
        };
        match outcome {
            Ok(text) => {
                step.status = StepStatus::Completed;
                step.outcome = Some(text);
            }
            Err(reason) => {
                step.status = StepStatus::Failed;
                step.outcome = Some(reason);
            }
        }
        if self.finished.len() == self.archive_capacity {
            self.finished.pop_front();
        }
        self.finished.push_back(step);
        true
    }

    pub fn active(&self) -> impl Iterator<Item = &PlanStep> {
        self.active.iter()
    }

    pub fn finished(&self) -> impl Iterator<Item = &PlanStep> {
        self.finished.iter()
    }
}

impl Default for PlanQueue {
    fn default() -> Self {
        Self::new(crate::constants::DEFAULT_HISTORY_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut q = PlanQueue::new(8);
        let a = q.push(PlanStep::new(PlanAction::Retrieve, "first"));
        let b = q.push(PlanStep::new(PlanAction::Answer, "second"));
        assert!(a < b);
        assert_eq!(q.pending_count(), 2);

        let step = q.begin_next().unwrap();
        assert_eq!(step.target, "first");
        assert_eq!(q.executing().unwrap().id, a);
        assert_eq!(q.pending_count(), 1);
    }

    #[test]
    fn test_finish_archives() {
        let mut q = PlanQueue::new(8);
        let id = q.push(PlanStep::new(PlanAction::Compute(MathOp::Solve), "x^2 = 4"));
        q.begin_next();
        assert!(q.finish(id, Err("no engine".into())));
        assert!(!q.has_pending());
        let done: Vec<_> = q.finished().collect();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].status, StepStatus::Failed);
        assert!(!q.finish(id, Ok("again".into())));
    }

    #[test]
    fn test_archive_bounded() {
        let mut q = PlanQueue::new(2);
        for i in 0..5 {
            let id = q.push(PlanStep::new(PlanAction::Answer, format!("s{i}")));
            q.begin_next();
            q.finish(id, Ok("ok".into()));
        }
        let targets: Vec<_> = q.finished().map(|s| s.target.clone()).collect();
        assert_eq!(targets, vec!["s3", "s4"]);
    }

    #[test]
    fn test_math_op_parse() {
        assert_eq!(MathOp::parse("Differentiate"), Some(MathOp::Differentiate));
        assert_eq!(MathOp::parse("integrate"), Some(MathOp::Integrate));
        assert_eq!(MathOp::parse("plot"), None);
    }
}
