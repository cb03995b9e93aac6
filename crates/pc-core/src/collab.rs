//! Contracts for the external collaborators injected into an agent.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::CollabError;
use crate::plan::MathOp;
use crate::policy::Action;
use crate::signal::SignalVector;

/// Computer-algebra backend. The core only forwards requests and stores
/// the returned text.
pub trait MathEngine: Send {
    fn compute(
        &mut self,
        op: MathOp,
        expression: &str,
        variable: Option<&str>,
    ) -> Result<String, CollabError>;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub doc_id: String,
    pub score: f64,
    pub snippet: String,
}

pub trait Retriever: Send {
    fn search(&mut self, query: &str, top_k: usize) -> Result<Vec<SearchHit>, CollabError>;
}

/// Append-only cycle log.
pub trait EventSink: Send {
    fn append(&mut self, record: &CycleRecord) -> Result<(), CollabError>;
}

/// Size of the agent state at the end of a cycle.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSummary {
    pub facts: usize,
    pub contradictions: usize,
    pub gaps: usize,
    pub pending_steps: usize,
    pub open_chains: usize,
    pub field_norms: (f64, f64),
    pub diverged: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CycleRecord {
    pub timestamp: u64,
    pub cycle: u64,
    pub input: String,
    pub action: Action,
    pub response: String,
    pub signal_vector: SignalVector,
    pub state_summary: StateSummary,
}

/// Stand-in for a collaborator that is not configured. Every call fails,
/// which the agent turns into a `<collaborator>_failure` gap.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unavailable;

impl MathEngine for Unavailable {
    fn compute(&mut self, op: MathOp, _: &str, _: Option<&str>) -> Result<String, CollabError> {
        Err(CollabError::Unavailable(format!("no math engine for {op}")))
    }
}

impl Retriever for Unavailable {
    fn search(&mut self, _: &str, _: usize) -> Result<Vec<SearchHit>, CollabError> {
        Err(CollabError::Unavailable("no retriever configured".to_string()))
    }
}

/// Discards every record.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn append(&mut self, _: &CycleRecord) -> Result<(), CollabError> {
        Ok(())
    }
}

/// Keeps records in memory. Clones share the same buffer, so a test can
/// hold one handle and give the other to an agent.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<CycleRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<CycleRecord> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for MemorySink {
    fn append(&mut self, record: &CycleRecord) -> Result<(), CollabError> {
        self.records
            .lock()
            .map_err(|_| CollabError::Failed("memory sink lock poisoned".to_string()))?
            .push(record.clone());
        Ok(())
    }
}

/// Injected collaborator handles.
pub struct Collaborators {
    pub math: Box<dyn MathEngine>,
    pub retriever: Box<dyn Retriever>,
    pub sink: Box<dyn EventSink>,
}

impl Collaborators {
    pub fn with_math(mut self, math: impl MathEngine + 'static) -> Self {
        self.math = Box::new(math);
        self
    }

    pub fn with_retriever(mut self, retriever: impl Retriever + 'static) -> Self {
        self.retriever = Box::new(retriever);
        self
    }

    pub fn with_sink(mut self, sink: impl EventSink + 'static) -> Self {
        self.sink = Box::new(sink);
        self
    }
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            math: Box::new(Unavailable),
            retriever: Box::new(Unavailable),
            sink: Box::new(NullSink),
        }
    }
}
