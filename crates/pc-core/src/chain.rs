//! Reasoning-chain tracker.
//!
//! Open chains form an explicit stack. A nested `start` pushes a chain one
//! level deeper; past the depth limit it is rejected. Only the innermost
//! chain may be completed, and nothing is ever silently replaced.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ChainError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChainId(Uuid);

impl ChainId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ChainId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What kind of request opened the chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainKind {
    Assertion,
    Command,
    Query,
    Clarification,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    Parse,
    Signal,
    Decide,
    Execute,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChainStep {
    pub phase: StepPhase,
    pub target: String,
    pub result: String,
    pub note: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReasoningChain {
    pub id: ChainId,
    pub query: String,
    pub kind: ChainKind,
    /// Number of chains open beneath this one when it started.
    pub depth: usize,
    pub steps: Vec<ChainStep>,
    pub result: Option<String>,
    pub success: Option<bool>,
}

#[derive(Clone, Debug)]
pub struct ChainTracker {
    open: Vec<ReasoningChain>,
    archive: VecDeque<ReasoningChain>,
    depth_limit: usize,
    archive_capacity: usize,
}

impl ChainTracker {
    pub fn new(depth_limit: usize, archive_capacity: usize) -> Self {
        Self {
            open: Vec::new(),
            archive: VecDeque::new(),
            depth_limit: depth_limit.max(1),
            archive_capacity: archive_capacity.max(1),
        }
    }

    pub fn start(&mut self, query: &str, kind: ChainKind) -> Result<ChainId, ChainError> {
        if self.open.len() >= self.depth_limit {
            return Err(ChainError::DepthExceeded {
                limit: self.depth_limit,
            });
        }
        let id = ChainId::new();
        self.open.push(ReasoningChain {
            id,
            query: query.to_string(),
            kind,
            depth: self.open.len(),
            steps: Vec::new(),
            result: None,
            success: None,
        });
        Ok(id)
    }

    pub fn append_step(
        &mut self,
        id: ChainId,
        phase: StepPhase,
        target: &str,
        result: &str,
        note: Option<&str>,
    ) -> Result<(), ChainError> {
        let chain = self.open_mut(id)?;
        chain.steps.push(ChainStep {
            phase,
            target: target.to_string(),
            result: result.to_string(),
            note: note.map(str::to_string),
        });
        Ok(())
    }

    /// Close the innermost chain and move it to the archive.
    pub fn complete(
        &mut self,
        id: ChainId,
        result: &str,
        success: bool,
    ) -> Result<&ReasoningChain, ChainError> {
        let innermost = match self.open.last() {
            Some(chain) => chain.id,
            None => return Err(self.missing(id)),
        };
        if innermost != id {
            if self.open.iter().any(|c| c.id == id) {
                return Err(ChainError::NotInnermost {
                    requested: id,
                    innermost,
                });
            }
            return Err(self.missing(id));
        }
        let Some(mut chain) = self.open.pop() else {
            return Err(self.missing(id));
        };
        chain.result = Some(result.to_string());
        chain.success = Some(success);
        if self.archive.len() == self.archive_capacity {
            self.archive.pop_front();
        }
        self.archive.push_back(chain);
        self.archive.back().ok_or(ChainError::UnknownChain(id))
    }

    pub fn depth(&self) -> usize {
        self.open.len()
    }

    pub fn current(&self) -> Option<&ReasoningChain> {
        self.open.last()
    }

    /// Completed chains, oldest first.
    pub fn archive(&self) -> impl Iterator<Item = &ReasoningChain> {
        self.archive.iter()
    }

    pub fn get(&self, id: ChainId) -> Option<&ReasoningChain> {
        self.open
            .iter()
            .chain(self.archive.iter())
            .find(|c| c.id == id)
    }

    fn open_mut(&mut self, id: ChainId) -> Result<&mut ReasoningChain, ChainError> {
        if let Some(pos) = self.open.iter().position(|c| c.id == id) {
            return Ok(&mut self.open[pos]);
        }
        Err(self.missing(id))
    }

    fn missing(&self, id: ChainId) -> ChainError {
        if self.archive.iter().any(|c| c.id == id) {
            ChainError::NotOpen(id)
        } else {
            ChainError::UnknownChain(id)
        }
    }
}
