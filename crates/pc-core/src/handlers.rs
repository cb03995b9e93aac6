//! Built-in bus handlers: KPI accounting and plan scheduling.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::bus::{Event, EventBus};
use crate::error::HandlerError;
use crate::plan::{PlanAction, PlanQueue, PlanStep};
use crate::policy::Action;

static SUBTASK_SPLIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s*(?:,|;|\band then\b|\bthen\b|\band\b)\s*").unwrap());

/// Running counters for one agent.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Kpis {
    pub cycles: u64,
    pub actions: BTreeMap<Action, u64>,
    pub handler_failures: u64,
    pub divergences: u64,
    pub facts_added: u64,
    pub gaps_opened: u64,
    pub gaps_resolved: u64,
    pub collaborator_failures: u64,
    pub steps_completed: u64,
    pub steps_failed: u64,
}

impl Kpis {
    pub fn action_count(&self, action: Action) -> u64 {
        self.actions.get(&action).copied().unwrap_or(0)
    }
}

/// Mutable context handed to every handler on publish.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Bookkeeping {
    pub kpis: Kpis,
    pub plan: PlanQueue,
    /// Step ids created by handlers during the current publish.
    #[serde(skip)]
    pub scheduled: Vec<u64>,
}

/// Subscribe the KPI recorder and the plan scheduler.
pub fn install(bus: &mut EventBus<Bookkeeping>) {
    bus.subscribe_all(record_kpis);
    bus.subscribe(Action::Decompose, schedule_subtasks);
    bus.subscribe(Action::Continue, begin_next_step);
}

fn record_kpis(event: &Event, book: &mut Bookkeeping) -> Result<(), HandlerError> {
    *book.kpis.actions.entry(event.kind).or_default() += 1;
    Ok(())
}

/// Split the event target into retrieve steps followed by an answer step.
/// A target taken from a plan step replaces that step.
fn schedule_subtasks(event: &Event, book: &mut Bookkeeping) -> Result<(), HandlerError> {
    let target = event.target.trim();
    if target.is_empty() {
        return Err(HandlerError::new("decompose event without a target"));
    }
    let parts: Vec<&str> = SUBTASK_SPLIT
        .split(target)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    if let Some(step) = event.source_step {
        if parts.len() < 2 {
            tracing::debug!(step, target, "plan step is already atomic");
            return Ok(());
        }
        book.plan.finish(step, Ok("decomposed".to_string()));
    }
    for part in &parts {
        let id = book.plan.push(PlanStep::new(PlanAction::Retrieve, *part));
        book.scheduled.push(id);
    }
    let id = book.plan.push(PlanStep::new(PlanAction::Answer, target));
    book.scheduled.push(id);
    tracing::debug!(subtasks = parts.len(), target, "decomposed target");
    Ok(())
}

fn begin_next_step(_event: &Event, book: &mut Bookkeeping) -> Result<(), HandlerError> {
    if book.plan.executing().is_some() {
        return Ok(());
    }
    match book.plan.begin_next() {
        Some(step) => {
            tracing::debug!(step = step.id, target = %step.target, "executing plan step");
            Ok(())
        }
        None => Err(HandlerError::new("continue event with no pending plan step")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::StepStatus;

    fn bus() -> EventBus<Bookkeeping> {
        let mut bus = EventBus::new(16);
        install(&mut bus);
        bus
    }

    #[test]
    fn test_kpis_count_every_kind() {
        let mut bus = bus();
        let mut book = Bookkeeping::default();
        bus.publish(Event::new(Action::Clarify, 0, "", 0), &mut book);
        bus.publish(Event::new(Action::Clarify, 1, "", 0), &mut book);
        bus.publish(Event::new(Action::Retrieve, 2, "cats", 0), &mut book);
        assert_eq!(book.kpis.action_count(Action::Clarify), 2);
        assert_eq!(book.kpis.action_count(Action::Retrieve), 1);
        assert_eq!(book.kpis.action_count(Action::Synthesize), 0);
    }

    #[test]
    fn test_decompose_schedules_steps() {
        let mut bus = bus();
        let mut book = Bookkeeping::default();
        bus.publish(
            Event::new(Action::Decompose, 0, "find the author, then check the date", 0),
            &mut book,
        );
        let steps: Vec<_> = book.plan.active().collect();
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0].target, "find the author");
        assert_eq!(steps[1].target, "check the date");
        assert_eq!(steps[2].action, PlanAction::Answer);
        assert_eq!(book.scheduled.len(), 3);
    }

    #[test]
    fn test_decompose_replaces_source_step() {
        let mut bus = bus();
        let mut book = Bookkeeping::default();
        let source = book.plan.push(PlanStep::new(PlanAction::Retrieve, "cats and dogs"));
        bus.publish(
            Event::new(Action::Decompose, 0, "cats and dogs", 0).with_source_step(Some(source)),
            &mut book,
        );

        let targets: Vec<_> = book.plan.active().map(|s| s.target.as_str()).collect();
        assert_eq!(targets, vec!["cats", "dogs", "cats and dogs"]);
        assert!(book.plan.active().all(|s| s.id != source));
        let retired = book.plan.finished().find(|s| s.id == source).unwrap();
        assert_eq!(retired.status, StepStatus::Completed);
        assert_eq!(retired.outcome.as_deref(), Some("decomposed"));
    }

    #[test]
    fn test_atomic_source_step_is_left_alone() {
        let mut bus = bus();
        let mut book = Bookkeeping::default();
        let source = book.plan.push(PlanStep::new(PlanAction::Retrieve, "cats"));
        let report = bus.publish(
            Event::new(Action::Decompose, 0, "cats", 0).with_source_step(Some(source)),
            &mut book,
        );
        assert_eq!(report.failed, 0);
        assert!(book.scheduled.is_empty());
        assert_eq!(book.plan.pending_count(), 1);
        assert_eq!(book.plan.active().next().unwrap().id, source);
    }

    #[test]
    fn test_decompose_without_target_fails() {
        let mut bus = bus();
        let mut book = Bookkeeping::default();
        let report = bus.publish(Event::new(Action::Decompose, 0, "  ", 0), &mut book);
        assert_eq!(report.failed, 1);
        // KPI recorder still ran
        assert!(report.handled);
        assert!(!book.plan.has_pending());
    }

    #[test]
    fn test_continue_begins_head_step() {
        let mut bus = bus();
        let mut book = Bookkeeping::default();
        book.plan.push(PlanStep::new(PlanAction::Retrieve, "a"));
        book.plan.push(PlanStep::new(PlanAction::Retrieve, "b"));
        bus.publish(Event::new(Action::Continue, 0, "", 0), &mut book);

        let executing = book.plan.executing().unwrap();
        assert_eq!(executing.target, "a");
        assert_eq!(executing.status, StepStatus::Executing);
        assert_eq!(book.plan.pending_count(), 1);
    }

    #[test]
    fn test_continue_with_empty_plan_is_recorded() {
        let mut bus = bus();
        let mut book = Bookkeeping::default();
        let report = bus.publish(Event::new(Action::Continue, 0, "", 0), &mut book);
        assert_eq!(report.failed, 1);
        assert_eq!(bus.failures().count(), 1);
    }
}
