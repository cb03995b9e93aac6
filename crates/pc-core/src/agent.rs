//! The agent aggregate and its `process` cycle.
//!
//! One call to [`Agent::process`] runs parse, store mutation, field drive,
//! trigger extraction, signal aggregation, the policy decision, event
//! dispatch, action execution, chain bookkeeping and the cycle log as a
//! single `&mut self` unit. It always returns a [`Response`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::AtomicBool;

use serde::{Deserialize, Serialize};

use crate::bus::{Event, EventBus};
use crate::chain::{ChainId, ChainKind, ChainTracker, StepPhase};
use crate::collab::{Collaborators, CycleRecord, SearchHit, StateSummary};
use crate::config::CoreConfig;
use crate::constants::{SOURCE_INPUT, SOURCE_MATH, SOURCE_RETRIEVAL};
use crate::error::{CollabError, ConfigError};
use crate::fact::{Fact, FactKey, FactStore, Polarity};
use crate::field::{DivergencePolicy, EvolveReport, FieldSnapshot, FieldState};
use crate::gap::{Collaborator, Gap, GapKey, GapSet, GapType};
use crate::handlers::{self, Bookkeeping, Kpis};
use crate::plan::{MathOp, PlanAction, PlanQueue, StepStatus};
use crate::policy::{Action, CooldownTable, Decision, PolicyEngine};
use crate::signal::{SignalBreakdown, SignalVector, aggregate};
use crate::time::Clock;
use crate::tokenizer::{InputKind, ParsedInput, content_terms, parse_input};
use crate::trigger::{self, FieldTriggers};

const REFERENCE_WORDS: &[&str] = &["it", "they", "them", "this", "that", "these", "those", "he", "she"];

/// Result of one cycle.
#[derive(Clone, Debug, Serialize)]
pub struct Response {
    pub cycle: u64,
    pub action: Action,
    pub text: String,
    pub signals: SignalVector,
    pub breakdown: SignalBreakdown,
    pub decision: Decision,
    /// A field step exceeded the divergence bound this cycle.
    pub diverged: bool,
    pub handler_failures: usize,
    pub chain: Option<ChainId>,
}

/// Everything needed to resume an agent in a later process.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub cycle: u64,
    pub facts: Vec<Fact>,
    pub gaps: Vec<Gap>,
    pub field: FieldSnapshot,
    pub cooldowns: CooldownTable,
    pub plan: PlanQueue,
    pub kpis: Kpis,
}

pub struct Agent {
    config: CoreConfig,
    facts: FactStore,
    gaps: GapSet,
    field: FieldState,
    last_triggers: FieldTriggers,
    policy: PolicyEngine,
    bus: EventBus<Bookkeeping>,
    book: Bookkeeping,
    chains: ChainTracker,
    collab: Collaborators,
    clock: Box<dyn Clock>,
    cycle: u64,
}

impl Agent {
    /// Validate the configuration and build an agent. Unstable field
    /// parameters and unsupported event caps fail here and nowhere else.
    pub fn new(
        config: CoreConfig,
        collab: Collaborators,
        clock: impl Clock + 'static,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let field = match config.field_seed {
            Some(seed) => FieldState::seeded(config.field.clone(), seed)?,
            None => FieldState::new(config.field.clone())?,
        };
        let mut bus = EventBus::new(config.history_capacity);
        handlers::install(&mut bus);
        let policy = PolicyEngine::new(
            config.thresholds.clone(),
            config.priorities.clone(),
            config.cooldown_window,
        );
        let book = Bookkeeping {
            plan: PlanQueue::new(config.history_capacity),
            ..Bookkeeping::default()
        };
        let chains = ChainTracker::new(config.chain_depth_limit, config.history_capacity);
        tracing::info!(
            dim = config.field.dim,
            gamma = config.field.gamma,
            cooldown_window = config.cooldown_window,
            "agent initialized"
        );
        Ok(Self {
            config,
            facts: FactStore::new(),
            gaps: GapSet::new(),
            field,
            last_triggers: FieldTriggers::default(),
            policy,
            bus,
            book,
            chains,
            collab,
            clock: Box::new(clock),
            cycle: 0,
        })
    }

    /// Rebuild an agent from a snapshot. The field parameters come from
    /// `config` and are validated again.
    pub fn restore(
        config: CoreConfig,
        collab: Collaborators,
        clock: impl Clock + 'static,
        snapshot: AgentSnapshot,
    ) -> Result<Self, ConfigError> {
        let mut agent = Self::new(config, collab, clock)?;
        agent.field = FieldState::restore(agent.config.field.clone(), snapshot.field)?;
        agent.facts.extend(snapshot.facts);
        for gap in snapshot.gaps {
            agent.gaps.insert_gap(gap);
        }
        agent.policy = PolicyEngine::new(
            agent.config.thresholds.clone(),
            agent.config.priorities.clone(),
            agent.config.cooldown_window,
        )
        .with_cooldowns(snapshot.cooldowns);
        agent.book.plan = snapshot.plan;
        agent.book.kpis = snapshot.kpis;
        agent.cycle = snapshot.cycle;
        agent.last_triggers = trigger::triggers(&agent.field, &agent.config.triggers);
        Ok(agent)
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            cycle: self.cycle,
            facts: self.facts.iter().cloned().collect(),
            gaps: self.gaps.iter().cloned().collect(),
            field: self.field.snapshot(),
            cooldowns: self.policy.cooldowns().clone(),
            plan: self.book.plan.clone(),
            kpis: self.book.kpis.clone(),
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn facts(&self) -> &FactStore {
        &self.facts
    }

    pub fn gaps(&self) -> &GapSet {
        &self.gaps
    }

    pub fn field(&self) -> &FieldState {
        &self.field
    }

    pub fn last_triggers(&self) -> &FieldTriggers {
        &self.last_triggers
    }

    pub fn policy(&self) -> &PolicyEngine {
        &self.policy
    }

    pub fn plan(&self) -> &PlanQueue {
        &self.book.plan
    }

    pub fn kpis(&self) -> &Kpis {
        &self.book.kpis
    }

    pub fn bus(&self) -> &EventBus<Bookkeeping> {
        &self.bus
    }

    /// Register an extra handler on the agent's bus.
    pub fn bus_mut(&mut self) -> &mut EventBus<Bookkeeping> {
        &mut self.bus
    }

    pub fn chains(&self) -> &ChainTracker {
        &self.chains
    }

    pub fn summary(&self) -> StateSummary {
        StateSummary {
            facts: self.facts.len(),
            contradictions: self.facts.contradiction_count(),
            gaps: self.gaps.len(),
            pending_steps: self.book.plan.pending_count(),
            open_chains: self.chains.depth(),
            field_norms: self.field.norms(),
            diverged: false,
        }
    }

    /// Run the field integrator outside the cycle. `cancel` is checked
    /// between steps.
    pub fn evolve(
        &mut self,
        steps: usize,
        dt: f64,
        cancel: &AtomicBool,
        on_divergence: DivergencePolicy,
    ) -> EvolveReport {
        let report = self.field.evolve(steps, dt, cancel, on_divergence);
        if report.first_divergence.is_some() {
            self.book.kpis.divergences += 1;
        }
        self.last_triggers = trigger::triggers(&self.field, &self.config.triggers);
        report
    }

    /// One full control cycle.
    pub fn process(&mut self, input: &str) -> Response {
        let cycle = self.cycle;
        let now = self.clock.now_unix_secs();
        let parsed = parse_input(input);
        let chain = self.open_chain(input, parsed.kind);
        let mut notes = Vec::new();

        let diverged = if parsed.is_empty() {
            self.trace(chain, StepPhase::Parse, "input", "empty", None);
            false
        } else {
            let parse_summary = format!(
                "{} fact(s), {} step(s), {} resolution(s), query: {}",
                parsed.assertions.len(),
                parsed.steps.len(),
                parsed.resolutions.len(),
                parsed.query.is_some()
            );
            self.trace(chain, StepPhase::Parse, "input", &parse_summary, None);
            self.apply(&parsed, now, &mut notes);
            self.drive_field()
        };

        self.last_triggers = trigger::triggers(&self.field, &self.config.triggers);
        let query_terms = parsed.query.as_ref().map(|q| &q.terms);
        let (signals, breakdown) =
            aggregate(&self.facts, &self.gaps, query_terms, &self.last_triggers);
        self.trace(chain, StepPhase::Signal, "aggregate", &format_signals(&signals), None);

        let decision = if parsed.is_empty() {
            Decision {
                cycle,
                action: Action::Clarify,
                fired: None,
                candidates: Vec::new(),
                suppressed: Vec::new(),
            }
        } else {
            self.policy.decide(cycle, &signals, self.book.plan.has_pending())
        };
        let action = decision.action;
        let fired = decision.fired.map(|c| c.as_str());
        self.trace(chain, StepPhase::Decide, "policy", action.as_str(), fired);

        let (target, source_step) = self.event_target(action, &parsed);
        let (priority, strength) = decision.fired.map_or((0, 0.0), |class| {
            (self.config.priorities.get(class), signals.get(class))
        });
        let event = Event::new(action, cycle, target.clone(), now)
            .with_priority(priority, strength)
            .with_source_step(source_step);
        self.book.scheduled.clear();
        let report = self.bus.publish(event, &mut self.book);
        self.book.kpis.handler_failures += report.failed as u64;

        let body = self.execute(action, &target, &parsed, now);
        self.trace(chain, StepPhase::Execute, &target, &body, None);
        self.policy.complete();
        notes.push(body);
        if diverged {
            self.book.kpis.divergences += 1;
            notes.push("Field norm exceeded its bound this cycle.".to_string());
        }
        let text = notes.join(" ");

        if let Some(id) = chain
            && let Err(err) = self.chains.complete(id, &text, !diverged)
        {
            tracing::debug!(%err, "could not complete reasoning chain");
        }

        self.book.kpis.cycles += 1;
        self.cycle += 1;
        self.log_cycle(now, cycle, input, action, &text, signals, diverged);
        tracing::info!(cycle, %action, diverged, "cycle complete");

        Response {
            cycle,
            action,
            text,
            signals,
            breakdown,
            decision,
            diverged,
            handler_failures: report.failed,
            chain,
        }
    }

    fn open_chain(&mut self, input: &str, kind: InputKind) -> Option<ChainId> {
        let kind = match kind {
            InputKind::Assertion => ChainKind::Assertion,
            InputKind::Command => ChainKind::Command,
            InputKind::Query => ChainKind::Query,
            InputKind::Empty => ChainKind::Clarification,
        };
        match self.chains.start(input, kind) {
            Ok(id) => Some(id),
            Err(err) => {
                tracing::warn!(%err, "reasoning chain not recorded");
                None
            }
        }
    }

    fn trace(
        &mut self,
        chain: Option<ChainId>,
        phase: StepPhase,
        target: &str,
        result: &str,
        note: Option<&str>,
    ) {
        if let Some(id) = chain
            && let Err(err) = self.chains.append_step(id, phase, target, result, note)
        {
            tracing::debug!(%err, "could not append chain step");
        }
    }

    /// Store, gap and plan mutations requested by the input.
    fn apply(&mut self, parsed: &ParsedInput, now: u64, notes: &mut Vec<String>) {
        if !parsed.assertions.is_empty() {
            let mut added = 0;
            for a in &parsed.assertions {
                let args: Vec<&str> = a.args.iter().map(String::as_str).collect();
                let fact = Fact::new(
                    FactKey::new(a.predicate.as_str(), &args),
                    a.polarity,
                    SOURCE_INPUT,
                    now,
                    a.confidence,
                );
                if self.facts.insert(fact) {
                    added += 1;
                }
            }
            self.book.kpis.facts_added += added;
            let corroborated = parsed.assertions.len() as u64 - added;
            if corroborated > 0 {
                notes.push(format!(
                    "Recorded {added} fact(s), {corroborated} corroborated."
                ));
            } else {
                notes.push(format!("Recorded {added} fact(s)."));
            }
        }

        for description in &parsed.resolutions {
            let key = self.gaps.find_by_description(description).map(Gap::key);
            match key.and_then(|k| self.gaps.remove(&k)) {
                Some(gap) => {
                    self.book.kpis.gaps_resolved += 1;
                    notes.push(format!("Resolved gap '{}'.", gap.description));
                }
                None => notes.push(format!("No open gap matches '{description}'.")),
            }
        }

        if !parsed.steps.is_empty() {
            for step in &parsed.steps {
                self.book.plan.push(step.clone());
            }
            notes.push(format!("Queued {} plan step(s).", parsed.steps.len()));
        }

        if let Some(query) = &parsed.query {
            if self.facts.is_empty()
                && let Some(word) = query
                    .terms
                    .iter()
                    .find(|t| REFERENCE_WORDS.contains(&t.as_str()))
            {
                let ctx = BTreeMap::from([("query".to_string(), query.text.clone())]);
                self.open_gap(GapType::UnresolvedReference, &format!("referent of '{word}'"), ctx);
            }
            if query.is_question {
                let unknown = self.unknown_terms(&query.text);
                if !unknown.is_empty() {
                    let ctx = BTreeMap::from([("terms".to_string(), unknown.join(" "))]);
                    self.open_gap(GapType::OpenQuestion, &query.text, ctx);
                }
            }
        }
    }

    fn unknown_terms(&self, text: &str) -> Vec<String> {
        content_terms(text)
            .into_iter()
            .filter(|t| !self.facts.knows_term(t))
            .collect()
    }

    /// Drive Λ from gap priorities and S from active plan steps, then run
    /// the per-cycle integrator steps. Returns whether any step diverged.
    fn drive_field(&mut self) -> bool {
        let params = self.field.params();
        let (dim, gain, dt, steps) = (
            params.dim,
            params.drive_gain,
            params.dt,
            params.steps_per_cycle,
        );

        let mut src_s = vec![0.0; dim];
        let mut src_l = vec![0.0; dim];
        let gap_terms: Vec<BTreeSet<String>> = self
            .gaps
            .iter()
            .map(|g| content_terms(&g.description))
            .collect();
        for (i, gap) in self.gaps.iter().enumerate() {
            src_l[i % dim] += gap.priority * gain;
        }
        for step in self.book.plan.active() {
            let terms = content_terms(&step.target);
            let site = gap_terms
                .iter()
                .position(|g| !g.is_disjoint(&terms))
                .unwrap_or(step.id as usize);
            src_s[site % dim] += gain;
        }
        self.field.set_drive(&src_s, &src_l);

        let mut diverged = false;
        for _ in 0..steps {
            diverged |= self.field.step(dt).diverged;
        }
        diverged
    }

    /// The event target, and the plan step it was taken from for a
    /// decompose that falls back to the head retrieve step.
    fn event_target(&self, action: Action, parsed: &ParsedInput) -> (String, Option<u64>) {
        let query = parsed.query.as_ref().map(|q| q.text.clone());
        let top_gap = || self.gaps.by_priority().first().map(|g| g.description.clone());
        let head_step = || {
            self.book
                .plan
                .active()
                .find(|s| s.status == StepStatus::Pending)
                .map(|s| s.target.clone())
        };
        if action == Action::Decompose && query.is_none() {
            let head_retrieve = self
                .book
                .plan
                .active()
                .find(|s| s.status == StepStatus::Pending && s.action == PlanAction::Retrieve);
            if let Some(step) = head_retrieve {
                return (step.target.clone(), Some(step.id));
            }
        }
        let target = match action {
            Action::Counterexample => self.freshest_contradiction().map(|(p, _)| p.key().to_string()),
            Action::ResolveGap => top_gap(),
            Action::Retrieve => query.or_else(top_gap),
            Action::Decompose => query.or_else(top_gap),
            Action::Synthesize => query,
            Action::Continue => head_step(),
            Action::Clarify => query,
        };
        (target.unwrap_or_default(), None)
    }

    fn freshest_contradiction(&self) -> Option<(Fact, Fact)> {
        self.facts
            .iter_contradictions()
            .max_by_key(|(p, n)| p.timestamp().max(n.timestamp()))
            .cloned()
    }

    fn execute(&mut self, action: Action, target: &str, parsed: &ParsedInput, now: u64) -> String {
        match action {
            Action::Counterexample => self.counterexample(),
            Action::ResolveGap => self.resolve_gap(now),
            Action::Retrieve => self.retrieve(target, now),
            Action::Decompose => self.decompose(target),
            Action::Synthesize => self.synthesize(target),
            Action::Continue => self.continue_plan(now),
            Action::Clarify => self.clarify(parsed),
        }
    }

    fn counterexample(&mut self) -> String {
        let Some((pos, neg)) = self.freshest_contradiction() else {
            return "No contradiction to examine.".to_string();
        };
        let key = pos.key().clone();
        let description = format!("evidence for {key}");
        let ctx = BTreeMap::from([
            ("key".to_string(), key.to_string()),
            ("asserted_by".to_string(), pos.source().to_string()),
            ("denied_by".to_string(), neg.source().to_string()),
        ]);
        self.open_gap(GapType::MissingEvidence, &description, ctx);
        format!(
            "{key} is both asserted ({}) and denied ({}); {} contradiction(s) held. \
             Looking for a counterexample: opened gap '{description}'.",
            pos.source(),
            neg.source(),
            self.facts.contradiction_count()
        )
    }

    fn resolve_gap(&mut self, now: u64) -> String {
        let Some(gap) = self.gaps.by_priority().first().map(|g| (*g).clone()) else {
            return "No open gaps.".to_string();
        };
        let key = gap.key();
        let attempts = self.gaps.record_attempt(&key).unwrap_or(0);

        let covered = match gap.gap_type {
            GapType::CollaboratorFailure(Collaborator::Math) => {
                let op = gap.context.get("op").and_then(|o| MathOp::parse(o));
                let expression = gap.context.get("expression");
                match (op, expression) {
                    (Some(op), Some(expr)) => {
                        let variable = gap.context.get("variable").map(String::as_str);
                        self.compute(op, expr, variable, now).is_ok()
                    }
                    _ => false,
                }
            }
            GapType::CollaboratorFailure(Collaborator::Retrieval) => {
                let query = gap.context.get("query").unwrap_or(&gap.description);
                self.search(query, now).is_ok()
            }
            // cleared by the next successful append
            GapType::CollaboratorFailure(Collaborator::Sink) => false,
            GapType::UnresolvedReference => false,
            GapType::OpenQuestion | GapType::MissingEvidence => {
                if !self.gap_covered(&gap) {
                    let subject = gap_subject(&gap).into_iter().collect::<Vec<_>>().join(" ");
                    if !subject.is_empty() {
                        let _ = self.search(&subject, now);
                    }
                }
                self.gap_covered(&gap)
            }
        };

        if covered {
            if self.gaps.remove(&key).is_some() {
                self.book.kpis.gaps_resolved += 1;
            }
            format!(
                "Resolved gap '{}' after {attempts} attempt(s).",
                gap.description
            )
        } else if attempts >= self.config.max_gap_attempts {
            format!(
                "Gap '{}' is still open after {attempts} attempt(s). Can you provide more information?",
                gap.description
            )
        } else {
            format!(
                "Working on gap '{}' ({}), attempt {attempts} of {}.",
                gap.description, gap.gap_type, self.config.max_gap_attempts
            )
        }
    }

    fn gap_covered(&self, gap: &Gap) -> bool {
        let subject = gap_subject(gap);
        if subject.is_empty() {
            return false;
        }
        match gap.gap_type {
            GapType::OpenQuestion => subject.iter().all(|t| self.facts.knows_term(t)),
            GapType::MissingEvidence => subject.iter().all(|t| self.facts.is_evidence_term(t)),
            GapType::UnresolvedReference | GapType::CollaboratorFailure(_) => false,
        }
    }

    fn retrieve(&mut self, target: &str, now: u64) -> String {
        if target.is_empty() {
            return "Nothing to retrieve.".to_string();
        }
        match self.search(target, now) {
            Ok(hits) if hits.is_empty() => format!("No evidence found for '{target}'."),
            Ok(hits) => {
                let listed: Vec<String> = hits
                    .iter()
                    .map(|h| format!("{} ({:.2})", h.doc_id, h.score))
                    .collect();
                format!(
                    "Retrieved {} result(s) for '{target}': {}.",
                    hits.len(),
                    listed.join(", ")
                )
            }
            Err(err) => format!("Retrieval failed for '{target}': {err}. Recorded as a gap."),
        }
    }

    fn decompose(&self, target: &str) -> String {
        if self.book.scheduled.is_empty() {
            return "Nothing to decompose.".to_string();
        }
        let steps: Vec<String> = self
            .book
            .plan
            .active()
            .filter(|s| self.book.scheduled.contains(&s.id))
            .map(|s| match s.action {
                PlanAction::Compute(op) => format!("{op} {}", s.target),
                PlanAction::Retrieve => format!("retrieve '{}'", s.target),
                PlanAction::Answer => "answer".to_string(),
            })
            .collect();
        format!(
            "Split '{target}' into {} step(s): {}.",
            steps.len(),
            steps.join(", ")
        )
    }

    fn synthesize(&self, target: &str) -> String {
        let terms = content_terms(target);
        let mut supported = BTreeSet::new();
        let mut contested = BTreeSet::new();
        let relevant: Vec<&Fact> = if terms.is_empty() {
            self.facts.iter().collect()
        } else {
            self.facts.facts_mentioning(&terms).collect()
        };
        for fact in relevant {
            if self.facts.contradictions_for(fact.key()).is_empty() {
                supported.insert(fact.to_string());
            } else {
                contested.insert(fact.key().to_string());
            }
        }
        if supported.is_empty() && contested.is_empty() {
            return if target.is_empty() {
                "Nothing known yet.".to_string()
            } else {
                format!("Nothing known yet about '{target}'.")
            };
        }
        let mut parts = Vec::new();
        if !supported.is_empty() {
            parts.push(format!(
                "supported: {}",
                supported.into_iter().collect::<Vec<_>>().join(", ")
            ));
        }
        if !contested.is_empty() {
            parts.push(format!(
                "contested: {}",
                contested.into_iter().collect::<Vec<_>>().join(", ")
            ));
        }
        if target.is_empty() {
            format!("Summary: {}.", parts.join("; "))
        } else {
            format!("On '{target}': {}.", parts.join("; "))
        }
    }

    fn continue_plan(&mut self, now: u64) -> String {
        let Some(step) = self.book.plan.executing().cloned() else {
            return "No pending plan step.".to_string();
        };
        let outcome = match step.action {
            PlanAction::Compute(op) => {
                let variable = step.params.get("variable").map(String::as_str);
                self.compute(op, &step.target, variable, now)
                    .map(|value| format!("{op} {} = {value}", step.target))
                    .map_err(|e| e.to_string())
            }
            PlanAction::Retrieve => self
                .search(&step.target, now)
                .map(|hits| format!("retrieved {} result(s) for '{}'", hits.len(), step.target))
                .map_err(|e| e.to_string()),
            PlanAction::Answer => Ok(self.synthesize(&step.target)),
        };
        let text = match &outcome {
            Ok(result) => {
                self.book.kpis.steps_completed += 1;
                format!("Step {}: {result}", step.id)
            }
            Err(err) => {
                self.book.kpis.steps_failed += 1;
                format!("Step {} failed: {err}. Recorded as a gap.", step.id)
            }
        };
        self.book.plan.finish(step.id, outcome);
        text
    }

    fn clarify(&self, parsed: &ParsedInput) -> String {
        if parsed.is_empty() {
            return "I didn't catch that. Assert a fact like is(system, secure), give a command \
                    (solve, search, resolve), or ask a question."
                .to_string();
        }
        if let Some(query) = &parsed.query {
            let unknown = self.unknown_terms(&query.text);
            if query.is_question && !unknown.is_empty() {
                return format!(
                    "I don't know about {} yet. Can you tell me more?",
                    unknown.join(", ")
                );
            }
            return format!("Could you clarify what you want to know about '{}'?", query.text);
        }
        if let Some(stuck) = self
            .gaps
            .by_priority()
            .into_iter()
            .find(|g| g.attempts >= self.config.max_gap_attempts)
        {
            return format!("Can you help with '{}'?", stuck.description);
        }
        "Noted. What would you like to know?".to_string()
    }

    /// Forward to the math collaborator. Results become `result(op,
    /// expression, value)` facts; failures become gaps.
    fn compute(
        &mut self,
        op: MathOp,
        expression: &str,
        variable: Option<&str>,
        now: u64,
    ) -> Result<String, CollabError> {
        let description = format!("{op} {expression}");
        match self.collab.math.compute(op, expression, variable) {
            Ok(value) => {
                let fact = Fact::new(
                    FactKey::new("result", &[op.as_str(), expression, value.as_str()]),
                    Polarity::Positive,
                    SOURCE_MATH,
                    now,
                    1.0,
                );
                if self.facts.insert(fact) {
                    self.book.kpis.facts_added += 1;
                }
                let stale = GapKey::new(GapType::CollaboratorFailure(Collaborator::Math), description);
                if self.gaps.remove(&stale).is_some() {
                    self.book.kpis.gaps_resolved += 1;
                }
                Ok(value)
            }
            Err(err) => {
                let mut ctx = BTreeMap::from([
                    ("op".to_string(), op.as_str().to_string()),
                    ("expression".to_string(), expression.to_string()),
                    ("error".to_string(), err.to_string()),
                ]);
                if let Some(v) = variable {
                    ctx.insert("variable".to_string(), v.to_string());
                }
                self.collaborator_failed(Collaborator::Math, &description, ctx, &err);
                Err(err)
            }
        }
    }

    /// Forward to the retriever. Hits become `evidence(doc_id, snippet)`
    /// facts with the hit score as confidence; failures become gaps.
    fn search(&mut self, query: &str, now: u64) -> Result<Vec<SearchHit>, CollabError> {
        match self.collab.retriever.search(query, self.config.retrieval_top_k) {
            Ok(hits) => {
                for hit in &hits {
                    let fact = Fact::new(
                        FactKey::new("evidence", &[hit.doc_id.as_str(), hit.snippet.as_str()]),
                        Polarity::Positive,
                        SOURCE_RETRIEVAL,
                        now,
                        hit.score,
                    );
                    if self.facts.insert(fact) {
                        self.book.kpis.facts_added += 1;
                    }
                }
                let stale = GapKey::new(GapType::CollaboratorFailure(Collaborator::Retrieval), query);
                if self.gaps.remove(&stale).is_some() {
                    self.book.kpis.gaps_resolved += 1;
                }
                Ok(hits)
            }
            Err(err) => {
                let ctx = BTreeMap::from([
                    ("query".to_string(), query.to_string()),
                    ("error".to_string(), err.to_string()),
                ]);
                self.collaborator_failed(Collaborator::Retrieval, query, ctx, &err);
                Err(err)
            }
        }
    }

    fn collaborator_failed(
        &mut self,
        who: Collaborator,
        description: &str,
        ctx: BTreeMap<String, String>,
        err: &CollabError,
    ) {
        tracing::warn!(collaborator = who.as_str(), %err, description, "collaborator failed");
        self.book.kpis.collaborator_failures += 1;
        self.open_gap(GapType::CollaboratorFailure(who), description, ctx);
    }

    fn open_gap(&mut self, gap_type: GapType, description: &str, ctx: BTreeMap<String, String>) {
        let before = self.gaps.len();
        self.gaps.add(gap_type, description, ctx);
        if self.gaps.len() > before {
            self.book.kpis.gaps_opened += 1;
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn log_cycle(
        &mut self,
        timestamp: u64,
        cycle: u64,
        input: &str,
        action: Action,
        response: &str,
        signal_vector: SignalVector,
        diverged: bool,
    ) {
        let record = CycleRecord {
            timestamp,
            cycle,
            input: input.to_string(),
            action,
            response: response.to_string(),
            signal_vector,
            state_summary: StateSummary {
                diverged,
                ..self.summary()
            },
        };
        let sink_gap = GapKey::new(GapType::CollaboratorFailure(Collaborator::Sink), "cycle log");
        match self.collab.sink.append(&record) {
            Ok(()) => {
                if self.gaps.remove(&sink_gap).is_some() {
                    self.book.kpis.gaps_resolved += 1;
                }
            }
            Err(err) => {
                let ctx = BTreeMap::from([
                    ("cycle".to_string(), cycle.to_string()),
                    ("error".to_string(), err.to_string()),
                ]);
                self.collaborator_failed(Collaborator::Sink, "cycle log", ctx, &err);
            }
        }
    }
}

/// Terms a gap is about: the recorded unknown terms of a question, the
/// contested key of a missing-evidence gap, else the description.
fn gap_subject(gap: &Gap) -> BTreeSet<String> {
    if let Some(terms) = gap.context.get("terms") {
        return terms.split_whitespace().map(str::to_string).collect();
    }
    if let Some(key) = gap.context.get("key") {
        return content_terms(key);
    }
    content_terms(&gap.description)
}

fn format_signals(s: &SignalVector) -> String {
    format!(
        "contradiction={:.3} gap={:.3} novelty={:.3} torsion={:.3} coherence={:.3}",
        s.contradiction, s.gap, s.novelty, s.torsion, s.coherence
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{MathEngine, MemorySink, Retriever};
    use crate::time::ManualClock;

    struct EchoMath;

    impl MathEngine for EchoMath {
        fn compute(&mut self, op: MathOp, expr: &str, _: Option<&str>) -> Result<String, CollabError> {
            Ok(format!("{op}[{expr}]"))
        }
    }

    struct FixedRetriever(Vec<SearchHit>);

    impl Retriever for FixedRetriever {
        fn search(&mut self, _: &str, top_k: usize) -> Result<Vec<SearchHit>, CollabError> {
            Ok(self.0.iter().take(top_k).cloned().collect())
        }
    }

    fn agent() -> Agent {
        Agent::new(
            CoreConfig::default(),
            Collaborators::default(),
            ManualClock::starting_at(1_700_000_000),
        )
        .unwrap()
    }

    #[test]
    fn test_contradiction_scenario_fires_counterexample() {
        let mut agent = agent();
        let response = agent.process("is(system, secure); not is(system, secure)");
        assert_eq!(response.action, Action::Counterexample);
        assert!((response.signals.contradiction - 0.5).abs() < 1e-12);
        assert_eq!(agent.facts().contradiction_count(), 1);
        assert_eq!(agent.facts().len(), 2);
        assert!(
            agent
                .gaps()
                .get(&GapKey::new(GapType::MissingEvidence, "evidence for is(system, secure)"))
                .is_some()
        );
    }

    #[test]
    fn test_empty_input_clarifies() {
        let mut agent = agent();
        let response = agent.process("   ");
        assert_eq!(response.action, Action::Clarify);
        assert!(response.text.contains("didn't catch"));
        assert_eq!(agent.cycle(), 1);
        assert!(agent.policy().cooldowns().last_fired(crate::signal::TriggerClass::Contradiction).is_none());
    }

    #[test]
    fn test_plain_fact_is_noted() {
        let mut agent = agent();
        let response = agent.process("likes(ann, tea)");
        assert_eq!(response.action, Action::Clarify);
        assert!(response.text.starts_with("Recorded 1 fact(s)."));
    }

    #[test]
    fn test_math_step_without_engine_opens_gap() {
        let mut agent = agent();
        let response = agent.process("solve x^2 - 4 = 0 for x");
        assert_eq!(response.action, Action::Continue);
        assert!(response.text.contains("failed"));
        let key = GapKey::new(
            GapType::CollaboratorFailure(Collaborator::Math),
            "solve x^2 - 4 = 0",
        );
        let gap = agent.gaps().get(&key).unwrap();
        assert_eq!(gap.context["variable"], "x");
        assert_eq!(agent.kpis().collaborator_failures, 1);
        assert_eq!(agent.kpis().steps_failed, 1);
    }

    #[test]
    fn test_math_step_stores_result_fact() {
        let collab = Collaborators::default().with_math(EchoMath);
        let mut agent =
            Agent::new(CoreConfig::default(), collab, ManualClock::starting_at(0)).unwrap();
        let response = agent.process("differentiate x^3 wrt x");
        assert_eq!(response.action, Action::Continue);
        let results = agent.facts().facts(Some("result"), None);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source(), SOURCE_MATH);
        assert_eq!(results[0].args()[2], "differentiate[x^3]");
        assert!(!agent.plan().has_pending());
    }

    #[test]
    fn test_retrieved_hits_become_evidence() {
        let hits = vec![SearchHit {
            doc_id: "doc7".to_string(),
            score: 0.8,
            snippet: "zork was written at mit".to_string(),
        }];
        let collab = Collaborators::default().with_retriever(FixedRetriever(hits));
        let mut agent =
            Agent::new(CoreConfig::default(), collab, ManualClock::starting_at(0)).unwrap();
        agent.process("search zork history");
        let evidence = agent.facts().facts(Some("evidence"), None);
        assert_eq!(evidence.len(), 1);
        assert_eq!(evidence[0].source(), SOURCE_RETRIEVAL);
        assert!((evidence[0].confidence() - 0.8).abs() < 1e-12);
        assert!(agent.facts().is_evidence_term("mit"));
    }

    #[test]
    fn test_resolve_command_removes_gap() {
        let mut agent = agent();
        agent.process("who wrote zork?");
        assert!(agent.gaps().find_by_description("who wrote zork?").is_some());
        let response = agent.process("resolve who wrote zork?");
        assert!(response.text.contains("Resolved gap"));
        assert!(agent.gaps().find_by_description("who wrote zork?").is_none());
        let again = agent.process("resolve who wrote zork?");
        assert!(again.text.contains("No open gap matches"));
    }

    #[test]
    fn test_sink_records_every_cycle() {
        let sink = MemorySink::new();
        let collab = Collaborators::default().with_sink(sink.clone());
        let mut agent =
            Agent::new(CoreConfig::default(), collab, ManualClock::starting_at(100)).unwrap();
        agent.process("is(a, b)");
        agent.process("");
        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].cycle, 0);
        assert_eq!(records[0].timestamp, 100);
        assert_eq!(records[1].action, Action::Clarify);
        assert_eq!(records[0].state_summary.facts, 1);
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let mut agent = agent();
        agent.process("is(system, secure); not is(system, secure)");
        agent.process("search firewall");
        let snap = agent.snapshot();

        let restored = Agent::restore(
            CoreConfig::default(),
            Collaborators::default(),
            ManualClock::starting_at(0),
            snap.clone(),
        )
        .unwrap();
        assert_eq!(restored.cycle(), 2);
        assert_eq!(restored.facts().len(), agent.facts().len());
        assert_eq!(restored.facts().contradiction_count(), 1);
        assert_eq!(restored.gaps().len(), agent.gaps().len());
        assert_eq!(restored.field().s(), agent.field().s());
        assert_eq!(
            restored.policy().cooldowns(),
            agent.policy().cooldowns()
        );
    }

    #[test]
    fn test_overflowing_evolve_still_restores() {
        let config = CoreConfig {
            field_seed: Some(7),
            ..CoreConfig::default()
        };
        let mut agent = Agent::new(config.clone(), Collaborators::default(), ManualClock::starting_at(0))
            .unwrap();
        let cancel = AtomicBool::new(false);
        let report = agent.evolve(50, 10.0, &cancel, DivergencePolicy::Continue);
        assert!(report.halted);
        assert_eq!(agent.kpis().divergences, 1);

        let (s, l) = agent.summary().field_norms;
        assert!(s.is_finite() && l.is_finite());
        let restored = Agent::restore(
            config,
            Collaborators::default(),
            ManualClock::starting_at(0),
            agent.snapshot(),
        );
        assert!(restored.is_ok());
    }

    #[test]
    fn test_chain_is_recorded_per_cycle() {
        let mut agent = agent();
        agent.process("is(a, b)");
        let chain = agent.chains().archive().last().unwrap();
        let phases: Vec<StepPhase> = chain.steps.iter().map(|s| s.phase).collect();
        assert_eq!(
            phases,
            vec![StepPhase::Parse, StepPhase::Signal, StepPhase::Decide, StepPhase::Execute]
        );
        assert_eq!(chain.success, Some(true));
        assert_eq!(agent.chains().depth(), 0);
    }

    #[test]
    fn test_agent_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<Agent>();
    }
}
