//! Integration tests exercising the full control cycle:
//! parse → store → field → signals → policy → bus → execute → log.

use std::collections::BTreeMap;

use pc_core::{
    Action, Agent, Collaborator, Collaborators, CoreConfig, Fact, FactStore, FieldTriggers,
    GapKey, GapSet, GapType, ManualClock, MemorySink, PlanAction, PolicyEngine, Priorities,
    StepStatus, Thresholds, aggregate,
};

fn clock() -> ManualClock {
    ManualClock::starting_at(1_700_000_000)
}

fn agent_with(config: CoreConfig) -> Agent {
    Agent::new(config, Collaborators::default(), clock()).unwrap()
}

/// Test 1: P / ¬P gives one pair, ratio 1/2, and the counterexample action.
#[test]
fn contradiction_scenario_components() {
    let mut facts = FactStore::new();
    facts.insert(Fact::positive("is", &["system", "secure"], "input", 1));
    facts.insert(Fact::negative("is", &["system", "secure"], "input", 2));
    assert_eq!(facts.contradictions().len(), 1);

    let (signals, breakdown) = aggregate(&facts, &GapSet::new(), None, &FieldTriggers::default());
    assert!((breakdown.contradiction_ratio - 0.5).abs() < 1e-12);

    let mut policy = PolicyEngine::new(Thresholds::default(), Priorities::default(), 3);
    assert_eq!(policy.decide(0, &signals, false).action, Action::Counterexample);
}

/// Test 2: the same scenario through `process`.
#[test]
fn contradiction_scenario_end_to_end() {
    let mut agent = agent_with(CoreConfig::default());
    let response = agent.process("is(\"system\", \"secure\"); not is(\"system\", \"secure\")");
    assert_eq!(response.action, Action::Counterexample);
    assert_eq!(response.decision.fired.map(|c| c.as_str()), Some("contradiction"));
    assert!(response.text.contains("is(system, secure)"));
    assert_eq!(agent.facts().len(), 2);
}

/// Test 3: a class that keeps its signal above threshold fires at most once
/// per cooldown window.
#[test]
fn cooldown_enforced_across_cycles() {
    let mut agent = agent_with(CoreConfig::default());
    let input = "is(system, secure); not is(system, secure)";
    let fired: Vec<u64> = (0..9)
        .map(|_| agent.process(input))
        .filter(|r| r.action == Action::Counterexample)
        .map(|r| r.cycle)
        .collect();
    assert_eq!(fired, vec![0, 3, 6]);
    for pair in fired.windows(2) {
        assert!(pair[1] - pair[0] >= agent.config().cooldown_window);
    }
}

/// Test 4: many simultaneous crossings still produce exactly one event.
#[test]
fn event_cap_one_per_cycle() {
    let config = CoreConfig {
        thresholds: Thresholds {
            contradiction: 0.0,
            gap: 0.0,
            novelty: 0.0,
            torsion: 0.0,
            coherence: 0.0,
        },
        ..CoreConfig::default()
    };
    let mut agent = agent_with(config);
    let first = agent.process("is(a, b); not is(a, b); what about zebras?");
    assert!(first.decision.candidates.len() > 1);
    for i in 1..6 {
        agent.process(&format!("what about topic {i}?"));
    }
    assert_eq!(agent.bus().history().count(), 6);
    let cycles: Vec<u64> = agent.bus().history().map(|e| e.cycle).collect();
    assert_eq!(cycles, vec![0, 1, 2, 3, 4, 5]);
}

/// Test 5: event caps other than one are refused at construction.
#[test]
fn event_cap_other_than_one_rejected() {
    let config = CoreConfig {
        event_cap: 3,
        ..CoreConfig::default()
    };
    assert!(Agent::new(config, Collaborators::default(), clock()).is_err());
}

/// Test 6: unstable field parameters fail loudly at construction.
#[test]
fn unstable_field_rejected_by_agent() {
    for (gamma, m_s, m_l) in [(1.0, 1.0, 1.0), (0.2, -1.0, 1.0), (0.2, 1.0, 0.0)] {
        let mut config = CoreConfig::default();
        config.field.gamma = gamma;
        config.field.mass_s_sq = m_s;
        config.field.mass_l_sq = m_l;
        assert!(
            Agent::new(config, Collaborators::default(), clock()).is_err(),
            "accepted gamma={gamma} m_s={m_s} m_l={m_l}"
        );
    }
}

/// Test 7: 1000 gaps minus 100 leaves 900 and does not touch the fact store.
#[test]
fn thousand_gaps_with_fact_store() {
    let mut facts = FactStore::new();
    facts.insert(Fact::positive("p", &["x"], "input", 1));
    facts.insert(Fact::negative("p", &["x"], "input", 2));
    let mut gaps = GapSet::new();
    for i in 0..1000 {
        gaps.add(GapType::OpenQuestion, &format!("question {i}"), BTreeMap::new());
    }
    for i in 0..100 {
        assert!(gaps.remove(&GapKey::new(GapType::OpenQuestion, format!("question {}", i * 7))).is_some());
    }
    assert_eq!(gaps.len(), 900);
    assert_eq!(facts.len(), 2);
    assert_eq!(facts.contradictions().len(), 1);
}

/// Test 8: collaborator failures become gaps and the cycle still answers.
#[test]
fn collaborator_failure_becomes_gap() {
    let mut agent = agent_with(CoreConfig::default());
    let response = agent.process("search quantum tunnelling");
    assert_eq!(response.action, Action::Continue);
    assert!(!response.text.is_empty());
    let key = GapKey::new(
        GapType::CollaboratorFailure(Collaborator::Retrieval),
        "quantum tunnelling",
    );
    assert!(agent.gaps().get(&key).is_some());
    assert_eq!(agent.kpis().collaborator_failures, 1);
}

/// Test 9: a panicking subscriber is recorded and the cycle completes.
#[test]
fn handler_panic_is_contained() {
    let mut agent = agent_with(CoreConfig::default());
    agent.bus_mut().subscribe_all(|_, _| panic!("subscriber bug"));
    let response = agent.process("likes(ann, tea)");
    assert_eq!(response.handler_failures, 1);
    assert_eq!(agent.kpis().handler_failures, 1);
    assert_eq!(agent.kpis().action_count(response.action), 1);
    let failure = agent.bus().failures().next().unwrap();
    assert!(failure.panicked);
    assert_eq!(failure.message, "subscriber bug");
}

/// Test 10: field torsion decomposes the head plan step into subtasks.
#[test]
fn torsion_decomposes_plan_step() {
    let mut config = CoreConfig {
        thresholds: Thresholds {
            contradiction: 10.0,
            gap: 10.0,
            novelty: 10.0,
            torsion: 0.7,
            coherence: 10.0,
        },
        ..CoreConfig::default()
    };
    config.triggers.gradient_threshold = 0.0;
    let mut agent = agent_with(config);
    let response = agent.process("search cats and dogs");
    assert_eq!(response.action, Action::Decompose);
    assert!(response.text.contains("Split 'cats and dogs' into 3 step(s)"));

    // the undivided retrieve step is replaced, not kept next to its parts
    assert_eq!(agent.plan().pending_count(), 3);
    assert!(
        !agent
            .plan()
            .active()
            .any(|s| s.action == PlanAction::Retrieve && s.target == "cats and dogs")
    );
    let retired: Vec<_> = agent.plan().finished().collect();
    assert_eq!(retired.len(), 1);
    assert_eq!(retired[0].target, "cats and dogs");
    assert_eq!(retired[0].status, StepStatus::Completed);
    assert_eq!(retired[0].outcome.as_deref(), Some("decomposed"));
}

/// Test 11: every cycle is appended to the log sink, including empty input.
#[test]
fn every_cycle_is_logged() {
    let sink = MemorySink::new();
    let collab = Collaborators::default().with_sink(sink.clone());
    let mut agent = Agent::new(CoreConfig::default(), collab, clock()).unwrap();
    for input in ["is(a, b)", "", "who is zaphod?", "resolve who is zaphod?"] {
        agent.process(input);
    }
    let records = sink.records();
    assert_eq!(records.len(), 4);
    assert_eq!(records[1].action, Action::Clarify);
    assert_eq!(records[3].state_summary.gaps, agent.gaps().len());
    let json = serde_json::to_string(&records[2]).unwrap();
    assert!(json.contains("\"signal_vector\""));
}

/// Test 12: a question about unknown terms opens a gap that the retriever
/// can later close.
#[test]
fn open_question_resolved_by_evidence() {
    use pc_core::{CollabError, Retriever, SearchHit};

    struct Library;

    impl Retriever for Library {
        fn search(&mut self, _: &str, _: usize) -> Result<Vec<SearchHit>, CollabError> {
            Ok(vec![SearchHit {
                doc_id: "hhgttg".to_string(),
                score: 0.9,
                snippet: "zaphod beeblebrox was president".to_string(),
            }])
        }
    }

    let collab = Collaborators::default().with_retriever(Library);
    let mut agent = Agent::new(CoreConfig::default(), collab, clock()).unwrap();
    let response = agent.process("who is zaphod?");
    assert_eq!(response.action, Action::ResolveGap);
    assert!(response.text.contains("Resolved gap 'who is zaphod?'"));
    assert!(agent.gaps().is_empty());
    assert_eq!(agent.kpis().gaps_opened, 1);
    assert_eq!(agent.kpis().gaps_resolved, 1);
}
