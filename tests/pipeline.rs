// End-to-end pipeline tests over the mock provider. Each test seeds the
// same scenario fixture, queues canned stage outputs, and asserts on the
// committed event records and projections.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{Value, json};

use fateloom::config::EngineSettings;
use fateloom::context::ContextPacket;
use fateloom::gateway::{Gateway, MockProvider};
use fateloom::ids::Id;
use fateloom::lore::index::LoreIndex;
use fateloom::orchestrator::{Orchestrator, TurnOutcome};
use fateloom::prompts::PromptRegistry;
use fateloom::scenario::{Scenario, seed_campaign};
use fateloom::state::model::{EngineEvent, Visibility};
use fateloom::state::Store;

const CAMPAIGN: &str = "campaign:main";

// Dice-pool difficulty 11 on a d10: every roll misses, so failure paths are
// deterministic; safe actions skip the dice entirely, so success paths are
// deterministic too.
const SCENARIO_YAML: &str = r#"
id: rain_debt
name: Rain Debt
system:
  clock_rules:
    - name: heat
      segments: 8
      tags: [pressure]
      triggers: { 8: "crackdown" }
    - name: time
      segments: 12
      start: 11
      triggers: { 12: "deadline_passed" }
    - name: harm
      segments: 4
      tags: [harm]
      triggers: { 4: "down_and_out" }
  resolution_rules:
    resolution:
      method: dice_pool
      die: 10
      difficulty: 11
      ones_cancel_successes: false
    action_stat_map:
      _default: { attribute: cool, ability: streetwise }
    action_costs:
      wait: { time: 1 }
      move: {}
    danger:
      _default: safe
    consequences: [exposed, detected, cornered]
    failure_streak_threshold: 2
calibration:
  tone: noir
  themes: [debt, rain]
  risk: high
entities:
  - id: pc
    type: pc
    name: Riley
    attributes:
      stats: { cool: 2 }
      abilities: { streetwise: 1 }
  - id: alley
    type: location
    name: Service Alley
  - id: hatch
    type: location
    name: Maintenance Hatch
  - id: agent_chen
    type: npc
    name: Agent Chen
    attributes:
      threat_level: high
      capabilities: [pursuit, combat, surveillance]
      limitations: [no_netrunning]
  - id: dead_courier
    type: npc
    name: Dead Courier
    attributes:
      discoverable:
        - trigger: search
          content: "A data chip tucked in the jacket lining."
          item_id: "campaign:data_chip"
  - id: data_chip
    type: item
    name: Data Chip
  - id: sniper_01
    type: npc
    name: Rooftop Sniper
facts:
  - subject: agent_chen
    predicate: pursuing
    object: "campaign:pc"
    visibility: known
    tags: [threat]
  - subject: sniper_01
    predicate: overwatch_position
    visibility: world
  - subject: dead_courier
    predicate: lying_in_alley
    visibility: witnessed
threads:
  - id: who_killed_the_courier
    title: "Who killed the courier?"
    related: [dead_courier, alley]
scene:
  location: alley
  present: [pc, agent_chen, dead_courier]
  constraints:
    adjacent: ["campaign:hatch"]
  noise: quiet
"#;

struct Harness {
    _dir: tempfile::TempDir,
    db: PathBuf,
    mock: Arc<MockProvider>,
    orch: Orchestrator,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("campaign.db");
    let scenario: Scenario = serde_yaml::from_str(SCENARIO_YAML).unwrap();
    {
        let mut store = Store::open(&db, CAMPAIGN).unwrap();
        let mut index = LoreIndex::open(&db).unwrap();
        seed_campaign(&mut store, &mut index, &scenario, None).unwrap();
    }
    let mock = Arc::new(MockProvider::new());
    let gateway = Gateway::new(Box::new(mock.clone()), EngineSettings::default());
    let orch = Orchestrator::new(
        db.clone(),
        CAMPAIGN,
        gateway,
        PromptRegistry::builtin(),
        EngineSettings::default(),
        None,
    )
    .await
    .unwrap();
    Harness {
        _dir: dir,
        db,
        mock,
        orch,
    }
}

fn interp(actions: Value, risk: &[&str], perception: &[&str]) -> Value {
    json!({
        "intent": "test intent",
        "referenced_entities": [],
        "proposed_actions": actions,
        "assumptions": [],
        "risk_flags": risk,
        "perception_flags": perception,
    })
}

fn action(verb: &str, target: Option<&str>) -> Value {
    match target {
        Some(target) => json!({
            "verb": verb, "target": target, "details": "", "estimated_minutes": 1
        }),
        None => json!({ "verb": verb, "details": "", "estimated_minutes": 1 }),
    }
}

fn planner(beats: &[&str]) -> Value {
    json!({
        "beats": beats,
        "tension_move": "the net tightens",
        "tension_move_type": "show_approaching_threat",
        "next_suggestions": ["lay low", "keep moving"],
    })
}

fn narrator(text: &str) -> Value {
    json!({
        "final_text": text,
        "next_prompt": "What do you do?",
        "suggested_actions": [],
        "established_facts": [],
        "introduced_items": [],
        "introduced_npcs": [],
        "thread_updates": [],
    })
}

fn push_turn(mock: &MockProvider, interp_out: Value, planner_out: Value, narrator_out: Value) {
    mock.push("interpreter", interp_out);
    mock.push("planner", planner_out);
    mock.push("narrator", narrator_out);
}

fn packet_of(record: &fateloom::state::model::EventRecord) -> ContextPacket {
    serde_json::from_value(record.context_packet.clone()).unwrap()
}

// Scenario 1: a plain move while pursued still rolls, and failure writes
// the configured situation fact and ticks the pressure clock.
#[tokio::test]
async fn pursuit_override_forces_roll_and_consequence() {
    let mut h = harness().await;
    push_turn(
        &h.mock,
        interp(
            json!([action("move", Some("campaign:hatch"))]),
            &["pursuit"],
            &[],
        ),
        planner(&["Agent Chen closes the distance"]),
        narrator("Boots splash behind you — you are seen."),
    );

    let outcome = h.orch.run_turn("I walk down the alley toward the hatch.").await;
    assert!(matches!(outcome, TurnOutcome::Committed { .. }));

    let record = h.orch.store().event(1).unwrap().unwrap();
    let resolver: fateloom::resolver::ResolverOutput =
        serde_json::from_value(record.resolver.clone()).unwrap();
    // The safe-by-default move was rolled anyway (pursuit override), and
    // with difficulty 11 it cannot have landed.
    assert_eq!(resolver.rolls.len(), 1);
    assert!(record.engine_events.iter().any(|e| matches!(
        e,
        EngineEvent::ActionFailed { .. } | EngineEvent::ActionBotched { .. }
    )));
    assert!(record.engine_events.iter().any(|e| matches!(
        e,
        EngineEvent::SituationFactWritten { predicate, .. } if predicate == "exposed"
    )));

    let facts = h.orch.store().facts().unwrap();
    assert!(facts
        .iter()
        .any(|f| f.predicate == "exposed" && f.subject == Id::from("campaign:pc")));
    assert_eq!(
        h.orch.store().clock_by_name("heat").unwrap().unwrap().value,
        1
    );
}

// Scenario 2: perception block and the one permitted question.
#[tokio::test]
async fn perception_block_short_circuits_with_one_question() {
    let mut h = harness().await;
    // Only the interpreter output is queued: a clarification turn must
    // never reach the planner or narrator.
    h.mock.push(
        "interpreter",
        interp(
            json!([action("duck", Some("campaign:sniper_01"))]),
            &[],
            &["campaign:sniper_01"],
        ),
    );

    let outcome = h.orch.run_turn("I duck to avoid the sniper.").await;
    match outcome {
        TurnOutcome::Clarification { question, .. } => {
            assert_eq!(question, "What makes you think you need to duck?");
        }
        other => panic!("expected clarification, got {other:?}"),
    }

    let record = h.orch.store().event(1).unwrap().unwrap();
    assert!(record.diff.is_empty());
    assert_eq!(record.final_text, "What makes you think you need to duck?");
    // P7: exactly one question reached the output.
    assert_eq!(record.final_text.matches('?').count(), 1);
}

// Scenario 3: search finds and implicitly pockets the chip; re-search is
// idempotent.
#[tokio::test]
async fn search_then_research_is_idempotent() {
    let mut h = harness().await;
    push_turn(
        &h.mock,
        interp(json!([action("search", Some("campaign:dead_courier"))]), &[], &[]),
        planner(&[]),
        narrator("You find a data chip in the lining."),
    );
    h.orch.run_turn("Search the body.").await;

    let record = h.orch.store().event(1).unwrap().unwrap();
    assert!(record.engine_events.iter().any(|e| matches!(
        e,
        EngineEvent::ItemDiscovered { item, picked_up: true, .. }
            if item == &Id::from("campaign:data_chip")
    )));
    let inventory = h
        .orch
        .store()
        .inventory_for(&Id::from("campaign:pc"))
        .unwrap();
    assert_eq!(inventory.len(), 1);
    assert_eq!(inventory[0].quantity, 1);

    push_turn(
        &h.mock,
        interp(json!([action("examine", Some("campaign:dead_courier"))]), &[], &[]),
        planner(&[]),
        narrator("Nothing you haven't already seen."),
    );
    h.orch.run_turn("Check the body again.").await;

    let record = h.orch.store().event(2).unwrap().unwrap();
    assert!(record.engine_events.iter().any(|e| matches!(
        e,
        EngineEvent::ActionSucceeded { outcome, .. } if outcome == "nothing_new"
    )));
    // P8: no second copy of the chip.
    let inventory = h
        .orch
        .store()
        .inventory_for(&Id::from("campaign:pc"))
        .unwrap();
    assert_eq!(inventory[0].quantity, 1);
}

// Scenario 4: a cost crossing a terminal threshold emits the trigger and
// the next turn's packet shows it active.
#[tokio::test]
async fn clock_threshold_is_forcing_and_visible_next_turn() {
    let mut h = harness().await;
    push_turn(
        &h.mock,
        interp(json!([action("wait", None)]), &[], &[]),
        planner(&[]),
        narrator("The deadline passes while you hold still."),
    );
    h.orch.run_turn("I wait for the patrol to pass.").await;

    let record = h.orch.store().event(1).unwrap().unwrap();
    assert!(record.engine_events.iter().any(|e| matches!(
        e,
        EngineEvent::ClockTriggered { clock, trigger, terminal: true, .. }
            if clock == "time" && trigger == "deadline_passed"
    )));
    assert_eq!(
        h.orch.store().clock_by_name("time").unwrap().unwrap().value,
        12
    );

    push_turn(
        &h.mock,
        interp(json!([]), &[], &[]),
        planner(&[]),
        narrator("Too late now."),
    );
    h.orch.run_turn("What now?").await;
    let packet = packet_of(&h.orch.store().event(2).unwrap().unwrap());
    let time = packet.clocks.iter().find(|c| c.name == "time").unwrap();
    assert!(time.triggered);
    assert!(time.active_triggers.contains(&"deadline_passed".to_string()));

    // P5: a further time cost cannot push past max.
    push_turn(
        &h.mock,
        interp(json!([action("wait", None)]), &[], &[]),
        planner(&[]),
        narrator("Time has already run out."),
    );
    h.orch.run_turn("I keep waiting.").await;
    assert_eq!(
        h.orch.store().clock_by_name("time").unwrap().unwrap().value,
        12
    );
}

// Scenario 5: the resolver refuses NPC actions outside capabilities; the
// narrator only sees authorized responses.
#[tokio::test]
async fn npc_capability_enforcement_drops_forbidden_beats() {
    let mut h = harness().await;
    push_turn(
        &h.mock,
        interp(json!([action("move", Some("campaign:hatch"))]), &[], &[]),
        planner(&[
            "Agent Chen remotely disables the implant with a hack",
            "Agent Chen closes the distance on foot",
        ]),
        narrator("Chen is closing, fast."),
    );
    h.orch.run_turn("I make for the hatch.").await;

    let record = h.orch.store().event(1).unwrap().unwrap();
    let npc_actions: Vec<&EngineEvent> = record
        .engine_events
        .iter()
        .filter(|e| matches!(e, EngineEvent::NpcAction { .. }))
        .collect();
    assert_eq!(npc_actions.len(), 1);
    match npc_actions[0] {
        EngineEvent::NpcAction { description, .. } => {
            assert!(description.contains("on foot"));
            assert!(!description.contains("hack"));
        }
        _ => unreachable!(),
    }
}

// Scenario 6 + P2: replay into a sandbox with an overridden narrator
// version; the live campaign is untouched and the projections match.
#[tokio::test]
async fn replay_writes_sandbox_and_leaves_live_campaign_alone() {
    let mut h = harness().await;
    for (input, text) in [("I wait.", "First turn text."), ("I wait more.", "Second turn text.")] {
        push_turn(
            &h.mock,
            interp(json!([action("wait", None)]), &[], &[]),
            planner(&[]),
            narrator(text),
        );
        let outcome = h.orch.run_turn(input).await;
        assert!(matches!(outcome, TurnOutcome::Committed { .. }));
    }
    let live_events = h.orch.store().event_count().unwrap();

    // Replay re-runs the pipeline; sticky defaults stand in for the
    // recorded model outputs.
    h.mock
        .set_default("interpreter", interp(json!([action("wait", None)]), &[], &[]));
    h.mock.set_default("planner", planner(&[]));
    h.mock.set_default("narrator", narrator("Replayed narration."));

    let overrides = BTreeMap::from([("narrator".to_string(), "v2".to_string())]);
    let report = h.orch.replay(1, 2, Some(&overrides)).await.unwrap();
    assert_eq!(report.turns.len(), 2);
    assert_eq!(report.turns[0].original_final_text, "First turn text.");
    assert_eq!(report.turns[0].replayed_final_text, "Replayed narration.");

    // Live campaign untouched.
    assert_eq!(h.orch.store().event_count().unwrap(), live_events);

    let sandbox = Store::open(&h.db, &report.sandbox_campaign).unwrap();
    assert_eq!(sandbox.event_count().unwrap(), live_events);
    let replayed = sandbox.event(1).unwrap().unwrap();
    assert_eq!(replayed.prompt_versions.get("narrator").unwrap(), "v2");
    // P2: the deterministic stages replayed identically, so projections
    // agree with the live campaign.
    assert_eq!(
        sandbox.clock_by_name("time").unwrap().unwrap().value,
        h.orch.store().clock_by_name("time").unwrap().unwrap().value
    );
}

// P1: a failed stage aborts the turn with no event appended.
#[tokio::test]
async fn aborted_turn_appends_nothing() {
    let mut h = harness().await;
    let before = h.orch.store().event_count().unwrap();
    // Three malformed interpreter replies exhaust the gateway's retries.
    for _ in 0..3 {
        h.mock.push("interpreter", json!("not an object"));
    }
    let outcome = h.orch.run_turn("Do something.").await;
    assert!(matches!(outcome, TurnOutcome::Aborted { .. }));
    assert_eq!(h.orch.store().event_count().unwrap(), before);
    assert_eq!(h.orch.store().last_turn().unwrap(), 0);
}

// P3 + P9: the packet never carries world-visibility facts and respects
// the token budget.
#[tokio::test]
async fn context_packet_honors_perception_and_budget() {
    let mut h = harness().await;
    push_turn(
        &h.mock,
        interp(json!([]), &[], &[]),
        planner(&[]),
        narrator("Rain on corrugated steel."),
    );
    h.orch.run_turn("I take in the scene.").await;

    let record = h.orch.store().event(1).unwrap().unwrap();
    let packet = packet_of(&record);
    assert!(packet
        .known_facts
        .iter()
        .all(|f| f.visibility != Visibility::World));
    assert!(packet
        .active_situations
        .iter()
        .all(|f| f.visibility != Visibility::World));
    // The world-only sniper fact never leaks into the serialized packet.
    assert!(!record.context_packet.to_string().contains("overwatch_position"));
    assert!(packet.token_estimate() <= EngineSettings::default().context_token_budget);
}

// P10: at the streak threshold with an active threat, the next failure
// forces threat resolution instead of another near-miss.
#[tokio::test]
async fn failure_streak_forces_threat_resolution() {
    let mut h = harness().await;
    for turn in 1..=3u64 {
        push_turn(
            &h.mock,
            interp(
                json!([action("move", Some("campaign:hatch"))]),
                &["pursuit"],
                &[],
            ),
            planner(&["Agent Chen keeps pace"]),
            narrator("Still running."),
        );
        let outcome = h.orch.run_turn("I keep running.").await;
        assert!(matches!(outcome, TurnOutcome::Committed { .. }), "turn {turn}");
    }

    // Turns 1 and 2 fail (difficulty 11) and build the streak; turn 3 hits
    // the threshold of 2 with a threat situation active.
    let record = h.orch.store().event(3).unwrap().unwrap();
    assert!(record.engine_events.iter().any(|e| matches!(
        e,
        EngineEvent::ThreatResolved { .. }
    )));
    // The binding resolution clears the situation facts and the streak.
    let facts = h.orch.store().facts().unwrap();
    assert!(!facts.iter().any(|f| f.tags.iter().any(|t| t == "situation")));
    assert!(h.orch.store().failure_streaks().unwrap().is_empty());
}

// Narrator contributions are re-validated at commit: contradictions are
// dropped, novelties are namespaced and persisted.
#[tokio::test]
async fn narrator_merge_drops_contradictions_and_namespaces_ids() {
    let mut h = harness().await;
    let mut narrator_out = narrator("A fixer named Whisper steps out of the rain.");
    narrator_out["established_facts"] = json!([
        { "subject": "agent_chen", "predicate": "carries", "detail": "mono-knife" },
        // Contradicts the seeded `pursuing: campaign:pc` known fact.
        { "subject": "agent_chen", "predicate": "pursuing", "detail": "someone else" }
    ]);
    narrator_out["introduced_npcs"] =
        json!([{ "local_id": "whisper", "name": "Whisper", "description": "a fixer" }]);
    push_turn(
        &h.mock,
        interp(json!([]), &[], &[]),
        planner(&["introduce a new face"]),
        narrator_out,
    );
    h.orch.run_turn("I look around for help.").await;

    let facts = h.orch.store().facts().unwrap();
    assert!(facts.iter().any(|f| f.predicate == "carries"));
    let pursuing: Vec<_> = facts.iter().filter(|f| f.predicate == "pursuing").collect();
    assert_eq!(pursuing.len(), 1);
    assert_eq!(pursuing[0].object, json!("campaign:pc"));

    let whisper = h
        .orch
        .store()
        .entity(&Id::from("campaign:whisper"))
        .unwrap();
    assert!(whisper.is_some());
}

// P4: every fact in the projections traces back to exactly one event diff
// (the genesis record counts as turn zero).
#[tokio::test]
async fn no_free_facts() {
    let mut h = harness().await;
    push_turn(
        &h.mock,
        interp(
            json!([action("move", Some("campaign:hatch"))]),
            &["pursuit"],
            &[],
        ),
        planner(&[]),
        narrator("Spotted."),
    );
    h.orch.run_turn("I move.").await;

    let last = h.orch.store().last_turn().unwrap();
    let mut from_diffs: Vec<String> = Vec::new();
    for record in h.orch.store().events_in_range(0, last).unwrap() {
        from_diffs.extend(
            record
                .diff
                .facts_to_add
                .iter()
                .map(|f| f.id.as_str().to_string()),
        );
        for update in &record.diff.fact_updates {
            if update.retract {
                from_diffs.retain(|id| id != update.id.as_str());
            }
        }
    }
    let mut live: Vec<String> = h
        .orch
        .store()
        .facts()
        .unwrap()
        .iter()
        .map(|f| f.id.as_str().to_string())
        .collect();
    live.sort();
    from_diffs.sort();
    assert_eq!(live, from_diffs);
}
