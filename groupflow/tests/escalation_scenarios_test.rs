//! Escalation, investigation and merge-retry scenarios driven through the
//! orchestrator with scripted worker replies.

mod common;

use std::sync::Arc;

use common::{group, ScriptedInvoker};
use groupflow::escalation::Tier;
use groupflow::invoker::{DispatchIntent, Role, StatusReport};
use groupflow::orchestrator::ApplyOutcome;
use groupflow::state::{
    GroupStatus, InMemoryStore, InvestigationOutcome, MergeOutcome, PlanningTrigger,
    SessionStatus, StateStore, TaskGroup,
};
use groupflow::{Orchestrator, OrchestratorConfig};

fn open(
    store: &Arc<InMemoryStore>,
    invoker: &Arc<ScriptedInvoker>,
    groups: Vec<TaskGroup>,
) -> Orchestrator {
    Orchestrator::open_session(
        store.clone(),
        invoker.clone(),
        OrchestratorConfig::default(),
        groups,
    )
    .unwrap()
}

fn trail(invoker: &ScriptedInvoker, group_id: &str) -> Vec<(Role, Tier, DispatchIntent)> {
    invoker
        .orders_for(group_id)
        .into_iter()
        .map(|o| (o.role, o.tier, o.intent))
        .collect()
}

#[tokio::test]
async fn test_g1_review_failures_then_merge_conflict() {
    let store = InMemoryStore::new().shared();
    let invoker = ScriptedInvoker::new();
    invoker.script("g1", Role::Verifier, &["FAIL", "FAIL"]);
    invoker.script("g1", Role::Merger, &["MERGE_CONFLICT"]);
    let mut orch = open(&store, &invoker, vec![TaskGroup::new("g1", "G1")]);

    let mut saw_merge_recovery = false;
    loop {
        let report = orch.tick().await.unwrap();
        let g = group(store.as_ref(), orch.session_id(), "g1");
        if g.outstanding.as_ref().map(|d| d.intent) == Some(DispatchIntent::MergeRecovery) {
            assert_eq!(g.status, GroupStatus::AwaitingVerification);
            assert_eq!(g.tier, Tier::Senior);
            assert_eq!(g.revisions, 2);
            saw_merge_recovery = true;
        }
        if report.session_status != SessionStatus::Running {
            break;
        }
    }
    assert!(saw_merge_recovery);

    use DispatchIntent::*;
    use Role::*;
    assert_eq!(
        trail(&invoker, "g1"),
        vec![
            (Implementer, Tier::Base, Implement),
            (Verifier, Tier::Base, Verify),
            // revisions 0 at failure: same tier
            (Implementer, Tier::Base, Revise),
            (Verifier, Tier::Base, Verify),
            // revisions 1 at failure: senior
            (Implementer, Tier::Senior, Revise),
            (Verifier, Tier::Senior, Verify),
            (Reviewer, Tier::Senior, Review),
            (Merger, Tier::Senior, Merge),
            // first merge failure: same tier, full re-verification
            (Implementer, Tier::Senior, MergeRecovery),
            (Verifier, Tier::Senior, Verify),
            (Reviewer, Tier::Senior, Review),
            (Merger, Tier::Senior, Merge),
        ]
    );

    let g1 = group(store.as_ref(), orch.session_id(), "g1");
    assert_eq!(g1.status, GroupStatus::Merged);
    assert_eq!(g1.revisions, 2);
    assert!(g1
        .history
        .iter()
        .any(|t| t.from == GroupStatus::MergePending && t.to == GroupStatus::AwaitingVerification));

    let attempts = store.list_merge_attempts(orch.session_id(), "g1").unwrap();
    let outcomes: Vec<MergeOutcome> = attempts.iter().map(|a| a.outcome).collect();
    assert_eq!(
        outcomes,
        vec![MergeOutcome::Conflict, MergeOutcome::Success]
    );
}

#[tokio::test]
async fn test_security_sensitive_group_escalates_on_first_failure() {
    let store = InMemoryStore::new().shared();
    let invoker = ScriptedInvoker::new();
    invoker.script("auth", Role::Verifier, &["FAIL", "FAIL"]);
    let groups = vec![TaskGroup::new("auth", "Auth").security_sensitive()];
    let mut orch = open(&store, &invoker, groups);
    orch.run().await.unwrap();

    let implementer: Vec<(Tier, DispatchIntent)> = trail(&invoker, "auth")
        .into_iter()
        .filter(|(role, _, _)| *role == Role::Implementer)
        .map(|(_, tier, intent)| (tier, intent))
        .collect();
    assert_eq!(
        implementer,
        vec![
            (Tier::Base, DispatchIntent::Implement),
            (Tier::Senior, DispatchIntent::Revise),
            (Tier::Lead, DispatchIntent::Guidance),
        ]
    );
    let auth = group(store.as_ref(), orch.session_id(), "auth");
    assert_eq!(auth.status, GroupStatus::Merged);
    assert_eq!(auth.tier, Tier::Lead);
}

#[tokio::test]
async fn test_fourth_review_failure_goes_to_planning() {
    let store = InMemoryStore::new().shared();
    let invoker = ScriptedInvoker::new();
    invoker.script("g", Role::Verifier, &["FAIL", "FAIL", "FAIL", "FAIL"]);
    let mut orch = open(&store, &invoker, vec![TaskGroup::new("g", "G")]);

    let session = orch.run().await.unwrap();
    assert_eq!(session.status, SessionStatus::Complete);

    let g = group(store.as_ref(), orch.session_id(), "g");
    assert_eq!(g.status, GroupStatus::BlockedEscalated);
    assert_eq!(g.tier, Tier::PlanningAuthority);
    assert_eq!(g.revisions, 4);
    assert!(g.blocked_reason.is_some());

    let escalations = store.list_escalations(orch.session_id()).unwrap();
    assert_eq!(escalations.len(), 1);
    assert_eq!(escalations[0].trigger, PlanningTrigger::RevisionsExhausted);
    assert_eq!(escalations[0].last_tier, Tier::Lead);
}

#[tokio::test]
async fn test_merge_retry_bound() {
    let store = InMemoryStore::new().shared();
    let invoker = ScriptedInvoker::new();
    invoker.script(
        "g",
        Role::Merger,
        &["MERGE_CONFLICT", "MERGE_TEST_FAILURE", "MERGE_CONFLICT", "MERGE_CONFLICT"],
    );
    let mut orch = open(&store, &invoker, vec![TaskGroup::new("g", "G")]);
    orch.run().await.unwrap();

    let merge_tiers: Vec<Tier> = trail(&invoker, "g")
        .into_iter()
        .filter(|(role, _, _)| *role == Role::Merger)
        .map(|(_, tier, _)| tier)
        .collect();
    assert_eq!(
        merge_tiers,
        vec![Tier::Base, Tier::Base, Tier::Senior, Tier::Lead]
    );

    let g = group(store.as_ref(), orch.session_id(), "g");
    assert_eq!(g.status, GroupStatus::BlockedEscalated);
    assert_eq!(g.tier, Tier::PlanningAuthority);
    assert_eq!(g.revisions, 0, "merge failures have their own counter");

    assert_eq!(
        store.list_merge_attempts(orch.session_id(), "g").unwrap().len(),
        4
    );
    let escalations = store.list_escalations(orch.session_id()).unwrap();
    assert_eq!(
        escalations[0].trigger,
        PlanningTrigger::MergeRetriesExhausted
    );
}

#[tokio::test]
async fn test_blocked_merge_asks_reviewer_about_integration_target() {
    let store = InMemoryStore::new().shared();
    let invoker = ScriptedInvoker::new();
    invoker.script("g", Role::Merger, &["MERGE_BLOCKED"]);
    let mut orch = open(&store, &invoker, vec![TaskGroup::new("g", "G")]);
    orch.run().await.unwrap();

    let intents: Vec<DispatchIntent> = trail(&invoker, "g")
        .into_iter()
        .map(|(_, _, i)| i)
        .collect();
    let blocked_at = intents
        .iter()
        .position(|i| *i == DispatchIntent::Merge)
        .unwrap();
    assert_eq!(intents[blocked_at + 1], DispatchIntent::AssessIntegration);
    assert_eq!(intents.last(), Some(&DispatchIntent::Merge));
    assert_eq!(
        group(store.as_ref(), orch.session_id(), "g").status,
        GroupStatus::Merged
    );
}

#[tokio::test]
async fn test_investigation_finds_root_cause() {
    let store = InMemoryStore::new().shared();
    let invoker = ScriptedInvoker::new();
    invoker.script("g", Role::Verifier, &["BLOCKED"]);
    invoker.script(
        "g",
        Role::Investigator,
        &["HYPOTHESIS_ELIMINATED", "NEED_MORE_DIAGNOSTIC", "ROOT_CAUSE_FOUND"],
    );
    let mut orch = open(&store, &invoker, vec![TaskGroup::new("g", "G")]);
    orch.run().await.unwrap();

    let steps: Vec<(Role, DispatchIntent)> = trail(&invoker, "g")
        .into_iter()
        .map(|(role, _, intent)| (role, intent))
        .collect();
    use DispatchIntent::*;
    use Role::*;
    assert_eq!(
        steps,
        vec![
            (Implementer, Implement),
            (Verifier, Verify),
            (Investigator, Investigate),
            (Investigator, Investigate),
            (Implementer, Instrument),
            (Investigator, Investigate),
            (Implementer, ValidatedFix),
            (Verifier, Verify),
            (Reviewer, Review),
            (Merger, Merge),
        ]
    );

    let inv = store.get_investigation(orch.session_id(), "g").unwrap().unwrap();
    assert_eq!(inv.outcome, Some(InvestigationOutcome::RootCauseFound));
    assert_eq!(inv.iteration, 3, "instrumentation does not consume an iteration");
    assert_eq!(
        group(store.as_ref(), orch.session_id(), "g").status,
        GroupStatus::Merged
    );
}

#[tokio::test]
async fn test_investigation_terminates_within_ceiling() {
    let store = InMemoryStore::new().shared();
    let invoker = ScriptedInvoker::new();
    invoker.script("g", Role::Verifier, &["BLOCKED"]);
    invoker.script("g", Role::Investigator, &["HYPOTHESIS_ELIMINATED"; 10]);
    // Restart once with a new strategy, then ask again after the restart.
    invoker.script("g", Role::Reviewer, &["INVESTIGATE", "INVESTIGATE"]);
    let mut orch = open(&store, &invoker, vec![TaskGroup::new("g", "G")]);
    orch.run().await.unwrap();

    let roles: Vec<(Role, DispatchIntent)> = trail(&invoker, "g")
        .into_iter()
        .map(|(role, _, intent)| (role, intent))
        .collect();
    let mut longest = 0;
    let mut run = 0;
    for (role, _) in &roles {
        run = if *role == Role::Investigator { run + 1 } else { 0 };
        longest = longest.max(run);
    }
    assert_eq!(longest, 5);
    assert_eq!(
        roles.iter().filter(|(r, _)| *r == Role::Investigator).count(),
        10
    );
    assert_eq!(
        roles
            .iter()
            .filter(|(_, i)| *i == DispatchIntent::AssessPartialFindings)
            .count(),
        2
    );

    let g = group(store.as_ref(), orch.session_id(), "g");
    assert_eq!(g.status, GroupStatus::BlockedEscalated);
    let inv = store.get_investigation(orch.session_id(), "g").unwrap().unwrap();
    assert_eq!(inv.restarts, 1);
    assert_eq!(inv.outcome, Some(InvestigationOutcome::Exhausted));
    let escalations = store.list_escalations(orch.session_id()).unwrap();
    assert_eq!(
        escalations[0].trigger,
        PlanningTrigger::InvestigationUnresolved
    );
}

#[tokio::test]
async fn test_investigator_blocked_exits_early_to_planning() {
    let store = InMemoryStore::new().shared();
    let invoker = ScriptedInvoker::new();
    invoker.script("g", Role::Reviewer, &["INVESTIGATE"]);
    invoker.script("g", Role::Investigator, &["BLOCKED"]);
    let mut orch = open(&store, &invoker, vec![TaskGroup::new("g", "G")]);
    orch.run().await.unwrap();

    let g = group(store.as_ref(), orch.session_id(), "g");
    assert_eq!(g.status, GroupStatus::BlockedEscalated);
    let inv = store.get_investigation(orch.session_id(), "g").unwrap().unwrap();
    assert_eq!(inv.outcome, Some(InvestigationOutcome::Blocked));
    assert_eq!(inv.iteration, 1);
    let escalations = store.list_escalations(orch.session_id()).unwrap();
    assert_eq!(
        escalations[0].trigger,
        PlanningTrigger::InvestigationBlocked
    );
}

#[tokio::test]
async fn test_repeated_blocking_defects_hit_investigation_limit() {
    let store = InMemoryStore::new().shared();
    let invoker = ScriptedInvoker::new();
    invoker.script("g", Role::Verifier, &["BLOCKED", "BLOCKED", "BLOCKED", "BLOCKED"]);
    let mut orch = open(&store, &invoker, vec![TaskGroup::new("g", "G")]);
    orch.run().await.unwrap();

    let g = group(store.as_ref(), orch.session_id(), "g");
    assert_eq!(g.status, GroupStatus::BlockedEscalated);
    assert_eq!(g.investigations, 3);
    let escalations = store.list_escalations(orch.session_id()).unwrap();
    assert_eq!(escalations[0].trigger, PlanningTrigger::InvestigationLimit);
}

#[tokio::test]
async fn test_unknown_implementer_status_goes_to_reviewer() {
    let store = InMemoryStore::new().shared();
    let invoker = ScriptedInvoker::new();
    invoker.script("g", Role::Implementer, &["DONE_I_THINK"]);
    let mut orch = open(&store, &invoker, vec![TaskGroup::new("g", "G")]);
    orch.run().await.unwrap();

    let trail = trail(&invoker, "g");
    assert_eq!(trail[1].0, Role::Reviewer);
    assert_eq!(trail[1].2, DispatchIntent::ClassifyStatus);
    let spawns = store.list_spawn_records(orch.session_id(), "g").unwrap();
    assert!(spawns[0].status.is_unknown(), "unknown code is recorded, not dropped");
}

#[tokio::test]
async fn test_replayed_report_is_idempotent() {
    let store = InMemoryStore::new().shared();
    let invoker = ScriptedInvoker::new();
    let mut orch = open(&store, &invoker, vec![TaskGroup::new("g", "G")]);

    // Admits, issues and applies the implementer's report.
    orch.tick().await.unwrap();
    let g = group(store.as_ref(), orch.session_id(), "g");
    let verifier = g.outstanding.clone().unwrap();
    assert_eq!(verifier.role, Role::Verifier);

    let pass = StatusReport::parse(Role::Verifier, "PASS");
    let first = orch.apply_report("g", verifier.iteration, pass.clone()).unwrap();
    assert_eq!(
        first,
        ApplyOutcome::Applied {
            group_id: "g".into(),
            status: GroupStatus::AwaitingReview,
        }
    );
    let after_first = group(store.as_ref(), orch.session_id(), "g");

    let replay = orch.apply_report("g", verifier.iteration, pass).unwrap();
    assert!(matches!(replay, ApplyOutcome::Ignored { .. }));
    let after_replay = group(store.as_ref(), orch.session_id(), "g");
    assert_eq!(after_first, after_replay);
    assert_eq!(
        store.list_spawn_records(orch.session_id(), "g").unwrap().len(),
        2
    );

    // A report for an iteration that was never dispatched is ignored too.
    let bogus = orch
        .apply_report("g", 99, StatusReport::parse(Role::Reviewer, "APPROVED"))
        .unwrap();
    assert!(matches!(bogus, ApplyOutcome::Ignored { .. }));

    let session = orch.run().await.unwrap();
    assert_eq!(session.status, SessionStatus::Complete);
}

#[tokio::test]
async fn test_tier_never_decreases_across_mixed_failures() {
    let store = InMemoryStore::new().shared();
    let invoker = ScriptedInvoker::new();
    invoker.script("g", Role::Verifier, &["FAIL", "FAIL"]);
    invoker.script("g", Role::Reviewer, &["CHANGES_REQUESTED"]);
    invoker.script("g", Role::Merger, &["MERGE_CONFLICT"]);
    let mut orch = open(&store, &invoker, vec![TaskGroup::new("g", "G")]);
    orch.run().await.unwrap();

    let tiers: Vec<Tier> = trail(&invoker, "g").into_iter().map(|(_, tier, _)| tier).collect();
    assert!(tiers.windows(2).all(|w| w[0] <= w[1]), "tiers regressed: {:?}", tiers);

    let g = group(store.as_ref(), orch.session_id(), "g");
    assert_eq!(g.status, GroupStatus::Merged);
    assert_eq!(g.revisions, 3);
    assert_eq!(g.tier, Tier::Lead);
}
