//! Board-level lifecycle tests.
//!
//! Drive the public `Board` API with a manual clock, scripted workers and an
//! in-memory snapshot store, and check cards, tracker counters and
//! collaborator calls after each operation.

use std::sync::Arc;
use std::time::Duration;

use taskboard::clock::Clock;
use taskboard::core::invariants::validate_card;
use taskboard::io::workers::WorkerRole;
use taskboard::rules::{BoardEvent, Deferred, Rule, RuleEngine};
use taskboard::test_support::{FailingStore, TestBoard, scenario_config};
use taskboard::{BoardConfig, CardId, CardStatus, NewCard, Priority, Rejection, UsageReport};

fn rejection(err: taskboard::BoardError) -> Rejection {
    err.rejection().cloned().expect("recoverable rejection")
}

fn last_reason(card: &taskboard::Card) -> &str {
    card.history
        .last()
        .map(|record| record.reason.as_str())
        .unwrap_or("")
}

/// Create → start → complete walks every edge and retires the worker.
#[test]
fn card_runs_from_backlog_to_done() {
    let tb = TestBoard::scenario();
    let card = tb
        .board
        .create_card(NewCard::new("write parser", Priority::Medium))
        .expect("create");
    assert_eq!(card.status, CardStatus::Backlog);

    let started = tb.board.start_card(&card.id).expect("start");
    assert_eq!(started.status, CardStatus::Active);
    assert_eq!(started.history.len(), 2);
    assert_eq!(started.role, Some(WorkerRole::Implementer));
    let worker = started.assigned_worker.clone().expect("worker");
    assert_eq!(tb.board.tracker().active_count(), 1);

    tb.clock.advance(Duration::from_secs(42));
    let done = tb.board.complete_card(&card.id).expect("complete");
    assert_eq!(done.status, CardStatus::Done);
    assert_eq!(done.completed_at, Some(tb.clock.now()));
    assert!(done.assigned_worker.is_none());
    assert_eq!(done.metrics.processing_ms, 42_000);
    assert!(validate_card(&done).is_empty(), "{:?}", validate_card(&done));
    assert_eq!(tb.board.tracker().active_count(), 0);
    assert_eq!(tb.workers.terminated(), vec![(worker, "completed".to_string())]);
    assert!(tb.store.save_count() >= 3);
}

#[test]
fn invalid_move_is_rejected_without_side_effects() {
    let tb = TestBoard::scenario();
    let card = tb
        .board
        .create_card(NewCard::new("c", Priority::Low))
        .expect("create");
    let err = tb
        .board
        .move_card(&card.id, CardStatus::Done, false)
        .expect_err("invalid");
    assert_eq!(
        rejection(err),
        Rejection::InvalidTransition {
            from: CardStatus::Backlog,
            to: CardStatus::Done
        }
    );
    let after = tb.board.get_card(&card.id).expect("card");
    assert!(after.history.is_empty());
    assert_eq!(after.status, CardStatus::Backlog);
}

#[test]
fn unknown_card_is_reported() {
    let tb = TestBoard::scenario();
    let ghost = CardId::new("ghost");
    let err = tb.board.start_card(&ghost).expect_err("missing");
    assert_eq!(rejection(err), Rejection::CardNotFound(ghost));
}

#[test]
fn unknown_dependency_is_rejected() {
    let tb = TestBoard::scenario();
    let mut new = NewCard::new("follow-up", Priority::Low);
    new.dependencies.push(CardId::new("nope"));
    let err = tb.board.create_card(new).expect_err("dependency");
    assert!(matches!(rejection(err), Rejection::CardNotFound(_)));
}

/// Two cards fit under the effective limit of 2.5; the third lands in the
/// buffer zone and needs `force`; a fourth crosses the hard limit.
#[test]
fn admission_respects_effective_and_hard_limits() {
    let tb = TestBoard::scenario();
    let mut ids = Vec::new();
    for title in ["a", "b", "c", "d"] {
        ids.push(
            tb.board
                .create_card(NewCard::new(title, Priority::Medium))
                .expect("create")
                .id,
        );
    }
    tb.board.start_card(&ids[0]).expect("first");
    tb.board.start_card(&ids[1]).expect("second");

    let err = tb.board.start_card(&ids[2]).expect_err("buffer zone");
    match rejection(err) {
        Rejection::AdmissionDenied { reason } => assert!(reason.contains("effective limit")),
        other => panic!("unexpected rejection {other:?}"),
    }

    tb.board
        .move_card(&ids[2], CardStatus::Todo, false)
        .expect("todo");
    let forced = tb
        .board
        .move_card(&ids[2], CardStatus::Active, true)
        .expect("forced");
    assert_eq!(forced.status, CardStatus::Active);
    assert!(
        forced
            .warnings
            .iter()
            .any(|warning| warning.starts_with("forced admission"))
    );
    assert_eq!(tb.board.tracker().active_count(), 3);

    tb.board
        .move_card(&ids[3], CardStatus::Todo, false)
        .expect("todo");
    let err = tb
        .board
        .move_card(&ids[3], CardStatus::Active, true)
        .expect_err("hard limit");
    match rejection(err) {
        Rejection::AdmissionDenied { reason } => assert!(reason.contains("hard limit")),
        other => panic!("unexpected rejection {other:?}"),
    }
    assert_eq!(tb.board.tracker().active_count(), 3);
}

#[test]
fn pause_and_resume_cycle_the_worker() {
    let tb = TestBoard::scenario();
    let id = tb
        .board
        .create_card(NewCard::new("long job", Priority::Medium))
        .expect("create")
        .id;
    let first_worker = tb
        .board
        .start_card(&id)
        .expect("start")
        .assigned_worker
        .expect("worker");

    let paused = tb.board.pause_card(&id).expect("pause");
    assert_eq!(paused.status, CardStatus::Blocked);
    assert!(paused.paused);
    assert!(paused.assigned_worker.is_none());
    assert_eq!(tb.board.tracker().active_count(), 0);
    assert_eq!(
        tb.workers.terminated(),
        vec![(first_worker.clone(), "paused".to_string())]
    );

    let err = tb
        .board
        .move_card(&id, CardStatus::Active, false)
        .expect_err("paused");
    assert_eq!(rejection(err), Rejection::Paused(id.clone()));

    let resumed = tb.board.resume_card(&id).expect("resume");
    assert_eq!(resumed.status, CardStatus::Active);
    assert!(!resumed.paused);
    let second_worker = resumed.assigned_worker.expect("worker");
    assert_ne!(second_worker, first_worker);
    assert_eq!(tb.board.tracker().active_count(), 1);
}

#[test]
fn pause_requires_a_running_card() {
    let tb = TestBoard::scenario();
    let id = tb
        .board
        .create_card(NewCard::new("idle", Priority::Low))
        .expect("create")
        .id;
    let err = tb.board.pause_card(&id).expect_err("not running");
    assert!(matches!(rejection(err), Rejection::InvalidTransition { .. }));
}

/// A worker backend failure leaves the card in Backlog with no slot held.
#[test]
fn worker_failure_rolls_back_start() {
    let tb = TestBoard::scenario();
    let id = tb
        .board
        .create_card(NewCard::new("c", Priority::Medium))
        .expect("create")
        .id;
    tb.workers.fail_create(true);
    let err = tb.board.start_card(&id).expect_err("worker down");
    assert!(matches!(rejection(err), Rejection::Worker { .. }));

    let card = tb.board.get_card(&id).expect("card");
    assert_eq!(card.status, CardStatus::Backlog);
    assert!(card.history.is_empty());
    assert_eq!(tb.board.tracker().active_count(), 0);

    tb.workers.fail_create(false);
    tb.board.start_card(&id).expect("start after recovery");
}

#[test]
fn terminate_failure_becomes_a_warning() {
    let tb = TestBoard::scenario();
    let id = tb
        .board
        .create_card(NewCard::new("c", Priority::Medium))
        .expect("create")
        .id;
    tb.board.start_card(&id).expect("start");
    tb.workers.fail_terminate(true);
    let card = tb.board.fail_card(&id, "crashed").expect("fail");
    assert_eq!(card.status, CardStatus::Failed);
    assert!(
        card.warnings
            .iter()
            .any(|warning| warning.contains("did not answer"))
    );
}

#[test]
fn failed_card_can_be_retried() {
    let tb = TestBoard::scenario();
    let id = tb
        .board
        .create_card(NewCard::new("flaky", Priority::Medium))
        .expect("create")
        .id;
    tb.board.start_card(&id).expect("start");
    let failed = tb.board.fail_card(&id, "crashed").expect("fail");
    assert_eq!(failed.status, CardStatus::Failed);
    assert!(failed.completed_at.is_some());

    let retried = tb
        .board
        .move_card(&id, CardStatus::Todo, false)
        .expect("retry");
    assert_eq!(retried.metrics.retry_count, 1);
    assert!(retried.completed_at.is_none());

    let running = tb.board.start_card(&id).expect("start again");
    assert_eq!(running.status, CardStatus::Active);
    assert!(validate_card(&running).is_empty());
}

/// Moving a clean card into Review lets the default rule finish it.
#[test]
fn clean_review_auto_advances_to_done() {
    let tb = TestBoard::scenario();
    let clean = tb
        .board
        .create_card(NewCard::new("clean", Priority::Medium))
        .expect("create")
        .id;
    tb.board.start_card(&clean).expect("start");
    let card = tb
        .board
        .move_card(&clean, CardStatus::Review, false)
        .expect("review");
    assert_eq!(card.status, CardStatus::Done);
    assert_eq!(last_reason(&card), "review passed with zero errors");

    let noisy = tb
        .board
        .create_card(NewCard::new("noisy", Priority::Medium))
        .expect("create")
        .id;
    tb.board.start_card(&noisy).expect("start");
    tb.board
        .record_usage(
            &noisy,
            UsageReport {
                errors: 1,
                ..UsageReport::default()
            },
        )
        .expect("usage");
    let card = tb
        .board
        .move_card(&noisy, CardStatus::Review, false)
        .expect("review");
    assert_eq!(card.status, CardStatus::Review);
}

/// Critical cards are assigned a role and started by the default rule.
#[test]
fn critical_card_is_started_on_creation() {
    let tb = TestBoard::scenario();
    let card = tb
        .board
        .create_card(NewCard::new("prod is down", Priority::Critical))
        .expect("create");
    assert_eq!(card.status, CardStatus::Active);
    assert_eq!(card.role, Some(WorkerRole::Implementer));
    assert_eq!(tb.workers.created().len(), 1);
}

/// A deferred start that cannot be admitted is recorded on the card.
#[test]
fn refused_auto_start_leaves_a_warning() {
    let tb = TestBoard::scenario();
    for title in ["a", "b"] {
        let id = tb
            .board
            .create_card(NewCard::new(title, Priority::Medium))
            .expect("create")
            .id;
        tb.board.start_card(&id).expect("start");
    }
    let card = tb
        .board
        .create_card(NewCard::new("urgent", Priority::Critical))
        .expect("create");
    assert_eq!(card.status, CardStatus::Backlog);
    assert!(
        card.warnings
            .iter()
            .any(|warning| warning.contains("admission denied")),
        "{:?}",
        card.warnings
    );
}

/// A card running past the processing limit is blocked on the next sweep
/// and gives its slot back.
#[test]
fn sweep_blocks_timed_out_cards() {
    let tb = TestBoard::scenario();
    let id = tb
        .board
        .create_card(NewCard::new("slow", Priority::Medium))
        .expect("create")
        .id;
    let worker = tb
        .board
        .start_card(&id)
        .expect("start")
        .assigned_worker
        .expect("worker");

    tb.clock.advance(Duration::from_secs(600));
    assert!(tb.board.run_sweep().expect("sweep").is_empty());

    tb.clock.advance(Duration::from_secs(1));
    let report = tb.board.run_sweep().expect("sweep");
    assert_eq!(report.timed_out, vec![id.clone()]);

    let card = tb.board.get_card(&id).expect("card");
    assert_eq!(card.status, CardStatus::Blocked);
    assert_eq!(last_reason(&card), "timeout");
    assert_eq!(tb.board.tracker().active_count(), 0);
    assert!(tb.workers.terminated().contains(&(worker, "timeout".to_string())));
}

#[test]
fn sweep_fails_cards_over_error_ceiling() {
    let tb = TestBoard::scenario();
    let id = tb
        .board
        .create_card(NewCard::new("buggy", Priority::Medium))
        .expect("create")
        .id;
    tb.board.start_card(&id).expect("start");
    tb.board
        .record_usage(
            &id,
            UsageReport {
                errors: 6,
                ..UsageReport::default()
            },
        )
        .expect("usage");

    let report = tb.board.run_sweep().expect("sweep");
    assert_eq!(report.failed, vec![id.clone()]);
    let card = tb.board.get_card(&id).expect("card");
    assert_eq!(card.status, CardStatus::Failed);
    assert_eq!(last_reason(&card), "error ceiling: 6 errors > 5");
}

#[test]
fn usage_passes_tool_calls_through_rate_window() {
    let mut config = scenario_config();
    config.limits.max_calls_per_window = 3;
    let tb = TestBoard::new(config);
    let id = tb
        .board
        .create_card(NewCard::new("chatty", Priority::Medium))
        .expect("create")
        .id;
    tb.board.start_card(&id).expect("start");

    let outcome = tb
        .board
        .record_usage(
            &id,
            UsageReport {
                units: 500,
                tool_calls: 5,
                errors: 0,
            },
        )
        .expect("usage");
    assert_eq!(outcome.accepted_calls, 3);
    assert_eq!(outcome.rejected_calls, 2);
    assert_eq!(outcome.card.metrics.tool_calls, 3);
    assert_eq!(outcome.card.metrics.budget_units, 500);
    assert!(!outcome.handoff.should_handoff);

    let status = tb.board.get_resource_status();
    assert_eq!(status.budget_in_flight, 500);
    assert_eq!(status.calls_in_window, 3);
}

#[test]
fn usage_needs_a_running_card() {
    let tb = TestBoard::scenario();
    let id = tb
        .board
        .create_card(NewCard::new("idle", Priority::Low))
        .expect("create")
        .id;
    let err = tb
        .board
        .record_usage(&id, UsageReport::default())
        .expect_err("not running");
    assert!(matches!(rejection(err), Rejection::AllocationRefused { .. }));
}

#[test]
fn usage_past_hard_budget_is_refused() {
    let tb = TestBoard::scenario();
    let id = tb
        .board
        .create_card(NewCard::new("hungry", Priority::Medium))
        .expect("create")
        .id;
    tb.board.start_card(&id).expect("start");
    let err = tb
        .board
        .record_usage(
            &id,
            UsageReport {
                units: 20_001,
                ..UsageReport::default()
            },
        )
        .expect_err("over budget");
    assert!(matches!(rejection(err), Rejection::AllocationRefused { .. }));
    assert_eq!(tb.board.get_card(&id).expect("card").metrics.budget_units, 0);
}

#[test]
fn scheduler_starts_highest_priority_first() {
    let tb = TestBoard::scenario();
    for (title, priority) in [
        ("low", Priority::Low),
        ("high", Priority::High),
        ("medium", Priority::Medium),
    ] {
        tb.board
            .create_card(NewCard::new(title, priority))
            .expect("create");
        tb.clock.advance(Duration::from_secs(1));
    }
    assert_eq!(tb.board.next_card().expect("next").title, "high");
    let started = tb.board.start_next().expect("start").expect("card");
    assert_eq!(started.title, "high");
    assert_eq!(tb.board.next_card().expect("next").title, "medium");
}

#[test]
fn start_next_with_nothing_waiting() {
    let tb = TestBoard::scenario();
    assert!(tb.board.start_next().expect("start").is_none());
}

#[test]
fn emergency_mode_blocks_starts_until_reset() {
    let tb = TestBoard::scenario();
    let a = tb
        .board
        .create_card(NewCard::new("a", Priority::Medium))
        .expect("create")
        .id;
    let b = tb
        .board
        .create_card(NewCard::new("b", Priority::Medium))
        .expect("create")
        .id;
    tb.board.start_card(&a).expect("start");
    tb.board.force_emergency_mode("operator stop").expect("force");

    let err = tb.board.start_card(&b).expect_err("emergency");
    match rejection(err) {
        Rejection::AdmissionDenied { reason } => assert!(reason.contains("emergency mode")),
        other => panic!("unexpected rejection {other:?}"),
    }
    assert!(tb.board.reset_emergency_mode().is_err());

    tb.board.complete_card(&a).expect("complete");
    tb.board.reset_emergency_mode().expect("reset");
    tb.board.start_card(&b).expect("start after reset");
}

#[test]
fn cleanup_removes_only_old_finished_cards() {
    let tb = TestBoard::scenario();
    let done = tb
        .board
        .create_card(NewCard::new("done", Priority::Medium))
        .expect("create")
        .id;
    let waiting = tb
        .board
        .create_card(NewCard::new("waiting", Priority::Low))
        .expect("create")
        .id;
    tb.board.start_card(&done).expect("start");
    tb.board.complete_card(&done).expect("complete");

    let retention = Duration::from_secs(3600);
    assert!(tb.board.cleanup(retention).expect("cleanup").is_empty());

    tb.clock.advance(Duration::from_secs(3601));
    assert_eq!(tb.board.cleanup(retention).expect("cleanup"), vec![done.clone()]);
    assert!(tb.board.get_card(&done).is_none());
    assert!(tb.board.get_card(&waiting).is_some());
}

/// A reopened board resumes cards and tracker counters from the last snapshot.
#[test]
fn reopened_board_resumes_from_snapshot() {
    let tb = TestBoard::scenario();
    let id = tb
        .board
        .create_card(NewCard::new("persisted", Priority::High))
        .expect("create")
        .id;
    tb.board.start_card(&id).expect("start");
    tb.board
        .record_usage(
            &id,
            UsageReport {
                units: 1_200,
                tool_calls: 1,
                errors: 0,
            },
        )
        .expect("usage");

    let reopened = tb.reopen(scenario_config());
    let card = reopened.get_card(&id).expect("card");
    assert_eq!(card.status, CardStatus::Active);
    assert_eq!(card.metrics.budget_units, 1_200);
    let status = reopened.get_resource_status();
    assert_eq!(status.active_count, 1);
    assert_eq!(status.budget_in_flight, 1_200);

    reopened.complete_card(&id).expect("complete");
    assert_eq!(reopened.tracker().budget_consumed(), 1_200);
}

#[test]
fn persistence_failure_is_fatal() {
    let tb = TestBoard::build(scenario_config(), |collaborators| {
        taskboard::Collaborators {
            store: Arc::new(FailingStore),
            ..collaborators
        }
    });
    let err = tb
        .board
        .create_card(NewCard::new("c", Priority::Low))
        .expect_err("save fails");
    assert!(err.is_fatal());
    assert!(err.to_string().contains("disk full"));
}

#[test]
fn cards_by_status_are_in_schedule_order() {
    let tb = TestBoard::scenario();
    for (title, priority) in [("b", Priority::Low), ("a", Priority::High)] {
        tb.board
            .create_card(NewCard::new(title, priority))
            .expect("create");
    }
    let titles: Vec<String> = tb
        .board
        .get_cards_by_status(CardStatus::Backlog)
        .into_iter()
        .map(|card| card.title)
        .collect();
    assert_eq!(titles, vec!["a", "b"]);
}

#[test]
fn default_config_opens() {
    let tb = TestBoard::new(BoardConfig::default());
    assert_eq!(tb.board.get_resource_status().max_active, 10);
}

#[test]
fn json_store_survives_restart() {
    let (_dir, store) = taskboard::test_support::temp_store();
    let store = Arc::new(store);
    let workers = Arc::new(taskboard::test_support::ScriptedWorkers::new());
    let clock = Arc::new(taskboard::clock::ManualClock::new(
        taskboard::test_support::epoch(),
    ));
    let open = || {
        taskboard::Board::open(
            scenario_config(),
            taskboard::Collaborators::new(workers.clone(), store.clone())
                .with_clock(clock.clone()),
        )
        .expect("open")
    };

    let id = {
        let board = open();
        let id = board
            .create_card(NewCard::new("durable", Priority::Medium))
            .expect("create")
            .id;
        board.start_card(&id).expect("start");
        id
    };

    let board = open();
    assert!(store.path().exists());
    assert_eq!(board.get_card(&id).expect("card").status, CardStatus::Active);
    assert_eq!(board.get_resource_status().active_count, 1);
}

/// Creation goes through the same availability check as admission.
#[test]
fn emergency_mode_refuses_new_cards() {
    let tb = TestBoard::scenario();
    tb.board.force_emergency_mode("operator stop").expect("force");

    let err = tb
        .board
        .create_card(NewCard::new("late", Priority::High))
        .expect_err("emergency");
    match rejection(err) {
        Rejection::AdmissionDenied { reason } => assert!(reason.contains("emergency mode")),
        other => panic!("unexpected rejection {other:?}"),
    }
    assert!(tb.board.get_cards_by_status(CardStatus::Backlog).is_empty());

    tb.board.reset_emergency_mode().expect("reset");
    tb.board
        .create_card(NewCard::new("late", Priority::High))
        .expect("create after reset");
}

#[test]
fn card_created_in_buffer_zone_carries_warning() {
    let tb = TestBoard::scenario();
    for title in ["a", "b"] {
        let id = tb
            .board
            .create_card(NewCard::new(title, Priority::Medium))
            .expect("create")
            .id;
        tb.board.start_card(&id).expect("start");
    }
    let card = tb
        .board
        .create_card(NewCard::new("c", Priority::Low))
        .expect("create");
    assert!(
        card.warnings
            .iter()
            .any(|warning| warning.starts_with("created under pressure")),
        "{:?}",
        card.warnings
    );
}

/// Rules that keep queueing moves stop at `max_deferred_actions`; the rest
/// are dropped with a warning on the card.
#[test]
fn deferred_actions_stop_at_the_cap() {
    let mut config = scenario_config();
    config.rules.max_deferred_actions = 2;
    let mut rules = RuleEngine::new();
    rules.register(Rule::new(
        "bounce-to-integrate",
        BoardEvent::CardStarted,
        |card, _ctx| card.status == CardStatus::Active,
        |card, _ctx, deferred| {
            deferred.push(Deferred::Move {
                card_id: card.id.clone(),
                to: CardStatus::Integrate,
                reason: "bounce".to_string(),
            });
            Ok(())
        },
    ));
    rules.register(Rule::new(
        "bounce-to-active",
        BoardEvent::CardMoved,
        |card, _ctx| card.status == CardStatus::Integrate,
        |card, _ctx, deferred| {
            deferred.push(Deferred::Move {
                card_id: card.id.clone(),
                to: CardStatus::Active,
                reason: "bounce".to_string(),
            });
            Ok(())
        },
    ));
    let tb = TestBoard::with_rules(config, rules);
    let id = tb
        .board
        .create_card(NewCard::new("restless", Priority::Medium))
        .expect("create")
        .id;

    let card = tb.board.start_card(&id).expect("start");
    let statuses: Vec<CardStatus> = card.history.iter().map(|record| record.to).collect();
    assert_eq!(
        statuses,
        vec![
            CardStatus::Todo,
            CardStatus::Active,
            CardStatus::Integrate,
            CardStatus::Active
        ]
    );
    let dropped: Vec<&String> = card
        .warnings
        .iter()
        .filter(|warning| warning.contains("dropped: cap of 2 reached"))
        .collect();
    assert_eq!(dropped.len(), 1, "{:?}", card.warnings);
    assert!(dropped[0].contains(&format!("move {id} to integrate")));
    assert_eq!(tb.board.tracker().active_count(), 1);
}

#[test]
fn rejected_deferred_move_becomes_a_warning() {
    let mut rules = RuleEngine::new();
    rules.register(Rule::new(
        "finish-immediately",
        BoardEvent::CardStarted,
        |_card, _ctx| true,
        |card, _ctx, deferred| {
            deferred.push(Deferred::Move {
                card_id: card.id.clone(),
                to: CardStatus::Done,
                reason: "skip review".to_string(),
            });
            Ok(())
        },
    ));
    let tb = TestBoard::with_rules(scenario_config(), rules);
    let id = tb
        .board
        .create_card(NewCard::new("eager", Priority::Medium))
        .expect("create")
        .id;

    let card = tb.board.start_card(&id).expect("start");
    assert_eq!(card.status, CardStatus::Active);
    assert!(
        card.warnings.iter().any(|warning| warning
            == &format!("deferred 'move {id} to done' failed: invalid transition active -> done")),
        "{:?}",
        card.warnings
    );
}
