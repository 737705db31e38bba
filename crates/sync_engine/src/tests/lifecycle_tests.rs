use super::*;

#[test]
fn happy_path_transitions() {
    let state = transition(SessionState::Uninitialized, LifecycleEvent::InitStarted)
        .expect("start");
    assert_eq!(state, SessionState::Initializing);
    let state = transition(state, LifecycleEvent::InitSucceeded).expect("ready");
    assert_eq!(state, SessionState::Ready);
    let state = transition(state, LifecycleEvent::CleanedUp).expect("cleanup");
    assert_eq!(state, SessionState::Uninitialized);
}

#[test]
fn failed_sessions_can_retry() {
    let state = transition(SessionState::Initializing, LifecycleEvent::InitFailed).expect("fail");
    assert_eq!(state, SessionState::Failed);
    assert_eq!(
        transition(state, LifecycleEvent::InitStarted).expect("retry"),
        SessionState::Initializing
    );
}

#[test]
fn rejects_invalid_transitions() {
    let err = transition(SessionState::Ready, LifecycleEvent::InitStarted).expect_err("invalid");
    assert_eq!(err.from, SessionState::Ready);
    assert!(transition(SessionState::Uninitialized, LifecycleEvent::InitSucceeded).is_err());
    assert!(transition(SessionState::Ready, LifecycleEvent::InitFailed).is_err());
}

#[test]
fn cleanup_is_valid_from_every_state() {
    for state in [
        SessionState::Uninitialized,
        SessionState::Initializing,
        SessionState::Ready,
        SessionState::Failed,
    ] {
        assert_eq!(
            transition(state, LifecycleEvent::CleanedUp).expect("cleanup"),
            SessionState::Uninitialized
        );
    }
}

#[test]
fn budget_is_checked_before_consuming_attempts() {
    let mut lifecycle = Lifecycle::default();
    for attempt in 1..=3 {
        lifecycle.check_budget(3).expect("within budget");
        lifecycle.begin_attempt().expect("begin");
        assert_eq!(lifecycle.session().attempt_count, attempt);
        lifecycle
            .fail(Fault::generic("backend down"))
            .expect("fail");
    }
    let fault = lifecycle.check_budget(3).expect_err("exhausted");
    assert_eq!(fault.kind, FaultKind::AttemptBudgetExceeded);
    assert_eq!(lifecycle.session().state, SessionState::Failed);
    assert_eq!(lifecycle.session().attempt_count, 3);
}

#[test]
fn teardown_keeps_attempt_count_but_reset_clears_it() {
    let mut lifecycle = Lifecycle::default();
    lifecycle.begin_attempt().expect("begin");
    lifecycle.fail(Fault::generic("nope")).expect("fail");
    lifecycle.teardown();
    assert_eq!(lifecycle.session().state, SessionState::Uninitialized);
    assert_eq!(lifecycle.session().attempt_count, 1);
    assert!(lifecycle.last_error().is_some());

    lifecycle.reset_attempt_budget();
    assert_eq!(lifecycle.session().attempt_count, 0);
    assert!(lifecycle.last_error().is_none());
}

#[test]
fn single_flight_guard_rejects_second_acquire_until_dropped() {
    let flag = AtomicBool::new(false);
    let first = InitFlight::acquire(&flag).expect("first");
    assert!(InitFlight::acquire(&flag).is_none());
    drop(first);
    assert!(InitFlight::acquire(&flag).is_some());
}
