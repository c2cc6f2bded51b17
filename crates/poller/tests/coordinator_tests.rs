use chrono::{TimeZone, Utc};

use cloud_client::CloudError;
use modbus_client::ClientError;
use poller::{classify, ClassifiedError, ErrorCategory, Phase, PollState, TransportError};
use types::DeviceSnapshot;

fn snapshot() -> DeviceSnapshot {
    DeviceSnapshot::empty(Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap())
}

fn network_error() -> ClassifiedError {
    classify(&TransportError::Modbus(ClientError::Timeout {
        timeout_ms: 1_000,
    }))
}

#[test]
fn state_machine_walks_idle_fetching_ready_degraded() {
    let mut state = PollState::new();
    assert_eq!(state.phase(), Phase::Idle);
    assert!(state.latest().is_none());

    state.begin();
    assert_eq!(state.phase(), Phase::Fetching);

    state.on_success(snapshot());
    assert_eq!(state.phase(), Phase::Ready);
    assert!(state.latest().is_some());
    assert!(state.last_error().is_none());

    state.begin();
    state.on_failure(network_error());
    assert_eq!(state.phase(), Phase::Degraded);
    assert_eq!(state.consecutive_failures(), 1);

    // Degraded is never terminal: the next tick fetches again.
    state.begin();
    assert_eq!(state.phase(), Phase::Fetching);
}

#[test]
fn degraded_state_retains_the_last_good_snapshot() {
    let mut state = PollState::new();
    let good = snapshot();
    state.on_success(good.clone());

    state.on_failure(network_error());
    state.on_failure(network_error());
    assert_eq!(state.phase(), Phase::Degraded);
    assert_eq!(state.consecutive_failures(), 2);
    assert_eq!(state.latest(), Some(&good));
    assert_eq!(state.last_error().map(|e| e.category), Some(ErrorCategory::Network));
}

#[test]
fn recovery_clears_the_recorded_error() {
    let mut state = PollState::new();
    state.on_failure(network_error());
    assert!(state.last_error().is_some());

    state.on_success(snapshot());
    assert_eq!(state.phase(), Phase::Ready);
    assert!(state.last_error().is_none());
    assert_eq!(state.consecutive_failures(), 0);
}

#[test]
fn cloud_errors_classify_into_user_facing_categories() {
    let cases = [
        (
            TransportError::Cloud(CloudError::Auth("wrong password".into())),
            ErrorCategory::Authentication,
        ),
        (
            TransportError::Cloud(CloudError::RateLimited("login frequently".into())),
            ErrorCategory::RateLimited,
        ),
        (
            TransportError::Cloud(CloudError::NoPlants),
            ErrorCategory::DeviceNotFound,
        ),
        (
            TransportError::Cloud(CloudError::NoDevice("98765".into())),
            ErrorCategory::DeviceNotFound,
        ),
        (
            TransportError::Cloud(CloudError::SessionExpired),
            ErrorCategory::Authentication,
        ),
        (
            TransportError::Cloud(CloudError::Protocol("not json".into())),
            ErrorCategory::Protocol,
        ),
    ];

    for (error, expected) in cases {
        let classified = classify(&error);
        assert_eq!(classified.category, expected, "{error}");
        assert!(!classified.hint.is_empty());
        assert!(!classified.message.is_empty());
    }
}

#[test]
fn modbus_and_timeout_errors_classify_as_network() {
    let classified = classify(&TransportError::Modbus(ClientError::Timeout {
        timeout_ms: 500,
    }));
    assert_eq!(classified.category, ErrorCategory::Network);
    assert!(classified.message.contains("500"));

    let classified = classify(&TransportError::Modbus(ClientError::InvalidAddress(
        "nowhere".into(),
        502,
    )));
    assert_eq!(classified.category, ErrorCategory::Protocol);
}

#[test]
fn rate_limit_hint_promises_automatic_retry() {
    let classified = classify(&TransportError::Cloud(CloudError::RateLimited("507".into())));
    assert!(classified.hint.contains("retrying automatically"));

    let classified = classify(&TransportError::Cloud(CloudError::Auth("denied".into())));
    assert!(classified.hint.contains("username and password"));
}
