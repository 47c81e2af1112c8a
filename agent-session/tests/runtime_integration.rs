//! End-to-end tests against real PTY sessions.
//!
//! These spawn `sh`/`cat` children, so they assume a POSIX environment.

use std::sync::Arc;
use std::time::{Duration, Instant};

use agent_session::queue::{CommandOp, CommandPhase};
use agent_session::{
    BusEvent, EventBus, PtyBackend, SessionManager, SessionSpec, SessionState,
};

/// An echoing session that prints a banner first so the readiness gate
/// opens, then stays alive until destroyed.
const ECHO_AGENT: &str = "sh -c 'echo booted; exec cat'";

async fn wait_for<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    cond()
}

fn runtime() -> (Arc<SessionManager>, Arc<EventBus>) {
    let bus = Arc::new(EventBus::new());
    let manager = SessionManager::new(Arc::new(PtyBackend::new()), Arc::clone(&bus));
    (manager, bus)
}

#[tokio::test]
async fn session_becomes_ready_after_first_output() {
    let (manager, _bus) = runtime();
    let session = manager
        .create_session(SessionSpec::new("ready-check", ECHO_AGENT))
        .await
        .expect("session spawns");

    let ready = manager
        .wait_ready(&session.id, Duration::from_secs(10))
        .await
        .unwrap();
    assert!(ready, "banner output should open the readiness gate");

    manager.destroy_session(&session.id).await.unwrap();
}

#[tokio::test]
async fn command_round_trip_completes() {
    let (manager, _bus) = runtime();
    let session = manager
        .create_session(SessionSpec::new("round-trip", ECHO_AGENT))
        .await
        .expect("session spawns");
    manager
        .wait_ready(&session.id, Duration::from_secs(10))
        .await
        .unwrap();

    let cmd = manager
        .enqueue_command(
            &session.id,
            CommandOp::SendText,
            serde_json::json!({"text": "marker-42\n"}),
        )
        .await
        .expect("command accepted");

    // cat echoes the marker back; silence flush plus quiescence completes
    // the command.
    let session_for_poll = Arc::clone(&session);
    let done = wait_for(
        || {
            session_for_poll
                .command(&cmd)
                .map(|r| r.phase == CommandPhase::Completed)
                .unwrap_or(false)
        },
        Duration::from_secs(15),
    )
    .await;
    assert!(done, "command should reach completed: {:?}", session.command(&cmd));

    let echoed = session
        .parsed_output(50)
        .iter()
        .any(|l| l.text.contains("marker-42"));
    assert!(echoed, "parsed ring should contain the echoed marker");

    manager.destroy_session(&session.id).await.unwrap();
}

#[tokio::test]
async fn destroyed_session_ends_in_a_terminal_state() {
    let (manager, _bus) = runtime();
    let session = manager
        .create_session(SessionSpec::new("teardown", ECHO_AGENT))
        .await
        .unwrap();
    manager
        .wait_ready(&session.id, Duration::from_secs(10))
        .await
        .unwrap();

    manager.destroy_session(&session.id).await.unwrap();
    let session_for_poll = Arc::clone(&session);
    let closed = wait_for(
        || session_for_poll.state().is_terminal(),
        Duration::from_secs(10),
    )
    .await;
    assert!(closed, "state: {:?}", session.state());
    // Explicit destruction is completion, not failure.
    assert_eq!(session.state(), SessionState::Completed);
}

#[tokio::test]
async fn abrupt_exit_without_signal_is_failure() {
    let (manager, _bus) = runtime();
    // Exits on its own shortly after the banner, with no completion marker.
    let session = manager
        .create_session(SessionSpec::new("crash", "sh -c 'echo booted; sleep 1'"))
        .await
        .unwrap();

    let session_for_poll = Arc::clone(&session);
    let closed = wait_for(
        || session_for_poll.state().is_terminal(),
        Duration::from_secs(15),
    )
    .await;
    assert!(closed);
    assert_eq!(session.state(), SessionState::Failed);
}

#[tokio::test]
async fn bus_carries_terminal_data_for_subscribers() {
    let (manager, bus) = runtime();
    let sub = bus.subscribe(None);
    // Handshake first.
    match sub.recv().await {
        Some(BusEvent::Windows { .. }) => {}
        other => panic!("expected windows handshake, got {:?}", other),
    }

    let session = manager
        .create_session(SessionSpec::new("bus-check", ECHO_AGENT))
        .await
        .unwrap();

    let got_banner = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match sub.recv().await {
                Some(BusEvent::TerminalData { session_id, text }) => {
                    if session_id == session.id && text.contains("booted") {
                        break true;
                    }
                }
                Some(_) => {}
                None => break false,
            }
        }
    })
    .await
    .unwrap_or(false);
    assert!(got_banner, "raw banner bytes should reach the bus");

    manager.destroy_session(&session.id).await.unwrap();
}
