//! Graduated termination of real agent processes.

use std::time::{Duration, Instant};

use agent_session::cli::{AgentProcess, SpawnConfig};
use agent_session::session::ErrorContext;
use agent_session::{Session, SessionConfig, SessionError, SessionEvent, SessionState};
use futures_util::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Answers the initialize request, then idles.
const HANDSHAKE_SCRIPT: &str = r#"
read line
id=$(printf '%s' "$line" | sed 's/.*"request_id":"\([^"]*\)".*/\1/')
printf '{"type":"system","subtype":"init","session_id":"proc-1","model":"m"}\n'
printf '{"type":"control_response","response":{"subtype":"success","request_id":"%s","response":{}}}\n' "$id"
exec sleep 30
"#;

fn shell(script: &str) -> SpawnConfig {
    SpawnConfig::new("sh").args(["-c", script])
}

/// Whether `pid` is still running. Zombies awaiting a reaper do not count.
#[cfg(target_os = "linux")]
fn is_running(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .is_some_and(|rest| !rest.trim_start().starts_with('Z')),
        Err(_) => false,
    }
}

#[cfg(target_os = "linux")]
async fn wait_until_gone(pid: u32) -> bool {
    let deadline = Instant::now() + Duration::from_secs(1);
    while is_running(pid) {
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    true
}

#[tokio::test]
async fn stop_kills_process_that_ignores_term() {
    let mut process =
        AgentProcess::spawn(&shell("trap '' TERM; while true; do sleep 1; done")).unwrap();
    // Give the shell time to install its trap.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let grace = Duration::from_millis(300);
    let started = Instant::now();
    process.stop(grace).await.unwrap();
    assert!(started.elapsed() < grace + Duration::from_secs(2));
    assert!(process.is_stopped());
    assert!(process.try_wait().unwrap().is_some());

    // Second stop is a no-op.
    let started = Instant::now();
    process.stop(grace).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(50));
}

#[tokio::test]
async fn stop_returns_early_when_process_exits_on_term() {
    let mut process = AgentProcess::spawn(&shell("exec sleep 30")).unwrap();
    let started = Instant::now();
    process.stop(Duration::from_secs(5)).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn stop_on_exited_process_is_fine() {
    let mut process = AgentProcess::spawn(&shell("exit 0")).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    process.stop(Duration::from_millis(100)).await.unwrap();
}

#[tokio::test]
async fn spawned_session_handshakes_and_stops() {
    let config = SessionConfig {
        executable: "sh".to_string(),
        args: vec!["-c".to_string(), HANDSHAKE_SCRIPT.to_string()],
        initialize_timeout_ms: 5_000,
        shutdown_grace_ms: 300,
        ..SessionConfig::default()
    };
    let session = Session::spawn(config).await.unwrap();
    assert_eq!(session.state(), SessionState::Ready);
    assert!(session.pid().is_some());
    assert_eq!(session.metadata().session_id.as_deref(), Some("proc-1"));

    let started = Instant::now();
    session.stop().await;
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn agent_exit_mid_session_closes_it() {
    let script = HANDSHAKE_SCRIPT.replace("exec sleep 30", "exit 0");
    let config = SessionConfig {
        executable: "sh".to_string(),
        args: vec!["-c".to_string(), script],
        initialize_timeout_ms: 5_000,
        ..SessionConfig::default()
    };
    // The exit can race the end of the handshake.
    let session = match Session::spawn(config).await {
        Ok(session) => session,
        Err(err) => {
            assert!(matches!(err, SessionError::Closed), "unexpected error: {err}");
            return;
        }
    };

    let deadline = Instant::now() + Duration::from_secs(5);
    while !session.is_closed() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(session.is_closed());
    session.stop().await;
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn stop_reaches_descendants_after_agent_exits() {
    let mut process = AgentProcess::spawn(&shell("sleep 30 & echo $!; exit 0")).unwrap();
    let stdout = process.take_stdout().unwrap();
    let orphan: u32 = BufReader::new(stdout)
        .lines()
        .next_line()
        .await
        .unwrap()
        .unwrap()
        .trim()
        .parse()
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while process.try_wait().unwrap().is_none() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(process.try_wait().unwrap().is_some());
    assert!(is_running(orphan));

    process.stop(Duration::from_millis(300)).await.unwrap();
    assert!(wait_until_gone(orphan).await, "background child {orphan} survived stop");
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn stop_waits_for_teardown_started_by_agent_exit() {
    // Closes its output after the handshake but ignores SIGTERM.
    let script = HANDSHAKE_SCRIPT.replace(
        "exec sleep 30",
        "trap '' TERM\nsleep 1\nexec >&-\nwhile true; do sleep 1; done",
    );
    let config = SessionConfig {
        executable: "sh".to_string(),
        args: vec!["-c".to_string(), script],
        initialize_timeout_ms: 5_000,
        shutdown_grace_ms: 1_000,
        ..SessionConfig::default()
    };
    let session = Session::spawn(config).await.unwrap();
    let pid = session.pid().unwrap();
    let mut events = session.take_events().unwrap();

    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = events.next().await {
            if matches!(
                event,
                SessionEvent::Error {
                    context: ErrorContext::Read,
                    ..
                }
            ) {
                return true;
            }
        }
        false
    })
    .await
    .unwrap();
    assert!(closed);

    // Teardown is now inside its grace window.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let started = Instant::now();
    session.stop().await;
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert!(!is_running(pid));

    let ended = tokio::time::timeout(Duration::from_secs(4), async {
        while events.next().await.is_some() {}
    })
    .await;
    assert!(ended.is_ok(), "event stream never closed");
}
