//! End-to-end behaviour of the execution engine against real shell processes.

#![cfg(unix)]

mod common;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use bridge_protocol::StreamName;
use common::{CountingLauncher, FakeControl, lines_from};
use libbridge::denylist::DEFAULT_BLOCKED_PATTERNS;
use libbridge::executor::{BLOCKED_OUTPUT, TIMEOUT_EXIT_CODE, TIMEOUT_OUTPUT};
use libbridge::output::{DEFAULT_MAX_OUTPUT_CHARS, TRUNCATION_MARKER};
use libbridge::{ExecRequest, ExecutionResult, Executor, ExecutorConfig, SessionStore};

fn executor() -> Executor<CountingLauncher> {
    Executor::with_launcher(ExecutorConfig::default(), CountingLauncher::default())
}

fn request(id: &str, command: &str) -> ExecRequest {
    ExecRequest {
        id: id.to_string(),
        command: command.to_string(),
        working_dir: None,
        timeout: Duration::from_secs(20),
        session_id: None,
    }
}

fn in_session(mut req: ExecRequest, session_id: &str, working_dir: Option<&Path>) -> ExecRequest {
    req.session_id = Some(session_id.to_string());
    req.working_dir = working_dir.map(Path::to_path_buf);
    req
}

fn canonical(path: impl AsRef<Path>) -> PathBuf {
    std::fs::canonicalize(path).expect("canonicalize")
}

#[tokio::test]
async fn denylisted_commands_never_spawn() {
    let executor = executor();
    let sink = FakeControl::default();
    let mut sessions = SessionStore::default();

    for pattern in DEFAULT_BLOCKED_PATTERNS {
        let command = format!("echo warming up; {pattern}");
        let result = executor
            .execute(&mut sessions, &sink, request("blocked", &command))
            .await;
        assert_eq!(result, ExecutionResult::new("blocked", BLOCKED_OUTPUT, 1));
    }

    assert_eq!(executor.launcher().spawns(), 0);
    assert!(sink.sent().is_empty());
    assert!(sessions.is_empty());
}

#[tokio::test]
async fn both_streams_are_captured_in_per_origin_order() {
    let executor = executor();
    let sink = FakeControl::default();
    let mut sessions = SessionStore::default();
    let n = 200;
    let script = format!(
        r#"i=1; while [ $i -le {n} ]; do echo "line $i"; echo "line $i" >&2; i=$((i+1)); done"#
    );

    let result = executor
        .execute(&mut sessions, &sink, request("streams", &script))
        .await;
    assert_eq!(result.exit_code, 0);

    let expected: Vec<String> = (1..=n).map(|i| format!("line {i}")).collect();
    let full: Vec<&str> = result.output.lines().collect();
    assert_eq!(full.len(), 2 * n);
    let mut counts = std::collections::HashMap::new();
    for line in &full {
        *counts.entry(*line).or_insert(0) += 1;
    }
    for line in &expected {
        assert_eq!(counts.get(line.as_str()), Some(&2), "missing {line}");
    }

    let streamed = sink.streamed_lines();
    assert_eq!(streamed.len(), 2 * n);
    assert_eq!(lines_from(&streamed, StreamName::Stdout), expected);
    assert_eq!(lines_from(&streamed, StreamName::Stderr), expected);
}

#[tokio::test]
async fn long_running_output_is_streamed_in_batches() {
    let executor = executor();
    let sink = FakeControl::default();
    let mut sessions = SessionStore::default();

    let result = executor
        .execute(
            &mut sessions,
            &sink,
            request("slow", "echo first; sleep 1.2; echo second"),
        )
        .await;
    assert_eq!(result.output, "first\nsecond\n");

    let batches = sink.sent();
    assert!(batches.len() >= 2, "expected separate batches, got {batches:?}");
    assert_eq!(
        lines_from(&sink.streamed_lines(), StreamName::Stdout),
        vec!["first", "second"]
    );
}

#[tokio::test]
async fn timeout_kills_and_reaps_the_child() {
    let executor = executor();
    let sink = FakeControl::default();
    let mut sessions = SessionStore::default();
    let mut req = request("slow", "echo started; sleep 30");
    req.timeout = Duration::from_secs(1);

    let started = Instant::now();
    let result = executor.execute(&mut sessions, &sink, req).await;

    assert_eq!(result, ExecutionResult::new("slow", TIMEOUT_OUTPUT, TIMEOUT_EXIT_CODE));
    assert!(result.is_timeout());
    assert!(started.elapsed() < Duration::from_secs(10));

    // Output captured before the kill was still streamed.
    assert_eq!(
        lines_from(&sink.streamed_lines(), StreamName::Stdout),
        vec!["started"]
    );

    let pids = executor.launcher().pids();
    assert_eq!(pids.len(), 1);
    let pid = libc::pid_t::try_from(pids[0]).unwrap();
    // SAFETY: signal 0 only checks for existence. A zombie would still be
    // found, so ESRCH means the child was reaped.
    let rc = unsafe { libc::kill(pid, 0) };
    assert_eq!(rc, -1);
    assert_eq!(
        std::io::Error::last_os_error().raw_os_error(),
        Some(libc::ESRCH)
    );
}

#[tokio::test]
async fn session_carries_directory_changes_forward() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("sub")).unwrap();
    let executor = executor();
    let sink = FakeControl::default();
    let mut sessions = SessionStore::default();

    let first = executor
        .execute(
            &mut sessions,
            &sink,
            in_session(request("a", "cd sub && true"), "s1", Some(dir.path())),
        )
        .await;
    assert_eq!(first.exit_code, 0);

    let second = executor
        .execute(&mut sessions, &sink, in_session(request("b", "pwd"), "s1", None))
        .await;
    assert_eq!(second.exit_code, 0);
    assert_eq!(canonical(second.output.trim()), canonical(dir.path().join("sub")));
}

#[tokio::test]
async fn failed_command_does_not_move_the_session() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("sub")).unwrap();
    let executor = executor();
    let sink = FakeControl::default();
    let mut sessions = SessionStore::default();

    let first = executor
        .execute(
            &mut sessions,
            &sink,
            in_session(request("a", "cd sub && false"), "s1", Some(dir.path())),
        )
        .await;
    assert_eq!(first.exit_code, 1);

    let second = executor
        .execute(&mut sessions, &sink, in_session(request("b", "pwd"), "s1", None))
        .await;
    assert_eq!(canonical(second.output.trim()), canonical(dir.path()));
}

#[tokio::test]
async fn early_exit_falls_back_to_directory_query() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("sub")).unwrap();
    let executor = executor();
    let sink = FakeControl::default();
    let mut sessions = SessionStore::default();

    let result = executor
        .execute(
            &mut sessions,
            &sink,
            in_session(request("a", "cd sub; exit 0"), "s1", Some(dir.path())),
        )
        .await;
    assert_eq!(result.exit_code, 0);
    // The command plus one fallback `pwd` in the resolved context.
    assert_eq!(executor.launcher().spawns(), 2);
    assert_eq!(
        canonical(&sessions.get("s1").unwrap().cwd),
        canonical(dir.path())
    );
}

#[tokio::test]
async fn oversized_output_is_truncated() {
    let executor = executor();
    let sink = FakeControl::default();
    let mut sessions = SessionStore::default();

    // 30,000 lines of "a\n" is 60,000 characters.
    let result = executor
        .execute(&mut sessions, &sink, request("big", "yes a | head -n 30000"))
        .await;
    assert_eq!(result.exit_code, 0);
    assert_eq!(
        result.output.chars().count(),
        DEFAULT_MAX_OUTPUT_CHARS + TRUNCATION_MARKER.chars().count()
    );
    assert!(result.output.ends_with(TRUNCATION_MARKER));
    assert!(result.output.starts_with("a\na\n"));
}

#[tokio::test]
async fn idle_session_is_expired_before_reuse() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("sub")).unwrap();
    let executor = executor();
    let sink = FakeControl::default();
    let mut sessions = SessionStore::new(Duration::from_millis(100));

    executor
        .execute(
            &mut sessions,
            &sink,
            in_session(request("a", "cd sub && true"), "s1", Some(dir.path())),
        )
        .await;
    assert!(sessions.contains("s1"));

    tokio::time::sleep(Duration::from_millis(250)).await;

    let second = executor
        .execute(&mut sessions, &sink, in_session(request("b", "pwd"), "s1", None))
        .await;
    assert_eq!(
        canonical(second.output.trim()),
        canonical(std::env::current_dir().unwrap())
    );
}

#[tokio::test]
async fn session_env_is_isolated_from_commands() {
    let executor = executor();
    let sink = FakeControl::default();
    let mut sessions = SessionStore::default();

    executor
        .execute(
            &mut sessions,
            &sink,
            in_session(request("a", "export BRIDGE_LEAK=1"), "s1", None),
        )
        .await;
    let second = executor
        .execute(
            &mut sessions,
            &sink,
            in_session(request("b", "echo \"[${BRIDGE_LEAK:-unset}]\""), "s1", None),
        )
        .await;
    assert_eq!(second.output, "[unset]\n");
}

async fn stdout_of(executor: &Executor<CountingLauncher>, req: ExecRequest) -> Vec<String> {
    let sink = FakeControl::default();
    let mut sessions = SessionStore::default();
    let result = executor.execute(&mut sessions, &sink, req).await;
    assert!(
        !result.output.contains("__bridge"),
        "shell plumbing leaked into output: {:?}",
        result.output
    );
    lines_from(&sink.streamed_lines(), StreamName::Stdout)
}

#[tokio::test]
async fn session_mode_does_not_change_command_text() {
    let executor = executor();
    for command in ["cat <<EOF\nhello", "echo a \\", "echo one; echo two"] {
        let plain = stdout_of(&executor, request("plain", command)).await;
        let sessioned = stdout_of(&executor, in_session(request("sess", command), "s1", None)).await;
        assert_eq!(plain, sessioned, "command {command:?}");
    }

    let heredoc = stdout_of(&executor, in_session(request("h", "cat <<EOF\nhello"), "s1", None)).await;
    assert_eq!(heredoc, vec!["hello"]);
}
