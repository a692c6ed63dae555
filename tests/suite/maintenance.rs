//! `list-processes`, `clean-stale`, `optimize`, `kill-process`, and `schedule`.

use std::fs;
use std::path::PathBuf;
use std::process::{self, Command};

use chrono::Utc;
use serde_json::Value;

use fibril_types::{Pid, ProcessRecord};

use crate::common::{TestEnv, stderr, stdout};

fn track(env: &TestEnv, pid: u32, label: &str) -> Pid {
    let dirs = env.dirs();
    dirs.ensure();
    let pid = Pid::new(pid).unwrap();
    let record = ProcessRecord {
        pid,
        command: vec!["fibril".into(), "execute-payload".into()],
        payload_path: PathBuf::from("/tmp/fibril_test.json"),
        label: Some(label.into()),
        created_at: Utc::now(),
        uuid: "0123456789abcdef".into(),
        started_at_ms: fibril_utils::process_started_at_unix_ms(pid.value()),
    };
    dirs.pids().write(&record).unwrap();
    pid
}

#[cfg(unix)]
fn exited_pid() -> u32 {
    let mut child = Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    pid
}

#[test]
fn list_reports_liveness_as_json() {
    let env = TestEnv::new();
    track(&env, process::id(), "self");

    let output = env.fibril(&["list-processes", "--json"]);
    assert!(output.status.success(), "{}", stderr(&output));
    let rows: Value = serde_json::from_str(&stdout(&output)).unwrap();
    let row = &rows.as_array().unwrap()[0];
    assert_eq!(row["pid"], process::id());
    assert_eq!(row["status"], "alive");
    assert_eq!(row["label"], "self");
}

#[test]
fn list_without_records_says_so() {
    let env = TestEnv::new();
    let output = env.fibril(&["list-processes"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("No tracked processes."));
}

#[cfg(unix)]
#[test]
fn clean_stale_removes_only_dead_records() {
    let env = TestEnv::new();
    let dead = track(&env, exited_pid(), "gone");
    let live = track(&env, process::id(), "here");

    let output = env.fibril(&["clean-stale"]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(stdout(&output).contains("Removed 1 stale PID files."));
    assert!(!env.dirs().pids().contains(dead));
    assert!(env.dirs().pids().contains(live));
}

#[cfg(unix)]
#[test]
fn optimize_leaves_payloads_alone() {
    let env = TestEnv::new();
    track(&env, exited_pid(), "gone");
    let payload = env.dirs().payloads().dir().join("fibril_orphan.json");
    fs::write(&payload, "{}").unwrap();

    let output = env.fibril(&["optimize"]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert_eq!(env.dirs().pids().count(), 0);
    assert!(payload.exists());

    let output = env.fibril(&["clean-stale", "--payloads"]);
    assert!(stdout(&output).contains("Removed 0 old payload files."));
    assert!(payload.exists(), "fresh payloads are within the TTL");
}

#[test]
fn kill_refuses_unmanaged_and_invalid_pids() {
    let env = TestEnv::new();

    let output = env.fibril(&["kill-process", &process::id().to_string()]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("not managed by fibril"));

    for raw in ["0", "-5", "abc"] {
        let output = env.fibril(&["kill-process", raw]);
        assert_eq!(output.status.code(), Some(1), "{raw}");
        assert!(stderr(&output).contains("invalid PID"), "{raw}");
    }
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn kill_terminates_dispatched_child() {
    use fibril_process::jobs::Sleep;

    let env = TestEnv::new();
    let pid = env
        .dispatcher()
        .dispatch(
            &Sleep {
                millis: 30_000,
                heartbeat: false,
            },
            env.options(),
        )
        .await
        .unwrap()
        .unwrap();

    let output = env.fibril(&["kill-process", &pid.to_string()]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(stdout(&output).contains(&format!("Process {pid}")));
    assert!(!env.dirs().pids().contains(pid));
}

#[test]
fn schedule_prints_enabled_tasks() {
    let env = TestEnv::new();
    let output = env.fibril(&["schedule"]);
    assert!(output.status.success(), "{}", stderr(&output));
    let text = stdout(&output);
    assert!(text.contains("process_clean\t0 * * * *\tfibril clean-stale --payloads"));
    assert!(!text.contains("process_optimize"));
}
