//! End-to-end dispatch through the real `fibril execute-payload` child.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;

use fibril_process::crypto;
use fibril_process::jobs::{Sleep, WriteFile};
use fibril_process::{DEADLINE_EXIT_CODE, Envelope, PayloadStore};
use fibril_types::{CipherId, ThrottleMode};

use crate::common::{SECRET, TestEnv, stderr, wait_for};

fn write_job(env: &TestEnv, name: &str, contents: &str) -> WriteFile {
    WriteFile {
        path: env.root().join(name),
        contents: contents.to_string(),
        append: false,
    }
}

#[cfg(unix)]
async fn round_trip(encrypted: bool) {
    let env = TestEnv::with_encryption(encrypted);
    let dispatcher = env.dispatcher();
    let job = write_job(&env, "out.txt", "from the child");

    let pid = dispatcher
        .dispatch(&job, env.options().label("round-trip"))
        .await
        .unwrap()
        .expect("child pid");

    assert!(
        wait_for(Duration::from_secs(10), || job.path.exists()),
        "child never wrote its output"
    );
    assert!(wait_for(Duration::from_secs(10), || {
        !env.dirs().pids().contains(pid)
    }));
    assert_eq!(fs::read_to_string(&job.path).unwrap(), "from the child");
    assert!(env.dirs().payloads().files().unwrap().is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn plaintext_payload_round_trip() {
    round_trip(false).await;
}

#[cfg(unix)]
#[tokio::test]
async fn encrypted_payload_round_trip() {
    round_trip(true).await;
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn instant_jobs_leave_no_pid_records() {
    let env = TestEnv::new();
    let dispatcher = env.dispatcher();
    let job = Sleep {
        millis: 0,
        heartbeat: false,
    };

    let mut pids = Vec::new();
    for _ in 0..20 {
        let pid = dispatcher
            .dispatch(&job, env.options())
            .await
            .unwrap()
            .expect("child pid");
        pids.push(pid);
    }

    let store = env.dirs().pids();
    assert!(
        wait_for(Duration::from_secs(15), || store.count() == 0),
        "records left behind: {:?}",
        store.entries().unwrap()
    );
    assert_eq!(pids.len(), 20);
}

#[cfg(unix)]
#[tokio::test]
async fn pid_record_describes_the_spawn() {
    let env = TestEnv::new();
    let job = Sleep {
        millis: 2_000,
        heartbeat: false,
    };
    let pid = env
        .dispatcher()
        .dispatch(&job, env.options().label("sleeper"))
        .await
        .unwrap()
        .unwrap();

    let record = env.dirs().pids().read(pid).unwrap();
    assert_eq!(record.pid, pid);
    assert_eq!(record.label.as_deref(), Some("sleeper"));
    assert_eq!(record.command[1], "execute-payload");
    assert_eq!(record.command.last().map(String::as_str), record.payload_path.to_str());
    assert_eq!(record.uuid.len(), 16);

    let _ = env.reaper().kill(pid).await;
}

#[cfg(unix)]
#[tokio::test]
async fn captured_output_lands_in_log_on_timeout() {
    let env = TestEnv::new();
    let job = Sleep {
        millis: 5_000,
        heartbeat: false,
    };
    let options = env
        .options()
        .timeout(Duration::from_millis(200))
        .capture_output();
    let pid = env.dispatcher().dispatch(&job, options).await.unwrap().unwrap();
    let record = env.dirs().pids().read(pid).unwrap();
    let log = PayloadStore::log_path_for(&record.payload_path);

    assert!(wait_for(Duration::from_secs(10), || {
        !env.dirs().pids().contains(pid)
    }));
    assert!(wait_for(Duration::from_secs(5), || {
        fs::read_to_string(&log).is_ok_and(|text| text.contains("exceeded its timeout"))
    }));
}

#[cfg(unix)]
#[tokio::test]
async fn reject_throttle_leaves_no_new_record() {
    let env = TestEnv::new();
    let mut process = env.process_config();
    process.max_concurrency = 1;
    process.throttle_mode = ThrottleMode::Reject;
    let dispatcher = env.dispatcher_with(process);
    let sleeper = Sleep {
        millis: 3_000,
        heartbeat: false,
    };

    let first = dispatcher
        .dispatch(&sleeper, env.options())
        .await
        .unwrap()
        .unwrap();
    let err = dispatcher
        .dispatch(&sleeper, env.options())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("throttled by max_concurrency"));
    assert_eq!(env.dirs().pids().count(), 1);

    let _ = env.reaper().kill(first).await;
}

#[cfg(unix)]
#[tokio::test]
async fn wait_throttle_proceeds_after_slot_frees() {
    let env = TestEnv::new();
    let mut process = env.process_config();
    process.max_concurrency = 1;
    process.throttle_mode = ThrottleMode::Wait;
    process.throttle_wait_max_seconds = 20;
    process.throttle_wait_interval_ms = 25;
    let dispatcher = env.dispatcher_with(process);

    let short = Sleep {
        millis: 300,
        heartbeat: false,
    };
    dispatcher
        .dispatch(&short, env.options())
        .await
        .unwrap()
        .unwrap();
    let job = write_job(&env, "second.txt", "admitted");
    dispatcher
        .dispatch(&job, env.options())
        .await
        .unwrap()
        .unwrap();

    assert!(wait_for(Duration::from_secs(10), || job.path.exists()));
}

fn sealed_payload(env: &TestEnv, job: &WriteFile, timestamp: i64) -> PathBuf {
    let dirs = env.dirs();
    dirs.ensure();
    let blob = Envelope::for_job(job).unwrap().to_blob().unwrap();
    let payload = crypto::seal(
        &blob,
        SECRET.as_bytes(),
        Some(CipherId::Aes256Gcm),
        None,
        timestamp,
    )
    .unwrap();
    dirs.payloads().create(&payload).unwrap()
}

#[test]
fn execute_payload_refuses_tampering() {
    let env = TestEnv::new();
    let job = write_job(&env, "never.txt", "x");
    let path = sealed_payload(&env, &job, Utc::now().timestamp());
    let mut payload = PayloadStore::read(&path).unwrap();
    payload.hmac = "ff".repeat(32);
    fs::write(&path, serde_json::to_vec(&payload).unwrap()).unwrap();

    let output = env.fibril(&["execute-payload", path.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("HMAC mismatch"));
    assert!(!path.exists(), "refused payload must still be consumed");
    assert!(!job.path.exists());
}

#[test]
fn execute_payload_refuses_paths_outside_payload_dir() {
    let env = TestEnv::new();
    let stray = env.root().join("stray.json");
    fs::write(&stray, "{}").unwrap();

    let output = env.fibril(&["execute-payload", stray.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stray.exists());
}

#[test]
fn execute_payload_exits_124_on_deadline() {
    let env = TestEnv::new();
    let dirs = env.dirs();
    dirs.ensure();
    let blob = Envelope::for_job(&Sleep {
        millis: 5_000,
        heartbeat: false,
    })
    .unwrap()
    .to_blob()
    .unwrap();
    let payload =
        crypto::seal(&blob, SECRET.as_bytes(), None, None, Utc::now().timestamp()).unwrap();
    let path = dirs.payloads().create(&payload).unwrap();

    let output = env
        .fibril_command(&["execute-payload", path.to_str().unwrap()])
        .env("FIBRIL_TIMEOUT_MS", "100")
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(DEADLINE_EXIT_CODE));
}
