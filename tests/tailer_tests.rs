use std::path::Path;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use torque_slack::event::{Event, EventKind, LogSource};
use torque_slack::tailer::LogTailer;

const POLL: Duration = Duration::from_millis(10);
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn start_line(job: u32, name: &str) -> String {
    format!(
        "02/26/2015 00:04:50;S;{}.host;user=alice group=lab jobname={}\n",
        job, name
    )
}

fn end_line(job: u32, exit: i64) -> String {
    format!("02/26/2015 01:00:00;E;{}.host;Exit_status={}\n", job, exit)
}

fn spawn_tailer(
    dir: &Path,
    token: &CancellationToken,
) -> (mpsc::Receiver<Event>, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(64);
    let tailer = LogTailer::new(dir, LogSource::Accounting, POLL, tx, token.clone());
    (rx, tokio::spawn(tailer.run()))
}

async fn append(path: &Path, data: &str) {
    use tokio::io::AsyncWriteExt;
    let mut file = tokio::fs::OpenOptions::new()
        .append(true)
        .open(path)
        .await
        .unwrap();
    file.write_all(data.as_bytes()).await.unwrap();
    file.flush().await.unwrap();
}

async fn recv(rx: &mut mpsc::Receiver<Event>) -> Event {
    timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

#[tokio::test]
async fn replays_existing_file_and_follows_growth() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("20150226");
    tokio::fs::write(&log, start_line(100, "run1")).await.unwrap();

    let token = CancellationToken::new();
    let (mut rx, handle) = spawn_tailer(dir.path(), &token);

    let event = recv(&mut rx).await;
    assert_eq!(event.job_id.numeric_id, "100");
    assert!(matches!(event.kind, EventKind::Start { .. }));

    // Append a new record; the tailer picks it up from its cursor.
    append(&log, &end_line(100, 0)).await;

    let event = recv(&mut rx).await;
    assert_eq!(event.kind, EventKind::End { exit_status: 0 });

    token.cancel();
    timeout(RECV_TIMEOUT, handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn buffers_unterminated_lines() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("20150226");
    let full = start_line(7, "run");
    let (head, tail) = full.split_at(20);
    tokio::fs::write(&log, head).await.unwrap();

    let token = CancellationToken::new();
    let (mut rx, handle) = spawn_tailer(dir.path(), &token);

    // Half a line is not an event.
    assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());

    append(&log, tail).await;
    let event = recv(&mut rx).await;
    assert_eq!(event.job_id.numeric_id, "7");

    token.cancel();
    timeout(RECV_TIMEOUT, handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn switches_to_newer_file_on_rotation() {
    let dir = tempfile::tempdir().unwrap();
    tokio::fs::write(dir.path().join("20150226"), start_line(1, "old"))
        .await
        .unwrap();

    let token = CancellationToken::new();
    let (mut rx, handle) = spawn_tailer(dir.path(), &token);

    let event = recv(&mut rx).await;
    assert_eq!(event.job_id.numeric_id, "1");

    // The scheduler starts a new date-named file; the tailer must follow
    // it from the beginning.
    tokio::time::sleep(Duration::from_millis(50)).await;
    tokio::fs::write(dir.path().join("20150227"), start_line(2, "new"))
        .await
        .unwrap();

    let event = recv(&mut rx).await;
    assert_eq!(event.job_id.numeric_id, "2");

    token.cancel();
    timeout(RECV_TIMEOUT, handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn truncation_resets_the_cursor() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("20150226");
    tokio::fs::write(
        &log,
        format!("{}{}", start_line(10, "longjobname"), end_line(10, 0)),
    )
    .await
    .unwrap();

    let token = CancellationToken::new();
    let (mut rx, handle) = spawn_tailer(dir.path(), &token);
    recv(&mut rx).await;
    recv(&mut rx).await;

    // Rewrite the file shorter than the cursor position.
    tokio::fs::write(&log, start_line(11, "x")).await.unwrap();

    let event = recv(&mut rx).await;
    assert_eq!(event.job_id.numeric_id, "11");

    token.cancel();
    timeout(RECV_TIMEOUT, handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn waits_for_directory_to_appear() {
    let parent = tempfile::tempdir().unwrap();
    let dir = parent.path().join("accounting");

    let token = CancellationToken::new();
    let (mut rx, handle) = spawn_tailer(&dir, &token);

    tokio::time::sleep(Duration::from_millis(50)).await;
    tokio::fs::create_dir_all(&dir).await.unwrap();
    tokio::fs::write(dir.join("20150226"), start_line(3, "late"))
        .await
        .unwrap();

    let event = recv(&mut rx).await;
    assert_eq!(event.job_id.numeric_id, "3");

    token.cancel();
    timeout(RECV_TIMEOUT, handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn malformed_lines_are_skipped_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("20150226");
    tokio::fs::write(
        &log,
        format!("not a log line at all\n{}", start_line(5, "ok")),
    )
    .await
    .unwrap();

    let token = CancellationToken::new();
    let (mut rx, handle) = spawn_tailer(dir.path(), &token);

    let event = recv(&mut rx).await;
    assert_eq!(event.job_id.numeric_id, "5");

    token.cancel();
    timeout(RECV_TIMEOUT, handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn cancellation_stops_the_tailer_promptly() {
    let dir = tempfile::tempdir().unwrap();
    let token = CancellationToken::new();
    let (_rx, handle) = spawn_tailer(dir.path(), &token);

    token.cancel();
    timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
}
