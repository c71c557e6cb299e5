use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::decoder;
use crate::event::{Event, LogSource};

const READ_CHUNK_BYTES: usize = 64 * 1024;

/// Follows the active log file inside a scheduler log directory.
///
/// TORQUE rotates logs by opening a new date-named file each day, so the
/// tailer watches the whole directory and treats the most recently modified
/// file as the active log. On first resolution the active file is replayed
/// from the start (the correlator's time filter keeps replayed history from
/// producing notices).
///
/// Growth, rotation to a newer file, truncation, and a missing directory are
/// all handled in the poll loop; only cancellation ends the task. Decoded
/// events go into the shared bounded channel, which provides backpressure
/// when the correlator falls behind.
pub struct LogTailer {
    dir: PathBuf,
    source: LogSource,
    poll_interval: Duration,
    events: mpsc::Sender<Event>,
    token: CancellationToken,
}

#[derive(Default)]
struct Cursor {
    active: Option<PathBuf>,
    offset: u64,
    /// Trailing bytes of an unterminated line, carried across polls.
    partial: String,
}

impl LogTailer {
    pub fn new(
        dir: impl Into<PathBuf>,
        source: LogSource,
        poll_interval: Duration,
        events: mpsc::Sender<Event>,
        token: CancellationToken,
    ) -> Self {
        Self {
            dir: dir.into(),
            source,
            poll_interval,
            events,
            token,
        }
    }

    /// Run until cancelled. Never returns early on I/O errors; a failed
    /// poll is logged and retried on the next tick.
    pub async fn run(self) {
        tracing::info!(dir = %self.dir.display(), source = %self.source, "Starting log tailer");
        let mut cursor = Cursor::default();

        loop {
            match self.poll(&mut cursor).await {
                Ok(true) => {}
                // Event channel closed: the consumer is gone, stop quietly.
                Ok(false) => break,
                Err(err) => {
                    tracing::warn!(
                        dir = %self.dir.display(),
                        error = %err,
                        "Log poll failed, will retry"
                    );
                }
            }

            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        tracing::info!(dir = %self.dir.display(), source = %self.source, "Log tailer stopped");
    }

    /// One poll: resolve the active file, pick up rotation/truncation, read
    /// newly appended bytes, and emit complete lines. Returns `Ok(false)`
    /// when the event channel has closed.
    async fn poll(&self, cursor: &mut Cursor) -> std::io::Result<bool> {
        let Some(path) = resolve_active_file(&self.dir).await? else {
            // Directory missing or empty; keep waiting for logs to appear.
            return Ok(true);
        };

        if cursor.active.as_deref() != Some(path.as_path()) {
            if cursor.active.is_some() {
                tracing::info!(
                    file = %path.display(),
                    "Log rotated, following new file"
                );
            } else {
                tracing::info!(file = %path.display(), "Following log file");
            }
            cursor.active = Some(path.clone());
            cursor.offset = 0;
            cursor.partial.clear();
        }

        let len = fs::metadata(&path).await?.len();
        if len < cursor.offset {
            tracing::warn!(
                file = %path.display(),
                previous_offset = cursor.offset,
                current_size = len,
                "Log file truncated, resetting cursor"
            );
            cursor.offset = 0;
            cursor.partial.clear();
        }
        if len == cursor.offset {
            return Ok(true);
        }

        let mut file = fs::File::open(&path).await?;
        file.seek(SeekFrom::Start(cursor.offset)).await?;

        let mut chunk = vec![0u8; READ_CHUNK_BYTES];
        loop {
            let read = file.read(&mut chunk).await?;
            if read == 0 {
                break;
            }
            cursor.offset += read as u64;
            cursor
                .partial
                .push_str(&String::from_utf8_lossy(&chunk[..read]));

            if !self.drain_complete_lines(cursor).await {
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Decode and forward every complete line buffered in the cursor,
    /// keeping the unterminated tail for the next read.
    async fn drain_complete_lines(&self, cursor: &mut Cursor) -> bool {
        let Some(last_newline) = cursor.partial.rfind('\n') else {
            return true;
        };
        let rest = cursor.partial.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut cursor.partial, rest);

        for line in complete.lines() {
            if line.is_empty() {
                continue;
            }
            match decoder::decode(self.source, line) {
                Ok(Some(event)) => {
                    tracing::debug!(
                        source = %self.source,
                        job = %event.job_id.numeric_id,
                        kind = event.kind.label(),
                        "Decoded event"
                    );
                    if self.events.send(event).await.is_err() {
                        return false;
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::debug!(source = %self.source, error = %err, line, "Skipping line");
                }
            }
        }
        true
    }
}

/// The most recently modified regular file in `dir`, ties broken by file
/// name (TORQUE's `YYYYMMDD` names sort chronologically). `None` when the
/// directory is missing or holds no files.
async fn resolve_active_file(dir: &Path) -> std::io::Result<Option<PathBuf>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };

    let mut newest: Option<(SystemTime, PathBuf)> = None;
    while let Some(entry) = entries.next_entry().await? {
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            // Entry vanished between listing and stat; skip it.
            Err(_) => continue,
        };
        if !metadata.is_file() {
            continue;
        }
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let path = entry.path();
        let candidate = (modified, path);
        newest = match newest {
            Some(current) if current >= candidate => Some(current),
            _ => Some(candidate),
        };
    }

    Ok(newest.map(|(_, path)| path))
}
