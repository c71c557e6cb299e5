use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::correlator::Correlator;
use crate::error::{Result, TorqueSlackError};
use crate::event::{Event, LogSource};
use crate::notice::LifecycleNotice;
use crate::slack::SlackWebhook;
use crate::tailer::LogTailer;

/// Bounded hand-off from the tailers to the correlator. Sends block when
/// full, so ingestion backpressures instead of buffering without limit.
const EVENT_CHANNEL_CAPACITY: usize = 1024;
const NOTICE_CHANNEL_CAPACITY: usize = 256;

/// Run the daemon until the token is cancelled.
///
/// Wiring: one tailer task per log directory feeds the shared event
/// channel; the correlator consumes it sequentially on this task (its
/// state needs no locks that way); notices flow through a second channel
/// to the webhook poster task. On cancellation the tailers stop and drop
/// their senders, the correlator drains everything already queued, and the
/// poster drains the remaining notices before `run` returns.
pub async fn run(config: Config, dry_run: bool, token: CancellationToken) -> Result<()> {
    if !dry_run && config.webhook_url.is_none() {
        return Err(TorqueSlackError::MissingWebhookUrl);
    }

    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (notice_tx, notice_rx) = mpsc::channel(NOTICE_CHANNEL_CAPACITY);

    let poll_interval = Duration::from_millis(config.poll_interval_ms);
    let accounting = LogTailer::new(
        config.accounting_dir(),
        LogSource::Accounting,
        poll_interval,
        event_tx.clone(),
        token.clone(),
    );
    let server = LogTailer::new(
        config.server_log_dir(),
        LogSource::Server,
        poll_interval,
        event_tx,
        token.clone(),
    );
    let accounting_handle = tokio::spawn(accounting.run());
    let server_handle = tokio::spawn(server.run());

    let poster_handle = if dry_run {
        tokio::spawn(log_notices(notice_rx))
    } else {
        // Checked above.
        let endpoint = config.webhook_url.clone().ok_or(TorqueSlackError::MissingWebhookUrl)?;
        let webhook = SlackWebhook::new(
            endpoint,
            config.username.clone(),
            config.channel.clone(),
            Duration::from_secs(config.min_post_delay_secs),
            token.clone(),
        );
        tokio::spawn(webhook.run(notice_rx))
    };

    let correlator = build_correlator(&config);
    correlator_loop(correlator, event_rx, notice_tx, token).await;

    // The notice sender is dropped by now; the poster exits once it has
    // drained its channel.
    let _ = poster_handle.await;
    let _ = accounting_handle.await;
    let _ = server_handle.await;

    Ok(())
}

fn build_correlator(config: &Config) -> Correlator {
    let mut correlator =
        Correlator::new().with_retention(chrono::Duration::days(i64::from(config.retention_days)));

    if let Some(users) = &config.users {
        correlator = correlator.with_allowed_users(users.iter().cloned());
    }
    if let Some(groups) = &config.groups {
        correlator = correlator.with_allowed_groups(groups.iter().cloned());
    }
    if !config.replay_history {
        correlator = correlator.with_ignore_before(chrono::Local::now().naive_local());
    }

    correlator
}

/// The single consumer of the event channel. Cancellation does not abandon
/// queued events: once the tailers stop and release their senders, the
/// channel closes and the drain loop sees the end of the stream.
async fn correlator_loop(
    mut correlator: Correlator,
    mut events: mpsc::Receiver<Event>,
    notices: mpsc::Sender<LifecycleNotice>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            maybe = events.recv() => match maybe {
                Some(event) => dispatch(&mut correlator, event, &notices).await,
                None => break,
            },
            _ = token.cancelled() => {
                tracing::info!("Shutting down, draining queued events");
                while let Some(event) = events.recv().await {
                    dispatch(&mut correlator, event, &notices).await;
                }
                break;
            }
        }
    }
    tracing::info!(tracked_jobs = correlator.tracked_jobs(), "Correlator stopped");
}

async fn dispatch(
    correlator: &mut Correlator,
    event: Event,
    notices: &mpsc::Sender<LifecycleNotice>,
) {
    if let Some(notice) = correlator.handle_event(event) {
        if notices.send(notice).await.is_err() {
            tracing::warn!("Notice channel closed, dropping notice");
        }
    }
}

/// Dry-run sink: log notices instead of posting them.
async fn log_notices(mut notices: mpsc::Receiver<LifecycleNotice>) {
    while let Some(notice) = notices.recv().await {
        tracing::info!(
            severity = ?notice.severity,
            title = %notice.title,
            body = notice.body.as_deref().unwrap_or(""),
            "Notice (dry run)"
        );
    }
}
