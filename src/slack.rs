use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::notice::{LifecycleNotice, Severity};

const INITIAL_RETRY_BACKOFF: Duration = Duration::from_secs(1);
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(60);

/// Slack incoming-webhook message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Attachment>>,
}

/// Slack message attachment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attachment {
    pub fallback: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Escape text for Slack message markup.
pub fn escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn severity_color(severity: Severity) -> Option<String> {
    match severity {
        Severity::Info => None,
        Severity::Good => Some("good".to_string()),
        Severity::Danger => Some("danger".to_string()),
    }
}

/// Build the webhook payload for one lifecycle notice.
pub fn message_for(
    notice: &LifecycleNotice,
    username: Option<&str>,
    channel: Option<&str>,
) -> Message {
    Message {
        text: None,
        username: username.map(str::to_string),
        channel: channel.map(str::to_string),
        attachments: Some(vec![Attachment {
            fallback: escape(&notice.title),
            color: severity_color(notice.severity),
            title: Some(escape(&notice.title)),
            text: notice.body.as_deref().map(escape),
        }]),
    }
}

/// Posts notices to a Slack incoming webhook, in order.
///
/// Ordering is guaranteed, delivery is best effort: transient transport
/// errors and 429 rate limiting are retried with backoff, but a permanent
/// HTTP rejection drops the notice with a logged error. Once the
/// cancellation token fires, each remaining notice gets a single attempt
/// and retry loops stop.
pub struct SlackWebhook {
    endpoint: String,
    username: Option<String>,
    channel: Option<String>,
    min_post_delay: Duration,
    client: reqwest::Client,
    token: CancellationToken,
}

impl SlackWebhook {
    pub fn new(
        endpoint: String,
        username: Option<String>,
        channel: Option<String>,
        min_post_delay: Duration,
        token: CancellationToken,
    ) -> Self {
        Self {
            endpoint,
            username,
            channel,
            min_post_delay,
            client: reqwest::Client::new(),
            token,
        }
    }

    /// Consume the notice channel until it closes.
    pub async fn run(self, mut notices: mpsc::Receiver<LifecycleNotice>) {
        while let Some(notice) = notices.recv().await {
            tracing::info!(title = %notice.title, "Posting notice");
            let message = message_for(&notice, self.username.as_deref(), self.channel.as_deref());
            let cooldown = self.post_with_retry(&message).await;

            // Pause between posts to avoid flooding; skip once shutting
            // down so the drain finishes promptly.
            let wait = cooldown.max(self.min_post_delay);
            if !self.token.is_cancelled() {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }
        tracing::info!("Webhook poster stopped");
    }

    /// Post one message, retrying transient failures. Returns any
    /// server-requested cooldown still owed after a successful post.
    async fn post_with_retry(&self, message: &Message) -> Duration {
        let mut backoff = INITIAL_RETRY_BACKOFF;

        loop {
            match self.post_once(message).await {
                Ok(None) => return Duration::ZERO,
                Ok(Some(retry_after)) => {
                    tracing::warn!(
                        retry_after_secs = retry_after.as_secs(),
                        "Webhook rate limited"
                    );
                    if self.token.is_cancelled() {
                        return Duration::ZERO;
                    }
                    tokio::select! {
                        _ = self.token.cancelled() => return Duration::ZERO,
                        _ = tokio::time::sleep(retry_after.max(backoff)) => {}
                    }
                }
                Err(err) if err.is_status() => {
                    tracing::error!(error = %err, "Webhook rejected message, dropping notice");
                    return Duration::ZERO;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "Webhook post failed, retrying");
                    if self.token.is_cancelled() {
                        return Duration::ZERO;
                    }
                    tokio::select! {
                        _ = self.token.cancelled() => return Duration::ZERO,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
            backoff = (backoff * 2).min(MAX_RETRY_BACKOFF);
        }
    }

    /// One delivery attempt. `Ok(Some(d))` means the server asked us to
    /// back off for `d` (HTTP 429).
    async fn post_once(&self, message: &Message) -> Result<Option<Duration>, reqwest::Error> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(message)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::ZERO);
            return Ok(Some(retry_after));
        }

        response.error_for_status()?;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notice::Severity;

    #[test]
    fn escapes_slack_markup() {
        assert_eq!(escape("a<b>&c"), "a&lt;b&gt;&amp;c");
        assert_eq!(escape("plain"), "plain");
    }

    #[test]
    fn message_payload_shape() {
        let notice = LifecycleNotice {
            severity: Severity::Danger,
            title: "alice: Job 1 (x<y) has finished in 5s, exit 1".to_string(),
            body: Some("1 of 2 tasks failed".to_string()),
        };
        let message = message_for(&notice, Some("torque"), Some("#cluster"));
        let value = serde_json::to_value(&message).unwrap();

        assert_eq!(value["username"], "torque");
        assert_eq!(value["channel"], "#cluster");
        assert!(value.get("text").is_none());
        let attachment = &value["attachments"][0];
        assert_eq!(attachment["color"], "danger");
        assert_eq!(
            attachment["title"],
            "alice: Job 1 (x&lt;y) has finished in 5s, exit 1"
        );
        assert_eq!(attachment["text"], "1 of 2 tasks failed");
    }

    #[test]
    fn info_notices_have_no_color() {
        let notice = LifecycleNotice {
            severity: Severity::Info,
            title: "alice: Job 1 (x) is now running".to_string(),
            body: None,
        };
        let message = message_for(&notice, None, None);
        let attachment = &message.attachments.unwrap()[0];
        assert!(attachment.color.is_none());
        assert!(attachment.text.is_none());
        assert_eq!(message.username, None);
    }
}
