//! Best-effort webhook fan-out.
//!
//! Notifications are handed to a bounded queue and delivered by a background
//! worker. There is no retry and no acknowledgement: a full queue drops the
//! job, and a failed POST is logged and forgotten.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use parley_shared::Notification;

const QUEUE_CAPACITY: usize = 256;

/// Outbound delivery of one notification to one endpoint.
pub trait WebhookTransport: Send + Sync {
    fn deliver<'a>(
        &'a self,
        url: &'a str,
        notification: &'a Notification,
    ) -> BoxFuture<'a, anyhow::Result<()>>;
}

/// JSON POST over HTTP.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build webhook client: {e}"))?;
        Ok(Self { client })
    }
}

impl WebhookTransport for HttpTransport {
    fn deliver<'a>(
        &'a self,
        url: &'a str,
        notification: &'a Notification,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let response = self.client.post(url).json(notification).send().await?;
            let status = response.status();
            if !status.is_success() {
                anyhow::bail!("webhook returned status {status}");
            }
            Ok(())
        })
    }
}

struct WebhookJob {
    urls: Vec<String>,
    notification: Notification,
}

#[derive(Clone)]
pub struct WebhookQueue {
    tx: mpsc::Sender<WebhookJob>,
}

impl WebhookQueue {
    /// Start the delivery worker and return the queue feeding it.
    pub fn spawn(transport: Arc<dyn WebhookTransport>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<WebhookJob>(QUEUE_CAPACITY);

        let worker = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let notification = Arc::new(job.notification);
                for url in job.urls {
                    let transport = transport.clone();
                    let notification = notification.clone();
                    tokio::spawn(async move {
                        match transport.deliver(&url, &notification).await {
                            Ok(()) => debug!(url = %url, id = notification.id, "Webhook delivered"),
                            Err(e) => warn!(url = %url, error = %e, "Webhook delivery failed"),
                        }
                    });
                }
            }
            debug!("Webhook queue closed");
        });

        (Self { tx }, worker)
    }

    /// Hand a notification to the worker without waiting.
    pub fn enqueue(&self, urls: Vec<String>, notification: Notification) {
        if urls.is_empty() {
            return;
        }
        if let Err(e) = self.tx.try_send(WebhookJob { urls, notification }) {
            warn!(error = %e, "Dropping webhook job");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use chrono::Utc;
    use parley_shared::NotificationKind;
    use tokio::sync::Mutex;

    use super::*;

    /// Transport that records deliveries and fails for urls containing "fail".
    #[derive(Default)]
    pub(crate) struct RecordingTransport {
        pub delivered: Mutex<Vec<(String, u64)>>,
    }

    impl WebhookTransport for RecordingTransport {
        fn deliver<'a>(
            &'a self,
            url: &'a str,
            notification: &'a Notification,
        ) -> BoxFuture<'a, anyhow::Result<()>> {
            Box::pin(async move {
                if url.contains("fail") {
                    anyhow::bail!("unreachable");
                }
                self.delivered
                    .lock()
                    .await
                    .push((url.to_string(), notification.id));
                Ok(())
            })
        }
    }

    fn notification(id: u64) -> Notification {
        Notification {
            id,
            user_id: "bob".to_string(),
            kind: NotificationKind::NewMessage,
            message: "New message from alice".to_string(),
            read: false,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_fan_out_ignores_failures() {
        let transport = Arc::new(RecordingTransport::default());
        let (queue, worker) = WebhookQueue::spawn(transport.clone());

        queue.enqueue(
            vec!["http://a.test".into(), "http://fail.test".into(), "http://b.test".into()],
            notification(7),
        );
        drop(queue);
        worker.await.unwrap();

        // Deliveries run on their own tasks; give them a moment.
        for _ in 0..50 {
            if transport.delivered.lock().await.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let mut delivered = transport.delivered.lock().await.clone();
        delivered.sort();
        assert_eq!(
            delivered,
            vec![("http://a.test".to_string(), 7), ("http://b.test".to_string(), 7)]
        );
    }
}
