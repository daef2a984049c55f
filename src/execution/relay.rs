use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::models::event::WebhookEvent;

/// Re-posts every accepted webhook verbatim to a configured URL.
/// Fire-and-forget: failures are logged and never retried.
pub struct WebhookRelay {
    http: reqwest::Client,
    url: String,
}

impl WebhookRelay {
    pub fn new(url: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("Failed to build HTTP client");
        Self { http, url }
    }

    pub fn spawn(
        self,
        mut webhooks: broadcast::Receiver<WebhookEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    ev = webhooks.recv() => match ev {
                        Ok(ev) => {
                            match self.http.post(&self.url).json(&ev.raw).send().await {
                                Ok(resp) if resp.status().is_success() => {
                                    debug!("Relayed webhook for {}", ev.symbol);
                                }
                                Ok(resp) => warn!("Relay HTTP {}", resp.status()),
                                Err(e) => warn!("Relay failed: {e}"),
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Relay lagged {n} webhooks");
                        }
                        Err(_) => break,
                    },
                    _ = shutdown.recv() => break,
                }
            }
            info!("Webhook relay stopped");
        })
    }
}
