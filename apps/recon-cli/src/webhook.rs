use std::time::Duration;

use anyhow::{bail, Result};
use recon_core::notify::render_message;
use recon_core::store::Artifact;
use recon_core::Notifier;
use reqwest::Client;

/// Posts each emitted brief to a chat webhook as `{"content": ...}`.
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait::async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn notify(&self, artifact: &Artifact) -> Result<()> {
        let body = serde_json::json!({ "content": render_message(artifact) });
        let resp = self.client.post(&self.url).json(&body).send().await?;
        if !resp.status().is_success() {
            bail!("webhook answered {}", resp.status());
        }
        Ok(())
    }
}
