use std::sync::Arc;

use recon_store::Artifact;
use tokio::task::{AbortHandle, JoinSet};

/// Best-effort sink for emitted artifacts. Failures are logged, never propagated.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn notify(&self, artifact: &Artifact) -> anyhow::Result<()>;
}

pub type SharedNotifier = Arc<dyn Notifier>;

#[derive(Clone, Debug, Default)]
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, artifact: &Artifact) -> anyhow::Result<()> {
        tracing::info!(
            target: "recon::notify",
            artifact_id = %artifact.artifact_id,
            target_id = %artifact.target,
            events = artifact.event_count,
            "{}",
            artifact.summary_text
        );
        Ok(())
    }
}

/// Plain-text rendering used by chat-style sinks.
pub fn render_message(artifact: &Artifact) -> String {
    let mut lines = vec![
        format!("**Brief for {}**", artifact.target),
        artifact.summary_text.clone(),
    ];
    if let Some(score) = artifact.signals.get("activity_score") {
        lines.push(format!(
            "events: {} | activity: {:.2}",
            artifact.event_count, score
        ));
    }
    if !artifact.next_watchlist.is_empty() {
        lines.push(format!("watchlist: {}", artifact.next_watchlist.join(", ")));
    }
    lines.push(format!(
        "artifact `{}` at {}",
        &artifact.artifact_id[..artifact.artifact_id.len().min(12)],
        artifact.created_at.to_rfc3339()
    ));
    lines.join("\n")
}

/// Fire-and-forget delivery. The task joins `tasks` so a caller can wait for it before the
/// runtime goes away; finished tasks are reaped on each call.
pub fn spawn_notify(
    tasks: &mut JoinSet<()>,
    notifier: SharedNotifier,
    artifact: Artifact,
) -> AbortHandle {
    while tasks.try_join_next().is_some() {}
    tasks.spawn(async move {
        if let Err(err) = notifier.notify(&artifact).await {
            tracing::warn!(
                target: "recon::notify",
                notifier = notifier.name(),
                artifact_id = %artifact.artifact_id,
                error = %err,
                "notification failed"
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use recon_store::from_unix;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn artifact() -> Artifact {
        Artifact {
            artifact_id: "abcdef0123456789".into(),
            target: "0xw".into(),
            created_at: from_unix(0),
            summary_text: "quiet day".into(),
            signals: [("activity_score".to_string(), 0.75)].into_iter().collect(),
            next_watchlist: vec!["P1".into(), "P2".into()],
            source_ids: Default::default(),
            event_count: 9,
            summary_model: None,
            summary_tokens: None,
        }
    }

    #[test]
    fn message_lists_watchlist_and_short_id() {
        let msg = render_message(&artifact());
        assert!(msg.starts_with("**Brief for 0xw**"));
        assert!(msg.contains("events: 9 | activity: 0.75"));
        assert!(msg.contains("watchlist: P1, P2"));
        assert!(msg.contains("`abcdef012345`"));
    }

    struct Broken(AtomicBool);

    #[async_trait::async_trait]
    impl Notifier for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn notify(&self, _artifact: &Artifact) -> anyhow::Result<()> {
            self.0.store(true, Ordering::SeqCst);
            anyhow::bail!("sink down")
        }
    }

    #[tokio::test]
    async fn failures_stay_inside_the_task() {
        let sink = Arc::new(Broken(AtomicBool::new(false)));
        let mut tasks = JoinSet::new();
        spawn_notify(&mut tasks, sink.clone(), artifact());
        tasks.join_next().await.unwrap().unwrap();
        assert!(sink.0.load(Ordering::SeqCst));
        assert!(tasks.is_empty());
    }
}
