/// Block Template Manager - poll the node and push new work to miners
///
/// Fetches a template on a fixed interval; when the work changes the
/// dispatcher broadcasts fresh jobs to every open connection.

use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time;

use super::rpc_client::NodeClient;
use super::template::BlockTemplate;
use crate::jobs::JobDispatcher;
use crate::metrics::prometheus as metrics;

pub struct TemplateManager {
    node: Arc<dyn NodeClient>,
    dispatcher: Arc<JobDispatcher>,
    update_interval: Duration,
}

impl TemplateManager {
    pub fn new(
        node: Arc<dyn NodeClient>,
        dispatcher: Arc<JobDispatcher>,
        update_interval: Option<Duration>,
    ) -> Self {
        let update_interval = update_interval.unwrap_or(Duration::from_secs(10));
        tracing::info!("TemplateManager: interval={}s", update_interval.as_secs());

        Self {
            node,
            dispatcher,
            update_interval,
        }
    }

    /// Fetch once and broadcast if the work changed. Returns the number of
    /// jobs sent.
    pub async fn poll_once(&self) -> Result<usize> {
        let template = self.node.get_block_template().await?;
        let changed = self
            .dispatcher
            .current_template()
            .await
            .map_or(true, |current| !current.same_work(&template));
        if !changed {
            return Ok(0);
        }

        log_new_template(&template);
        metrics::inc_template_updates();
        Ok(self.dispatcher.update_template(template, Instant::now()).await)
    }

    /// Start the polling loop. The handle is aborted on shutdown.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = time::interval(self.update_interval);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                if self.dispatcher.is_draining() {
                    break;
                }

                if let Err(e) = self.poll_once().await {
                    metrics::inc_template_fetch_errors();
                    tracing::error!("Failed to fetch block template: {}", e);
                }
            }
        })
    }

    /// True when no template is held or it is older than two poll intervals.
    pub async fn is_stale(&self) -> bool {
        match self.dispatcher.current_template().await {
            None => true,
            Some(t) => {
                let now = chrono::Utc::now().timestamp().max(0) as u64;
                now.saturating_sub(t.timestamp) > self.update_interval.as_secs() * 2
            }
        }
    }
}

fn log_new_template(template: &BlockTemplate) {
    tracing::info!(
        "New block template: height={}, nbits={}, difficulty={:.2}, prev_hash={}",
        template.height,
        template.nbits,
        template.block_difficulty(),
        template.prev_hash.get(..16).unwrap_or(&template.prev_hash)
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::TemplateJobBuilder;
    use crate::session::SessionRegistry;
    use crate::test_utils::{template, test_session, FakeNode};

    fn setup(node: Arc<FakeNode>) -> (Arc<JobDispatcher>, TemplateManager) {
        let dispatcher = Arc::new(JobDispatcher::new(
            Arc::new(TemplateJobBuilder::new()),
            Arc::new(SessionRegistry::new(15)),
        ));
        let manager = TemplateManager::new(node, dispatcher.clone(), Some(Duration::from_secs(5)));
        (dispatcher, manager)
    }

    #[tokio::test]
    async fn test_template_manager_creation() {
        let (_, manager) = setup(Arc::new(FakeNode::default()));
        assert_eq!(manager.update_interval, Duration::from_secs(5));
        assert!(manager.is_stale().await);
    }

    #[tokio::test]
    async fn test_poll_broadcasts_only_on_change() {
        let node = Arc::new(FakeNode::default());
        node.set_template(template(10)).await;
        let (dispatcher, manager) = setup(node.clone());

        let (session, mut rx) = test_session("s1", 1.0);
        dispatcher.register(session).await;

        assert_eq!(manager.poll_once().await.unwrap(), 1);
        assert!(rx.try_recv().is_ok());
        assert!(!manager.is_stale().await);

        assert_eq!(manager.poll_once().await.unwrap(), 0);
        assert!(rx.try_recv().is_err());

        node.set_template(template(11)).await;
        assert_eq!(manager.poll_once().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_fetch_error_keeps_previous_template() {
        let node = Arc::new(FakeNode::default());
        let (dispatcher, manager) = setup(node);
        assert!(manager.poll_once().await.is_err());
        assert!(dispatcher.current_template().await.is_none());
    }
}
