/// Job construction and dispatch
///
/// Every connection gets its own job, built from the current template and
/// that connection's difficulty. A new template supersedes all jobs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use crate::blockchain::BlockTemplate;
use crate::difficulty::target_from_difficulty;
use crate::metrics::prometheus as metrics;
use crate::session::{AssignedJob, Session, SessionRegistry, SharedSession};
use crate::stratum::protocol::ServerMessage;
use crate::vardiff::clamp_difficulty;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub job_id: String,
    pub data: String,
    pub target: String,
}

/// Builds `(job_id, payload, target)` from a template and a difficulty.
pub trait JobBuilder: Send + Sync {
    fn build(&self, template: &BlockTemplate, difficulty: f64) -> Job;
}

/// Header-prefix payload with a monotonically increasing hex job id.
#[derive(Debug, Default)]
pub struct TemplateJobBuilder {
    next_id: AtomicU64,
}

impl TemplateJobBuilder {
    pub fn new() -> Self {
        Self { next_id: AtomicU64::new(1) }
    }
}

impl JobBuilder for TemplateJobBuilder {
    fn build(&self, template: &BlockTemplate, difficulty: f64) -> Job {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Job {
            job_id: format!("{:x}", id),
            data: template.job_data().to_string(),
            target: target_from_difficulty(difficulty),
        }
    }
}

pub struct JobDispatcher {
    builder: Arc<dyn JobBuilder>,
    registry: Arc<SessionRegistry>,
    template: RwLock<Option<Arc<BlockTemplate>>>,
    sessions: RwLock<HashMap<String, SharedSession>>,
    draining: AtomicBool,
}

impl JobDispatcher {
    pub fn new(builder: Arc<dyn JobBuilder>, registry: Arc<SessionRegistry>) -> Self {
        Self {
            builder,
            registry,
            template: RwLock::new(None),
            sessions: RwLock::new(HashMap::new()),
            draining: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub async fn current_template(&self) -> Option<Arc<BlockTemplate>> {
        self.template.read().await.clone()
    }

    /// Store a template. Returns false when it carries the same work as the
    /// one already held.
    pub async fn set_template(&self, template: BlockTemplate) -> bool {
        let mut current = self.template.write().await;
        if current.as_ref().is_some_and(|t| t.same_work(&template)) {
            return false;
        }
        metrics::set_template_height(template.height);
        *current = Some(Arc::new(template));
        true
    }

    /// Store a template and, if it changed, push fresh jobs to everyone.
    pub async fn update_template(&self, template: BlockTemplate, now: Instant) -> usize {
        if !self.set_template(template).await {
            return 0;
        }
        self.broadcast(now).await
    }

    pub async fn register(&self, session: SharedSession) {
        let id = session.read().await.id.clone();
        self.sessions.write().await.insert(id, session);
        metrics::set_active_connections(self.sessions.read().await.len());
    }

    pub async fn unregister(&self, session_id: &str) -> Option<SharedSession> {
        let mut sessions = self.sessions.write().await;
        let removed = sessions.remove(session_id);
        metrics::set_active_connections(sessions.len());
        removed
    }

    /// Snapshot of every registered connection.
    pub async fn sessions(&self) -> Vec<SharedSession> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn connection_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub fn begin_draining(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Assign and send a new job. The caller holds the session's write lock.
    ///
    /// Returns false when there is no template yet, the pool is draining or
    /// the connection is no longer open.
    pub async fn issue_job(&self, session: &mut Session, now: Instant) -> bool {
        if self.is_draining() || !session.is_open() {
            return false;
        }
        let Some(template) = self.current_template().await else {
            return false;
        };

        session.difficulty = clamp_difficulty(session.difficulty, template.block_difficulty());
        let job = self.builder.build(&template, session.difficulty);

        session.current_job = Some(AssignedJob {
            job_id: job.job_id.clone(),
            data: job.data.clone(),
            target: job.target.clone(),
        });

        if let Some(miner_id) = session.miner_id.as_deref() {
            self.registry.track_job_issued(miner_id, now).await;
        }

        tracing::debug!(
            "Job {} -> session {} (difficulty {:.3})",
            job.job_id,
            session.id,
            session.difficulty
        );

        session.send(ServerMessage::Job {
            job_id: job.job_id,
            data: job.data,
            target: job.target,
        })
    }

    /// Issue a job to every open connection. Returns how many were sent.
    pub async fn broadcast(&self, now: Instant) -> usize {
        if self.current_template().await.is_none() {
            return 0;
        }

        let mut sent = 0;
        for session in self.sessions().await {
            let mut session = session.write().await;
            if self.issue_job(&mut session, now).await {
                sent += 1;
            }
        }

        metrics::inc_job_broadcasts();
        tracing::info!("Broadcast new jobs to {} connections", sent);
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stratum::protocol::Outbound;
    use crate::test_utils::{template, test_session};

    fn dispatcher() -> JobDispatcher {
        JobDispatcher::new(Arc::new(TemplateJobBuilder::new()), Arc::new(SessionRegistry::new(15)))
    }

    #[test]
    fn test_job_ids_are_unique_hex() {
        let builder = TemplateJobBuilder::new();
        let tpl = template(1);
        let a = builder.build(&tpl, 1.0);
        let b = builder.build(&tpl, 2.0);
        assert_ne!(a.job_id, b.job_id);
        assert!(a.job_id.bytes().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(a.data, tpl.job_data());
        assert_eq!(a.target, target_from_difficulty(1.0));
        assert_eq!(b.target, target_from_difficulty(2.0));
    }

    #[tokio::test]
    async fn test_no_job_without_template() {
        let d = dispatcher();
        let (session, mut rx) = test_session("s1", 1.0);
        let mut s = session.write().await;
        assert!(!d.issue_job(&mut s, Instant::now()).await);
        assert!(s.current_job.is_none());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_issue_job_records_and_sends() {
        let d = dispatcher();
        d.set_template(template(1)).await;
        let (session, mut rx) = test_session("s1", 4.0);
        let now = Instant::now();

        {
            let mut s = session.write().await;
            s.bind_miner("minerA".to_string());
            assert!(d.issue_job(&mut s, now).await);
        }

        let s = session.read().await;
        let job = s.current_job.clone().unwrap();
        match rx.try_recv() {
            Ok(Outbound::Message(ServerMessage::Job { job_id, target, .. })) => {
                assert_eq!(job_id, job.job_id);
                assert_eq!(target, target_from_difficulty(4.0));
            }
            other => panic!("expected job, got {:?}", other),
        }

        let state = d.registry().get("minerA").await.unwrap();
        assert_eq!(state.lock().await.last_job_issued, now);
    }

    #[tokio::test]
    async fn test_unchanged_template_does_not_broadcast() {
        let d = dispatcher();
        let (session, mut rx) = test_session("s1", 1.0);
        d.register(session).await;

        assert_eq!(d.update_template(template(1), Instant::now()).await, 1);
        assert!(rx.try_recv().is_ok());
        assert_eq!(d.update_template(template(1), Instant::now()).await, 0);
        assert!(rx.try_recv().is_err());
        assert_eq!(d.update_template(template(2), Instant::now()).await, 1);
    }

    #[tokio::test]
    async fn test_draining_stops_issuance() {
        let d = dispatcher();
        d.set_template(template(1)).await;
        let (session, _rx) = test_session("s1", 1.0);
        d.register(session).await;
        d.begin_draining();
        assert_eq!(d.broadcast(Instant::now()).await, 0);
    }
}
