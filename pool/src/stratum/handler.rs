/// Per-connection share protocol
///
/// Drives one connection from accept to disconnect:
/// - on connect: register, send a job if a template is known
/// - on each text frame: validate, bind identity, check the job, verify,
///   account, retarget, issue the next job
/// - on disconnect: drop the miner's control state (cold restart)
///
/// Messages from one connection are handled in order by its reader task;
/// different connections run concurrently.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use crate::blockchain::NodeClient;
use crate::error::{CloseReason, ProtocolError};
use crate::jobs::JobDispatcher;
use crate::metrics::prometheus as metrics;
use crate::session::{SessionRegistry, SharedSession};
use crate::shares::{BanList, ShareKind, ShareRecord, ShareStore, ShareVerifier, VerifyRequest};
use crate::stratum::protocol::{parse_client_message, ServerMessage, SubmitRequest, MAX_MESSAGE_SIZE};
use crate::vardiff::DifficultyController;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolSettings {
    pub max_message_size: usize,
    pub invalid_share_limit: u32,
    pub job_mismatch_tolerance: u32,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            max_message_size: MAX_MESSAGE_SIZE,
            invalid_share_limit: 8,
            job_mismatch_tolerance: 32,
        }
    }
}

/// What happened to one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Draining, or the connection was already closed.
    Ignored,
    /// The connection was closed while handling this submission.
    Closed,
    JobMismatch,
    Accepted,
    BlockFound,
    Rejected,
    /// The verifier could not evaluate the input; nothing was sent.
    Dropped,
    /// The verifier failed or timed out; a bare rejection was sent.
    Faulted,
}

/// External services the protocol talks to.
pub struct Collaborators {
    pub verifier: Arc<dyn ShareVerifier>,
    pub node: Arc<dyn NodeClient>,
    pub store: Arc<dyn ShareStore>,
    pub bans: Arc<dyn BanList>,
}

pub struct ShareProtocol {
    dispatcher: Arc<JobDispatcher>,
    registry: Arc<SessionRegistry>,
    controller: DifficultyController,
    services: Collaborators,
    settings: ProtocolSettings,
}

impl ShareProtocol {
    pub fn new(
        dispatcher: Arc<JobDispatcher>,
        controller: DifficultyController,
        services: Collaborators,
        settings: ProtocolSettings,
    ) -> Self {
        let registry = dispatcher.registry().clone();
        Self {
            dispatcher,
            registry,
            controller,
            services,
            settings,
        }
    }

    pub fn dispatcher(&self) -> &Arc<JobDispatcher> {
        &self.dispatcher
    }

    pub fn settings(&self) -> &ProtocolSettings {
        &self.settings
    }

    /// Close reason for a policy close; while draining every close is a
    /// going-away.
    fn close_reason(&self, text: &str) -> CloseReason {
        if self.dispatcher.is_draining() {
            CloseReason::ShuttingDown
        } else {
            CloseReason::policy(text)
        }
    }

    async fn close(&self, session: &SharedSession, text: &str) {
        let reason = self.close_reason(text);
        let mut s = session.write().await;
        if s.is_open() && matches!(reason, CloseReason::PolicyViolation(_)) {
            metrics::inc_policy_closes();
            tracing::warn!("Closing session {} ({}): {}", s.id, s.peer_ip, text);
        }
        s.close(reason);
    }

    /// Decide whether a new connection may start. Refuses with a going-away
    /// while draining, and with a policy close for an unresolvable or banned
    /// address. Ban list failures admit the connection.
    pub async fn admit(&self, ip: Option<IpAddr>) -> Result<IpAddr, CloseReason> {
        if self.dispatcher.is_draining() {
            return Err(CloseReason::ShuttingDown);
        }
        let Some(ip) = ip else {
            tracing::warn!("Refusing connection with an unresolvable client address");
            return Err(CloseReason::policy("Bye."));
        };

        match self.services.bans.is_banned(&ip.to_string()).await {
            Ok(false) => Ok(ip),
            Ok(true) => {
                tracing::warn!("Refusing banned address {}", ip);
                Err(CloseReason::policy("Banned"))
            }
            Err(e) => {
                metrics::inc_storage_errors();
                tracing::warn!("Ban check for {} failed: {}", ip, e);
                Ok(ip)
            }
        }
    }

    pub async fn on_connect(&self, session: SharedSession, now: Instant) {
        self.dispatcher.register(session.clone()).await;

        let mut s = session.write().await;
        tracing::info!(
            "Miner connected: session={} ip={} difficulty={}",
            s.id,
            s.peer_ip,
            s.difficulty
        );
        self.dispatcher.issue_job(&mut s, now).await;
    }

    /// Handle one text frame.
    pub async fn on_text(&self, session: &SharedSession, text: &str, now: Instant) -> SubmitOutcome {
        match parse_client_message(text, self.settings.max_message_size) {
            Ok(Some(req)) => self.handle_submit(session, req, now).await,
            Ok(None) => SubmitOutcome::Ignored,
            Err(e) => self.on_protocol_error(session, e).await,
        }
    }

    pub async fn on_protocol_error(&self, session: &SharedSession, err: ProtocolError) -> SubmitOutcome {
        let reason = CloseReason::from(err.clone());
        tracing::debug!("Protocol error on session {}: {}", session.read().await.id, err);
        self.close(session, &reason.to_string()).await;
        SubmitOutcome::Closed
    }

    /// Bind the miner identity on first submission. Returns the bound
    /// identity, or `None` once the connection has been closed.
    async fn bind_identity(&self, session: &SharedSession, claimed: &str) -> Option<String> {
        if let Some(bound) = session.read().await.miner_id.clone() {
            return Some(bound);
        }

        match self.services.node.validate_address(claimed).await {
            Ok(true) => {
                let mut s = session.write().await;
                s.bind_miner(claimed.to_string());
                tracing::info!("Session {} bound to miner {}", s.id, claimed);
                Some(claimed.to_string())
            }
            Ok(false) => {
                self.close(session, "Invalid miner address").await;
                None
            }
            Err(e) => {
                tracing::warn!("Address validation for {} failed: {}", claimed, e);
                self.close(session, "Invalid miner address").await;
                None
            }
        }
    }

    pub async fn handle_submit(&self, session: &SharedSession, req: SubmitRequest, now: Instant) -> SubmitOutcome {
        if self.dispatcher.is_draining() || !session.read().await.is_open() {
            return SubmitOutcome::Ignored;
        }

        let Some(miner_id) = self.bind_identity(session, &req.miner_id).await else {
            return SubmitOutcome::Closed;
        };
        if self.dispatcher.is_draining() {
            return SubmitOutcome::Ignored;
        }

        let (job, difficulty) = {
            let mut s = session.write().await;
            match s.current_job.clone() {
                Some(job) if job.job_id == req.job_id => {
                    s.job_mismatches = 0;
                    (job, s.difficulty)
                }
                _ => {
                    s.job_mismatches = s.job_mismatches.saturating_add(1);
                    s.send(ServerMessage::rejected_with("Job ID mismatch"));
                    let over = s.job_mismatches > self.settings.job_mismatch_tolerance;
                    drop(s);
                    if over {
                        self.close(session, "Too many stale submissions").await;
                        return SubmitOutcome::Closed;
                    }
                    return SubmitOutcome::JobMismatch;
                }
            }
        };

        let Some(template) = self.dispatcher.current_template().await else {
            session.read().await.send(ServerMessage::rejected());
            return SubmitOutcome::Faulted;
        };

        let request = VerifyRequest {
            job_data: job.data.clone(),
            nonce: req.nonce.clone(),
            path: req.path.clone(),
            job_target: job.target.clone(),
            template_expanded: template.expanded.clone(),
            template_blockhex: template.blockhex.clone(),
        };

        let outcome = match self.services.verifier.verify(request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if self.dispatcher.is_draining() {
                    return SubmitOutcome::Ignored;
                }
                tracing::error!("Error processing share from {}: {}", miner_id, e);
                session.read().await.send(ServerMessage::rejected());
                return SubmitOutcome::Faulted;
            }
        };

        // A rejection may create the control state before the retarget below.
        let mut first_share = false;
        let result = match outcome.kind {
            ShareKind::BlockFound | ShareKind::Accepted => {
                let is_block = outcome.kind == ShareKind::BlockFound;
                if is_block {
                    self.submit_block(&miner_id, outcome.block_hex_updated.as_deref(), template.height)
                        .await;
                }

                let record = ShareRecord {
                    miner_id: miner_id.clone(),
                    target: outcome.target.clone(),
                    nonce: outcome.nonce.clone(),
                    hash: outcome.hash.clone(),
                    path: outcome.path.clone(),
                    difficulty,
                    is_block,
                    timestamp: chrono::Utc::now().timestamp(),
                };
                if let Err(e) = self.services.store.save_share(&record).await {
                    metrics::inc_storage_errors();
                    tracing::warn!("Failed to persist share for {}: {}", miner_id, e);
                }

                self.registry.reset_invalid_shares(&miner_id).await;
                metrics::inc_accepted();
                metrics::inc_miner_share(&miner_id, true);
                session.read().await.send(ServerMessage::Accepted);

                if is_block {
                    SubmitOutcome::BlockFound
                } else {
                    SubmitOutcome::Accepted
                }
            }
            ShareKind::Rejected => {
                let (invalid, created) = self.registry.track_invalid_share(&miner_id, now).await;
                first_share = created;
                metrics::inc_rejected();
                metrics::inc_miner_share(&miner_id, false);
                session.read().await.send(ServerMessage::rejected());

                if invalid >= self.settings.invalid_share_limit {
                    self.close(session, "Too many invalid shares").await;
                    return SubmitOutcome::Closed;
                }
                SubmitOutcome::Rejected
            }
            ShareKind::ValidationError => {
                metrics::inc_validation_errors();
                tracing::debug!("Dropped unevaluable share from {}", miner_id);
                return SubmitOutcome::Dropped;
            }
        };

        let mut s = session.write().await;
        s.last_submit = Some(now);

        let (state, created) = self.registry.get_or_create(&miner_id, now).await;
        if !created && !first_share {
            let mut state = state.lock().await;
            let previous = s.difficulty;
            s.difficulty = self
                .controller
                .adjust(&mut state, previous, template.block_difficulty(), now);
            if s.difficulty != previous {
                metrics::inc_vardiff_retarget();
            }
        }

        self.dispatcher.issue_job(&mut s, now).await;
        result
    }

    async fn submit_block(&self, miner_id: &str, block_hex: Option<&str>, height: u64) {
        let Some(block_hex) = block_hex else {
            metrics::inc_block_submit_failures();
            tracing::error!("Block found by {} at height {} but no block data was produced", miner_id, height);
            return;
        };

        match self.services.node.submit_block(block_hex).await {
            Ok(true) => {
                metrics::inc_blocks_found();
                tracing::info!("Block found by {} at height {} accepted by node", miner_id, height);
            }
            Ok(false) => {
                metrics::inc_block_submit_failures();
                tracing::warn!("Block found by {} at height {} rejected by node", miner_id, height);
            }
            Err(e) => {
                metrics::inc_block_submit_failures();
                tracing::error!("Failed to submit block found by {}: {}", miner_id, e);
            }
        }
    }

    pub async fn on_disconnect(&self, session: &SharedSession) {
        let mut s = session.write().await;
        self.dispatcher.unregister(&s.id).await;
        if let Some(miner_id) = s.miner_id.as_deref() {
            self.registry.remove(miner_id).await;
            metrics::remove_miner(miner_id);
        }
        tracing::info!(
            "Miner disconnected: session={} miner={} after {}s",
            s.id,
            s.miner_id.as_deref().unwrap_or("-"),
            s.connected_for().as_secs()
        );
        s.teardown();
    }

    /// Ban an address and close every connection from it.
    pub async fn ban_and_disconnect(&self, ip: IpAddr) -> anyhow::Result<usize> {
        self.services.bans.ban(&ip.to_string()).await?;

        let mut closed = 0;
        for session in self.dispatcher.sessions().await {
            let matches = {
                let s = session.read().await;
                s.peer_ip == ip && s.is_open()
            };
            if matches {
                self.close(&session, "Banned").await;
                closed += 1;
            }
        }
        tracing::warn!("Banned {} and closed {} connections", ip, closed);
        Ok(closed)
    }

    /// Close every connection with a going-away frame.
    pub async fn close_all(&self) -> usize {
        let mut closed = 0;
        for session in self.dispatcher.sessions().await {
            let mut s = session.write().await;
            if s.is_open() {
                s.close(CloseReason::ShuttingDown);
                closed += 1;
            }
        }
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stratum::protocol::Outbound;
    use crate::test_utils::{drain, submit_json, TestPool};

    #[tokio::test]
    async fn connect_sends_job_when_template_known() {
        let pool = TestPool::new().await;
        let (session, mut rx) = pool.connect("s1", 1.0).await;

        let out = drain(&mut rx);
        assert!(matches!(out.as_slice(), [Outbound::Message(ServerMessage::Job { .. })]));
        assert!(session.read().await.current_job.is_some());
        assert_eq!(pool.protocol.dispatcher().connection_count().await, 1);
    }

    #[tokio::test]
    async fn malformed_frames_close_with_policy_violation() {
        let pool = TestPool::new().await;
        let (session, mut rx) = pool.connect("s1", 1.0).await;
        drain(&mut rx);

        let outcome = pool.protocol.on_text(&session, "{oops", Instant::now()).await;
        assert_eq!(outcome, SubmitOutcome::Closed);
        assert_eq!(
            drain(&mut rx),
            vec![Outbound::Close(CloseReason::policy("Invalid JSON"))]
        );
        assert!(pool.node.validations().await.is_empty());
    }

    #[tokio::test]
    async fn invalid_identity_closes_without_state() {
        let pool = TestPool::new().await;
        pool.node.reject_address("badminer").await;
        let (session, mut rx) = pool.connect("s1", 1.0).await;
        let job_id = pool.job_id(&session).await;
        drain(&mut rx);

        let text = submit_json("badminer", &job_id);
        let outcome = pool.protocol.on_text(&session, &text, Instant::now()).await;
        assert_eq!(outcome, SubmitOutcome::Closed);
        assert_eq!(
            drain(&mut rx),
            vec![Outbound::Close(CloseReason::policy("Invalid miner address"))]
        );
        assert!(pool.registry.get("badminer").await.is_none());
        assert!(session.read().await.miner_id.is_none());
    }

    #[tokio::test]
    async fn accepted_share_persists_and_issues_next_job() {
        let pool = TestPool::new().await;
        let (session, mut rx) = pool.connect("s1", 1.0).await;
        let job_id = pool.job_id(&session).await;
        drain(&mut rx);

        let now = Instant::now();
        let outcome = pool.protocol.on_text(&session, &submit_json("minerA", &job_id), now).await;
        assert_eq!(outcome, SubmitOutcome::Accepted);

        let out = drain(&mut rx);
        assert_eq!(out[0], Outbound::Message(ServerMessage::Accepted));
        assert!(matches!(out[1], Outbound::Message(ServerMessage::Job { .. })));
        assert_ne!(pool.job_id(&session).await, job_id);
        assert_eq!(pool.store.shares().await.len(), 1);
        assert_eq!(session.read().await.last_submit, Some(now));
    }

    #[tokio::test]
    async fn block_found_is_submitted_upstream() {
        let pool = TestPool::new().await;
        pool.verifier.push(ShareKind::BlockFound).await;
        let (session, mut rx) = pool.connect("s1", 1.0).await;
        let job_id = pool.job_id(&session).await;
        drain(&mut rx);

        let outcome = pool.protocol.on_text(&session, &submit_json("minerA", &job_id), Instant::now()).await;
        assert_eq!(outcome, SubmitOutcome::BlockFound);
        assert_eq!(pool.node.submitted_blocks().await.len(), 1);
        let shares = pool.store.shares().await;
        assert!(shares[0].is_block);
        assert_eq!(drain(&mut rx)[0], Outbound::Message(ServerMessage::Accepted));
    }

    #[tokio::test]
    async fn validation_error_is_silent() {
        let pool = TestPool::new().await;
        pool.verifier.push(ShareKind::ValidationError).await;
        let (session, mut rx) = pool.connect("s1", 1.0).await;
        let job_id = pool.job_id(&session).await;
        drain(&mut rx);

        let outcome = pool.protocol.on_text(&session, &submit_json("minerA", &job_id), Instant::now()).await;
        assert_eq!(outcome, SubmitOutcome::Dropped);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(pool.job_id(&session).await, job_id);
        assert!(session.read().await.last_submit.is_none());
    }

    #[tokio::test]
    async fn verifier_fault_replies_bare_rejection_without_accounting() {
        let pool = TestPool::new().await;
        pool.verifier.fail_next().await;
        let (session, mut rx) = pool.connect("s1", 1.0).await;
        let job_id = pool.job_id(&session).await;
        drain(&mut rx);

        let outcome = pool.protocol.on_text(&session, &submit_json("minerA", &job_id), Instant::now()).await;
        assert_eq!(outcome, SubmitOutcome::Faulted);
        assert_eq!(drain(&mut rx), vec![Outbound::Message(ServerMessage::rejected())]);
        assert!(pool.registry.get("minerA").await.is_none());
    }

    #[tokio::test]
    async fn repeated_job_mismatch_closes_connection() {
        let pool = TestPool::with_settings(ProtocolSettings {
            job_mismatch_tolerance: 2,
            ..ProtocolSettings::default()
        })
        .await;
        let (session, mut rx) = pool.connect("s1", 1.0).await;
        drain(&mut rx);

        for _ in 0..2 {
            let outcome = pool.protocol.on_text(&session, &submit_json("minerA", "dead"), Instant::now()).await;
            assert_eq!(outcome, SubmitOutcome::JobMismatch);
        }
        let outcome = pool.protocol.on_text(&session, &submit_json("minerA", "dead"), Instant::now()).await;
        assert_eq!(outcome, SubmitOutcome::Closed);

        let out = drain(&mut rx);
        assert_eq!(out.len(), 4);
        assert_eq!(out[3], Outbound::Close(CloseReason::policy("Too many stale submissions")));
    }

    #[tokio::test]
    async fn draining_ignores_submissions_and_closes_going_away() {
        let pool = TestPool::new().await;
        let (session, mut rx) = pool.connect("s1", 1.0).await;
        let job_id = pool.job_id(&session).await;
        drain(&mut rx);

        pool.protocol.dispatcher().begin_draining();
        let outcome = pool.protocol.on_text(&session, &submit_json("minerA", &job_id), Instant::now()).await;
        assert_eq!(outcome, SubmitOutcome::Ignored);
        assert!(drain(&mut rx).is_empty());

        assert_eq!(pool.protocol.close_all().await, 1);
        assert_eq!(drain(&mut rx), vec![Outbound::Close(CloseReason::ShuttingDown)]);
    }

    #[tokio::test]
    async fn disconnect_drops_miner_state() {
        let pool = TestPool::new().await;
        let (session, mut rx) = pool.connect("s1", 1.0).await;
        let job_id = pool.job_id(&session).await;
        drain(&mut rx);
        pool.protocol.on_text(&session, &submit_json("minerA", &job_id), Instant::now()).await;
        assert!(pool.registry.get("minerA").await.is_some());

        pool.protocol.on_disconnect(&session).await;
        assert!(pool.registry.get("minerA").await.is_none());
        assert_eq!(pool.protocol.dispatcher().connection_count().await, 0);
        assert!(session.read().await.current_job.is_none());
    }

    #[tokio::test]
    async fn ban_and_disconnect_closes_matching_connections() {
        let pool = TestPool::new().await;
        let (_a, mut rx_a) = pool.connect("a", 1.0).await;
        let (_b, mut rx_b) = pool.connect("b", 1.0).await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        assert_eq!(pool.protocol.ban_and_disconnect(ip).await.unwrap(), 2);
        assert_eq!(pool.protocol.admit(Some(ip)).await, Err(CloseReason::policy("Banned")));
        assert_eq!(drain(&mut rx_a), vec![Outbound::Close(CloseReason::policy("Banned"))]);
        let other: IpAddr = "10.0.0.9".parse().unwrap();
        assert_eq!(pool.protocol.admit(Some(other)).await, Ok(other));
    }

    #[tokio::test]
    async fn admission_refuses_while_draining() {
        let pool = TestPool::new().await;
        let ip: IpAddr = "10.0.0.9".parse().unwrap();
        assert_eq!(pool.protocol.admit(Some(ip)).await, Ok(ip));
        assert_eq!(pool.protocol.admit(None).await, Err(CloseReason::policy("Bye.")));

        pool.protocol.dispatcher().begin_draining();
        let refused = pool.protocol.admit(Some(ip)).await;
        assert_eq!(refused, Err(CloseReason::ShuttingDown));
        if let Err(reason) = refused {
            assert_eq!(reason.code(), 1001);
            assert_eq!(reason.to_string(), "Server shutting down");
        }
    }

    #[tokio::test]
    async fn rejected_first_share_skips_retarget() {
        let pool = TestPool::new().await;
        pool.verifier.push(ShareKind::Rejected).await;
        let (session, mut rx) = pool.connect("s1", 1.0).await;
        let job_id = pool.job_id(&session).await;
        drain(&mut rx);

        let outcome = pool.protocol.on_text(&session, &submit_json("minerA", &job_id), Instant::now()).await;
        assert_eq!(outcome, SubmitOutcome::Rejected);
        assert_eq!(session.read().await.difficulty, 1.0);

        let state = pool.registry.get("minerA").await.unwrap();
        let state = state.lock().await;
        assert!(state.window.is_empty());
        assert_eq!(state.invalid_shares, 1);
    }
}
