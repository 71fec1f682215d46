/// Session tracking for connected miners
///
/// - `Session`: one per WebSocket connection, owned by its handler
/// - `MinerControlState`: per miner identity, holds the vardiff window,
///   controller memory and invalid-share accounting
/// - `SessionRegistry`: identity -> control state, created lazily and
///   dropped on disconnect

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::error::CloseReason;
use crate::stratum::protocol::{Outbound, ServerMessage};
use crate::vardiff::{ControllerState, RollingWindow};

pub type SharedSession = Arc<RwLock<Session>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connected, no miner identity bound yet
    Unauthenticated,
    /// Miner identity validated and bound
    Authenticated,
    /// Close frame queued; nothing further is sent
    Closed,
}

/// Job currently assigned to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignedJob {
    pub job_id: String,
    pub data: String,
    pub target: String,
}

pub struct Session {
    /// Unique session ID
    pub id: String,

    /// Resolved client address
    pub peer_ip: IpAddr,

    pub state: ConnectionState,

    /// Miner identity (after first valid submission)
    pub miner_id: Option<String>,

    /// Current share difficulty, always >= 1
    pub difficulty: f64,

    pub current_job: Option<AssignedJob>,

    pub last_submit: Option<Instant>,

    pub last_proactive_adjust: Option<Instant>,

    /// Consecutive submissions against a job that is no longer current
    pub job_mismatches: u32,

    connected_at: Instant,

    /// Outbound writer channel (server -> miner)
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
}

impl Session {
    pub fn new(
        id: String,
        peer_ip: IpAddr,
        difficulty: f64,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        Self {
            id,
            peer_ip,
            state: ConnectionState::Unauthenticated,
            miner_id: None,
            difficulty: if difficulty.is_finite() { difficulty.max(1.0) } else { 1.0 },
            current_job: None,
            last_submit: None,
            last_proactive_adjust: None,
            job_mismatches: 0,
            connected_at: Instant::now(),
            outbound: Some(outbound),
        }
    }

    pub fn shared(self) -> SharedSession {
        Arc::new(RwLock::new(self))
    }

    pub fn is_open(&self) -> bool {
        self.state != ConnectionState::Closed && self.outbound.is_some()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == ConnectionState::Authenticated
    }

    pub fn connected_for(&self) -> std::time::Duration {
        self.connected_at.elapsed()
    }

    pub fn bind_miner(&mut self, miner_id: String) {
        self.miner_id = Some(miner_id);
        if self.state == ConnectionState::Unauthenticated {
            self.state = ConnectionState::Authenticated;
        }
    }

    /// Queue a message. Returns false once the connection is closed or the
    /// writer has gone away.
    pub fn send(&self, message: ServerMessage) -> bool {
        if !self.is_open() {
            return false;
        }
        match &self.outbound {
            Some(tx) => tx.send(Outbound::Message(message)).is_ok(),
            None => false,
        }
    }

    /// Queue a close frame once; later calls are no-ops.
    pub fn close(&mut self, reason: CloseReason) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closed;
        if let Some(tx) = self.outbound.take() {
            let _ = tx.send(Outbound::Close(reason));
        }
    }

    /// Clear per-connection fields after the socket is gone.
    pub fn teardown(&mut self) {
        self.state = ConnectionState::Closed;
        self.current_job = None;
        self.outbound = None;
    }
}

/// Control and accounting state for one miner identity.
#[derive(Debug, Clone)]
pub struct MinerControlState {
    pub window: RollingWindow,
    pub controller: ControllerState,
    pub invalid_shares: u32,
    pub last_share: Instant,
    pub last_job_issued: Instant,
    pub last_proactive_adjust: Instant,
}

impl MinerControlState {
    pub fn new(window_size: usize, now: Instant) -> Self {
        Self {
            window: RollingWindow::new(window_size),
            controller: ControllerState::default(),
            invalid_shares: 0,
            last_share: now,
            last_job_issued: now,
            last_proactive_adjust: now,
        }
    }
}

pub type SharedMinerState = Arc<Mutex<MinerControlState>>;

/// Identity-keyed control state, owned by the pool instance.
///
/// Each entry sits behind its own mutex so the share path and the sweep
/// never interleave updates for the same miner.
pub struct SessionRegistry {
    miners: RwLock<HashMap<String, SharedMinerState>>,
    window_size: usize,
}

impl SessionRegistry {
    pub fn new(window_size: usize) -> Self {
        Self {
            miners: RwLock::new(HashMap::new()),
            window_size: window_size.max(1),
        }
    }

    pub async fn get(&self, miner_id: &str) -> Option<SharedMinerState> {
        self.miners.read().await.get(miner_id).cloned()
    }

    /// Fetch or lazily create the state. The flag is true when the entry
    /// was created by this call.
    pub async fn get_or_create(&self, miner_id: &str, now: Instant) -> (SharedMinerState, bool) {
        if let Some(state) = self.get(miner_id).await {
            return (state, false);
        }

        let mut miners = self.miners.write().await;
        if let Some(state) = miners.get(miner_id) {
            return (state.clone(), false);
        }
        let state = Arc::new(Mutex::new(MinerControlState::new(self.window_size, now)));
        miners.insert(miner_id.to_string(), state.clone());
        tracing::debug!("Created control state for miner {}", miner_id);
        (state, true)
    }

    pub async fn track_job_issued(&self, miner_id: &str, now: Instant) {
        let (state, _) = self.get_or_create(miner_id, now).await;
        state.lock().await.last_job_issued = now;
    }

    /// Count a rejected share. Returns the updated counter and whether the
    /// state was created by this call.
    pub async fn track_invalid_share(&self, miner_id: &str, now: Instant) -> (u32, bool) {
        let (state, created) = self.get_or_create(miner_id, now).await;
        let mut state = state.lock().await;
        state.invalid_shares = state.invalid_shares.saturating_add(1);
        (state.invalid_shares, created)
    }

    pub async fn reset_invalid_shares(&self, miner_id: &str) {
        if let Some(state) = self.get(miner_id).await {
            state.lock().await.invalid_shares = 0;
        }
    }

    /// Drop a miner's state (cold restart on reconnect).
    pub async fn remove(&self, miner_id: &str) -> bool {
        self.miners.write().await.remove(miner_id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.miners.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.miners.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn session() -> (Session, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let s = Session::new("s1".to_string(), IpAddr::V4(Ipv4Addr::LOCALHOST), 1.0, tx);
        (s, rx)
    }

    #[test]
    fn test_session_creation() {
        let (s, _rx) = session();
        assert_eq!(s.state, ConnectionState::Unauthenticated);
        assert_eq!(s.difficulty, 1.0);
        assert!(s.miner_id.is_none());
        assert!(s.current_job.is_none());
        assert!(s.is_open());
    }

    #[test]
    fn test_bind_miner_authenticates() {
        let (mut s, _rx) = session();
        s.bind_miner("shai1abc".to_string());
        assert!(s.is_authenticated());
        assert_eq!(s.miner_id.as_deref(), Some("shai1abc"));
    }

    #[test]
    fn test_close_is_sent_once() {
        let (mut s, mut rx) = session();
        s.close(CloseReason::policy("Bye."));
        s.close(CloseReason::ShuttingDown);
        assert!(!s.send(ServerMessage::Accepted));

        assert!(matches!(rx.try_recv(), Ok(Outbound::Close(CloseReason::PolicyViolation(_)))));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_registry_lazy_create_and_remove() {
        let registry = SessionRegistry::new(5);
        let now = Instant::now();

        let (_, created) = registry.get_or_create("a", now).await;
        assert!(created);
        let (state, created) = registry.get_or_create("a", now).await;
        assert!(!created);
        {
            let st = state.lock().await;
            assert!(st.window.is_empty());
            assert_eq!(st.window.capacity(), 5);
            assert_eq!(st.invalid_shares, 0);
        }

        assert!(registry.remove("a").await);
        assert!(registry.get("a").await.is_none());
        assert!(!registry.remove("a").await);
    }

    #[tokio::test]
    async fn test_invalid_share_counter() {
        let registry = SessionRegistry::new(5);
        let now = Instant::now();

        assert_eq!(registry.track_invalid_share("a", now).await, (1, true));
        assert_eq!(registry.track_invalid_share("a", now).await, (2, false));
        assert_eq!(registry.track_invalid_share("b", now).await, (1, true));

        registry.reset_invalid_shares("a").await;
        let a = registry.get("a").await.unwrap();
        assert_eq!(a.lock().await.invalid_shares, 0);
        let b = registry.get("b").await.unwrap();
        assert_eq!(b.lock().await.invalid_shares, 1);
    }
}
