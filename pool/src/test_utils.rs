/// In-memory node, verifier, store and ban list, plus a fully wired
/// `ShareProtocol` for driving connections without sockets.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::Mutex;

use crate::blockchain::{BlockTemplate, NodeClient};
use crate::jobs::{JobDispatcher, TemplateJobBuilder};
use crate::session::{Session, SessionRegistry, SharedSession};
use crate::shares::{BanList, ShareKind, ShareRecord, ShareStore, ShareVerifier, VerifyOutcome, VerifyRequest};
use crate::stratum::handler::{Collaborators, ProtocolSettings, ShareProtocol};
use crate::stratum::protocol::Outbound;
use crate::vardiff::{DifficultyController, VarDiffConfig};

/// Template with distinct work per height and a block difficulty far above
/// any share difficulty used in tests.
pub fn template(height: u64) -> BlockTemplate {
    let blockhex = format!(
        "{:08x}{}1d00ffff{}",
        height,
        "ab".repeat(68),
        "00".repeat(40)
    );
    let value = json!({
        "height": height,
        "previousblockhash": format!("{:064x}", height),
        "nbits": "1d00ffff",
        "blockhex": blockhex,
    });
    match BlockTemplate::from_rpc_response(&value) {
        Ok(t) => t,
        Err(e) => panic!("fixture template is invalid: {}", e),
    }
}

pub fn test_session(id: &str, difficulty: f64) -> (SharedSession, UnboundedReceiver<Outbound>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let session = Session::new(id.to_string(), IpAddr::V4(Ipv4Addr::LOCALHOST), difficulty, tx);
    (session.shared(), rx)
}

/// Everything queued so far, without waiting.
pub fn drain(rx: &mut UnboundedReceiver<Outbound>) -> Vec<Outbound> {
    let mut out = Vec::new();
    while let Ok(item) = rx.try_recv() {
        out.push(item);
    }
    out
}

pub fn submit_json(miner_id: &str, job_id: &str) -> String {
    json!({
        "type": "submit",
        "miner_id": miner_id,
        "nonce": "0a0b",
        "job_id": job_id,
        "path": "abc123",
    })
    .to_string()
}

#[derive(Default)]
pub struct FakeNode {
    template: Mutex<Option<BlockTemplate>>,
    rejected: Mutex<HashSet<String>>,
    validations: Mutex<Vec<String>>,
    submitted: Mutex<Vec<String>>,
}

impl FakeNode {
    pub async fn set_template(&self, template: BlockTemplate) {
        *self.template.lock().await = Some(template);
    }

    pub async fn reject_address(&self, address: &str) {
        self.rejected.lock().await.insert(address.to_string());
    }

    pub async fn validations(&self) -> Vec<String> {
        self.validations.lock().await.clone()
    }

    pub async fn submitted_blocks(&self) -> Vec<String> {
        self.submitted.lock().await.clone()
    }
}

#[async_trait]
impl NodeClient for FakeNode {
    async fn get_block_template(&self) -> Result<BlockTemplate> {
        self.template
            .lock()
            .await
            .clone()
            .ok_or_else(|| anyhow!("node unavailable"))
    }

    async fn submit_block(&self, block_hex: &str) -> Result<bool> {
        self.submitted.lock().await.push(block_hex.to_string());
        Ok(true)
    }

    async fn validate_address(&self, address: &str) -> Result<bool> {
        self.validations.lock().await.push(address.to_string());
        Ok(!self.rejected.lock().await.contains(address))
    }
}

/// Replays queued outcomes, then accepts everything. `None` in the queue
/// is a verifier fault.
#[derive(Default)]
pub struct FakeVerifier {
    queue: Mutex<VecDeque<Option<ShareKind>>>,
}

impl FakeVerifier {
    pub async fn push(&self, kind: ShareKind) {
        self.queue.lock().await.push_back(Some(kind));
    }

    pub async fn fail_next(&self) {
        self.queue.lock().await.push_back(None);
    }
}

#[async_trait]
impl ShareVerifier for FakeVerifier {
    async fn verify(&self, req: VerifyRequest) -> Result<VerifyOutcome> {
        let kind = match self.queue.lock().await.pop_front() {
            Some(Some(kind)) => kind,
            Some(None) => return Err(anyhow!("verifier crashed")),
            None => ShareKind::Accepted,
        };
        if kind == ShareKind::ValidationError {
            return Ok(VerifyOutcome::validation_error(&req));
        }

        let block_hex_updated =
            (kind == ShareKind::BlockFound).then(|| format!("{}{}{}", req.job_data, req.nonce, req.path));
        Ok(VerifyOutcome {
            kind,
            target: req.job_target,
            nonce: req.nonce,
            hash: "00".repeat(32),
            path: req.path,
            block_hex_updated,
        })
    }
}

#[derive(Default)]
pub struct FakeStore {
    shares: Mutex<Vec<ShareRecord>>,
}

impl FakeStore {
    pub async fn shares(&self) -> Vec<ShareRecord> {
        self.shares.lock().await.clone()
    }
}

#[async_trait]
impl ShareStore for FakeStore {
    async fn save_share(&self, share: &ShareRecord) -> Result<()> {
        self.shares.lock().await.push(share.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeBans {
    banned: Mutex<HashSet<String>>,
}

#[async_trait]
impl BanList for FakeBans {
    async fn is_banned(&self, ip: &str) -> Result<bool> {
        Ok(self.banned.lock().await.contains(ip))
    }

    async fn ban(&self, ip: &str) -> Result<()> {
        self.banned.lock().await.insert(ip.to_string());
        Ok(())
    }
}

/// A protocol wired to fakes, with template 1 already installed.
pub struct TestPool {
    pub protocol: Arc<ShareProtocol>,
    pub node: Arc<FakeNode>,
    pub verifier: Arc<FakeVerifier>,
    pub store: Arc<FakeStore>,
    pub bans: Arc<FakeBans>,
    pub registry: Arc<SessionRegistry>,
    pub dispatcher: Arc<JobDispatcher>,
}

impl TestPool {
    pub async fn new() -> Self {
        Self::with_settings(ProtocolSettings::default()).await
    }

    pub async fn with_settings(settings: ProtocolSettings) -> Self {
        let vardiff = VarDiffConfig::default();
        let registry = Arc::new(SessionRegistry::new(vardiff.window_size));
        let dispatcher = Arc::new(JobDispatcher::new(Arc::new(TemplateJobBuilder::new()), registry.clone()));
        dispatcher.set_template(template(1)).await;

        let node = Arc::new(FakeNode::default());
        let verifier = Arc::new(FakeVerifier::default());
        let store = Arc::new(FakeStore::default());
        let bans = Arc::new(FakeBans::default());

        let protocol = Arc::new(ShareProtocol::new(
            dispatcher.clone(),
            DifficultyController::new(vardiff),
            Collaborators {
                verifier: verifier.clone(),
                node: node.clone(),
                store: store.clone(),
                bans: bans.clone(),
            },
            settings,
        ));

        Self {
            protocol,
            node,
            verifier,
            store,
            bans,
            registry,
            dispatcher,
        }
    }

    /// Open a connection from 127.0.0.1; the initial job is left queued.
    pub async fn connect(&self, id: &str, difficulty: f64) -> (SharedSession, UnboundedReceiver<Outbound>) {
        let (session, rx) = test_session(id, difficulty);
        self.protocol.on_connect(session.clone(), Instant::now()).await;
        (session, rx)
    }

    pub async fn job_id(&self, session: &SharedSession) -> String {
        session
            .read()
            .await
            .current_job
            .as_ref()
            .map(|job| job.job_id.clone())
            .unwrap_or_default()
    }
}
