/// Share verification
///
/// `ShareVerifier` is the seam for the chain's proof-of-work check.
/// `Sha3Verifier` is a self-contained reference implementation and
/// `BoundedVerifier` caps concurrency and latency around any verifier.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use num_bigint::BigUint;
use sha3::{Digest, Sha3_256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::difficulty::parse_target;
use crate::metrics::prometheus as metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareKind {
    BlockFound,
    Accepted,
    Rejected,
    /// Input the verifier could not evaluate at all.
    ValidationError,
}

/// Everything the verifier needs for one submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyRequest {
    pub job_data: String,
    pub nonce: String,
    pub path: String,
    pub job_target: String,
    pub template_expanded: String,
    pub template_blockhex: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyOutcome {
    pub kind: ShareKind,
    pub target: String,
    pub nonce: String,
    pub hash: String,
    pub path: String,
    /// Serialized block to submit upstream, set for `BlockFound`.
    pub block_hex_updated: Option<String>,
}

impl VerifyOutcome {
    pub fn validation_error(req: &VerifyRequest) -> Self {
        Self {
            kind: ShareKind::ValidationError,
            target: req.job_target.clone(),
            nonce: req.nonce.clone(),
            hash: String::new(),
            path: req.path.clone(),
            block_hex_updated: None,
        }
    }
}

#[async_trait]
pub trait ShareVerifier: Send + Sync {
    /// `Err` is a verifier fault (crash, timeout), distinct from a
    /// `ValidationError` outcome.
    async fn verify(&self, req: VerifyRequest) -> Result<VerifyOutcome>;
}

/// SHA3-256 over `header || nonce || path`, compared big-endian against
/// the job target and then the block target.
#[derive(Debug, Default, Clone)]
pub struct Sha3Verifier;

impl Sha3Verifier {
    pub fn new() -> Self {
        Self
    }

    pub fn verify_blocking(req: &VerifyRequest) -> VerifyOutcome {
        let (Ok(header), Ok(nonce), Ok(path)) = (
            hex::decode(&req.job_data),
            hex::decode(&req.nonce),
            hex::decode(&req.path),
        ) else {
            return VerifyOutcome::validation_error(req);
        };
        let (Some(job_target), Some(block_target)) =
            (parse_target(&req.job_target), parse_target(&req.template_expanded))
        else {
            return VerifyOutcome::validation_error(req);
        };

        let mut hasher = Sha3_256::new();
        hasher.update(&header);
        hasher.update(&nonce);
        hasher.update(&path);
        let digest = hasher.finalize();
        let hash_value = BigUint::from_bytes_be(&digest);

        let kind = if hash_value <= block_target {
            ShareKind::BlockFound
        } else if hash_value <= job_target {
            ShareKind::Accepted
        } else {
            ShareKind::Rejected
        };

        let block_hex_updated = (kind == ShareKind::BlockFound).then(|| {
            let body = req.template_blockhex.get(req.job_data.len()..).unwrap_or("");
            format!("{}{}{}{}", req.job_data, req.nonce, req.path, body).to_lowercase()
        });

        VerifyOutcome {
            kind,
            target: req.job_target.clone(),
            nonce: req.nonce.clone(),
            hash: hex::encode(digest),
            path: req.path.clone(),
            block_hex_updated,
        }
    }
}

#[async_trait]
impl ShareVerifier for Sha3Verifier {
    async fn verify(&self, req: VerifyRequest) -> Result<VerifyOutcome> {
        tokio::task::spawn_blocking(move || Self::verify_blocking(&req))
            .await
            .map_err(|e| anyhow!("verifier task failed: {}", e))
    }
}

/// Runs at most `max_concurrent` verifications at once and gives up on any
/// that exceed `timeout`.
pub struct BoundedVerifier {
    inner: Arc<dyn ShareVerifier>,
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl BoundedVerifier {
    pub fn new(inner: Arc<dyn ShareVerifier>, max_concurrent: usize, timeout: Duration) -> Self {
        Self {
            inner,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            timeout,
        }
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}

#[async_trait]
impl ShareVerifier for BoundedVerifier {
    async fn verify(&self, req: VerifyRequest) -> Result<VerifyOutcome> {
        let work = async {
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| anyhow!("verifier pool closed"))?;
            self.inner.verify(req).await
        };

        match tokio::time::timeout(self.timeout, work).await {
            Ok(res) => res,
            Err(_) => {
                metrics::inc_validation_timeouts();
                Err(anyhow!("share verification timed out after {:?}", self.timeout))
            }
        }
    }
}
