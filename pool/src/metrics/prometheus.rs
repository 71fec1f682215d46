use prometheus::core::Collector;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder};
use std::sync::OnceLock;

static ACCEPTED: OnceLock<IntCounter> = OnceLock::new();
static REJECTED: OnceLock<IntCounter> = OnceLock::new();
static BLOCKS_FOUND: OnceLock<IntCounter> = OnceLock::new();
static BLOCK_SUBMIT_FAILURES: OnceLock<IntCounter> = OnceLock::new();
static VALIDATION_ERRORS: OnceLock<IntCounter> = OnceLock::new();
static VALIDATION_TIMEOUTS: OnceLock<IntCounter> = OnceLock::new();

static VARDIFF_RETARGETS: OnceLock<IntCounter> = OnceLock::new();
static STALE_CORRECTIONS: OnceLock<IntCounter> = OnceLock::new();
static PROACTIVE_CORRECTIONS: OnceLock<IntCounter> = OnceLock::new();
static JOB_BROADCASTS: OnceLock<IntCounter> = OnceLock::new();
static POLICY_CLOSES: OnceLock<IntCounter> = OnceLock::new();

static RPC_REQUESTS: OnceLock<IntCounter> = OnceLock::new();
static RPC_ERRORS: OnceLock<IntCounter> = OnceLock::new();
static TEMPLATE_UPDATES: OnceLock<IntCounter> = OnceLock::new();
static TEMPLATE_FETCH_ERRORS: OnceLock<IntCounter> = OnceLock::new();
static STORAGE_ERRORS: OnceLock<IntCounter> = OnceLock::new();

static ACTIVE_CONNECTIONS: OnceLock<IntGauge> = OnceLock::new();
static TEMPLATE_HEIGHT: OnceLock<IntGauge> = OnceLock::new();

// ── Per-miner labeled metrics ──────────────────────────────────────
static MINER_SHARES: OnceLock<IntCounterVec> = OnceLock::new();

fn counter(cell: &'static OnceLock<IntCounter>, name: &str, help: &str) -> &'static IntCounter {
    cell.get_or_init(|| IntCounter::new(name, help).unwrap())
}

fn gauge(cell: &'static OnceLock<IntGauge>, name: &str, help: &str) -> &'static IntGauge {
    cell.get_or_init(|| IntGauge::new(name, help).unwrap())
}

fn accepted() -> &'static IntCounter {
    counter(&ACCEPTED, "shares_accepted_total", "Total accepted shares")
}

fn rejected() -> &'static IntCounter {
    counter(&REJECTED, "shares_rejected_total", "Total rejected shares")
}

fn blocks_found() -> &'static IntCounter {
    counter(&BLOCKS_FOUND, "blocks_found_total", "Total blocks accepted by the node")
}

fn block_submit_failures() -> &'static IntCounter {
    counter(
        &BLOCK_SUBMIT_FAILURES,
        "block_submit_failures_total",
        "Found blocks the node rejected or could not be sent",
    )
}

fn validation_errors() -> &'static IntCounter {
    counter(
        &VALIDATION_ERRORS,
        "share_validation_errors_total",
        "Submissions the verifier could not evaluate (silently dropped)",
    )
}

fn validation_timeouts() -> &'static IntCounter {
    counter(
        &VALIDATION_TIMEOUTS,
        "share_validation_timeouts_total",
        "Share verifications abandoned after the timeout",
    )
}

fn vardiff_retargets() -> &'static IntCounter {
    counter(&VARDIFF_RETARGETS, "vardiff_retargets_total", "Total per-share VarDiff adjustments")
}

fn stale_corrections() -> &'static IntCounter {
    counter(
        &STALE_CORRECTIONS,
        "vardiff_stale_corrections_total",
        "Difficulty halvings for silent miners",
    )
}

fn proactive_corrections() -> &'static IntCounter {
    counter(
        &PROACTIVE_CORRECTIONS,
        "vardiff_proactive_corrections_total",
        "Sweep-driven difficulty corrections",
    )
}

fn job_broadcasts() -> &'static IntCounter {
    counter(&JOB_BROADCASTS, "job_broadcasts_total", "Total new-template job broadcasts")
}

fn policy_closes() -> &'static IntCounter {
    counter(
        &POLICY_CLOSES,
        "connections_policy_closed_total",
        "Connections closed for a policy violation",
    )
}

fn rpc_requests() -> &'static IntCounter {
    counter(&RPC_REQUESTS, "rpc_requests_total", "Total RPC requests to the node")
}

fn rpc_errors() -> &'static IntCounter {
    counter(&RPC_ERRORS, "rpc_errors_total", "Total failed RPC requests")
}

fn template_updates() -> &'static IntCounter {
    counter(&TEMPLATE_UPDATES, "template_updates_total", "Block templates that changed the work")
}

fn template_fetch_errors() -> &'static IntCounter {
    counter(
        &TEMPLATE_FETCH_ERRORS,
        "template_fetch_errors_total",
        "Failed block template fetches",
    )
}

fn storage_errors() -> &'static IntCounter {
    counter(&STORAGE_ERRORS, "storage_errors_total", "Share store and ban list failures")
}

fn active_connections() -> &'static IntGauge {
    gauge(&ACTIVE_CONNECTIONS, "active_connections", "Open miner connections")
}

fn template_height() -> &'static IntGauge {
    gauge(&TEMPLATE_HEIGHT, "template_height", "Height of the current block template")
}

fn miner_shares() -> &'static IntCounterVec {
    MINER_SHARES.get_or_init(|| {
        IntCounterVec::new(
            Opts::new("miner_shares_total", "Total shares per miner"),
            &["miner", "status"],
        )
        .unwrap()
    })
}

pub fn inc_accepted() {
    accepted().inc();
}

pub fn inc_rejected() {
    rejected().inc();
}

pub fn inc_blocks_found() {
    blocks_found().inc();
}

pub fn inc_block_submit_failures() {
    block_submit_failures().inc();
}

pub fn inc_validation_errors() {
    validation_errors().inc();
}

pub fn inc_validation_timeouts() {
    validation_timeouts().inc();
}

pub fn inc_vardiff_retarget() {
    vardiff_retargets().inc();
}

pub fn inc_stale_corrections() {
    stale_corrections().inc();
}

pub fn inc_proactive_corrections() {
    proactive_corrections().inc();
}

pub fn inc_job_broadcasts() {
    job_broadcasts().inc();
}

pub fn inc_policy_closes() {
    policy_closes().inc();
}

pub fn inc_rpc_requests() {
    rpc_requests().inc();
}

pub fn inc_rpc_errors() {
    rpc_errors().inc();
}

pub fn inc_template_updates() {
    template_updates().inc();
}

pub fn inc_template_fetch_errors() {
    template_fetch_errors().inc();
}

pub fn inc_storage_errors() {
    storage_errors().inc();
}

pub fn set_active_connections(n: usize) {
    active_connections().set(n as i64);
}

pub fn set_template_height(height: u64) {
    template_height().set(height as i64);
}

pub fn inc_miner_share(miner: &str, valid: bool) {
    let status = if valid { "valid" } else { "invalid" };
    miner_shares().with_label_values(&[miner, status]).inc();
}

/// Remove label sets for a departed miner (cardinality control)
pub fn remove_miner(miner: &str) {
    let _ = miner_shares().remove_label_values(&[miner, "valid"]);
    let _ = miner_shares().remove_label_values(&[miner, "invalid"]);
}

pub fn render() -> String {
    let enc = TextEncoder::new();
    let mut mfs = Vec::new();

    mfs.extend(accepted().collect());
    mfs.extend(rejected().collect());
    mfs.extend(blocks_found().collect());
    mfs.extend(block_submit_failures().collect());
    mfs.extend(validation_errors().collect());
    mfs.extend(validation_timeouts().collect());
    mfs.extend(vardiff_retargets().collect());
    mfs.extend(stale_corrections().collect());
    mfs.extend(proactive_corrections().collect());
    mfs.extend(job_broadcasts().collect());
    mfs.extend(policy_closes().collect());
    mfs.extend(rpc_requests().collect());
    mfs.extend(rpc_errors().collect());
    mfs.extend(template_updates().collect());
    mfs.extend(template_fetch_errors().collect());
    mfs.extend(storage_errors().collect());
    mfs.extend(active_connections().collect());
    mfs.extend(template_height().collect());

    // Per-miner labeled metrics
    mfs.extend(miner_shares().collect());

    let mut buf = Vec::new();
    let _ = enc.encode(&mfs, &mut buf);
    String::from_utf8_lossy(&buf).to_string()
}
