/// Periodic difficulty sweep
///
/// Catches miners the per-share controller cannot see: ones that stopped
/// submitting, and ones whose rolling rate is far off target.

use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time;

use crate::jobs::JobDispatcher;
use crate::metrics::prometheus as metrics;
use crate::session::SessionRegistry;
use crate::vardiff::clamp_difficulty;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub interval_secs: u64,
    /// Halve difficulty once a miner has been silent this long. A tick that
    /// halves resets the silence clock and skips the proactive checks.
    pub share_expiration_secs: f64,
    /// Silence beyond this divides difficulty by the overdue ratio. Only
    /// reachable when `share_expiration_secs > very_overdue_secs`; with the
    /// defaults the stale halving always fires first.
    pub very_overdue_secs: f64,
    /// Rolling mean below this is "too fast".
    pub fast_threshold_secs: f64,
    /// Rolling mean above this is "too slow".
    pub slow_threshold_secs: f64,
    pub overdue_cap: f64,
    pub correction_cap: f64,
    /// Minimum spacing between proactive corrections for one miner.
    pub cooldown_secs: f64,
    pub min_samples: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            share_expiration_secs: 90.0,
            very_overdue_secs: 150.0,
            fast_threshold_secs: 60.0,
            slow_threshold_secs: 150.0,
            overdue_cap: 3.0,
            correction_cap: 2.0,
            cooldown_secs: 25.0,
            min_samples: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub stale: usize,
    pub proactive: usize,
    pub reissued: usize,
}

pub struct StaleSweeper {
    dispatcher: Arc<JobDispatcher>,
    registry: Arc<SessionRegistry>,
    target_share_secs: f64,
    cfg: SweepConfig,
}

impl StaleSweeper {
    pub fn new(
        dispatcher: Arc<JobDispatcher>,
        registry: Arc<SessionRegistry>,
        target_share_secs: f64,
        cfg: SweepConfig,
    ) -> Self {
        Self {
            dispatcher,
            registry,
            target_share_secs: target_share_secs.max(1.0),
            cfg,
        }
    }

    /// Proactive correction for one miner, if any branch applies.
    fn proactive_difficulty(&self, current: f64, since_share: f64, rolling_mean: Option<f64>) -> Option<f64> {
        if since_share > self.cfg.very_overdue_secs {
            let factor = (since_share / self.target_share_secs).min(self.cfg.overdue_cap);
            return Some(current / factor.max(1.0));
        }

        let avg = rolling_mean?;
        if avg < self.cfg.fast_threshold_secs {
            let ratio = self.target_share_secs / avg.max(0.001);
            Some(current * ratio.min(self.cfg.correction_cap))
        } else if avg > self.cfg.slow_threshold_secs {
            let ratio = avg / self.target_share_secs;
            Some(current / ratio.min(self.cfg.correction_cap))
        } else {
            None
        }
    }

    /// One pass over every connection.
    pub async fn sweep(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        let Some(template) = self.dispatcher.current_template().await else {
            return report;
        };
        let block_difficulty = template.block_difficulty();

        for session in self.dispatcher.sessions().await {
            let mut session = session.write().await;
            if !session.is_open() {
                continue;
            }
            let Some(miner_id) = session.miner_id.clone() else {
                continue;
            };
            let Some(state) = self.registry.get(&miner_id).await else {
                continue;
            };

            let mut corrected = false;
            {
                let mut state = state.lock().await;
                let since_share = now.saturating_duration_since(state.last_share).as_secs_f64();

                if since_share > self.cfg.share_expiration_secs {
                    let halved = (session.difficulty * 0.5).max(1.0);
                    session.difficulty = clamp_difficulty(halved, block_difficulty);
                    state.last_share = now;
                    corrected = true;
                    report.stale += 1;
                    metrics::inc_stale_corrections();
                    tracing::debug!(
                        "Stale miner {} ({:.0}s silent), difficulty -> {:.3}",
                        miner_id,
                        since_share,
                        session.difficulty
                    );
                } else {
                    let since_proactive = now
                        .saturating_duration_since(state.last_proactive_adjust)
                        .as_secs_f64();
                    let rolling_mean = if state.window.len() >= self.cfg.min_samples {
                        state.window.mean()
                    } else {
                        None
                    };

                    if since_proactive >= self.cfg.cooldown_secs {
                        if let Some(next) = self.proactive_difficulty(session.difficulty, since_share, rolling_mean) {
                            session.difficulty = clamp_difficulty(next, block_difficulty);
                            state.last_proactive_adjust = now;
                            session.last_proactive_adjust = Some(now);
                            corrected = true;
                            report.proactive += 1;
                            metrics::inc_proactive_corrections();
                            tracing::debug!(
                                "Proactive retarget for {}, difficulty -> {:.3}",
                                miner_id,
                                session.difficulty
                            );
                        }
                    }
                }
            }

            if corrected {
                session.current_job = None;
                if self.dispatcher.issue_job(&mut session, now).await {
                    report.reissued += 1;
                }
            }
        }

        report
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = time::interval(Duration::from_secs(self.cfg.interval_secs.max(1)));
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            interval.tick().await;

            loop {
                interval.tick().await;
                if self.dispatcher.is_draining() {
                    break;
                }
                let report = self.sweep(Instant::now()).await;
                if report.stale + report.proactive > 0 {
                    tracing::info!(
                        "Sweep: {} stale, {} proactive, {} jobs reissued",
                        report.stale,
                        report.proactive,
                        report.reissued
                    );
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::TemplateJobBuilder;
    use crate::session::SharedSession;
    use crate::stratum::protocol::{Outbound, ServerMessage};
    use crate::test_utils::{template, test_session};
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Fixture {
        dispatcher: Arc<JobDispatcher>,
        registry: Arc<SessionRegistry>,
        sweeper: StaleSweeper,
    }

    async fn fixture() -> Fixture {
        let registry = Arc::new(SessionRegistry::new(15));
        let dispatcher = Arc::new(JobDispatcher::new(
            Arc::new(TemplateJobBuilder::new()),
            registry.clone(),
        ));
        dispatcher.set_template(template(1)).await;
        let sweeper = StaleSweeper::new(dispatcher.clone(), registry.clone(), 120.0, SweepConfig::default());
        Fixture { dispatcher, registry, sweeper }
    }

    async fn bound(f: &Fixture, miner: &str, difficulty: f64, start: Instant) -> (SharedSession, UnboundedReceiver<Outbound>) {
        let (session, rx) = test_session(miner, difficulty);
        session.write().await.bind_miner(miner.to_string());
        f.registry.get_or_create(miner, start).await;
        f.dispatcher.register(session.clone()).await;
        (session, rx)
    }

    fn jobs(rx: &mut UnboundedReceiver<Outbound>) -> usize {
        let mut n = 0;
        while let Ok(msg) = rx.try_recv() {
            if matches!(msg, Outbound::Message(ServerMessage::Job { .. })) {
                n += 1;
            }
        }
        n
    }

    #[tokio::test]
    async fn stale_miner_is_halved_once() {
        let f = fixture().await;
        let start = Instant::now();
        let (session, mut rx) = bound(&f, "m1", 64.0, start).await;

        let now = start + Duration::from_secs(91);
        let report = f.sweeper.sweep(now).await;
        assert_eq!(report.stale, 1);
        assert_eq!(report.reissued, 1);
        assert_eq!(session.read().await.difficulty, 32.0);
        assert_eq!(jobs(&mut rx), 1);

        let report = f.sweeper.sweep(now + Duration::from_millis(10)).await;
        assert_eq!(report, SweepReport::default());
        assert_eq!(session.read().await.difficulty, 32.0);
        assert_eq!(jobs(&mut rx), 0);
    }

    #[tokio::test]
    async fn stale_halving_floors_at_one() {
        let f = fixture().await;
        let start = Instant::now();
        let (session, _rx) = bound(&f, "m1", 1.5, start).await;

        f.sweeper.sweep(start + Duration::from_secs(95)).await;
        assert_eq!(session.read().await.difficulty, 1.0);
    }

    #[tokio::test]
    async fn unbound_and_closed_sessions_are_skipped() {
        let f = fixture().await;
        let start = Instant::now();

        let (anon, mut anon_rx) = test_session("anon", 8.0);
        f.dispatcher.register(anon.clone()).await;

        let (closed, _rx) = bound(&f, "m2", 8.0, start).await;
        closed.write().await.close(crate::error::CloseReason::policy("Bye."));

        let report = f.sweeper.sweep(start + Duration::from_secs(200)).await;
        assert_eq!(report, SweepReport::default());
        assert_eq!(anon.read().await.difficulty, 8.0);
        assert_eq!(closed.read().await.difficulty, 8.0);
        assert_eq!(jobs(&mut anon_rx), 0);
    }

    #[tokio::test]
    async fn fast_miner_is_raised_with_cooldown() {
        let f = fixture().await;
        let start = Instant::now();
        let (session, mut rx) = bound(&f, "fast", 10.0, start).await;
        {
            let state = f.registry.get("fast").await.unwrap();
            let mut state = state.lock().await;
            for _ in 0..3 {
                state.window.push(20.0);
            }
        }

        let now = start + Duration::from_secs(30);
        // ratio 120/20 capped at 2
        let report = f.sweeper.sweep(now).await;
        assert_eq!(report.proactive, 1);
        assert_eq!(session.read().await.difficulty, 20.0);
        assert_eq!(session.read().await.last_proactive_adjust, Some(now));
        assert_eq!(jobs(&mut rx), 1);

        // inside the cooldown nothing changes
        let report = f.sweeper.sweep(now + Duration::from_secs(10)).await;
        assert_eq!(report.proactive, 0);
        assert_eq!(session.read().await.difficulty, 20.0);
    }

    #[tokio::test]
    async fn slow_miner_is_lowered() {
        let f = fixture().await;
        let start = Instant::now();
        let (session, _rx) = bound(&f, "slow", 30.0, start).await;
        {
            let state = f.registry.get("slow").await.unwrap();
            let mut state = state.lock().await;
            for _ in 0..4 {
                state.window.push(180.0);
            }
        }

        f.sweeper.sweep(start + Duration::from_secs(40)).await;
        // ratio 180/120 = 1.5
        assert_eq!(session.read().await.difficulty, 20.0);
    }

    #[tokio::test]
    async fn too_few_samples_leave_difficulty_alone() {
        let f = fixture().await;
        let start = Instant::now();
        let (session, _rx) = bound(&f, "new", 10.0, start).await;
        {
            let state = f.registry.get("new").await.unwrap();
            state.lock().await.window.push(1.0);
        }

        let report = f.sweeper.sweep(start + Duration::from_secs(30)).await;
        assert_eq!(report, SweepReport::default());
        assert_eq!(session.read().await.difficulty, 10.0);
    }

    #[test]
    fn very_overdue_branch_divides_by_capped_ratio() {
        let registry = Arc::new(SessionRegistry::new(15));
        let dispatcher = Arc::new(JobDispatcher::new(Arc::new(TemplateJobBuilder::new()), registry.clone()));
        let sweeper = StaleSweeper::new(dispatcher, registry, 120.0, SweepConfig::default());

        assert_eq!(sweeper.proactive_difficulty(90.0, 240.0, None), Some(45.0));
        assert_eq!(sweeper.proactive_difficulty(90.0, 1_000.0, None), Some(30.0));
        assert_eq!(sweeper.proactive_difficulty(90.0, 100.0, Some(120.0)), None);
        assert_eq!(sweeper.proactive_difficulty(90.0, 100.0, None), None);
    }

    #[tokio::test]
    async fn very_overdue_needs_longer_expiry() {
        let start = Instant::now();
        let silent = start + Duration::from_secs(300);

        // defaults: the stale halving wins
        let f = fixture().await;
        let (session, _rx) = bound(&f, "m1", 90.0, start).await;
        let report = f.sweeper.sweep(silent).await;
        assert_eq!((report.stale, report.proactive), (1, 0));
        assert_eq!(session.read().await.difficulty, 45.0);

        let f = fixture().await;
        let sweeper = StaleSweeper::new(
            f.dispatcher.clone(),
            f.registry.clone(),
            120.0,
            SweepConfig {
                share_expiration_secs: 400.0,
                ..SweepConfig::default()
            },
        );
        let (session, _rx) = bound(&f, "m1", 90.0, start).await;
        let report = sweeper.sweep(silent).await;
        assert_eq!((report.stale, report.proactive), (0, 1));
        // 300s / 120s = 2.5
        assert_eq!(session.read().await.difficulty, 36.0);
    }

    #[tokio::test]
    async fn nothing_happens_without_template() {
        let registry = Arc::new(SessionRegistry::new(15));
        let dispatcher = Arc::new(JobDispatcher::new(Arc::new(TemplateJobBuilder::new()), registry.clone()));
        let sweeper = StaleSweeper::new(dispatcher.clone(), registry.clone(), 120.0, SweepConfig::default());

        let start = Instant::now();
        let (session, _rx) = test_session("m", 16.0);
        session.write().await.bind_miner("m".to_string());
        registry.get_or_create("m", start).await;
        dispatcher.register(session.clone()).await;

        assert_eq!(sweeper.sweep(start + Duration::from_secs(500)).await, SweepReport::default());
        assert_eq!(session.read().await.difficulty, 16.0);
    }
}
