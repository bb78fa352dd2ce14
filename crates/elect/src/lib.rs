//! Lease-based leader election over `coordination.k8s.io/v1`.
//!
//! One elector per manager. The elector loop reads the Lease, decides whether
//! to acquire, renew or wait, and applies the write with optimistic
//! concurrency; a 409 means another candidate won the race. Promotion and
//! demotion are surfaced through [`ElectionHooks`].

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{ObjectMeta, PostParams};
use kube::{Api, Client};
use metrics::Label;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use rudder_core::{Error, LeaseConfig, Result};

/// Callbacks fired on leadership transitions. `on_promotion` runs before the
/// caller is considered leader; an error there aborts the term.
#[async_trait]
pub trait ElectionHooks: Send + Sync + 'static {
    async fn on_promotion(&self) -> Result<()>;
    async fn on_demotion(&self);
    async fn on_new_leader(&self, identity: &str);
}

/// What the elector should do with the Lease it just observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Lease is free, expired, or already ours with no holder recorded.
    Acquire,
    /// We hold it; refresh renewTime.
    Renew,
    /// Someone else holds a live lease.
    Wait { holder: String },
}

/// Pure election decision. `renew_time` and `holder` come from the observed
/// Lease spec; a missing renewTime on a held lease counts as expired.
pub fn judge(
    now: DateTime<Utc>,
    identity: &str,
    holder: Option<&str>,
    renew_time: Option<DateTime<Utc>>,
    lease_duration: Duration,
) -> Verdict {
    let Some(holder) = holder.filter(|h| !h.is_empty()) else {
        return Verdict::Acquire;
    };
    if holder == identity {
        return Verdict::Renew;
    }
    let expired = match renew_time {
        Some(renewed) => {
            let deadline = renewed
                + chrono::Duration::from_std(lease_duration)
                    .unwrap_or_else(|_| chrono::Duration::seconds(15));
            now > deadline
        }
        None => true,
    };
    if expired {
        Verdict::Acquire
    } else {
        Verdict::Wait { holder: holder.to_string() }
    }
}

/// Candidate identity: pod hostname plus a random suffix, so restarted pods
/// never mistake a stale lease for their own.
pub fn default_identity() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "rudder".to_string());
    format!("{host}_{}", uuid::Uuid::new_v4())
}

pub struct LeaderElector {
    api: Api<Lease>,
    lease_name: String,
    identity: String,
    config: LeaseConfig,
    hooks: Arc<dyn ElectionHooks>,
    is_leader: AtomicBool,
    labels: Vec<Label>,
}

impl LeaderElector {
    pub fn new(
        client: Client,
        lease_name: String,
        identity: String,
        config: LeaseConfig,
        hooks: Arc<dyn ElectionHooks>,
        operator: &str,
    ) -> Arc<Self> {
        let api = Api::namespaced(client, &config.namespace);
        let labels = vec![
            Label::new("operator", operator.to_string()),
            Label::new("lease", lease_name.clone()),
        ];
        Arc::new(Self {
            api,
            lease_name,
            identity,
            config,
            hooks,
            is_leader: AtomicBool::new(false),
            labels,
        })
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Run until the token cancels. A failed promotion demotes, sits out a
    /// full lease duration so another candidate can take over, and restarts
    /// the campaign from scratch.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                outcome = self.campaign(&shutdown) => match outcome {
                    CampaignEnd::Shutdown => break,
                    CampaignEnd::PromotionFailed => {
                        warn!(
                            lease = %self.lease_name,
                            "promotion hook failed; standing down for a full lease term"
                        );
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(self.config.lease_duration) => {}
                        }
                    }
                }
            }
        }
        if self.is_leader.swap(false, Ordering::SeqCst) {
            self.hooks.on_demotion().await;
            self.release().await;
        }
        self.record_leader(false);
        info!(lease = %self.lease_name, identity = %self.identity, "elector stopped");
    }

    async fn campaign(&self, shutdown: &CancellationToken) -> CampaignEnd {
        let mut observed_holder: Option<String> = None;
        loop {
            match self.tick(&mut observed_holder).await {
                Ok(TickOutcome::Continue) => {}
                Ok(TickOutcome::PromotionFailed) => return CampaignEnd::PromotionFailed,
                Err(err) => {
                    warn!(lease = %self.lease_name, error = %err, "election tick failed");
                    if self.is_leader.swap(false, Ordering::SeqCst) {
                        self.record_leader(false);
                        self.hooks.on_demotion().await;
                    }
                }
            }
            let pause = self.jittered(self.retry_interval());
            tokio::select! {
                _ = shutdown.cancelled() => return CampaignEnd::Shutdown,
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// One observe/decide/apply round.
    async fn tick(&self, observed_holder: &mut Option<String>) -> Result<TickOutcome> {
        let existing = self.api.get_opt(&self.lease_name).await?;
        let now = Utc::now();
        let (holder, renew_time) = match existing.as_ref().and_then(|l| l.spec.as_ref()) {
            Some(spec) => (
                spec.holder_identity.clone(),
                spec.renew_time.as_ref().map(|t| t.0),
            ),
            None => (None, None),
        };

        if let Some(holder) = holder.as_deref().filter(|h| !h.is_empty()) {
            if observed_holder.as_deref() != Some(holder) {
                observed_holder.replace(holder.to_string());
                if holder != self.identity {
                    self.hooks.on_new_leader(holder).await;
                }
            }
        }

        match judge(now, &self.identity, holder.as_deref(), renew_time, self.config.lease_duration)
        {
            Verdict::Wait { holder } => {
                if self.is_leader.swap(false, Ordering::SeqCst) {
                    self.record_leader(false);
                    info!(lease = %self.lease_name, new_holder = %holder, "lost leadership");
                    self.hooks.on_demotion().await;
                }
                debug!(lease = %self.lease_name, holder = %holder, "lease held elsewhere");
                Ok(TickOutcome::Continue)
            }
            verdict @ (Verdict::Acquire | Verdict::Renew) => {
                let taking_over = verdict == Verdict::Acquire;
                match self.write_lease(existing, now, taking_over).await {
                    Ok(()) => {}
                    Err(Error::LeaseConflict(detail)) => {
                        debug!(lease = %self.lease_name, %detail, "lost the lease write race");
                        return Ok(TickOutcome::Continue);
                    }
                    Err(err) => return Err(err),
                }
                if !self.is_leader.swap(true, Ordering::SeqCst) {
                    info!(lease = %self.lease_name, identity = %self.identity, "promoted to leader");
                    self.record_leader(true);
                    if let Err(err) = self.hooks.on_promotion().await {
                        error!(lease = %self.lease_name, error = %err, "promotion hook failed");
                        self.is_leader.store(false, Ordering::SeqCst);
                        self.record_leader(false);
                        self.hooks.on_demotion().await;
                        self.release().await;
                        return Ok(TickOutcome::PromotionFailed);
                    }
                }
                Ok(TickOutcome::Continue)
            }
        }
    }

    /// Create or CAS-replace the Lease with ourselves as holder. A 409 from
    /// the API server surfaces as [`Error::LeaseConflict`].
    async fn write_lease(
        &self,
        existing: Option<Lease>,
        now: DateTime<Utc>,
        taking_over: bool,
    ) -> Result<()> {
        let duration_secs = self.config.lease_duration.as_secs() as i32;
        let result = match existing {
            None => {
                let lease = Lease {
                    metadata: ObjectMeta {
                        name: Some(self.lease_name.clone()),
                        namespace: Some(self.config.namespace.clone()),
                        ..Default::default()
                    },
                    spec: Some(LeaseSpec {
                        holder_identity: Some(self.identity.clone()),
                        lease_duration_seconds: Some(duration_secs),
                        acquire_time: Some(MicroTime(now)),
                        renew_time: Some(MicroTime(now)),
                        lease_transitions: Some(0),
                        ..Default::default()
                    }),
                };
                self.api.create(&PostParams::default(), &lease).await
            }
            Some(mut lease) => {
                let spec = lease.spec.get_or_insert_with(Default::default);
                if taking_over {
                    spec.acquire_time = Some(MicroTime(now));
                    spec.lease_transitions = Some(spec.lease_transitions.unwrap_or(0) + 1);
                }
                spec.holder_identity = Some(self.identity.clone());
                spec.lease_duration_seconds = Some(duration_secs);
                spec.renew_time = Some(MicroTime(now));
                // resourceVersion is still set from the read, so this replace
                // fails with a conflict if anyone wrote in between.
                self.api.replace(&self.lease_name, &PostParams::default(), &lease).await
            }
        };
        match result {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                Err(Error::LeaseConflict(ae.message))
            }
            Err(err) => Err(Error::Api(err)),
        }
    }

    /// Best-effort release on shutdown so a successor need not wait out the
    /// lease term.
    async fn release(&self) {
        let existing = match self.api.get_opt(&self.lease_name).await {
            Ok(Some(lease)) => lease,
            Ok(None) => return,
            Err(err) => {
                debug!(lease = %self.lease_name, error = %err, "release read failed");
                return;
            }
        };
        let ours = existing
            .spec
            .as_ref()
            .and_then(|s| s.holder_identity.as_deref())
            .map(|h| h == self.identity)
            .unwrap_or(false);
        if !ours {
            return;
        }
        let mut lease = existing;
        if let Some(spec) = lease.spec.as_mut() {
            spec.holder_identity = Some(String::new());
            spec.renew_time = None;
        }
        if let Err(err) = self.api.replace(&self.lease_name, &PostParams::default(), &lease).await
        {
            debug!(lease = %self.lease_name, error = %err, "lease release failed");
        }
    }

    /// Renew well inside the lease term; the renew deadline bounds how long a
    /// leader may go without a successful write.
    fn retry_interval(&self) -> Duration {
        if self.is_leader() {
            self.config.retry_period.min(self.config.renew_deadline / 2)
        } else {
            self.config.retry_period
        }
    }

    fn jittered(&self, base: Duration) -> Duration {
        let factor = rand::thread_rng().gen_range(0.0..=0.2);
        base + base.mul_f64(factor)
    }

    fn record_leader(&self, leading: bool) {
        metrics::gauge!(
            "leader_election_master_status",
            if leading { 1.0 } else { 0.0 },
            self.labels.clone()
        );
    }
}

enum TickOutcome {
    Continue,
    PromotionFailed,
}

enum CampaignEnd {
    Shutdown,
    PromotionFailed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const ME: &str = "pod-a_4b2e";
    const OTHER: &str = "pod-b_91c0";

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn free_lease_is_acquired() {
        assert_eq!(judge(at(0), ME, None, None, Duration::from_secs(15)), Verdict::Acquire);
        assert_eq!(judge(at(0), ME, Some(""), None, Duration::from_secs(15)), Verdict::Acquire);
    }

    #[test]
    fn own_lease_is_renewed() {
        let verdict = judge(at(10), ME, Some(ME), Some(at(0)), Duration::from_secs(15));
        assert_eq!(verdict, Verdict::Renew);
    }

    #[test]
    fn live_foreign_lease_waits() {
        let verdict = judge(at(10), ME, Some(OTHER), Some(at(0)), Duration::from_secs(15));
        assert_eq!(verdict, Verdict::Wait { holder: OTHER.to_string() });
    }

    #[test]
    fn expired_foreign_lease_is_taken_over() {
        let verdict = judge(at(16), ME, Some(OTHER), Some(at(0)), Duration::from_secs(15));
        assert_eq!(verdict, Verdict::Acquire);
    }

    #[test]
    fn boundary_renew_time_is_not_expired() {
        // now == renew + duration is still inside the term.
        let verdict = judge(at(15), ME, Some(OTHER), Some(at(0)), Duration::from_secs(15));
        assert_eq!(verdict, Verdict::Wait { holder: OTHER.to_string() });
    }

    #[test]
    fn held_lease_without_renew_time_counts_as_expired() {
        let verdict = judge(at(0), ME, Some(OTHER), None, Duration::from_secs(15));
        assert_eq!(verdict, Verdict::Acquire);
    }

    #[test]
    fn identities_are_unique_per_process() {
        let a = default_identity();
        let b = default_identity();
        assert_ne!(a, b);
        assert!(a.contains('_'));
    }
}
