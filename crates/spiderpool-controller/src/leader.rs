use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use spiderpool_core::Lease;
use spiderpool_store::{Repository, Store, StoreError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Configuration for lease-based leader election
#[derive(Debug, Clone)]
pub struct LeaderConfig {
    /// Identity written into the lease (unique per replica)
    pub identity: String,
    pub lease_namespace: String,
    pub lease_name: String,
    /// A lease not renewed for this long may be taken over
    pub lease_duration: Duration,
    /// Interval between renew attempts
    pub renew_interval: Duration,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            identity: format!("spiderpool-controller-{}", std::process::id()),
            lease_namespace: "spiderpool".to_string(),
            lease_name: "spiderpool-controller-leader".to_string(),
            lease_duration: Duration::from_secs(15),
            renew_interval: Duration::from_secs(5),
        }
    }
}

/// Single-leader election over a store-backed Lease.
///
/// Non-leaders keep serving webhooks; only the elected replica runs the
/// garbage collector and subnet reconciler. Losing the lease cancels the
/// leader token within one renew interval.
pub struct LeaderElector {
    leases: Repository<Lease>,
    cfg: LeaderConfig,
    elected: AtomicBool,
    leader_token: parking_lot::Mutex<CancellationToken>,
}

impl LeaderElector {
    pub fn new(store: &Arc<Store>, cfg: LeaderConfig) -> Arc<Self> {
        Arc::new(Self {
            leases: store.repository(),
            cfg,
            elected: AtomicBool::new(false),
            leader_token: parking_lot::Mutex::new(CancellationToken::new()),
        })
    }

    /// Whether this replica currently holds the lease
    pub fn is_elected(&self) -> bool {
        self.elected.load(Ordering::SeqCst)
    }

    /// Token cancelled when leadership is lost; refreshed on re-election
    pub fn leader_token(&self) -> CancellationToken {
        self.leader_token.lock().clone()
    }

    pub async fn run(&self, token: CancellationToken) {
        info!(
            "Starting leader election as '{}' on lease {}/{}",
            self.cfg.identity, self.cfg.lease_namespace, self.cfg.lease_name
        );

        loop {
            match self.try_acquire_or_renew() {
                Ok(elected) => self.transition(elected),
                Err(err) => {
                    warn!("Leader election round failed: {}", err);
                    // keep the current state; a stale lease expires anyway
                }
            }

            tokio::select! {
                _ = token.cancelled() => {
                    self.step_down();
                    info!("Leader elector shutting down");
                    return;
                }
                _ = tokio::time::sleep(self.cfg.renew_interval) => {}
            }
        }
    }

    fn try_acquire_or_renew(&self) -> Result<bool, StoreError> {
        let ns = Some(self.cfg.lease_namespace.as_str());
        let now = MicroTime(Utc::now());

        let Some(mut lease) = self.leases.try_get(ns, &self.cfg.lease_name)? else {
            let mut lease = Lease::default();
            lease.metadata.name = Some(self.cfg.lease_name.clone());
            lease.metadata.namespace = Some(self.cfg.lease_namespace.clone());
            let spec = lease.spec.get_or_insert_with(Default::default);
            spec.holder_identity = Some(self.cfg.identity.clone());
            spec.lease_duration_seconds = Some(self.cfg.lease_duration.as_secs() as i32);
            spec.acquire_time = Some(now.clone());
            spec.renew_time = Some(now);

            return match self.leases.create(&lease) {
                Ok(_) => {
                    debug!("Acquired fresh lease");
                    Ok(true)
                }
                // someone else created it first this round
                Err(StoreError::AlreadyExists { .. }) => Ok(false),
                Err(err) => Err(err),
            };
        };

        let spec = lease.spec.get_or_insert_with(Default::default);
        let held_by_me = spec.holder_identity.as_deref() == Some(self.cfg.identity.as_str());
        let expired = match &spec.renew_time {
            Some(renewed) => {
                let age = Utc::now().signed_duration_since(renewed.0);
                age.to_std().unwrap_or_default() > self.cfg.lease_duration
            }
            None => true,
        };

        if !held_by_me && !expired {
            return Ok(false);
        }

        if !held_by_me {
            debug!(
                "Lease held by {:?} expired, taking over",
                spec.holder_identity
            );
            spec.holder_identity = Some(self.cfg.identity.clone());
            spec.acquire_time = Some(now.clone());
            spec.lease_transitions = Some(spec.lease_transitions.unwrap_or(0) + 1);
        }
        spec.lease_duration_seconds = Some(self.cfg.lease_duration.as_secs() as i32);
        spec.renew_time = Some(now);

        match self.leases.update(&lease) {
            Ok(_) => Ok(true),
            // lost the write race; the winner is renewing
            Err(StoreError::Conflict { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn transition(&self, elected: bool) {
        let was = self.elected.swap(elected, Ordering::SeqCst);
        match (was, elected) {
            (false, true) => {
                info!("Became leader");
                *self.leader_token.lock() = CancellationToken::new();
            }
            (true, false) => {
                warn!("Lost leadership, cancelling leader-only tasks");
                self.leader_token.lock().cancel();
            }
            _ => {}
        }
    }

    fn step_down(&self) {
        if !self.is_elected() {
            return;
        }
        self.transition(false);

        // best-effort: clear the holder so a peer can take over immediately
        let ns = Some(self.cfg.lease_namespace.as_str());
        if let Ok(Some(mut lease)) = self.leases.try_get(ns, &self.cfg.lease_name) {
            if let Some(spec) = lease.spec.as_mut() {
                if spec.holder_identity.as_deref() == Some(self.cfg.identity.as_str()) {
                    spec.holder_identity = None;
                    spec.renew_time = None;
                    let _ = self.leases.update(&lease);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(identity: &str) -> LeaderConfig {
        LeaderConfig {
            identity: identity.to_string(),
            lease_duration: Duration::from_millis(200),
            renew_interval: Duration::from_millis(50),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_single_elector_wins() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("test.redb")).unwrap();
        let elector = LeaderElector::new(&store, config("a"));

        assert!(elector.try_acquire_or_renew().unwrap());
        elector.transition(true);
        assert!(elector.is_elected());
        assert!(!elector.leader_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_second_elector_defers_then_takes_over() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("test.redb")).unwrap();
        let first = LeaderElector::new(&store, config("a"));
        let second = LeaderElector::new(&store, config("b"));

        assert!(first.try_acquire_or_renew().unwrap());
        assert!(!second.try_acquire_or_renew().unwrap());

        // the first holder stops renewing; its lease expires
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(second.try_acquire_or_renew().unwrap());
    }

    #[tokio::test]
    async fn test_losing_lease_cancels_leader_token() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("test.redb")).unwrap();
        let elector = LeaderElector::new(&store, config("a"));

        elector.transition(true);
        let leader_token = elector.leader_token();
        assert!(!leader_token.is_cancelled());

        elector.transition(false);
        assert!(leader_token.is_cancelled());
        assert!(!elector.is_elected());
    }

    #[tokio::test]
    async fn test_run_loop_elects_and_steps_down() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("test.redb")).unwrap();
        let elector = LeaderElector::new(&store, config("a"));

        let token = CancellationToken::new();
        let run_token = token.clone();
        let run_elector = Arc::clone(&elector);
        let handle = tokio::spawn(async move { run_elector.run(run_token).await });

        for _ in 0..50 {
            if elector.is_elected() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(elector.is_elected());

        token.cancel();
        handle.await.unwrap();
        assert!(!elector.is_elected());
    }
}
