use crate::manager::SubnetManager;
use crate::name::AppRef;
use spiderpool_core::annotations::{
    AutoPoolIpNumber, ANNO_POD_IPPOOL_IP_NUMBER, ANNO_POD_RECLAIM_IPPOOL,
};
use spiderpool_core::types::OwnerKind;
use spiderpool_core::{constants, IpamError, Resource, Result, SpiderIPPool, SpiderSubnet};
use spiderpool_metrics::AsyncGauge;
use spiderpool_store::{
    update_status_with_retry, Mutation, Repository, ResourceEvent, RetryConfig, Store,
    WatchEventType,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Configuration for the subnet reconciler
#[derive(Debug, Clone)]
pub struct SubnetReconcilerConfig {
    /// Interval between full accounting passes
    pub resync_interval: Duration,
}

impl Default for SubnetReconcilerConfig {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(30),
        }
    }
}

const WORKLOAD_KINDS: [&str; 5] = ["StatefulSet", "Deployment", "ReplicaSet", "DaemonSet", "Job"];

/// Watches workload scale events to resize auto-pools, reclaims auto-pools
/// whose workloads are gone, and keeps Subnet status accounting current.
///
/// Runs on the elected controller leader only.
pub struct SubnetReconciler {
    store: Arc<Store>,
    mgr: Arc<SubnetManager>,
    subnets: Repository<SpiderSubnet>,
    pools: Repository<SpiderIPPool>,
    pool_count_gauge: Arc<AsyncGauge>,
    retry: RetryConfig,
    cfg: SubnetReconcilerConfig,
}

impl SubnetReconciler {
    pub fn new(
        store: Arc<Store>,
        mgr: Arc<SubnetManager>,
        pool_count_gauge: Arc<AsyncGauge>,
        cfg: SubnetReconcilerConfig,
    ) -> Self {
        Self {
            subnets: store.repository(),
            pools: store.repository(),
            store,
            mgr,
            pool_count_gauge,
            retry: RetryConfig::default(),
            cfg,
        }
    }

    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        info!("Starting subnet reconciler");
        let mut rx = self.store.subscribe();
        let mut tick = tokio::time::interval(self.cfg.resync_interval);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Subnet reconciler shutting down");
                    return Ok(());
                }
                _ = tick.tick() => {
                    if let Err(err) = self.reconcile_all().await {
                        error!("Subnet accounting pass failed: {}", err);
                    }
                }
                event = rx.recv() => match event {
                    Ok(event) => {
                        if let Err(err) = self.handle_event(&event).await {
                            error!("Failed to handle {} event for {}: {}", event.kind, event.name, err);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Missed {} events, running a full pass", n);
                        if let Err(err) = self.reconcile_all().await {
                            error!("Resync after lag failed: {}", err);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Event bus closed, stopping subnet reconciler");
                        return Ok(());
                    }
                },
            }
        }
    }

    async fn handle_event(&self, event: &ResourceEvent) -> Result<()> {
        if !WORKLOAD_KINDS.contains(&event.kind.as_str()) {
            return Ok(());
        }
        let app = AppRef::new(
            OwnerKind::from_kind(&event.kind),
            event.namespace.clone().unwrap_or_default(),
            event.name.clone(),
        );

        match event.event_type {
            WatchEventType::Modified => self.resize_app_pools(&app).await,
            WatchEventType::Deleted => self.reclaim_app_pools(&app).await,
            WatchEventType::Added => Ok(()),
        }
    }

    /// Resize every auto-pool of the application to its current desired size
    async fn resize_app_pools(&self, app: &AppRef) -> Result<()> {
        let replicas = self.mgr.desired_replicas(app)?;
        for pool in self.app_pools(app)? {
            let Some(ip_number) = pool
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(ANNO_POD_IPPOOL_IP_NUMBER))
                .and_then(|raw| raw.parse::<AutoPoolIpNumber>().ok())
            else {
                continue;
            };
            let desired = ip_number.desired(replicas);
            debug!(
                "Resizing auto-pool {} to {} for {} replicas",
                pool.name(),
                desired,
                replicas
            );
            if let Err(err) = self.mgr.resize_auto_pool(pool.name(), desired).await {
                warn!("Failed to resize auto-pool {}: {}", pool.name(), err);
            }
        }
        Ok(())
    }

    /// Reclaim the application's auto-pools once their allocations are gone
    async fn reclaim_app_pools(&self, app: &AppRef) -> Result<()> {
        for pool in self.app_pools(app)? {
            if !reclaim_enabled(&pool) {
                continue;
            }
            // false means allocations remain; the periodic pass retries
            let _ = self.mgr.reclaim_auto_pool(pool.name()).await?;
        }
        Ok(())
    }

    /// Reclaim orphaned auto-pools and refresh subnet counters
    pub async fn reconcile_all(&self) -> Result<()> {
        debug!("Running subnet accounting pass");

        for pool in self.pools.list(None).map_err(IpamError::from)? {
            let Some(app) = owner_app(&pool) else { continue };
            if reclaim_enabled(&pool) && !self.mgr.app_exists(&app)? {
                let _ = self.mgr.reclaim_auto_pool(pool.name()).await?;
            }
        }

        let mut controlled_pools = 0u64;
        for subnet in self.subnets.list(None).map_err(IpamError::from)? {
            controlled_pools += subnet
                .status
                .as_ref()
                .map(|s| s.controlled_ip_pools.len() as u64)
                .unwrap_or(0);
            self.refresh_counters(subnet.name()).await?;
        }
        self.pool_count_gauge.record(controlled_pools as f64);
        Ok(())
    }

    async fn refresh_counters(&self, subnet_name: &str) -> Result<()> {
        let mut on_conflict = |_: u32| {};
        update_status_with_retry::<_, IpamError, _>(
            &self.subnets,
            None,
            subnet_name,
            &self.retry,
            &mut on_conflict,
            |subnet: &mut SpiderSubnet| {
                let total = subnet.total_ips()?.len() as u64;
                let status = subnet.status.get_or_insert_with(Default::default);
                let allocated: u64 = status.controlled_ip_pools.values().map(|p| p.ip_count).sum();
                if status.total_ip_count == Some(total)
                    && status.allocated_ip_count == Some(allocated)
                {
                    return Ok(Mutation::Noop);
                }
                status.total_ip_count = Some(total);
                status.allocated_ip_count = Some(allocated);
                Ok(Mutation::Apply)
            },
        )
        .await?;
        Ok(())
    }

    fn app_pools(&self, app: &AppRef) -> Result<Vec<SpiderIPPool>> {
        let wanted = app.label_value();
        let pools = self.pools.list(None).map_err(IpamError::from)?;
        Ok(pools
            .into_iter()
            .filter(|p| owner_label(p).as_deref() == Some(wanted.as_str()))
            .collect())
    }
}

fn owner_label(pool: &SpiderIPPool) -> Option<String> {
    pool.metadata
        .labels
        .as_ref()?
        .get(constants::LABEL_OWNER_APPLICATION)
        .cloned()
}

fn owner_app(pool: &SpiderIPPool) -> Option<AppRef> {
    let label = owner_label(pool)?;
    let mut parts = label.splitn(3, '_');
    let kind = parts.next()?;
    let namespace = parts.next()?;
    let name = parts.next()?;
    Some(AppRef::new(OwnerKind::from_kind(kind), namespace, name))
}

fn reclaim_enabled(pool: &SpiderIPPool) -> bool {
    pool.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNO_POD_RECLAIM_IPPOOL))
        .is_some_and(|v| v == "true")
}

#[cfg(test)]
mod tests {
    use super::*;
    use spiderpool_core::annotations::AutoPoolIpNumber;
    use spiderpool_core::types::IpVersion;
    use spiderpool_core::Deployment;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, Arc<Store>, Arc<SubnetManager>, SubnetReconciler) {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("test.redb")).unwrap();
        let mgr = SubnetManager::new(&store, RetryConfig::default());
        let reconciler = SubnetReconciler::new(
            Arc::clone(&store),
            Arc::clone(&mgr),
            AsyncGauge::new("test_subnet_pools"),
            SubnetReconcilerConfig::default(),
        );
        (dir, store, mgr, reconciler)
    }

    fn subnet(name: &str, ips: &[&str]) -> SpiderSubnet {
        let mut s = SpiderSubnet::new(name);
        s.spec.ip_version = Some(IpVersion::V4);
        s.spec.subnet = "10.0.0.0/24".to_string();
        s.spec.ips = ips.iter().map(|x| x.to_string()).collect();
        s
    }

    fn deployment(name: &str, replicas: i32) -> Deployment {
        let mut d = Deployment::default();
        d.metadata.name = Some(name.to_string());
        d.metadata.namespace = Some("default".to_string());
        d.spec = Some(Default::default());
        d.spec.as_mut().unwrap().replicas = Some(replicas);
        d
    }

    #[tokio::test]
    async fn test_scale_event_resizes_pool() {
        let (_dir, store, mgr, reconciler) = setup();
        let subnets = store.repository::<SpiderSubnet>();
        let deployments = store.repository::<Deployment>();
        let pools = store.repository::<SpiderIPPool>();

        subnets.create(&subnet("s4", &["10.0.0.1-10.0.0.20"])).unwrap();
        let created = deployments.create(&deployment("web", 2)).unwrap();

        let app = AppRef::new(OwnerKind::Deployment, "default", "web");
        let pool = mgr
            .ensure_auto_pool(&app, IpVersion::V4, "s4", AutoPoolIpNumber::Flexible(1), true)
            .await
            .unwrap();
        assert_eq!(pool.total_ips().unwrap().len(), 3);

        // scale up and deliver the event
        let mut scaled = created;
        scaled.spec.as_mut().unwrap().replicas = Some(5);
        deployments.update(&scaled).unwrap();

        reconciler
            .handle_event(&ResourceEvent::modified(
                "Deployment",
                Some("default"),
                "web",
                serde_json::Value::Null,
                0,
            ))
            .await
            .unwrap();

        let resized = pools.get(None, pool.name()).unwrap();
        assert_eq!(resized.total_ips().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_orphan_pool_is_reclaimed() {
        let (_dir, store, mgr, reconciler) = setup();
        let subnets = store.repository::<SpiderSubnet>();
        let pools = store.repository::<SpiderIPPool>();

        subnets.create(&subnet("s4", &["10.0.0.1-10.0.0.20"])).unwrap();

        // the owning Deployment never existed in the store
        let app = AppRef::new(OwnerKind::Deployment, "default", "gone");
        let pool = mgr
            .ensure_auto_pool(&app, IpVersion::V4, "s4", AutoPoolIpNumber::Fixed(3), true)
            .await
            .unwrap();

        reconciler.reconcile_all().await.unwrap();
        assert!(pools.try_get(None, pool.name()).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_accounting_refreshes_counters() {
        let (_dir, store, mgr, reconciler) = setup();
        let subnets = store.repository::<SpiderSubnet>();

        subnets.create(&subnet("s4", &["10.0.0.1-10.0.0.20"])).unwrap();
        let app = AppRef::new(OwnerKind::Deployment, "default", "web");
        store
            .repository::<Deployment>()
            .create(&deployment("web", 1))
            .unwrap();
        mgr.ensure_auto_pool(&app, IpVersion::V4, "s4", AutoPoolIpNumber::Fixed(4), true)
            .await
            .unwrap();

        reconciler.reconcile_all().await.unwrap();

        let s = subnets.get(None, "s4").unwrap();
        let status = s.status.unwrap();
        assert_eq!(status.total_ip_count, Some(20));
        assert_eq!(status.allocated_ip_count, Some(4));
        assert_eq!(reconciler.pool_count_gauge.observe(), 1.0);
    }
}
