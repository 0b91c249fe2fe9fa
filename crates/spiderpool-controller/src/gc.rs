use crate::leader::LeaderElector;
use metrics::counter;
use spiderpool_core::types::OwnerKind;
use spiderpool_core::{constants, IpamError, Pod, Resource, Result, SpiderEndpoint, SpiderIPPool};
use spiderpool_metrics::names;
use spiderpool_store::{
    update_status_with_retry, update_with_retry, Mutation, Repository, ResourceEvent, RetryConfig,
    Store, StoreError, WatchEventType,
};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Configuration for the IP garbage collector
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Interval between periodic sweeps
    pub gc_interval: Duration,
    /// How long a pod must be missing before its addresses are reclaimed
    pub grace_period: Duration,
    /// Short debounce after a pod-delete event before reclaiming
    pub debounce: Duration,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            gc_interval: Duration::from_secs(600),
            grace_period: Duration::from_secs(30),
            debounce: Duration::from_millis(500),
        }
    }
}

/// Reclaims addresses stranded by missed release calls or lost pods.
///
/// Runs only on the elected leader and never concurrently with itself:
/// the periodic sweep and the event-driven path share one task.
pub struct IpGc {
    store: Arc<Store>,
    pools: Repository<SpiderIPPool>,
    endpoints: Repository<SpiderEndpoint>,
    pods: Repository<Pod>,
    leader: Arc<LeaderElector>,
    retry: RetryConfig,
    cfg: GcConfig,
    /// First time each stranded entry was seen missing, for the grace period
    missing_since: parking_lot::Mutex<HashMap<(String, IpAddr), Instant>>,
}

impl IpGc {
    pub fn new(store: Arc<Store>, leader: Arc<LeaderElector>, cfg: GcConfig) -> Self {
        Self {
            pools: store.repository(),
            endpoints: store.repository(),
            pods: store.repository(),
            store,
            leader,
            retry: RetryConfig::default(),
            cfg,
            missing_since: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        info!(
            "Starting IP garbage collector (interval {:?}, grace period {:?})",
            self.cfg.gc_interval, self.cfg.grace_period
        );
        let mut rx = self.store.subscribe();
        let mut tick = tokio::time::interval(self.cfg.gc_interval);
        // consume the immediate first tick; the startup sweep would race
        // agents still writing their first allocations
        tick.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("IP garbage collector shutting down");
                    return Ok(());
                }
                _ = tick.tick() => {
                    if !self.leader.is_elected() {
                        debug!("Not the leader, skipping GC sweep");
                        continue;
                    }
                    if let Err(err) = self.sweep().await {
                        error!("GC sweep failed: {}", err);
                    }
                }
                event = rx.recv() => match event {
                    Ok(event) => {
                        if self.leader.is_elected() {
                            if let Err(err) = self.handle_event(&event).await {
                                error!("GC event handling failed: {}", err);
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("GC missed {} events; the periodic sweep covers them", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Event bus closed, stopping IP garbage collector");
                        return Ok(());
                    }
                },
            }
        }
    }

    /// Enumerate every pool entry and reclaim the stranded ones
    pub async fn sweep(&self) -> Result<()> {
        debug!("Running GC sweep");
        for pool in self.pools.list(None).map_err(IpamError::from)? {
            let Some(status) = &pool.status else { continue };
            for (ip, alloc) in &status.allocated_ips {
                if self.should_reclaim(pool.name(), *ip, alloc)? {
                    self.reclaim_entry(pool.name(), *ip, &alloc.pod_uid).await;
                }
            }
        }
        self.clean_endpoints().await?;
        Ok(())
    }

    fn should_reclaim(
        &self,
        pool: &str,
        ip: IpAddr,
        alloc: &spiderpool_core::PoolAllocation,
    ) -> Result<bool> {
        let pod = self
            .pods
            .try_get(Some(&alloc.namespace), &alloc.pod)
            .map_err(|e| IpamError::internal(e.to_string()))?;

        let key = (pool.to_string(), ip);
        match pod {
            None => {
                let mut missing = self.missing_since.lock();
                let since = *missing.entry(key).or_insert_with(Instant::now);
                Ok(since.elapsed() >= self.cfg.grace_period)
            }
            Some(pod) => {
                self.missing_since.lock().remove(&key);
                if pod.uid() != Some(alloc.pod_uid.as_str()) {
                    // the name was reused by a new pod instance
                    return Ok(true);
                }
                let phase = pod
                    .status
                    .as_ref()
                    .and_then(|s| s.phase.as_deref())
                    .unwrap_or_default();
                let finished = matches!(phase, "Succeeded" | "Failed");
                let owner = OwnerKind::from_kind(&alloc.owner_controller_kind);
                Ok(finished && !owner.is_long_lived())
            }
        }
    }

    /// Pod-delete events reclaim the pod's recorded addresses immediately,
    /// after a short debounce for the release path to run first.
    async fn handle_event(&self, event: &ResourceEvent) -> Result<()> {
        if event.kind != "Pod" || event.event_type != WatchEventType::Deleted {
            return Ok(());
        }
        let Some(namespace) = event.namespace.as_deref() else {
            return Ok(());
        };

        tokio::time::sleep(self.cfg.debounce).await;

        let Some(endpoint) = self
            .endpoints
            .try_get(Some(namespace), &event.name)
            .map_err(|e| IpamError::internal(e.to_string()))?
        else {
            return Ok(());
        };
        let Some(current) = endpoint.status.as_ref().and_then(|s| s.current.as_ref()) else {
            self.finish_endpoint(namespace, &event.name).await?;
            return Ok(());
        };

        debug!(
            "Reclaiming {} address(es) of deleted pod {}/{}",
            current.ips.len(),
            namespace,
            event.name
        );
        for (pool, ip) in endpoint.current_ips() {
            self.reclaim_entry(&pool, ip, &current.uid).await;
        }
        self.finish_endpoint(namespace, &event.name).await?;
        Ok(())
    }

    /// Remove one pool entry, guarded by the recorded pod UID
    async fn reclaim_entry(&self, pool_name: &str, ip: IpAddr, uid: &str) {
        let uid = uid.to_string();
        let mut on_conflict = |_: u32| {};
        let result = update_status_with_retry::<_, StoreError, _>(
            &self.pools,
            None,
            pool_name,
            &self.retry,
            &mut on_conflict,
            |pool: &mut SpiderIPPool| {
                let Some(status) = pool.status.as_mut() else {
                    return Ok(Mutation::Noop);
                };
                if !status
                    .allocated_ips
                    .get(&ip)
                    .is_some_and(|entry| entry.pod_uid == uid)
                {
                    return Ok(Mutation::Noop);
                }
                status.allocated_ips.remove(&ip);
                status.allocated_ip_count = Some(status.allocated_ips.len() as u64);
                Ok(Mutation::Apply)
            },
        )
        .await;

        match result {
            Ok(_) => {
                self.missing_since.lock().remove(&(pool_name.to_string(), ip));
                counter!(names::IP_GC_COUNTS).increment(1);
                info!("GC reclaimed {} from pool {}", ip, pool_name);
            }
            Err(err) => {
                counter!(names::IP_GC_FAILURE_COUNTS).increment(1);
                warn!("GC failed to reclaim {} from pool {}: {}", ip, pool_name, err);
            }
        }
    }

    /// Endpoints whose pod is gone and whose addresses are all reclaimed
    /// lose their finalizer and are deleted.
    async fn clean_endpoints(&self) -> Result<()> {
        let internal = |e: StoreError| IpamError::internal(e.to_string());
        for endpoint in self.endpoints.list(None).map_err(internal)? {
            let Some(namespace) = endpoint.namespace().map(str::to_string) else {
                continue;
            };
            let name = endpoint.name().to_string();

            if self
                .pods
                .try_get(Some(&namespace), &name)
                .map_err(internal)?
                .is_some()
            {
                continue;
            }

            let uid = endpoint
                .status
                .as_ref()
                .and_then(|s| s.current.as_ref())
                .map(|c| c.uid.clone())
                .unwrap_or_default();
            let still_held = endpoint.current_ips().into_iter().any(|(pool, ip)| {
                self.pools
                    .try_get(None, &pool)
                    .ok()
                    .flatten()
                    .and_then(|p| p.status)
                    .is_some_and(|s| {
                        s.allocated_ips
                            .get(&ip)
                            .is_some_and(|entry| entry.pod_uid == uid)
                    })
            });
            if !still_held {
                self.finish_endpoint(&namespace, &name).await?;
            }
        }
        Ok(())
    }

    async fn finish_endpoint(&self, namespace: &str, name: &str) -> Result<()> {
        if self
            .endpoints
            .try_get(Some(namespace), name)
            .map_err(|e| IpamError::internal(e.to_string()))?
            .is_none()
        {
            return Ok(());
        }

        let mut on_conflict = |_: u32| {};
        update_with_retry::<_, IpamError, _>(
            &self.endpoints,
            Some(namespace),
            name,
            &self.retry,
            &mut on_conflict,
            |endpoint: &mut SpiderEndpoint| {
                let Some(finalizers) = endpoint.metadata.finalizers.as_mut() else {
                    return Ok(Mutation::Noop);
                };
                let before = finalizers.len();
                finalizers.retain(|f| f != constants::SPIDERPOOL_FINALIZER);
                if finalizers.len() == before {
                    return Ok(Mutation::Noop);
                }
                Ok(Mutation::Apply)
            },
        )
        .await?;

        match self.endpoints.delete(Some(namespace), name) {
            Ok(()) | Err(StoreError::NotFound { .. }) => Ok(()),
            Err(err) => Err(IpamError::internal(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leader::LeaderConfig;
    use spiderpool_core::types::IpVersion;
    use spiderpool_core::PoolAllocation;
    use tempfile::tempdir;

    fn setup(grace: Duration) -> (tempfile::TempDir, Arc<Store>, IpGc) {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("test.redb")).unwrap();
        let leader = LeaderElector::new(&store, LeaderConfig::default());
        let gc = IpGc::new(
            Arc::clone(&store),
            leader,
            GcConfig {
                gc_interval: Duration::from_secs(600),
                grace_period: grace,
                debounce: Duration::from_millis(1),
            },
        );
        (dir, store, gc)
    }

    fn pool_with_entry(
        store: &Arc<Store>,
        name: &str,
        ip: &str,
        uid: &str,
        pod: &str,
        owner_kind: &str,
    ) -> SpiderIPPool {
        let pools = store.repository::<SpiderIPPool>();
        let mut pool = SpiderIPPool::new(name);
        pool.spec.ip_version = Some(IpVersion::V4);
        pool.spec.subnet = "10.0.0.0/24".to_string();
        pool.spec.ips = vec!["10.0.0.1-10.0.0.9".to_string()];
        let mut created = pools.create(&pool).unwrap();

        let status = created.status.get_or_insert_with(Default::default);
        status.allocated_ips.insert(
            ip.parse().unwrap(),
            PoolAllocation {
                pod_uid: uid.to_string(),
                pod: pod.to_string(),
                namespace: "ns".to_string(),
                nic: "eth0".to_string(),
                owner_controller_kind: owner_kind.to_string(),
                ..Default::default()
            },
        );
        status.allocated_ip_count = Some(1);
        pools.update_status(&created).unwrap()
    }

    fn make_pod(store: &Arc<Store>, namespace: &str, name: &str) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.name = Some(name.to_string());
        pod.metadata.namespace = Some(namespace.to_string());
        pod.spec = Some(Default::default());
        store.repository::<Pod>().create(&pod).unwrap()
    }

    #[tokio::test]
    async fn test_sweep_reclaims_missing_pod_after_grace() {
        let (_dir, store, gc) = setup(Duration::from_millis(0));
        pool_with_entry(&store, "p4", "10.0.0.7", "u-old", "gone-pod", "Pod");

        // grace period zero: the first sweep both records and reclaims
        gc.sweep().await.unwrap();

        let pool = store.repository::<SpiderIPPool>().get(None, "p4").unwrap();
        assert_eq!(pool.allocated_ip_count(), 0);
    }

    #[tokio::test]
    async fn test_sweep_respects_grace_period() {
        let (_dir, store, gc) = setup(Duration::from_secs(3600));
        pool_with_entry(&store, "p4", "10.0.0.7", "u-old", "gone-pod", "Pod");

        gc.sweep().await.unwrap();

        // within the grace period nothing is reclaimed
        let pool = store.repository::<SpiderIPPool>().get(None, "p4").unwrap();
        assert_eq!(pool.allocated_ip_count(), 1);
    }

    #[tokio::test]
    async fn test_sweep_reclaims_uid_mismatch_immediately() {
        let (_dir, store, gc) = setup(Duration::from_secs(3600));
        pool_with_entry(&store, "p4", "10.0.0.7", "u-old", "pod-a", "Pod");
        // the pod exists, but as a different instance
        make_pod(&store, "ns", "pod-a");

        gc.sweep().await.unwrap();

        let pool = store.repository::<SpiderIPPool>().get(None, "p4").unwrap();
        assert_eq!(pool.allocated_ip_count(), 0);
    }

    #[tokio::test]
    async fn test_succeeded_pod_of_short_lived_owner_is_reclaimed() {
        let (_dir, store, gc) = setup(Duration::from_secs(3600));
        let pods = store.repository::<Pod>();

        let mut pod = make_pod(&store, "ns", "job-pod");
        pod.status = Some(Default::default());
        pod.status.as_mut().unwrap().phase = Some("Succeeded".to_string());
        let pod = pods.update(&pod).unwrap();

        pool_with_entry(&store, "p4", "10.0.0.7", pod.uid().unwrap(), "job-pod", "Job");
        // a long-lived owner's pod in the same state is kept
        pool_with_entry(&store, "p4-sts", "10.0.0.8", pod.uid().unwrap(), "job-pod", "StatefulSet");

        gc.sweep().await.unwrap();

        let pools = store.repository::<SpiderIPPool>();
        assert_eq!(pools.get(None, "p4").unwrap().allocated_ip_count(), 0);
        assert_eq!(pools.get(None, "p4-sts").unwrap().allocated_ip_count(), 1);
    }

    #[tokio::test]
    async fn test_gc_convergence_within_two_cycles() {
        let (_dir, store, gc) = setup(Duration::from_millis(20));
        pool_with_entry(&store, "p4", "10.0.0.7", "u-old", "gone-a", "Pod");
        pool_with_entry(&store, "p4-b", "10.0.0.8", "u-old2", "gone-b", "Deployment");

        gc.sweep().await.unwrap(); // records first-seen-missing
        tokio::time::sleep(Duration::from_millis(30)).await;
        gc.sweep().await.unwrap(); // second cycle reclaims

        let pools = store.repository::<SpiderIPPool>();
        assert_eq!(pools.get(None, "p4").unwrap().allocated_ip_count(), 0);
        assert_eq!(pools.get(None, "p4-b").unwrap().allocated_ip_count(), 0);
    }

    #[tokio::test]
    async fn test_pod_delete_event_reclaims_recorded_ips() {
        let (_dir, store, gc) = setup(Duration::from_secs(3600));
        let pod = make_pod(&store, "ns", "pod-a");
        let uid = pod.uid().unwrap().to_string();
        pool_with_entry(&store, "p4", "10.0.0.7", &uid, "pod-a", "Pod");

        let endpoints = store.repository::<SpiderEndpoint>();
        let mut endpoint = SpiderEndpoint::new("ns", "pod-a");
        endpoint.metadata.finalizers = Some(vec![constants::SPIDERPOOL_FINALIZER.to_string()]);
        endpoint.record_allocation(
            spiderpool_core::EndpointAllocation {
                uid: uid.clone(),
                container_id: "c1".to_string(),
                node: None,
                ips: vec![spiderpool_core::NicAllocation {
                    nic: "eth0".to_string(),
                    version: Some(IpVersion::V4),
                    address: "10.0.0.7/24".to_string(),
                    pool: "p4".to_string(),
                    ..Default::default()
                }],
            },
            10,
        );
        endpoints.create(&endpoint).unwrap();

        store.repository::<Pod>().delete(Some("ns"), "pod-a").unwrap();
        gc.handle_event(&ResourceEvent::deleted(
            "Pod",
            Some("ns"),
            "pod-a",
            serde_json::Value::Null,
            0,
        ))
        .await
        .unwrap();

        let pool = store.repository::<SpiderIPPool>().get(None, "p4").unwrap();
        assert_eq!(pool.allocated_ip_count(), 0);
        // the endpoint lost its finalizer and was deleted
        assert!(endpoints.try_get(Some("ns"), "pod-a").unwrap().is_none());
    }
}
