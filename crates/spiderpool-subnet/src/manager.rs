use crate::name::{auto_pool_name, AppRef};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use spiderpool_core::annotations::{
    AutoPoolIpNumber, ANNO_POD_IPPOOL_IP_NUMBER, ANNO_POD_RECLAIM_IPPOOL,
};
use spiderpool_core::types::{IpVersion, OwnerKind};
use spiderpool_core::{
    constants, ip, ControlledPool, DaemonSet, Deployment, IpamError, Job, Node, Pod, ReplicaSet,
    Resource, Result, SpiderIPPool, SpiderSubnet, StatefulSet,
};
use spiderpool_store::{
    update_status_with_retry, update_with_retry, Mutation, Repository, RetryConfig, Store,
    StoreError,
};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Provisions and maintains per-application pools carved from Subnets.
///
/// All Subnet status mutations go through optimistic writes; concurrent
/// claims against the same Subnet are resolved by re-reading the winner's
/// state and recomputing the free set.
pub struct SubnetManager {
    subnets: Repository<SpiderSubnet>,
    pools: Repository<SpiderIPPool>,
    statefulsets: Repository<StatefulSet>,
    deployments: Repository<Deployment>,
    replicasets: Repository<ReplicaSet>,
    daemonsets: Repository<DaemonSet>,
    jobs: Repository<Job>,
    nodes: Repository<Node>,
    pods: Repository<Pod>,
    retry: RetryConfig,
}

impl SubnetManager {
    pub fn new(store: &Arc<Store>, retry: RetryConfig) -> Arc<Self> {
        Arc::new(Self {
            subnets: store.repository(),
            pools: store.repository(),
            statefulsets: store.repository(),
            deployments: store.repository(),
            replicasets: store.repository(),
            daemonsets: store.repository(),
            jobs: store.repository(),
            nodes: store.repository(),
            pods: store.repository(),
            retry,
        })
    }

    /// Make sure the (application, family) auto-pool exists and is at least
    /// the desired size. Returns `WaitingForAvailable` while the Subnet
    /// lacks free space.
    pub async fn ensure_auto_pool(
        &self,
        app: &AppRef,
        version: IpVersion,
        subnet_name: &str,
        ip_number: AutoPoolIpNumber,
        reclaim: bool,
    ) -> Result<SpiderIPPool> {
        let pool_name = auto_pool_name(app, version);
        let desired = ip_number.desired(self.desired_replicas(app)?);

        if let Some(pool) = self
            .pools
            .try_get(None, &pool_name)
            .map_err(|e| IpamError::internal(e.to_string()))?
        {
            if (pool.total_ips()?.len() as u32) < desired {
                self.resize_auto_pool(&pool_name, desired).await?;
                return self
                    .pools
                    .get(None, &pool_name)
                    .map_err(|e| IpamError::internal(e.to_string()));
            }
            return Ok(pool);
        }

        // Claim the addresses on the Subnet first so sibling pools can never
        // overlap, then create the pool; a failed create rolls the claim back.
        let subnet = self
            .claim(subnet_name, version, &pool_name, desired)
            .await?;
        let entry = subnet
            .status
            .as_ref()
            .and_then(|s| s.controlled_ip_pools.get(&pool_name))
            .cloned()
            .ok_or_else(|| IpamError::internal("claimed subnet entry vanished"))?;

        let pool = build_auto_pool(&subnet, &pool_name, version, app, &entry, ip_number, reclaim);
        match self.pools.create(&pool) {
            Ok(created) => {
                info!(
                    "Created auto-pool {} ({} addresses) from subnet {}",
                    pool_name, entry.ip_count, subnet_name
                );
                Ok(created)
            }
            Err(StoreError::AlreadyExists { .. }) => self
                .pools
                .get(None, &pool_name)
                .map_err(|e| IpamError::internal(e.to_string())),
            Err(err) => {
                warn!(
                    "Failed to create auto-pool {}, rolling back the subnet claim: {}",
                    pool_name, err
                );
                let _ = self.unclaim(subnet_name, &pool_name).await;
                Err(IpamError::internal(err.to_string()))
            }
        }
    }

    /// Claim `desired` free addresses of the Subnet for `pool_name`
    async fn claim(
        &self,
        subnet_name: &str,
        version: IpVersion,
        pool_name: &str,
        desired: u32,
    ) -> Result<SpiderSubnet> {
        let mut on_conflict = |_: u32| {};
        update_status_with_retry(
            &self.subnets,
            None,
            subnet_name,
            &self.retry,
            &mut on_conflict,
            |subnet: &mut SpiderSubnet| {
                if subnet.version()? != version {
                    return Err(IpamError::invalid_argument(format!(
                        "subnet {} is not an {} subnet",
                        subnet_name, version
                    )));
                }
                if subnet.is_terminating() {
                    return Err(IpamError::invalid_argument(format!(
                        "subnet {} is terminating",
                        subnet_name
                    )));
                }
                if subnet
                    .status
                    .as_ref()
                    .is_some_and(|s| s.controlled_ip_pools.contains_key(pool_name))
                {
                    // an earlier claim survived a crash; reuse it
                    return Ok(Mutation::Noop);
                }

                let free = subnet.free_ips()?;
                if free.len() < desired as usize {
                    return Err(IpamError::waiting_for_available(
                        subnet_name,
                        format!("{} free addresses, {} requested", free.len(), desired),
                    ));
                }
                let claimed = best_fit(&free, desired as usize);
                let ranges = ip::convert_ips_to_ip_ranges(version, &claimed)?;
                let total_count = subnet.total_ips()?.len() as u64;

                let status = subnet.status.get_or_insert_with(Default::default);
                status.controlled_ip_pools.insert(
                    pool_name.to_string(),
                    ControlledPool {
                        ips: ranges,
                        ip_count: claimed.len() as u64,
                    },
                );
                status.total_ip_count = Some(total_count);
                status.allocated_ip_count =
                    Some(status.controlled_ip_pools.values().map(|p| p.ip_count).sum());
                Ok(Mutation::Apply)
            },
        )
        .await
    }

    /// Return `pool_name`'s claim to the Subnet's free set
    pub async fn unclaim(&self, subnet_name: &str, pool_name: &str) -> Result<()> {
        if self
            .subnets
            .try_get(None, subnet_name)
            .map_err(|e| IpamError::internal(e.to_string()))?
            .is_none()
        {
            return Ok(());
        }

        let mut on_conflict = |_: u32| {};
        update_status_with_retry::<_, IpamError, _>(
            &self.subnets,
            None,
            subnet_name,
            &self.retry,
            &mut on_conflict,
            |subnet: &mut SpiderSubnet| {
                let Some(status) = subnet.status.as_mut() else {
                    return Ok(Mutation::Noop);
                };
                if status.controlled_ip_pools.remove(pool_name).is_none() {
                    return Ok(Mutation::Noop);
                }
                status.allocated_ip_count =
                    Some(status.controlled_ip_pools.values().map(|p| p.ip_count).sum());
                Ok(Mutation::Apply)
            },
        )
        .await?;
        debug!("Returned claim of {} to subnet {}", pool_name, subnet_name);
        Ok(())
    }

    /// Grow or shrink an auto-pool to `desired` addresses. Shrinking only
    /// removes addresses with no live allocation.
    pub async fn resize_auto_pool(&self, pool_name: &str, desired: u32) -> Result<()> {
        let Some(pool) = self
            .pools
            .try_get(None, pool_name)
            .map_err(|e| IpamError::internal(e.to_string()))?
        else {
            return Ok(());
        };
        let version = pool.version()?;
        let Some(subnet_name) = pool.owner_subnet().map(str::to_string) else {
            return Err(IpamError::invalid_argument(format!(
                "auto-pool {} has no controller Subnet",
                pool_name
            )));
        };

        let total = pool.total_ips()?;
        match (total.len() as u32).cmp(&desired) {
            std::cmp::Ordering::Equal => Ok(()),
            std::cmp::Ordering::Less => {
                self.expand(pool_name, &subnet_name, version, &total, desired)
                    .await
            }
            std::cmp::Ordering::Greater => {
                self.shrink(&pool, &subnet_name, version, &total, desired)
                    .await
            }
        }
    }

    async fn expand(
        &self,
        pool_name: &str,
        subnet_name: &str,
        version: IpVersion,
        total: &[IpAddr],
        desired: u32,
    ) -> Result<()> {
        let need = desired as usize - total.len();

        // grow the subnet claim first so the pool is always ⊆ its claim
        let mut on_conflict = |_: u32| {};
        let updated = update_status_with_retry(
            &self.subnets,
            None,
            subnet_name,
            &self.retry,
            &mut on_conflict,
            |subnet: &mut SpiderSubnet| {
                let free = subnet.free_ips()?;
                if free.len() < need {
                    return Err(IpamError::waiting_for_available(
                        subnet_name,
                        format!("{} free addresses, {} more requested", free.len(), need),
                    ));
                }
                let extra = best_fit(&free, need);
                let merged = ip::ips_union_set(total, &extra);
                let ranges = ip::convert_ips_to_ip_ranges(version, &merged)?;

                let status = subnet.status.get_or_insert_with(Default::default);
                status.controlled_ip_pools.insert(
                    pool_name.to_string(),
                    ControlledPool {
                        ips: ranges,
                        ip_count: merged.len() as u64,
                    },
                );
                status.allocated_ip_count =
                    Some(status.controlled_ip_pools.values().map(|p| p.ip_count).sum());
                Ok(Mutation::Apply)
            },
        )
        .await?;

        let ranges = updated
            .status
            .as_ref()
            .and_then(|s| s.controlled_ip_pools.get(pool_name))
            .map(|e| e.ips.clone())
            .unwrap_or_default();

        self.write_pool_ips(pool_name, ranges).await?;
        info!("Expanded auto-pool {} to {} addresses", pool_name, desired);
        Ok(())
    }

    async fn shrink(
        &self,
        pool: &SpiderIPPool,
        subnet_name: &str,
        version: IpVersion,
        total: &[IpAddr],
        desired: u32,
    ) -> Result<()> {
        let allocated: Vec<IpAddr> = pool
            .status
            .as_ref()
            .map(|s| s.allocated_ips.keys().copied().collect())
            .unwrap_or_default();
        let removable = ip::ips_diff_set(total, &allocated, true);

        let surplus = total.len() - desired as usize;
        let drop_count = surplus.min(removable.len());
        if drop_count == 0 {
            return Ok(());
        }
        // remove the highest unallocated addresses
        let dropped: Vec<IpAddr> = removable[removable.len() - drop_count..].to_vec();
        let kept = ip::ips_diff_set(total, &dropped, true);
        let ranges = ip::convert_ips_to_ip_ranges(version, &kept)?;

        // shrink the pool first so it never exceeds its subnet claim
        let pool_name = pool.name().to_string();
        self.write_pool_ips(&pool_name, ranges.clone()).await?;

        let mut on_conflict = |_: u32| {};
        update_status_with_retry::<_, IpamError, _>(
            &self.subnets,
            None,
            subnet_name,
            &self.retry,
            &mut on_conflict,
            |subnet: &mut SpiderSubnet| {
                let Some(status) = subnet.status.as_mut() else {
                    return Ok(Mutation::Noop);
                };
                status.controlled_ip_pools.insert(
                    pool_name.clone(),
                    ControlledPool {
                        ips: ranges.clone(),
                        ip_count: kept.len() as u64,
                    },
                );
                status.allocated_ip_count =
                    Some(status.controlled_ip_pools.values().map(|p| p.ip_count).sum());
                Ok(Mutation::Apply)
            },
        )
        .await?;

        info!(
            "Shrank auto-pool {} to {} addresses ({} still allocated)",
            pool_name,
            kept.len(),
            allocated.len()
        );
        Ok(())
    }

    async fn write_pool_ips(&self, pool_name: &str, ranges: Vec<String>) -> Result<()> {
        let mut on_conflict = |_: u32| {};
        update_with_retry::<_, IpamError, _>(
            &self.pools,
            None,
            pool_name,
            &self.retry,
            &mut on_conflict,
            |pool: &mut SpiderIPPool| {
                if pool.spec.ips == ranges {
                    return Ok(Mutation::Noop);
                }
                pool.spec.ips = ranges.clone();
                Ok(Mutation::Apply)
            },
        )
        .await?;
        Ok(())
    }

    /// Delete the auto-pool and return its claim to the Subnet once no
    /// allocation remains. Returns false while allocations still exist.
    pub async fn reclaim_auto_pool(&self, pool_name: &str) -> Result<bool> {
        let Some(pool) = self
            .pools
            .try_get(None, pool_name)
            .map_err(|e| IpamError::internal(e.to_string()))?
        else {
            return Ok(true);
        };

        if pool.allocated_ip_count() > 0 {
            debug!(
                "Auto-pool {} still holds {} allocations, not reclaiming",
                pool_name,
                pool.allocated_ip_count()
            );
            return Ok(false);
        }

        let subnet_name = pool.owner_subnet().map(str::to_string);
        match self.pools.delete(None, pool_name) {
            Ok(()) => {}
            Err(StoreError::NotFound { .. }) => {}
            Err(err) => return Err(IpamError::internal(err.to_string())),
        }
        if let Some(subnet_name) = subnet_name {
            self.unclaim(&subnet_name, pool_name).await?;
        }
        info!("Reclaimed auto-pool {}", pool_name);
        Ok(true)
    }

    /// Desired replica count of the owning workload
    pub fn desired_replicas(&self, app: &AppRef) -> Result<u32> {
        let internal = |e: StoreError| IpamError::internal(e.to_string());
        let ns = Some(app.namespace.as_str());
        let replicas = match &app.kind {
            OwnerKind::StatefulSet => self
                .statefulsets
                .try_get(ns, &app.name)
                .map_err(internal)?
                .and_then(|s| s.spec.and_then(|spec| spec.replicas)),
            OwnerKind::Deployment => self
                .deployments
                .try_get(ns, &app.name)
                .map_err(internal)?
                .and_then(|d| d.spec.and_then(|spec| spec.replicas)),
            OwnerKind::ReplicaSet => self
                .replicasets
                .try_get(ns, &app.name)
                .map_err(internal)?
                .and_then(|r| r.spec.and_then(|spec| spec.replicas)),
            OwnerKind::DaemonSet => {
                // one replica per node
                let _ = self
                    .daemonsets
                    .try_get(ns, &app.name)
                    .map_err(internal)?;
                Some(self.nodes.list(None).map_err(internal)?.len() as i32)
            }
            OwnerKind::Job => self
                .jobs
                .try_get(ns, &app.name)
                .map_err(internal)?
                .and_then(|j| j.spec.and_then(|spec| spec.parallelism)),
            OwnerKind::Pod | OwnerKind::Unknown(_) => Some(1),
        };
        Ok(replicas.unwrap_or(1).max(0) as u32)
    }

    /// Whether the owning workload still exists in the store
    pub fn app_exists(&self, app: &AppRef) -> Result<bool> {
        let internal = |e: StoreError| IpamError::internal(e.to_string());
        let ns = Some(app.namespace.as_str());
        let exists = match &app.kind {
            OwnerKind::StatefulSet => {
                self.statefulsets.try_get(ns, &app.name).map_err(internal)?.is_some()
            }
            OwnerKind::Deployment => {
                self.deployments.try_get(ns, &app.name).map_err(internal)?.is_some()
            }
            OwnerKind::ReplicaSet => {
                self.replicasets.try_get(ns, &app.name).map_err(internal)?.is_some()
            }
            OwnerKind::DaemonSet => {
                self.daemonsets.try_get(ns, &app.name).map_err(internal)?.is_some()
            }
            OwnerKind::Job => self.jobs.try_get(ns, &app.name).map_err(internal)?.is_some(),
            OwnerKind::Pod => self.pods.try_get(ns, &app.name).map_err(internal)?.is_some(),
            OwnerKind::Unknown(_) => true,
        };
        Ok(exists)
    }
}

/// Prefer the smallest contiguous run that fits; fall back to gathering
/// from the start of the free set.
fn best_fit(free: &[IpAddr], desired: usize) -> Vec<IpAddr> {
    let mut runs: Vec<&[IpAddr]> = Vec::new();
    let mut start = 0;
    for i in 1..=free.len() {
        if i == free.len() || !ip::are_consecutive(free[i - 1], free[i]) {
            runs.push(&free[start..i]);
            start = i;
        }
    }

    let best = runs
        .iter()
        .filter(|run| run.len() >= desired)
        .min_by_key(|run| run.len());
    match best {
        Some(run) => run[..desired].to_vec(),
        None => free[..desired.min(free.len())].to_vec(),
    }
}

fn build_auto_pool(
    subnet: &SpiderSubnet,
    pool_name: &str,
    version: IpVersion,
    app: &AppRef,
    entry: &ControlledPool,
    ip_number: AutoPoolIpNumber,
    reclaim: bool,
) -> SpiderIPPool {
    let mut pool = SpiderIPPool::new(pool_name);
    pool.spec.ip_version = Some(version);
    pool.spec.subnet = subnet.spec.subnet.clone();
    pool.spec.ips = entry.ips.clone();
    pool.spec.gateway = subnet.spec.gateway.clone();
    pool.spec.vlan = subnet.spec.vlan;
    pool.spec.routes = subnet.spec.routes.clone();

    pool.metadata.labels = Some(BTreeMap::from([(
        constants::LABEL_OWNER_APPLICATION.to_string(),
        app.label_value(),
    )]));
    pool.metadata.annotations = Some(BTreeMap::from([
        (ANNO_POD_RECLAIM_IPPOOL.to_string(), reclaim.to_string()),
        (ANNO_POD_IPPOOL_IP_NUMBER.to_string(), ip_number.to_string()),
    ]));
    pool.metadata.owner_references = Some(vec![OwnerReference {
        api_version: constants::API_VERSION.to_string(),
        kind: "SpiderSubnet".to_string(),
        name: subnet.name().to_string(),
        uid: subnet.uid().unwrap_or_default().to_string(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }]);
    pool
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, Arc<Store>, Arc<SubnetManager>) {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("test.redb")).unwrap();
        let mgr = SubnetManager::new(&store, RetryConfig::default());
        (dir, store, mgr)
    }

    fn subnet(name: &str, ips: &[&str]) -> SpiderSubnet {
        let mut s = SpiderSubnet::new(name);
        s.spec.ip_version = Some(IpVersion::V4);
        s.spec.subnet = "10.0.0.0/24".to_string();
        s.spec.ips = ips.iter().map(|x| x.to_string()).collect();
        s.spec.gateway = Some("10.0.0.254".to_string());
        s
    }

    fn app() -> AppRef {
        AppRef::new(OwnerKind::Deployment, "default", "web")
    }

    #[test]
    fn test_best_fit_prefers_smallest_fitting_run() {
        let free: Vec<IpAddr> = ["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.10", "10.0.0.11"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();

        // the two-address run fits exactly
        let picked = best_fit(&free, 2);
        assert_eq!(picked[0], "10.0.0.10".parse::<IpAddr>().unwrap());

        // nothing contiguous fits: gather from the start
        let picked = best_fit(&free, 4);
        assert_eq!(picked.len(), 4);
        assert_eq!(picked[0], "10.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_ensure_auto_pool_creates_and_claims() {
        let (_dir, store, mgr) = setup();
        let subnets = store.repository::<SpiderSubnet>();
        subnets.create(&subnet("s4", &["10.0.0.1-10.0.0.20"])).unwrap();

        let pool = mgr
            .ensure_auto_pool(&app(), IpVersion::V4, "s4", AutoPoolIpNumber::Fixed(5), true)
            .await
            .unwrap();

        assert_eq!(pool.total_ips().unwrap().len(), 5);
        assert_eq!(pool.owner_subnet(), Some("s4"));
        assert_eq!(pool.spec.gateway.as_deref(), Some("10.0.0.254"));

        let s = subnets.get(None, "s4").unwrap();
        let status = s.status.unwrap();
        assert_eq!(status.controlled_ip_pools.len(), 1);
        assert_eq!(status.allocated_ip_count, Some(5));
        assert_eq!(status.total_ip_count, Some(20));
    }

    #[tokio::test]
    async fn test_ensure_auto_pool_is_idempotent() {
        let (_dir, store, mgr) = setup();
        let subnets = store.repository::<SpiderSubnet>();
        subnets.create(&subnet("s4", &["10.0.0.1-10.0.0.20"])).unwrap();

        let first = mgr
            .ensure_auto_pool(&app(), IpVersion::V4, "s4", AutoPoolIpNumber::Fixed(5), true)
            .await
            .unwrap();
        let second = mgr
            .ensure_auto_pool(&app(), IpVersion::V4, "s4", AutoPoolIpNumber::Fixed(5), true)
            .await
            .unwrap();

        assert_eq!(first.name(), second.name());
        let s = subnets.get(None, "s4").unwrap();
        assert_eq!(s.status.unwrap().controlled_ip_pools.len(), 1);
    }

    #[tokio::test]
    async fn test_ensure_auto_pool_waits_when_full() {
        let (_dir, store, mgr) = setup();
        let subnets = store.repository::<SpiderSubnet>();
        subnets.create(&subnet("s4", &["10.0.0.1-10.0.0.3"])).unwrap();

        let err = mgr
            .ensure_auto_pool(&app(), IpVersion::V4, "s4", AutoPoolIpNumber::Fixed(5), true)
            .await
            .unwrap_err();
        assert!(matches!(err, IpamError::WaitingForAvailable { .. }));
    }

    #[tokio::test]
    async fn test_sibling_pools_are_disjoint() {
        let (_dir, store, mgr) = setup();
        let subnets = store.repository::<SpiderSubnet>();
        subnets.create(&subnet("s4", &["10.0.0.1-10.0.0.20"])).unwrap();

        let a = mgr
            .ensure_auto_pool(&app(), IpVersion::V4, "s4", AutoPoolIpNumber::Fixed(6), true)
            .await
            .unwrap();
        let other = AppRef::new(OwnerKind::StatefulSet, "default", "db");
        let b = mgr
            .ensure_auto_pool(&other, IpVersion::V4, "s4", AutoPoolIpNumber::Fixed(6), true)
            .await
            .unwrap();

        let ips_a = a.total_ips().unwrap();
        let ips_b = b.total_ips().unwrap();
        assert_eq!(ip::ips_diff_set(&ips_a, &ips_b, false).len(), ips_a.len());
    }

    #[tokio::test]
    async fn test_resize_expand_and_shrink() {
        let (_dir, store, mgr) = setup();
        let subnets = store.repository::<SpiderSubnet>();
        let pools = store.repository::<SpiderIPPool>();
        subnets.create(&subnet("s4", &["10.0.0.1-10.0.0.20"])).unwrap();

        let pool = mgr
            .ensure_auto_pool(&app(), IpVersion::V4, "s4", AutoPoolIpNumber::Fixed(4), true)
            .await
            .unwrap();
        let name = pool.name().to_string();

        mgr.resize_auto_pool(&name, 8).await.unwrap();
        assert_eq!(pools.get(None, &name).unwrap().total_ips().unwrap().len(), 8);

        mgr.resize_auto_pool(&name, 2).await.unwrap();
        assert_eq!(pools.get(None, &name).unwrap().total_ips().unwrap().len(), 2);

        let s = subnets.get(None, "s4").unwrap();
        assert_eq!(s.status.unwrap().allocated_ip_count, Some(2));
    }

    #[tokio::test]
    async fn test_shrink_is_gated_on_allocations() {
        let (_dir, store, mgr) = setup();
        let subnets = store.repository::<SpiderSubnet>();
        let pools = store.repository::<SpiderIPPool>();
        subnets.create(&subnet("s4", &["10.0.0.1-10.0.0.10"])).unwrap();

        let pool = mgr
            .ensure_auto_pool(&app(), IpVersion::V4, "s4", AutoPoolIpNumber::Fixed(4), true)
            .await
            .unwrap();
        let name = pool.name().to_string();

        // mark every address allocated
        let mut held = pools.get(None, &name).unwrap();
        let total = held.total_ips().unwrap();
        let status = held.status.get_or_insert_with(Default::default);
        for ip in &total {
            status.allocated_ips.insert(
                *ip,
                spiderpool_core::PoolAllocation {
                    pod_uid: "u1".to_string(),
                    pod: "p".to_string(),
                    namespace: "default".to_string(),
                    nic: "eth0".to_string(),
                    owner_controller_kind: "Deployment".to_string(),
                    ..Default::default()
                },
            );
        }
        status.allocated_ip_count = Some(total.len() as u64);
        pools.update_status(&held).unwrap();

        // nothing is removable
        mgr.resize_auto_pool(&name, 1).await.unwrap();
        assert_eq!(pools.get(None, &name).unwrap().total_ips().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_reclaim_returns_claim() {
        let (_dir, store, mgr) = setup();
        let subnets = store.repository::<SpiderSubnet>();
        subnets.create(&subnet("s4", &["10.0.0.1-10.0.0.10"])).unwrap();

        let pool = mgr
            .ensure_auto_pool(&app(), IpVersion::V4, "s4", AutoPoolIpNumber::Fixed(4), true)
            .await
            .unwrap();

        assert!(mgr.reclaim_auto_pool(pool.name()).await.unwrap());
        let s = subnets.get(None, "s4").unwrap();
        let status = s.status.unwrap();
        assert!(status.controlled_ip_pools.is_empty());
        assert_eq!(status.allocated_ip_count, Some(0));
    }

    #[tokio::test]
    async fn test_desired_replicas_from_deployment() {
        let (_dir, store, mgr) = setup();
        let deployments = store.repository::<Deployment>();

        let mut d = Deployment::default();
        d.metadata.name = Some("web".to_string());
        d.metadata.namespace = Some("default".to_string());
        d.spec = Some(Default::default());
        d.spec.as_mut().unwrap().replicas = Some(7);
        deployments.create(&d).unwrap();

        assert_eq!(mgr.desired_replicas(&app()).unwrap(), 7);

        // missing workload falls back to one replica
        let missing = AppRef::new(OwnerKind::Deployment, "default", "gone");
        assert_eq!(mgr.desired_replicas(&missing).unwrap(), 1);
    }
}
