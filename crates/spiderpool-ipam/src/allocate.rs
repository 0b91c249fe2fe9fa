use crate::limiter::Limiter;
use crate::metrics::{record_allocation_outcome, IpamMetrics};
use crate::pool_locks::PoolLocks;
use crate::types::{
    AllocateRequest, AllocateResponse, AllocationResult, IpConfig, IpamConfig, PodContext,
    RouteConfig, ToBeAllocated,
};
use futures_util::future::join_all;
use metrics::counter;
use spiderpool_core::annotations::PodAnnotations;
use spiderpool_core::ip;
use spiderpool_core::types::{IpVersion, OwnerKind};
use spiderpool_core::{
    IpamError, Namespace, Node, Pod, PoolAllocation, Resource, Result, SpiderEndpoint,
    SpiderIPPool, SpiderReservedIP,
};
use spiderpool_metrics::names;
use spiderpool_store::{RetryConfig, Store};
use spiderpool_subnet::SubnetManager;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// The per-node allocation and release engine
pub struct Ipam {
    pub(crate) cfg: IpamConfig,
    pub(crate) pools: spiderpool_store::Repository<SpiderIPPool>,
    pub(crate) endpoints: spiderpool_store::Repository<SpiderEndpoint>,
    pub(crate) reserved: spiderpool_store::Repository<SpiderReservedIP>,
    pub(crate) pods: spiderpool_store::Repository<Pod>,
    pub(crate) nodes: spiderpool_store::Repository<Node>,
    pub(crate) namespaces: spiderpool_store::Repository<Namespace>,
    pub(crate) subnet_mgr: Option<Arc<SubnetManager>>,
    pub(crate) pool_locks: PoolLocks,
    pub(crate) limiter: Limiter,
    pub(crate) metrics: Arc<IpamMetrics>,
    pub(crate) retry: RetryConfig,
}

impl Ipam {
    pub fn new(
        cfg: IpamConfig,
        store: &Arc<Store>,
        subnet_mgr: Option<Arc<SubnetManager>>,
        metrics: Arc<IpamMetrics>,
    ) -> Arc<Self> {
        let retry = RetryConfig {
            max_retries: cfg.max_conflict_retries,
            retry_unit: cfg.conflict_retry_unit,
        };
        let limiter = Limiter::new(4, cfg.max_queue_size);
        Arc::new(Self {
            pools: store.repository(),
            endpoints: store.repository(),
            reserved: store.repository(),
            pods: store.repository(),
            nodes: store.repository(),
            namespaces: store.repository(),
            subnet_mgr,
            pool_locks: PoolLocks::new(),
            limiter,
            metrics,
            retry,
            cfg,
        })
    }

    /// Allocate addresses for every requested interface of one pod
    pub async fn allocate(&self, req: &AllocateRequest) -> Result<AllocateResponse> {
        let started = Instant::now();
        let result = self.allocate_inner(req).await;
        self.metrics.allocation_duration.observe(started.elapsed());
        record_allocation_outcome(&result.as_ref().map(|_| ()));
        result
    }

    async fn allocate_inner(&self, req: &AllocateRequest) -> Result<AllocateResponse> {
        let pod = self
            .pods
            .try_get(Some(&req.pod_namespace), &req.pod_name)
            .map_err(|e| IpamError::internal(e.to_string()))?
            .ok_or_else(|| {
                IpamError::invalid_argument(format!(
                    "pod {}/{} not found",
                    req.pod_namespace, req.pod_name
                ))
            })?;

        if pod.is_terminating() {
            return Err(IpamError::Terminating {
                namespace: req.pod_namespace.clone(),
                pod: req.pod_name.clone(),
            });
        }

        let ctx = PodContext::from_pod(&pod)?;
        let empty = BTreeMap::new();
        let annos = PodAnnotations::parse(pod.metadata.annotations.as_ref().unwrap_or(&empty))
            .map_err(|e| IpamError::invalid_argument(e.to_string()))?;

        let endpoint = self
            .endpoints
            .try_get(Some(&req.pod_namespace), &req.pod_name)
            .map_err(|e| IpamError::internal(e.to_string()))?;

        // Sticky short-circuit for StatefulSet replicas
        if self.cfg.enable_stateful_set && ctx.owner_kind == OwnerKind::StatefulSet {
            if let Some(ep) = &endpoint {
                if let Some(response) = self.try_sticky_reuse(&ctx, ep, req).await? {
                    info!(
                        "Re-used recorded assignment for StatefulSet pod {}/{}",
                        ctx.namespace, ctx.name
                    );
                    return Ok(response);
                }
            }
        }

        let tbas = self.build_to_be_allocateds(&ctx, &annos, req).await?;
        debug!(
            "Candidate pools for pod {}/{}: {:?}",
            ctx.namespace,
            ctx.name,
            tbas.iter().map(|t| t.pools()).collect::<Vec<_>>()
        );

        // Per-NIC pick-and-write, concurrent across NICs
        let futures = tbas
            .into_iter()
            .map(|tba| self.allocate_nic(&ctx, &pod, tba));
        let outcomes = join_all(futures).await;

        let mut results = Vec::new();
        let mut first_err = None;
        for outcome in outcomes {
            match outcome {
                Ok(nic_results) => results.extend(nic_results),
                Err(err) => {
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            }
        }
        if let Some(err) = first_err {
            self.rollback(&ctx, &results).await;
            return Err(err);
        }

        assign_default_route(&mut results, req.default_route_nic.as_deref());

        if let Err(err) = self.record_endpoint(&ctx, req, &results).await {
            self.rollback(&ctx, &results).await;
            return Err(err);
        }

        info!(
            "Allocated {:?} for pod {}/{}",
            results.iter().map(|r| r.address()).collect::<Vec<_>>(),
            ctx.namespace,
            ctx.name
        );
        Ok(compose_response(&results))
    }

    /// Allocate one address per requested family for a single NIC
    async fn allocate_nic(
        &self,
        ctx: &PodContext,
        pod: &Pod,
        tba: ToBeAllocated,
    ) -> Result<Vec<AllocationResult>> {
        let resolved = self.resolve_candidates(pod, &tba).await?;

        let mut results = Vec::new();
        for (version, pools) in resolved {
            let result = self
                .pick_from_candidates(ctx, &tba.nic, tba.clean_gateway, version, pools)
                .await;
            match result {
                Ok(r) => results.push(r),
                Err(err) => {
                    // a family that picked already is rolled back by the caller
                    self.rollback(ctx, &results).await;
                    return Err(err);
                }
            }
        }
        Ok(results)
    }

    /// Try candidates in ascending-usage order until one yields an address
    async fn pick_from_candidates(
        &self,
        ctx: &PodContext,
        nic: &str,
        clean_gateway: bool,
        version: IpVersion,
        mut pools: Vec<SpiderIPPool>,
    ) -> Result<AllocationResult> {
        pools.sort_by(|a, b| {
            a.usage_ratio()
                .partial_cmp(&b.usage_ratio())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.name().cmp(b.name()))
        });

        let reserved = self.reserved_ips(version)?;
        let tried: Vec<String> = pools.iter().map(|p| p.name().to_string()).collect();

        for pool in &pools {
            match self
                .pick_and_write(ctx, nic, clean_gateway, version, pool.name(), &reserved)
                .await
            {
                Ok(result) => return Ok(result),
                Err(IpamError::IpUsedOut { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(IpamError::IpUsedOut {
            version,
            pools: tried,
        })
    }

    /// Pick the numerically smallest free address of one pool and write the
    /// holder record back, retrying on revision conflicts.
    ///
    /// Between retries the pool is re-read and the free set recomputed: the
    /// previously picked address may have been taken by the winner.
    pub(crate) async fn pick_and_write(
        &self,
        ctx: &PodContext,
        nic: &str,
        clean_gateway: bool,
        version: IpVersion,
        pool_name: &str,
        reserved: &BTreeSet<IpAddr>,
    ) -> Result<AllocationResult> {
        let _guard = self.pool_locks.lock(pool_name).await;

        let mut attempt = 0;
        loop {
            let pool = match self.pools.try_get(None, pool_name) {
                Ok(Some(pool)) => pool,
                Ok(None) => return Err(IpamError::pool_not_found(pool_name)),
                Err(e) => return Err(IpamError::internal(e.to_string())),
            };

            if pool.spec.disable || pool.version()? != version {
                return Err(IpamError::IpUsedOut {
                    version,
                    pools: vec![pool_name.to_string()],
                });
            }

            let total = pool.total_ips()?;
            let used_out = IpamError::IpUsedOut {
                version,
                pools: vec![pool_name.to_string()],
            };

            if pool.allocated_ip_count() as usize >= self.cfg.max_allocated_ips {
                return Err(used_out);
            }

            let mut updated = pool.clone();
            let status = updated.status.get_or_insert_with(Default::default);
            let Some(ip) = total
                .iter()
                .find(|ip| !status.allocated_ips.contains_key(*ip) && !reserved.contains(*ip))
                .copied()
            else {
                return Err(used_out);
            };

            status.allocated_ips.insert(
                ip,
                PoolAllocation {
                    pod_uid: ctx.uid.clone(),
                    pod: ctx.name.clone(),
                    namespace: ctx.namespace.clone(),
                    nic: nic.to_string(),
                    owner_controller_kind: ctx.owner_kind.as_str().to_string(),
                    owner_controller_name: ctx.owner_name.clone(),
                    node: ctx.node.clone(),
                },
            );
            status.allocated_ip_count = Some(status.allocated_ips.len() as u64);
            status.total_ip_count = Some(total.len() as u64);

            match self.pools.update_status(&updated) {
                Ok(_) => {
                    debug!("Picked {} from pool {} for NIC {}", ip, pool_name, nic);
                    return Ok(build_result(&pool, version, ip, nic, clean_gateway)?);
                }
                Err(err) if err.is_conflict() => {
                    attempt += 1;
                    counter!(names::IPAM_ALLOCATION_UPDATE_IPPOOL_CONFLICT_COUNTS).increment(1);
                    if attempt > self.cfg.max_conflict_retries {
                        return Err(IpamError::retries_exhausted(format!(
                            "IPPool {}",
                            pool_name
                        )));
                    }
                    tokio::time::sleep(self.retry.backoff(attempt)).await;
                }
                Err(err) => return Err(IpamError::internal(err.to_string())),
            }
        }
    }

    /// Compensating release of already-written pool entries after a partial
    /// failure. Best-effort: a failed rollback is left to the garbage
    /// collector.
    pub(crate) async fn rollback(&self, ctx: &PodContext, results: &[AllocationResult]) {
        for result in results {
            if let Err(err) = self
                .release_pool_entries(&result.pool, &[result.ip], &ctx.uid)
                .await
            {
                warn!(
                    "Failed to roll back {} in pool {}; left to the garbage collector: {}",
                    result.ip, result.pool, err
                );
            }
        }
    }

    /// Union of all ReservedIP resources of one family
    pub(crate) fn reserved_ips(&self, version: IpVersion) -> Result<BTreeSet<IpAddr>> {
        let mut set = BTreeSet::new();
        let reserved = self
            .reserved
            .list(None)
            .map_err(|e| IpamError::internal(e.to_string()))?;
        for r in reserved {
            if r.spec.ip_version == Some(version) {
                set.extend(r.reserved_ips()?);
            }
        }
        Ok(set)
    }
}

impl PodContext {
    pub(crate) fn from_pod(pod: &Pod) -> Result<Self> {
        let uid = pod
            .uid()
            .ok_or_else(|| IpamError::invalid_argument("pod carries no UID"))?
            .to_string();

        let owner = pod
            .metadata
            .owner_references
            .iter()
            .flatten()
            .find(|r| r.controller == Some(true));
        let (owner_kind, owner_name) = match owner {
            Some(r) => (OwnerKind::from_kind(&r.kind), Some(r.name.clone())),
            None => (OwnerKind::Pod, None),
        };

        Ok(Self {
            namespace: pod.namespace().unwrap_or_default().to_string(),
            name: pod.name().to_string(),
            uid,
            node: pod.spec.as_ref().and_then(|s| s.node_name.clone()),
            owner_kind,
            owner_name,
        })
    }
}

/// First NIC (in request order) with a gateway keeps the default route per
/// family; every other NIC gets `cleanGateway`. A caller-supplied
/// `defaultRouteNIC` overrides the ordering.
pub(crate) fn assign_default_route(
    results: &mut [AllocationResult],
    default_route_nic: Option<&str>,
) {
    let mut taken: HashSet<IpVersion> = HashSet::new();
    for result in results.iter_mut() {
        if result.gateway.is_none() {
            result.clean_gateway = true;
            continue;
        }
        let preferred = default_route_nic.map_or(true, |nic| result.nic == nic);
        if result.clean_gateway || !preferred || taken.contains(&result.version) {
            result.clean_gateway = true;
            continue;
        }
        result.clean_gateway = false;
        taken.insert(result.version);
    }
}

/// Routes are the union of pool-level routes plus the implicit default
/// route where a gateway is present and not suppressed.
pub(crate) fn compose_response(results: &[AllocationResult]) -> AllocateResponse {
    let mut response = AllocateResponse::default();
    for result in results {
        response.ips.push(IpConfig {
            nic: result.nic.clone(),
            version: result.version,
            address: result.address(),
            gateway: result.gateway.clone(),
            pool: result.pool.clone(),
            vlan: result.vlan,
        });

        for route in &result.routes {
            response.routes.push(RouteConfig {
                nic: result.nic.clone(),
                dst: route.dst.clone(),
                gw: route.gw.clone(),
            });
        }
        if let Some(gw) = &result.gateway {
            if !result.clean_gateway {
                let dst = match result.version {
                    IpVersion::V4 => "0.0.0.0/0",
                    IpVersion::V6 => "::/0",
                };
                response.routes.push(RouteConfig {
                    nic: result.nic.clone(),
                    dst: dst.to_string(),
                    gw: gw.clone(),
                });
            }
        }
    }
    response
}

fn build_result(
    pool: &SpiderIPPool,
    version: IpVersion,
    ip: IpAddr,
    nic: &str,
    clean_gateway: bool,
) -> Result<AllocationResult> {
    let net = ip::parse_cidr(version, &pool.spec.subnet)?;
    Ok(AllocationResult {
        nic: nic.to_string(),
        version,
        ip,
        prefix: net.prefix(),
        gateway: pool.spec.gateway.clone(),
        routes: pool.spec.routes.clone(),
        vlan: pool.spec.vlan,
        pool: pool.name().to_string(),
        clean_gateway,
    })
}


#[cfg(test)]
mod engine_tests {
    use super::*;
    use crate::metrics::IpamMetrics;
    use crate::types::ReleaseRequest;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use spiderpool_core::annotations::{
        ANNO_POD_IPPOOL, ANNO_POD_IPPOOLS, ANNO_POD_IPPOOL_IP_NUMBER, ANNO_POD_SUBNET,
    };
    use spiderpool_core::{ControlledPool, SpiderSubnet};
    use spiderpool_store::{RetryConfig, Store};
    use spiderpool_subnet::SubnetManager;
    use std::time::Duration;
    use tempfile::tempdir;

    fn setup(cfg: IpamConfig) -> (tempfile::TempDir, Arc<Store>, Arc<Ipam>) {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("test.redb")).unwrap();
        let mgr = SubnetManager::new(&store, RetryConfig::default());
        let ipam = Ipam::new(cfg, &store, Some(mgr), IpamMetrics::new());
        (dir, store, ipam)
    }

    fn default_cfg() -> IpamConfig {
        IpamConfig {
            node_name: "node-1".to_string(),
            conflict_retry_unit: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn make_pool(
        store: &Arc<Store>,
        name: &str,
        subnet: &str,
        version: IpVersion,
        ips: &[&str],
        excludes: &[&str],
    ) -> SpiderIPPool {
        let mut pool = SpiderIPPool::new(name);
        pool.spec.ip_version = Some(version);
        pool.spec.subnet = subnet.to_string();
        pool.spec.ips = ips.iter().map(|s| s.to_string()).collect();
        pool.spec.exclude_ips = excludes.iter().map(|s| s.to_string()).collect();
        store.repository::<SpiderIPPool>().create(&pool).unwrap()
    }

    fn make_pod(
        store: &Arc<Store>,
        namespace: &str,
        name: &str,
        annotations: &[(&str, &str)],
    ) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.name = Some(name.to_string());
        pod.metadata.namespace = Some(namespace.to_string());
        if !annotations.is_empty() {
            pod.metadata.annotations = Some(
                annotations
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            );
        }
        pod.spec = Some(Default::default());
        pod.spec.as_mut().unwrap().node_name = Some("node-1".to_string());
        store.repository::<Pod>().create(&pod).unwrap()
    }

    fn make_sts_pod(store: &Arc<Store>, namespace: &str, name: &str) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.name = Some(name.to_string());
        pod.metadata.namespace = Some(namespace.to_string());
        pod.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: "StatefulSet".to_string(),
            name: "web".to_string(),
            uid: "sts-uid".to_string(),
            controller: Some(true),
            ..Default::default()
        }]);
        pod.spec = Some(Default::default());
        pod.spec.as_mut().unwrap().node_name = Some("node-1".to_string());
        store.repository::<Pod>().create(&pod).unwrap()
    }

    fn request(namespace: &str, name: &str, container: &str) -> AllocateRequest {
        AllocateRequest {
            container_id: container.to_string(),
            pod_namespace: namespace.to_string(),
            pod_name: name.to_string(),
            if_name: "eth0".to_string(),
            netns: "/var/run/netns/test".to_string(),
            default_route_nic: None,
        }
    }

    #[tokio::test]
    async fn test_simple_v4_allocation() {
        let (_dir, store, ipam) = setup(default_cfg());
        make_pool(
            &store,
            "p4",
            "10.0.0.0/24",
            IpVersion::V4,
            &["10.0.0.10-10.0.0.12"],
            &[],
        );
        let pod = make_pod(&store, "ns", "a", &[(ANNO_POD_IPPOOL, r#"{"ipv4pools":["p4"]}"#)]);

        let response = ipam.allocate(&request("ns", "a", "c1")).await.unwrap();
        assert_eq!(response.ips.len(), 1);
        assert_eq!(response.ips[0].address, "10.0.0.10/24");
        assert_eq!(response.ips[0].pool, "p4");

        let pool = store.repository::<SpiderIPPool>().get(None, "p4").unwrap();
        let status = pool.status.unwrap();
        let entry = &status.allocated_ips[&"10.0.0.10".parse::<IpAddr>().unwrap()];
        assert_eq!(entry.pod_uid, pod.uid().unwrap());
        assert_eq!(entry.pod, "a");
        assert_eq!(entry.namespace, "ns");
        assert_eq!(entry.nic, "eth0");
        assert_eq!(entry.owner_controller_kind, "Pod");
        assert_eq!(status.allocated_ip_count, Some(1));
        assert_eq!(status.total_ip_count, Some(3));

        // the endpoint is created with the finalizer held
        let endpoint = store
            .repository::<SpiderEndpoint>()
            .get(Some("ns"), "a")
            .unwrap();
        assert!(endpoint.has_finalizer(spiderpool_core::constants::SPIDERPOOL_FINALIZER));
        let current = endpoint.status.unwrap().current.unwrap();
        assert_eq!(current.container_id, "c1");
        assert_eq!(current.ips.len(), 1);
    }

    #[tokio::test]
    async fn test_exclude_and_free_hole() {
        let (_dir, store, ipam) = setup(default_cfg());
        let pool = make_pool(
            &store,
            "p4",
            "10.0.0.0/24",
            IpVersion::V4,
            &["10.0.0.1-10.0.0.5"],
            &["10.0.0.2", "10.0.0.3"],
        );

        // 10.0.0.1 is already held by another pod
        let mut held = pool.clone();
        let status = held.status.get_or_insert_with(Default::default);
        status.allocated_ips.insert(
            "10.0.0.1".parse().unwrap(),
            PoolAllocation {
                pod_uid: "other-uid".to_string(),
                pod: "x".to_string(),
                namespace: "ns".to_string(),
                nic: "eth0".to_string(),
                owner_controller_kind: "Pod".to_string(),
                ..Default::default()
            },
        );
        status.allocated_ip_count = Some(1);
        store.repository::<SpiderIPPool>().update_status(&held).unwrap();

        make_pod(&store, "ns", "a", &[(ANNO_POD_IPPOOL, r#"{"ipv4pools":["p4"]}"#)]);
        let response = ipam.allocate(&request("ns", "a", "c1")).await.unwrap();
        assert_eq!(response.ips[0].address, "10.0.0.4/24");
    }

    #[tokio::test]
    async fn test_dual_stack_allocation() {
        let mut cfg = default_cfg();
        cfg.enable_ipv6 = true;
        let (_dir, store, ipam) = setup(cfg);

        make_pool(
            &store,
            "p4",
            "10.0.0.0/24",
            IpVersion::V4,
            &["10.0.0.1-10.0.0.9"],
            &[],
        );
        make_pool(
            &store,
            "p6",
            "fd00::/64",
            IpVersion::V6,
            &["fd00::1-fd00::9"],
            &[],
        );
        make_pod(
            &store,
            "ns",
            "a",
            &[(ANNO_POD_IPPOOL, r#"{"ipv4pools":["p4"],"ipv6pools":["p6"]}"#)],
        );

        let response = ipam.allocate(&request("ns", "a", "c1")).await.unwrap();
        assert_eq!(response.ips.len(), 2);
        let versions: Vec<IpVersion> = response.ips.iter().map(|ip| ip.version).collect();
        assert!(versions.contains(&IpVersion::V4));
        assert!(versions.contains(&IpVersion::V6));

        for name in ["p4", "p6"] {
            let pool = store.repository::<SpiderIPPool>().get(None, name).unwrap();
            assert_eq!(pool.allocated_ip_count(), 1);
        }

        let endpoint = store
            .repository::<SpiderEndpoint>()
            .get(Some("ns"), "a")
            .unwrap();
        let current = endpoint.status.unwrap().current.unwrap();
        assert_eq!(current.ips.len(), 2);
        assert!(current.ips.iter().all(|nic| nic.nic == "eth0"));
    }

    #[tokio::test]
    async fn test_last_address_race_is_used_out() {
        let (_dir, store, ipam) = setup(default_cfg());
        make_pool(
            &store,
            "p4",
            "10.0.0.0/24",
            IpVersion::V4,
            &["10.0.0.1"],
            &[],
        );
        make_pod(&store, "ns", "a", &[(ANNO_POD_IPPOOL, r#"{"ipv4pools":["p4"]}"#)]);
        make_pod(&store, "ns", "b", &[(ANNO_POD_IPPOOL, r#"{"ipv4pools":["p4"]}"#)]);

        let req_a = request("ns", "a", "c-a");
        let req_b = request("ns", "b", "c-b");
        let (first, second) = tokio::join!(ipam.allocate(&req_a), ipam.allocate(&req_b),);

        let results = [first, second];
        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        let loser = results.iter().find(|r| r.is_err()).unwrap();
        // the loser observes the refetched empty free set, not a retry failure
        assert!(matches!(
            loser.as_ref().unwrap_err(),
            IpamError::IpUsedOut { .. }
        ));
    }

    #[tokio::test]
    async fn test_no_available_pool_without_candidates() {
        let (_dir, store, ipam) = setup(default_cfg());
        make_pod(&store, "ns", "a", &[]);

        let err = ipam.allocate(&request("ns", "a", "c1")).await.unwrap_err();
        assert!(matches!(err, IpamError::NoAvailablePool { .. }));
    }

    #[tokio::test]
    async fn test_terminating_pod_is_rejected() {
        let (_dir, store, ipam) = setup(default_cfg());
        let pods = store.repository::<Pod>();
        let mut pod = make_pod(&store, "ns", "a", &[]);
        pod.metadata.deletion_timestamp =
            Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()));
        pods.update(&pod).unwrap();

        let err = ipam.allocate(&request("ns", "a", "c1")).await.unwrap_err();
        assert!(matches!(err, IpamError::Terminating { .. }));
    }

    #[tokio::test]
    async fn test_cluster_default_pool_fallback() {
        let mut cfg = default_cfg();
        cfg.cluster_default.ipv4_pools = vec!["default-v4".to_string()];
        let (_dir, store, ipam) = setup(cfg);

        make_pool(
            &store,
            "default-v4",
            "10.0.0.0/24",
            IpVersion::V4,
            &["10.0.0.1-10.0.0.9"],
            &[],
        );
        make_pod(&store, "ns", "a", &[]);

        let response = ipam.allocate(&request("ns", "a", "c1")).await.unwrap();
        assert_eq!(response.ips[0].pool, "default-v4");
    }

    #[tokio::test]
    async fn test_max_allocated_ips_ceiling() {
        let mut cfg = default_cfg();
        cfg.max_allocated_ips = 1;
        let (_dir, store, ipam) = setup(cfg);

        make_pool(
            &store,
            "p4",
            "10.0.0.0/24",
            IpVersion::V4,
            &["10.0.0.1-10.0.0.9"],
            &[],
        );
        make_pod(&store, "ns", "a", &[(ANNO_POD_IPPOOL, r#"{"ipv4pools":["p4"]}"#)]);
        make_pod(&store, "ns", "b", &[(ANNO_POD_IPPOOL, r#"{"ipv4pools":["p4"]}"#)]);

        ipam.allocate(&request("ns", "a", "c-a")).await.unwrap();
        let err = ipam.allocate(&request("ns", "b", "c-b")).await.unwrap_err();
        assert!(matches!(err, IpamError::IpUsedOut { .. }));
    }

    #[tokio::test]
    async fn test_partial_failure_rolls_back() {
        let (_dir, store, ipam) = setup(default_cfg());
        make_pool(
            &store,
            "p4",
            "10.0.0.0/24",
            IpVersion::V4,
            &["10.0.0.1-10.0.0.9"],
            &[],
        );
        // net1 names a pool that does not exist
        make_pod(
            &store,
            "ns",
            "a",
            &[(
                ANNO_POD_IPPOOLS,
                r#"[{"interface":"eth0","ipv4pools":["p4"]},
                    {"interface":"net1","ipv4pools":["missing"]}]"#,
            )],
        );

        let err = ipam.allocate(&request("ns", "a", "c1")).await.unwrap_err();
        assert!(matches!(err, IpamError::PoolNotFound { .. }));

        // eth0's write was compensated
        let pool = store.repository::<SpiderIPPool>().get(None, "p4").unwrap();
        assert_eq!(pool.allocated_ip_count(), 0);
        assert!(store
            .repository::<SpiderEndpoint>()
            .try_get(Some("ns"), "a")
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_statefulset_stickiness() {
        let (_dir, store, ipam) = setup(default_cfg());
        let pods = store.repository::<Pod>();
        make_pool(
            &store,
            "p4",
            "10.0.0.0/24",
            IpVersion::V4,
            &["10.0.0.1-10.0.0.9"],
            &[],
        );

        let first = make_sts_pod(&store, "ns", "web-0");
        let mut pod = first.clone();
        pod.metadata.annotations = Some(
            [(ANNO_POD_IPPOOL.to_string(), r#"{"ipv4pools":["p4"]}"#.to_string())]
                .into_iter()
                .collect(),
        );
        pods.update(&pod).unwrap();

        let response = ipam.allocate(&request("ns", "web-0", "c1")).await.unwrap();
        let address = response.ips[0].address.clone();
        let first_uid = first.uid().unwrap().to_string();

        // the pod is deleted and recreated with a new UID, without a release
        pods.delete(Some("ns"), "web-0").unwrap();
        let reborn = make_sts_pod(&store, "ns", "web-0");
        let reborn_uid = reborn.uid().unwrap().to_string();
        assert_ne!(first_uid, reborn_uid);

        let response = ipam.allocate(&request("ns", "web-0", "c2")).await.unwrap();
        assert_eq!(response.ips[0].address, address);

        // ownership was rewritten to the new pod instance
        let pool = store.repository::<SpiderIPPool>().get(None, "p4").unwrap();
        let status = pool.status.unwrap();
        assert_eq!(status.allocated_ips.len(), 1);
        let entry = status.allocated_ips.values().next().unwrap();
        assert_eq!(entry.pod_uid, reborn_uid);
    }

    #[tokio::test]
    async fn test_release_clears_pool_and_endpoint() {
        let (_dir, store, ipam) = setup(default_cfg());
        make_pool(
            &store,
            "p4",
            "10.0.0.0/24",
            IpVersion::V4,
            &["10.0.0.1-10.0.0.9"],
            &[],
        );
        make_pod(&store, "ns", "a", &[(ANNO_POD_IPPOOL, r#"{"ipv4pools":["p4"]}"#)]);
        ipam.allocate(&request("ns", "a", "c1")).await.unwrap();

        let release = ReleaseRequest {
            container_id: "c1".to_string(),
            pod_namespace: "ns".to_string(),
            pod_name: "a".to_string(),
            if_name: None,
        };
        ipam.release(&release).await.unwrap();

        let pool = store.repository::<SpiderIPPool>().get(None, "p4").unwrap();
        assert_eq!(pool.allocated_ip_count(), 0);
        let endpoint = store
            .repository::<SpiderEndpoint>()
            .get(Some("ns"), "a")
            .unwrap();
        assert!(endpoint.status.unwrap().current.is_none());

        // releasing again is a successful no-op
        ipam.release(&release).await.unwrap();
    }

    #[tokio::test]
    async fn test_release_is_uid_guarded() {
        let (_dir, store, ipam) = setup(default_cfg());
        make_pool(
            &store,
            "p4",
            "10.0.0.0/24",
            IpVersion::V4,
            &["10.0.0.1-10.0.0.9"],
            &[],
        );
        make_pod(&store, "ns", "a", &[(ANNO_POD_IPPOOL, r#"{"ipv4pools":["p4"]}"#)]);
        let response = ipam.allocate(&request("ns", "a", "c1")).await.unwrap();
        let ip: IpAddr = response.ips[0].address.split('/').next().unwrap().parse().unwrap();

        // a stale holder UID never releases the reassigned address
        ipam.release_pool_entries("p4", &[ip], "some-other-uid")
            .await
            .unwrap();
        let pool = store.repository::<SpiderIPPool>().get(None, "p4").unwrap();
        assert_eq!(pool.allocated_ip_count(), 1);
    }

    #[tokio::test]
    async fn test_auto_pool_wait_then_success() {
        let mut cfg = default_cfg();
        cfg.enable_spider_subnet = true;
        cfg.operation_retries = 2;
        cfg.operation_gap = Duration::from_millis(5);
        let (_dir, store, ipam) = setup(cfg);
        let subnets = store.repository::<SpiderSubnet>();

        let mut subnet = SpiderSubnet::new("s4");
        subnet.spec.ip_version = Some(IpVersion::V4);
        subnet.spec.subnet = "10.0.0.0/24".to_string();
        subnet.spec.ips = vec!["10.0.0.1-10.0.0.2".to_string()];
        let mut created = subnets.create(&subnet).unwrap();

        // another child already claims the whole subnet
        let status = created.status.get_or_insert_with(Default::default);
        status.controlled_ip_pools.insert(
            "other-child".to_string(),
            ControlledPool {
                ips: vec!["10.0.0.1-10.0.0.2".to_string()],
                ip_count: 2,
            },
        );
        subnets.update_status(&created).unwrap();

        make_pod(
            &store,
            "ns",
            "a",
            &[
                (ANNO_POD_SUBNET, r#"{"ipv4":["s4"]}"#),
                (ANNO_POD_IPPOOL_IP_NUMBER, "2"),
            ],
        );

        let err = ipam.allocate(&request("ns", "a", "c1")).await.unwrap_err();
        assert!(matches!(err, IpamError::WaitingForAvailable { .. }));

        // a child is deleted, freeing space
        let mut freed = subnets.get(None, "s4").unwrap();
        freed
            .status
            .as_mut()
            .unwrap()
            .controlled_ip_pools
            .remove("other-child");
        subnets.update_status(&freed).unwrap();

        let response = ipam.allocate(&request("ns", "a", "c1")).await.unwrap();
        assert!(response.ips[0].pool.starts_with("auto-"));
        assert_eq!(response.ips[0].address, "10.0.0.1/24");
    }

    #[tokio::test]
    async fn test_reallocation_pushes_history() {
        let (_dir, store, ipam) = setup(default_cfg());
        make_pool(
            &store,
            "p4",
            "10.0.0.0/24",
            IpVersion::V4,
            &["10.0.0.1-10.0.0.9"],
            &[],
        );
        make_pod(&store, "ns", "a", &[(ANNO_POD_IPPOOL, r#"{"ipv4pools":["p4"]}"#)]);

        ipam.allocate(&request("ns", "a", "c1")).await.unwrap();
        ipam.allocate(&request("ns", "a", "c2")).await.unwrap();

        let endpoint = store
            .repository::<SpiderEndpoint>()
            .get(Some("ns"), "a")
            .unwrap();
        let status = endpoint.status.unwrap();
        assert_eq!(status.current.as_ref().unwrap().container_id, "c2");
        assert_eq!(status.history.len(), 1);
        assert_eq!(status.history[0].container_id, "c1");
    }
}
