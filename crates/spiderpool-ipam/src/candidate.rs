use crate::allocate::Ipam;
use crate::types::{AllocateRequest, PodContext, PoolCandidate, ToBeAllocated};
use metrics::counter;
use spiderpool_core::annotations::{AutoPoolIpNumber, PodAnnotations};
use spiderpool_core::types::IpVersion;
use spiderpool_core::{annotations, constants, IpamError, Pod, Resource, Result, SpiderIPPool};
use spiderpool_metrics::names;
use spiderpool_subnet::AppRef;
use std::collections::BTreeMap;
use tracing::{debug, warn};

impl Ipam {
    pub(crate) fn enabled_versions(&self) -> Vec<IpVersion> {
        let mut versions = Vec::new();
        if self.cfg.enable_ipv4 {
            versions.push(IpVersion::V4);
        }
        if self.cfg.enable_ipv6 {
            versions.push(IpVersion::V6);
        }
        versions
    }

    /// Build the candidate pool list per NIC, in annotation priority order:
    /// per-NIC pools, single-NIC pools, subnets (auto-pool), namespace
    /// defaults, cluster defaults.
    pub(crate) async fn build_to_be_allocateds(
        &self,
        ctx: &PodContext,
        annos: &PodAnnotations,
        req: &AllocateRequest,
    ) -> Result<Vec<ToBeAllocated>> {
        if let Some(items) = &annos.ippools {
            if items.is_empty() {
                return Err(IpamError::invalid_argument(format!(
                    "annotation {} is an empty list",
                    annotations::ANNO_POD_IPPOOLS
                )));
            }
            return items
                .iter()
                .map(|item| {
                    self.tba_from_pools(
                        &item.interface,
                        &item.ipv4pools,
                        &item.ipv6pools,
                        item.cleangateway,
                    )
                })
                .collect();
        }

        if let Some(anno) = &annos.ippool {
            let nic = anno.interface.clone().unwrap_or_else(|| req.if_name.clone());
            return Ok(vec![self.tba_from_pools(
                &nic,
                &anno.ipv4pools,
                &anno.ipv6pools,
                false,
            )?]);
        }

        if annos.subnet.is_some() || annos.subnets.is_some() {
            if !self.cfg.enable_spider_subnet {
                return Err(IpamError::invalid_argument(
                    "subnet annotation given but the SpiderSubnet feature is disabled",
                ));
            }
            let subnet_annos = annos
                .subnets
                .clone()
                .or_else(|| annos.subnet.clone().map(|s| vec![s]))
                .unwrap_or_default();

            let mut tbas = Vec::new();
            for sa in &subnet_annos {
                let nic = sa.interface.clone().unwrap_or_else(|| req.if_name.clone());
                tbas.push(
                    self.tba_from_subnets(ctx, annos, &nic, &sa.ipv4, &sa.ipv6)
                        .await?,
                );
            }
            return Ok(tbas);
        }

        if let Some((v4, v6)) = self.namespace_default_pools(&ctx.namespace)? {
            debug!("Using namespace default pools for {}", ctx.namespace);
            return Ok(vec![self.tba_from_pools(&req.if_name, &v4, &v6, false)?]);
        }

        let defaults = &self.cfg.cluster_default;
        if !defaults.ipv4_pools.is_empty() || !defaults.ipv6_pools.is_empty() {
            return Ok(vec![self.tba_from_pools(
                &req.if_name,
                &defaults.ipv4_pools,
                &defaults.ipv6_pools,
                false,
            )?]);
        }

        if self.cfg.enable_spider_subnet
            && (!defaults.ipv4_subnets.is_empty() || !defaults.ipv6_subnets.is_empty())
        {
            return Ok(vec![
                self.tba_from_subnets(
                    ctx,
                    annos,
                    &req.if_name,
                    &defaults.ipv4_subnets,
                    &defaults.ipv6_subnets,
                )
                .await?,
            ]);
        }

        Err(IpamError::NoAvailablePool {
            version: self
                .enabled_versions()
                .first()
                .copied()
                .unwrap_or(IpVersion::V4),
            nic: req.if_name.clone(),
        })
    }

    fn tba_from_pools(
        &self,
        nic: &str,
        v4_pools: &[String],
        v6_pools: &[String],
        clean_gateway: bool,
    ) -> Result<ToBeAllocated> {
        let versions = self.enabled_versions();
        if versions.is_empty() {
            return Err(IpamError::invalid_argument(
                "neither IPv4 nor IPv6 is enabled",
            ));
        }

        let mut candidates = Vec::new();
        for version in versions {
            let pools = match version {
                IpVersion::V4 => v4_pools,
                IpVersion::V6 => v6_pools,
            };
            if pools.is_empty() {
                return Err(IpamError::NoAvailablePool {
                    version,
                    nic: nic.to_string(),
                });
            }
            candidates.push(PoolCandidate {
                version,
                pools: pools.to_vec(),
            });
        }

        Ok(ToBeAllocated {
            nic: nic.to_string(),
            clean_gateway,
            pool_candidates: candidates,
        })
    }

    /// Candidates backed by auto-pools provisioned from the named Subnets
    async fn tba_from_subnets(
        &self,
        ctx: &PodContext,
        annos: &PodAnnotations,
        nic: &str,
        v4_subnets: &[String],
        v6_subnets: &[String],
    ) -> Result<ToBeAllocated> {
        let app = AppRef::new(
            ctx.owner_kind.clone(),
            ctx.namespace.clone(),
            ctx.owner_name.clone().unwrap_or_else(|| ctx.name.clone()),
        );
        let ip_number = annos.ippool_ip_number.unwrap_or(AutoPoolIpNumber::Flexible(
            self.cfg.cluster_default.subnet_default_flexible_ip_number,
        ));

        let mut candidates = Vec::new();
        for version in self.enabled_versions() {
            let subnets = match version {
                IpVersion::V4 => v4_subnets,
                IpVersion::V6 => v6_subnets,
            };
            let Some(subnet_name) = subnets.first() else {
                return Err(IpamError::NoAvailablePool {
                    version,
                    nic: nic.to_string(),
                });
            };
            let pool = self
                .wait_auto_pool(&app, version, subnet_name, ip_number, annos.reclaim_ippool)
                .await?;
            candidates.push(PoolCandidate {
                version,
                pools: vec![pool],
            });
        }

        Ok(ToBeAllocated {
            nic: nic.to_string(),
            clean_gateway: false,
            pool_candidates: candidates,
        })
    }

    /// Block until the auto-pool exists, with `operation_gap` between
    /// attempts up to `operation_retries`. The limiter caps how many
    /// provisioning requests are in flight at once.
    async fn wait_auto_pool(
        &self,
        app: &AppRef,
        version: IpVersion,
        subnet_name: &str,
        ip_number: AutoPoolIpNumber,
        reclaim: bool,
    ) -> Result<String> {
        let Some(mgr) = &self.subnet_mgr else {
            return Err(IpamError::invalid_argument(
                "SpiderSubnet feature is disabled",
            ));
        };
        let _permit = self.limiter.acquire().await.map_err(|err| {
            warn!("Auto-pool provisioning rejected: {}", err);
            IpamError::retries_exhausted("auto-pool provisioning queue")
        })?;

        let mut attempt = 0;
        loop {
            match mgr
                .ensure_auto_pool(app, version, subnet_name, ip_number, reclaim)
                .await
            {
                Ok(pool) => return Ok(pool.name().to_string()),
                Err(err @ IpamError::WaitingForAvailable { .. }) => {
                    counter!(names::AUTO_POOL_WAITED_FOR_AVAILABLE_COUNTS).increment(1);
                    attempt += 1;
                    if attempt >= self.cfg.operation_retries {
                        return Err(err);
                    }
                    tokio::time::sleep(self.cfg.operation_gap).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Per-namespace default pool lists carried as Namespace annotations
    fn namespace_default_pools(
        &self,
        namespace: &str,
    ) -> Result<Option<(Vec<String>, Vec<String>)>> {
        let Some(ns) = self
            .namespaces
            .try_get(None, namespace)
            .map_err(|e| IpamError::internal(e.to_string()))?
        else {
            return Ok(None);
        };
        let Some(annos) = &ns.metadata.annotations else {
            return Ok(None);
        };

        let parse = |key: &str| -> Result<Vec<String>> {
            match annos.get(key) {
                Some(raw) => annotations::parse_ns_default_pools(raw)
                    .map_err(|e| IpamError::invalid_argument(e.to_string())),
                None => Ok(Vec::new()),
            }
        };
        let v4 = parse(annotations::ANNO_NS_DEFAULT_IPV4_POOL)?;
        let v6 = parse(annotations::ANNO_NS_DEFAULT_IPV6_POOL)?;
        if v4.is_empty() && v6.is_empty() {
            return Ok(None);
        }
        Ok(Some((v4, v6)))
    }

    /// Load and filter each candidate pool: disabled pools, family
    /// mismatches, and pools whose affinities exclude this pod are dropped.
    pub(crate) async fn resolve_candidates(
        &self,
        pod: &Pod,
        tba: &ToBeAllocated,
    ) -> Result<Vec<(IpVersion, Vec<SpiderIPPool>)>> {
        let internal = |e: spiderpool_store::StoreError| IpamError::internal(e.to_string());

        let pod_labels = pod.metadata.labels.clone().unwrap_or_default();
        let ns_labels = match pod.namespace() {
            Some(ns) => self
                .namespaces
                .try_get(None, ns)
                .map_err(internal)?
                .and_then(|n| n.metadata.labels)
                .unwrap_or_default(),
            None => BTreeMap::new(),
        };
        let node_labels = match pod.spec.as_ref().and_then(|s| s.node_name.as_deref()) {
            Some(node) => self
                .nodes
                .try_get(None, node)
                .map_err(internal)?
                .and_then(|n| n.metadata.labels)
                .unwrap_or_default(),
            None => BTreeMap::new(),
        };
        let multus = pod
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(constants::ANNO_MULTUS_DEFAULT_NETWORK))
            .cloned();

        let mut resolved = Vec::new();
        for candidate in &tba.pool_candidates {
            let mut survivors = Vec::new();
            for name in &candidate.pools {
                let Some(pool) = self.pools.try_get(None, name).map_err(internal)? else {
                    return Err(IpamError::pool_not_found(name));
                };
                if pool_selectable(
                    &pool,
                    candidate.version,
                    &pod_labels,
                    &ns_labels,
                    &node_labels,
                    multus.as_deref(),
                ) {
                    survivors.push(pool);
                } else {
                    debug!("Dropped candidate pool {} for NIC {}", name, tba.nic);
                }
            }
            if survivors.is_empty() {
                return Err(IpamError::NoAvailablePool {
                    version: candidate.version,
                    nic: tba.nic.clone(),
                });
            }
            resolved.push((candidate.version, survivors));
        }
        Ok(resolved)
    }
}

fn matches_selector(
    selector: Option<&BTreeMap<String, String>>,
    labels: &BTreeMap<String, String>,
) -> bool {
    selector.map_or(true, |sel| {
        sel.iter().all(|(k, v)| labels.get(k) == Some(v))
    })
}

fn pool_selectable(
    pool: &SpiderIPPool,
    version: IpVersion,
    pod_labels: &BTreeMap<String, String>,
    ns_labels: &BTreeMap<String, String>,
    node_labels: &BTreeMap<String, String>,
    multus: Option<&str>,
) -> bool {
    if pool.spec.disable {
        return false;
    }
    if pool.spec.ip_version != Some(version) {
        return false;
    }
    if !matches_selector(pool.spec.pod_affinity.as_ref(), pod_labels) {
        return false;
    }
    if !matches_selector(pool.spec.namespace_affinity.as_ref(), ns_labels) {
        return false;
    }
    if !matches_selector(pool.spec.node_affinity.as_ref(), node_labels) {
        return false;
    }
    if let Some(wanted) = &pool.spec.multus_name {
        if multus != Some(wanted.as_str()) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(version: IpVersion) -> SpiderIPPool {
        let mut p = SpiderIPPool::new("p");
        p.spec.ip_version = Some(version);
        p
    }

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_disabled_and_family_mismatch_are_dropped() {
        let empty = BTreeMap::new();
        let mut p = pool(IpVersion::V4);
        assert!(pool_selectable(&p, IpVersion::V4, &empty, &empty, &empty, None));
        assert!(!pool_selectable(&p, IpVersion::V6, &empty, &empty, &empty, None));

        p.spec.disable = true;
        assert!(!pool_selectable(&p, IpVersion::V4, &empty, &empty, &empty, None));
    }

    #[test]
    fn test_pod_affinity_reserves_pool() {
        let empty = BTreeMap::new();
        let mut p = pool(IpVersion::V4);
        p.spec.pod_affinity = Some(labels(&[("app", "web")]));

        let matching = labels(&[("app", "web"), ("tier", "front")]);
        let other = labels(&[("app", "db")]);
        assert!(pool_selectable(&p, IpVersion::V4, &matching, &empty, &empty, None));
        assert!(!pool_selectable(&p, IpVersion::V4, &other, &empty, &empty, None));
        assert!(!pool_selectable(&p, IpVersion::V4, &empty, &empty, &empty, None));
    }

    #[test]
    fn test_node_and_namespace_affinity() {
        let empty = BTreeMap::new();
        let mut p = pool(IpVersion::V4);
        p.spec.node_affinity = Some(labels(&[("zone", "a")]));
        p.spec.namespace_affinity = Some(labels(&[("team", "net")]));

        let node = labels(&[("zone", "a")]);
        let ns = labels(&[("team", "net")]);
        assert!(pool_selectable(&p, IpVersion::V4, &empty, &ns, &node, None));
        assert!(!pool_selectable(&p, IpVersion::V4, &empty, &empty, &node, None));
        assert!(!pool_selectable(&p, IpVersion::V4, &empty, &ns, &empty, None));
    }

    #[test]
    fn test_multus_name_restriction() {
        let empty = BTreeMap::new();
        let mut p = pool(IpVersion::V4);
        p.spec.multus_name = Some("macvlan-conf".to_string());

        assert!(pool_selectable(&p, IpVersion::V4, &empty, &empty, &empty, Some("macvlan-conf")));
        assert!(!pool_selectable(&p, IpVersion::V4, &empty, &empty, &empty, Some("other")));
        assert!(!pool_selectable(&p, IpVersion::V4, &empty, &empty, &empty, None));
    }
}
