use crate::allocate::Ipam;
use crate::types::{AllocateRequest, AllocateResponse, IpConfig, PodContext, RouteConfig};
use metrics::counter;
use spiderpool_core::types::IpVersion;
use spiderpool_core::{
    EndpointAllocation, IpamError, PoolAllocation, Result, SpiderEndpoint, SpiderIPPool,
};
use spiderpool_metrics::names;
use spiderpool_store::{update_status_with_retry, update_with_retry, Mutation};
use std::net::IpAddr;
use tracing::debug;

impl Ipam {
    /// Sticky re-use for StatefulSet replicas: if the recorded assignment
    /// is still valid in every referenced pool, hand the same addresses
    /// back, rewriting pool ownership to the new pod UID.
    ///
    /// Falls through to fresh selection (returning `None`) when any
    /// referenced pool is gone, disabled, or no longer contains the
    /// address; the stale record is replaced by the fresh allocation.
    /// History is not touched by a successful re-use.
    pub(crate) async fn try_sticky_reuse(
        &self,
        ctx: &PodContext,
        endpoint: &SpiderEndpoint,
        req: &AllocateRequest,
    ) -> Result<Option<AllocateResponse>> {
        let Some(current) = endpoint.status.as_ref().and_then(|s| s.current.clone()) else {
            return Ok(None);
        };
        if current.ips.is_empty() {
            return Ok(None);
        }

        // every recorded address must still be assignable from its pool
        for nic_alloc in &current.ips {
            let Some(pool) = self
                .pools
                .try_get(None, &nic_alloc.pool)
                .map_err(|e| IpamError::internal(e.to_string()))?
            else {
                debug!("Sticky pool {} is gone, re-selecting", nic_alloc.pool);
                return Ok(None);
            };
            if pool.spec.disable {
                debug!("Sticky pool {} is disabled, re-selecting", nic_alloc.pool);
                return Ok(None);
            }
            let Some(ip) = nic_ip(nic_alloc) else {
                return Ok(None);
            };
            if !pool.total_ips()?.contains(&ip) {
                debug!(
                    "Sticky address {} left pool {}, re-selecting",
                    ip, nic_alloc.pool
                );
                return Ok(None);
            }
        }

        // rewrite ownership inside each pool to the current pod instance
        for nic_alloc in &current.ips {
            let Some(ip) = nic_ip(nic_alloc) else { continue };
            self.reassign_pool_entry(&nic_alloc.pool, ip, ctx, &nic_alloc.nic)
                .await?;
        }

        let mut reused = current;
        reused.uid = ctx.uid.clone();
        reused.container_id = req.container_id.clone();
        reused.node = ctx.node.clone();

        let recorded = reused.clone();
        let mut on_conflict =
            |_: u32| counter!(names::IPAM_ALLOCATION_UPDATE_IPPOOL_CONFLICT_COUNTS).increment(1);
        update_with_retry::<_, IpamError, _>(
            &self.endpoints,
            Some(&ctx.namespace),
            &ctx.name,
            &self.retry,
            &mut on_conflict,
            |ep: &mut SpiderEndpoint| {
                let status = ep.status.get_or_insert_with(Default::default);
                status.current = Some(recorded.clone());
                Ok(Mutation::Apply)
            },
        )
        .await?;

        Ok(Some(response_from_allocation(&reused)))
    }

    /// Point one pool record at the current pod instance
    async fn reassign_pool_entry(
        &self,
        pool_name: &str,
        ip: IpAddr,
        ctx: &PodContext,
        nic: &str,
    ) -> Result<()> {
        let mut on_conflict =
            |_: u32| counter!(names::IPAM_ALLOCATION_UPDATE_IPPOOL_CONFLICT_COUNTS).increment(1);
        update_status_with_retry::<_, IpamError, _>(
            &self.pools,
            None,
            pool_name,
            &self.retry,
            &mut on_conflict,
            |pool: &mut SpiderIPPool| {
                let total = pool.total_ips()?.len() as u64;
                let status = pool.status.get_or_insert_with(Default::default);
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
                status.total_ip_count = Some(total);
                Ok(Mutation::Apply)
            },
        )
        .await?;
        Ok(())
    }
}

fn nic_ip(nic_alloc: &spiderpool_core::NicAllocation) -> Option<IpAddr> {
    nic_alloc.address.split('/').next()?.parse().ok()
}

/// Rebuild the wire response from a recorded endpoint assignment
pub(crate) fn response_from_allocation(alloc: &EndpointAllocation) -> AllocateResponse {
    let mut response = AllocateResponse::default();
    for nic_alloc in &alloc.ips {
        let version = nic_alloc.version.unwrap_or(IpVersion::V4);
        response.ips.push(IpConfig {
            nic: nic_alloc.nic.clone(),
            version,
            address: nic_alloc.address.clone(),
            gateway: nic_alloc.gateway.clone(),
            pool: nic_alloc.pool.clone(),
            vlan: nic_alloc.vlan,
        });
        for route in &nic_alloc.routes {
            response.routes.push(RouteConfig {
                nic: nic_alloc.nic.clone(),
                dst: route.dst.clone(),
                gw: route.gw.clone(),
            });
        }
        if let Some(gw) = &nic_alloc.gateway {
            if !nic_alloc.clean_gateway {
                let dst = match version {
                    IpVersion::V4 => "0.0.0.0/0",
                    IpVersion::V6 => "::/0",
                };
                response.routes.push(RouteConfig {
                    nic: nic_alloc.nic.clone(),
                    dst: dst.to_string(),
                    gw: gw.clone(),
                });
            }
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use spiderpool_core::NicAllocation;

    #[test]
    fn test_response_from_allocation() {
        let alloc = EndpointAllocation {
            uid: "u1".to_string(),
            container_id: "c1".to_string(),
            node: None,
            ips: vec![NicAllocation {
                nic: "eth0".to_string(),
                version: Some(IpVersion::V4),
                address: "10.0.0.10/24".to_string(),
                gateway: Some("10.0.0.254".to_string()),
                pool: "p4".to_string(),
                clean_gateway: false,
                ..Default::default()
            }],
        };

        let response = response_from_allocation(&alloc);
        assert_eq!(response.ips.len(), 1);
        assert_eq!(response.ips[0].address, "10.0.0.10/24");
        assert_eq!(response.routes.len(), 1);
        assert_eq!(response.routes[0].dst, "0.0.0.0/0");
    }

    #[test]
    fn test_clean_gateway_suppresses_default_route() {
        let alloc = EndpointAllocation {
            uid: "u1".to_string(),
            container_id: "c1".to_string(),
            node: None,
            ips: vec![NicAllocation {
                nic: "net1".to_string(),
                version: Some(IpVersion::V4),
                address: "10.1.0.10/24".to_string(),
                gateway: Some("10.1.0.254".to_string()),
                pool: "p4-b".to_string(),
                clean_gateway: true,
                ..Default::default()
            }],
        };

        let response = response_from_allocation(&alloc);
        assert!(response.routes.is_empty());
    }
}
