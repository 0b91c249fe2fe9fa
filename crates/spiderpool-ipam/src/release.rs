use crate::allocate::Ipam;
use crate::metrics::record_release_outcome;
use crate::types::ReleaseRequest;
use metrics::counter;
use spiderpool_core::{constants, IpamError, Result, SpiderEndpoint, SpiderIPPool};
use spiderpool_metrics::names;
use spiderpool_store::{update_status_with_retry, update_with_retry, Mutation, StoreError};
use std::net::IpAddr;
use std::time::Instant;
use tracing::{debug, info};

impl Ipam {
    /// Release the addresses recorded for one pod (optionally one NIC).
    ///
    /// Pool entries are removed only when their recorded pod UID matches
    /// the releasing assignment, so an address that was already reassigned
    /// is never touched; that case is a successful no-op.
    pub async fn release(&self, req: &ReleaseRequest) -> Result<()> {
        let started = Instant::now();
        let result = self.release_inner(req).await;
        self.metrics.release_duration.observe(started.elapsed());
        record_release_outcome(&result.as_ref().map(|_| ()));
        result
    }

    async fn release_inner(&self, req: &ReleaseRequest) -> Result<()> {
        let Some(endpoint) = self
            .endpoints
            .try_get(Some(&req.pod_namespace), &req.pod_name)
            .map_err(|e| IpamError::internal(e.to_string()))?
        else {
            // nothing recorded: releasing twice is fine
            return Ok(());
        };

        let Some(current) = endpoint.status.as_ref().and_then(|s| s.current.clone()) else {
            self.finish_endpoint(req).await?;
            return Ok(());
        };

        if current.container_id != req.container_id {
            // a stale delete for a container this pod no longer runs
            debug!(
                "Ignoring release for stale container {} of pod {}/{}",
                req.container_id, req.pod_namespace, req.pod_name
            );
            return Ok(());
        }

        let releasing: Vec<(String, IpAddr)> = current
            .ips
            .iter()
            .filter(|nic_alloc| {
                req.if_name
                    .as_deref()
                    .map_or(true, |nic| nic_alloc.nic == nic)
            })
            .filter_map(|nic_alloc| {
                let ip: IpAddr = nic_alloc.address.split('/').next()?.parse().ok()?;
                Some((nic_alloc.pool.clone(), ip))
            })
            .collect();

        for (pool, ip) in &releasing {
            self.release_pool_entries(pool, &[*ip], &current.uid).await?;
        }

        // clear the released NICs from `current`; history is not touched
        let if_name = req.if_name.clone();
        let mut on_conflict =
            |_: u32| counter!(names::IPAM_RELEASE_UPDATE_IPPOOL_CONFLICT_COUNTS).increment(1);
        update_with_retry::<_, IpamError, _>(
            &self.endpoints,
            Some(&req.pod_namespace),
            &req.pod_name,
            &self.retry,
            &mut on_conflict,
            |endpoint: &mut SpiderEndpoint| {
                let Some(status) = endpoint.status.as_mut() else {
                    return Ok(Mutation::Noop);
                };
                let Some(current) = status.current.as_mut() else {
                    return Ok(Mutation::Noop);
                };
                match &if_name {
                    Some(nic) => {
                        current.ips.retain(|a| &a.nic != nic);
                        if current.ips.is_empty() {
                            status.current = None;
                        }
                    }
                    None => status.current = None,
                }
                Ok(Mutation::Apply)
            },
        )
        .await?;

        self.finish_endpoint(req).await?;
        info!(
            "Released {} address(es) of pod {}/{}",
            releasing.len(),
            req.pod_namespace,
            req.pod_name
        );
        Ok(())
    }

    /// Remove pool entries whose recorded UID matches; conflicts retried
    pub(crate) async fn release_pool_entries(
        &self,
        pool_name: &str,
        ips: &[IpAddr],
        uid: &str,
    ) -> Result<()> {
        if self
            .pools
            .try_get(None, pool_name)
            .map_err(|e| IpamError::internal(e.to_string()))?
            .is_none()
        {
            // pool deleted underneath us: nothing left to clean
            return Ok(());
        }

        let uid = uid.to_string();
        let ips = ips.to_vec();
        let mut on_conflict =
            |_: u32| counter!(names::IPAM_RELEASE_UPDATE_IPPOOL_CONFLICT_COUNTS).increment(1);
        update_status_with_retry::<_, IpamError, _>(
            &self.pools,
            None,
            pool_name,
            &self.retry,
            &mut on_conflict,
            |pool: &mut SpiderIPPool| {
                let Some(status) = pool.status.as_mut() else {
                    return Ok(Mutation::Noop);
                };
                let mut changed = false;
                for ip in &ips {
                    if status
                        .allocated_ips
                        .get(ip)
                        .is_some_and(|entry| entry.pod_uid == uid)
                    {
                        status.allocated_ips.remove(ip);
                        changed = true;
                    }
                }
                if !changed {
                    return Ok(Mutation::Noop);
                }
                status.allocated_ip_count = Some(status.allocated_ips.len() as u64);
                Ok(Mutation::Apply)
            },
        )
        .await?;
        Ok(())
    }

    /// Once the pod is gone, drop the finalizer and delete the endpoint
    async fn finish_endpoint(&self, req: &ReleaseRequest) -> Result<()> {
        let pod_gone = self
            .pods
            .try_get(Some(&req.pod_namespace), &req.pod_name)
            .map_err(|e| IpamError::internal(e.to_string()))?
            .is_none();
        if !pod_gone {
            return Ok(());
        }

        let mut on_conflict = |_: u32| {};
        let result = update_with_retry::<_, IpamError, _>(
            &self.endpoints,
            Some(&req.pod_namespace),
            &req.pod_name,
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
        .await;
        if let Err(err) = result {
            return Err(err);
        }

        match self.endpoints.delete(Some(&req.pod_namespace), &req.pod_name) {
            Ok(()) => {
                debug!(
                    "Deleted endpoint {}/{} after pod removal",
                    req.pod_namespace, req.pod_name
                );
                Ok(())
            }
            Err(StoreError::NotFound { .. }) => Ok(()),
            Err(err) => Err(IpamError::internal(err.to_string())),
        }
    }
}
