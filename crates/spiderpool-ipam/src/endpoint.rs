use crate::allocate::Ipam;
use crate::types::{AllocateRequest, AllocationResult, PodContext};
use metrics::counter;
use spiderpool_core::{
    constants, EndpointAllocation, IpamError, NicAllocation, Result, SpiderEndpoint,
};
use spiderpool_metrics::names;
use spiderpool_store::{update_with_retry, Mutation, StoreError};
use tracing::debug;

impl Ipam {
    /// Upsert the pod's SpiderEndpoint with the new assignment: `current`
    /// is rewritten, the previous assignment is pushed onto the bounded
    /// history, and the finalizer guarantees pool cleanup before deletion.
    pub(crate) async fn record_endpoint(
        &self,
        ctx: &PodContext,
        req: &AllocateRequest,
        results: &[AllocationResult],
    ) -> Result<()> {
        let allocation = EndpointAllocation {
            uid: ctx.uid.clone(),
            container_id: req.container_id.clone(),
            node: ctx.node.clone(),
            ips: results.iter().map(to_nic_allocation).collect(),
        };

        if self
            .endpoints
            .try_get(Some(&ctx.namespace), &ctx.name)
            .map_err(|e| IpamError::internal(e.to_string()))?
            .is_none()
        {
            let mut endpoint = SpiderEndpoint::new(&ctx.namespace, &ctx.name);
            endpoint.metadata.finalizers =
                Some(vec![constants::SPIDERPOOL_FINALIZER.to_string()]);
            let status = endpoint.status.get_or_insert_with(Default::default);
            status.owner_controller_kind = ctx.owner_kind.as_str().to_string();
            status.owner_controller_name = ctx.owner_name.clone().unwrap_or_default();
            status.node = ctx.node.clone();
            endpoint.record_allocation(allocation.clone(), self.cfg.max_history_records);

            match self.endpoints.create(&endpoint) {
                Ok(_) => {
                    debug!("Created endpoint {}/{}", ctx.namespace, ctx.name);
                    return Ok(());
                }
                // lost the create race; fall through to the update path
                Err(StoreError::AlreadyExists { .. }) => {}
                Err(err) => return Err(IpamError::internal(err.to_string())),
            }
        }

        let max_history = self.cfg.max_history_records;
        let mut on_conflict =
            |_: u32| counter!(names::IPAM_ALLOCATION_UPDATE_IPPOOL_CONFLICT_COUNTS).increment(1);
        update_with_retry::<_, IpamError, _>(
            &self.endpoints,
            Some(&ctx.namespace),
            &ctx.name,
            &self.retry,
            &mut on_conflict,
            |endpoint: &mut SpiderEndpoint| {
                let finalizers = endpoint.metadata.finalizers.get_or_insert_with(Vec::new);
                if !finalizers.iter().any(|f| f == constants::SPIDERPOOL_FINALIZER) {
                    finalizers.push(constants::SPIDERPOOL_FINALIZER.to_string());
                }
                let status = endpoint.status.get_or_insert_with(Default::default);
                status.owner_controller_kind = ctx.owner_kind.as_str().to_string();
                status.owner_controller_name = ctx.owner_name.clone().unwrap_or_default();
                status.node = ctx.node.clone();
                endpoint.record_allocation(allocation.clone(), max_history);
                Ok(Mutation::Apply)
            },
        )
        .await?;
        debug!("Rewrote endpoint {}/{}", ctx.namespace, ctx.name);
        Ok(())
    }
}

fn to_nic_allocation(result: &AllocationResult) -> NicAllocation {
    NicAllocation {
        nic: result.nic.clone(),
        version: Some(result.version),
        address: result.address(),
        gateway: result.gateway.clone(),
        routes: result.routes.clone(),
        vlan: result.vlan,
        pool: result.pool.clone(),
        clean_gateway: result.clean_gateway,
    }
}
