use super::common::validate_shape;
use super::field::{ErrorList, FieldError};
use spiderpool_core::{ip, Resource, SpiderSubnet};
use spiderpool_store::{Repository, Store};
use std::sync::Arc;

/// Admission validation for SpiderSubnet mutations
pub struct SubnetWebhook {
    subnets: Repository<SpiderSubnet>,
}

impl SubnetWebhook {
    pub fn new(store: &Arc<Store>) -> Self {
        Self {
            subnets: store.repository(),
        }
    }

    pub fn validate_create(&self, subnet: &SpiderSubnet) -> ErrorList {
        let spec = &subnet.spec;
        let mut errors = validate_shape(
            spec.ip_version,
            &spec.subnet,
            &spec.ips,
            &spec.exclude_ips,
            spec.gateway.as_deref(),
            spec.vlan,
            &spec.routes,
        );
        if !errors.is_empty() {
            return errors;
        }

        self.validate_no_overlap(subnet, &mut errors);
        errors
    }

    pub fn validate_update(&self, old: &SpiderSubnet, new: &SpiderSubnet) -> ErrorList {
        let spec = &new.spec;
        let mut errors = validate_shape(
            spec.ip_version,
            &spec.subnet,
            &spec.ips,
            &spec.exclude_ips,
            spec.gateway.as_deref(),
            spec.vlan,
            &spec.routes,
        );
        if !errors.is_empty() {
            return errors;
        }

        if new.spec.subnet != old.spec.subnet {
            errors.push(FieldError::forbidden("spec.subnet", "field is immutable"));
        }
        if new.spec.ip_version != old.spec.ip_version {
            errors.push(FieldError::forbidden("spec.ipVersion", "field is immutable"));
        }
        if new.spec.vlan != old.spec.vlan {
            errors.push(FieldError::forbidden("spec.vlan", "field is immutable"));
        }
        if !errors.is_empty() {
            return errors;
        }

        self.validate_no_removed_claims(old, new, &mut errors);
        self.validate_no_overlap(new, &mut errors);
        errors
    }

    pub fn validate_delete(&self, subnet: &SpiderSubnet) -> ErrorList {
        let mut errors = ErrorList::new();
        if let Some(status) = &subnet.status {
            if !status.controlled_ip_pools.is_empty() {
                let children: Vec<&String> = status.controlled_ip_pools.keys().collect();
                errors.push(FieldError::forbidden(
                    "status.controlledIPPools",
                    format!("subnet still controls IPPools {:?}", children),
                ));
            }
        }
        errors
    }

    /// Shrinking may not strand addresses already claimed by child pools
    fn validate_no_removed_claims(
        &self,
        old: &SpiderSubnet,
        new: &SpiderSubnet,
        errors: &mut ErrorList,
    ) {
        let (Ok(old_total), Ok(new_total)) = (old.total_ips(), new.total_ips()) else {
            return;
        };
        let Ok(claimed) = old.controlled_ips() else {
            return;
        };

        let removed = ip::ips_diff_set(&old_total, &new_total, false);
        let stranded: Vec<_> = removed
            .iter()
            .filter(|ip| claimed.contains(ip))
            .collect();
        if !stranded.is_empty() {
            errors.push(FieldError::forbidden(
                "spec.ips",
                format!(
                    "cannot remove addresses {:?} claimed by controlled IPPools",
                    stranded
                ),
            ));
        }
    }

    fn validate_no_overlap(&self, subnet: &SpiderSubnet, errors: &mut ErrorList) {
        let Ok(total) = subnet.total_ips() else { return };
        let others = match self.subnets.list(None) {
            Ok(others) => others,
            Err(err) => {
                errors.push(FieldError::internal("spec.ips", err.to_string()));
                return;
            }
        };

        for other in others {
            if other.name() == subnet.name() || other.spec.subnet != subnet.spec.subnet {
                continue;
            }
            let Ok(other_total) = other.total_ips() else {
                continue;
            };
            let disjoint = ip::ips_diff_set(&total, &other_total, false);
            if disjoint.len() != total.len() {
                errors.push(FieldError::duplicate(
                    "spec.ips",
                    format!("ranges overlap with existing Subnet {}", other.name()),
                ));
            }
        }
    }
}
