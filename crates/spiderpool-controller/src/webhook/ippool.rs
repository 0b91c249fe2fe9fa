use super::common::validate_shape;
use super::field::{ErrorList, FieldError};
use spiderpool_core::{ip, Resource, SpiderEndpoint, SpiderIPPool, SpiderSubnet};
use spiderpool_store::{Repository, Store};
use std::sync::Arc;

/// Admission validation for SpiderIPPool mutations
pub struct IPPoolWebhook {
    pools: Repository<SpiderIPPool>,
    subnets: Repository<SpiderSubnet>,
    endpoints: Repository<SpiderEndpoint>,
    pub enable_spider_subnet: bool,
}

impl IPPoolWebhook {
    pub fn new(store: &Arc<Store>, enable_spider_subnet: bool) -> Self {
        Self {
            pools: store.repository(),
            subnets: store.repository(),
            endpoints: store.repository(),
            enable_spider_subnet,
        }
    }

    pub fn validate_create(&self, pool: &SpiderIPPool) -> ErrorList {
        let spec = &pool.spec;
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

        self.validate_no_overlap(pool, &mut errors);
        if self.enable_spider_subnet {
            self.validate_subnet_controller(pool, &mut errors);
        }
        errors
    }

    pub fn validate_update(&self, old: &SpiderIPPool, new: &SpiderIPPool) -> ErrorList {
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

        self.validate_no_removed_allocations(old, new, &mut errors);
        self.validate_no_overlap(new, &mut errors);
        if self.enable_spider_subnet {
            self.validate_subnet_controller(new, &mut errors);
        }
        errors
    }

    pub fn validate_delete(&self, pool: &SpiderIPPool) -> ErrorList {
        let mut errors = ErrorList::new();
        let Some(status) = &pool.status else {
            return errors;
        };

        for (ip, alloc) in &status.allocated_ips {
            match self.endpoints.try_get(Some(&alloc.namespace), &alloc.pod) {
                Ok(Some(_)) => {
                    errors.push(FieldError::forbidden(
                        "status.allocatedIPs",
                        format!(
                            "address {} is still held by pod {}/{}",
                            ip, alloc.namespace, alloc.pod
                        ),
                    ));
                }
                Ok(None) => {}
                Err(err) => {
                    errors.push(FieldError::internal("status.allocatedIPs", err.to_string()));
                }
            }
        }
        errors
    }

    /// An address currently allocated may not be removed from the pool
    fn validate_no_removed_allocations(
        &self,
        old: &SpiderIPPool,
        new: &SpiderIPPool,
        errors: &mut ErrorList,
    ) {
        let (Ok(old_total), Ok(new_total)) = (old.total_ips(), new.total_ips()) else {
            return;
        };
        let Some(status) = &old.status else { return };

        for removed in ip::ips_diff_set(&old_total, &new_total, false) {
            if status.allocated_ips.contains_key(&removed) {
                errors.push(FieldError::forbidden(
                    "spec.ips",
                    format!("cannot remove allocated address {}", removed),
                ));
            }
        }
    }

    /// Two live pools sharing the same CIDR must have disjoint total sets
    fn validate_no_overlap(&self, pool: &SpiderIPPool, errors: &mut ErrorList) {
        let Some(version) = pool.spec.ip_version else { return };
        let Ok(total) = pool.total_ips() else { return };
        let others = match self.pools.list(None) {
            Ok(others) => others,
            Err(err) => {
                errors.push(FieldError::internal("spec.ips", err.to_string()));
                return;
            }
        };

        for other in others {
            if other.name() == pool.name() || other.spec.subnet != pool.spec.subnet {
                continue;
            }
            let Ok(other_total) = other.total_ips() else {
                continue;
            };
            let disjoint = ip::ips_diff_set(&total, &other_total, false);
            if disjoint.len() != total.len() {
                let overlap = ip::ips_diff_set(&total, &disjoint, false);
                let ranges = ip::convert_ips_to_ip_ranges(version, &overlap).unwrap_or_default();
                errors.push(FieldError::duplicate(
                    "spec.ips",
                    format!(
                        "ranges {:?} overlap with existing IPPool {}",
                        ranges,
                        other.name()
                    ),
                ));
            }
        }
    }

    /// With SpiderSubnet enabled every pool must be controlled by a live
    /// Subnet, and its total set must be contained in the Subnet's.
    fn validate_subnet_controller(&self, pool: &SpiderIPPool, errors: &mut ErrorList) {
        let Some(owner) = pool.owner_subnet() else {
            errors.push(FieldError::forbidden(
                "metadata.ownerReferences",
                format!(
                    "orphan IPPool, must be controlled by a Subnet with the same 'spec.subnet' {}",
                    pool.spec.subnet
                ),
            ));
            return;
        };

        let subnet = match self.subnets.try_get(None, owner) {
            Ok(Some(subnet)) => subnet,
            Ok(None) => {
                errors.push(FieldError::forbidden(
                    "metadata.ownerReferences",
                    format!("controller Subnet {} does not exist", owner),
                ));
                return;
            }
            Err(err) => {
                errors.push(FieldError::internal(
                    "metadata.ownerReferences",
                    format!("failed to get controller Subnet {}: {}", owner, err),
                ));
                return;
            }
        };

        if subnet.is_terminating() {
            errors.push(FieldError::forbidden(
                "metadata.ownerReferences",
                format!("controller Subnet {} is terminating", owner),
            ));
            return;
        }

        let (Ok(pool_total), Ok(subnet_total)) = (pool.total_ips(), subnet.total_ips()) else {
            errors.push(FieldError::internal(
                "spec.ips",
                "failed to assemble total IP addresses",
            ));
            return;
        };
        let out = ip::ips_diff_set(&pool_total, &subnet_total, false);
        if !out.is_empty() {
            let ranges = pool
                .spec
                .ip_version
                .and_then(|version| ip::convert_ips_to_ip_ranges(version, &out).ok())
                .unwrap_or_default();
            errors.push(FieldError::forbidden(
                "spec.ips",
                format!(
                    "ranges {:?} are not contained in controller Subnet {}",
                    ranges, owner
                ),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::field::FieldErrorKind;
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use spiderpool_core::types::IpVersion;
    use spiderpool_core::PoolAllocation;
    use tempfile::tempdir;

    fn setup(enable_subnet: bool) -> (tempfile::TempDir, Arc<Store>, IPPoolWebhook) {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("test.redb")).unwrap();
        let webhook = IPPoolWebhook::new(&store, enable_subnet);
        (dir, store, webhook)
    }

    fn pool(name: &str, ips: &[&str]) -> SpiderIPPool {
        let mut p = SpiderIPPool::new(name);
        p.spec.ip_version = Some(IpVersion::V4);
        p.spec.subnet = "10.0.0.0/24".to_string();
        p.spec.ips = ips.iter().map(|s| s.to_string()).collect();
        p
    }

    #[test]
    fn test_create_valid_pool() {
        let (_dir, _store, webhook) = setup(false);
        let errors = webhook.validate_create(&pool("p4", &["10.0.0.1-10.0.0.9"]));
        assert!(errors.is_empty(), "{:?}", errors);
    }

    #[test]
    fn test_create_rejects_malformed_entries() {
        let (_dir, _store, webhook) = setup(false);
        let errors = webhook.validate_create(&pool("p4", &["10.0.9.1-10.0.0.9"]));
        assert!(!errors.is_empty());
        assert_eq!(errors[0].kind, FieldErrorKind::Invalid);
    }

    #[test]
    fn test_create_rejects_overlap_with_same_cidr() {
        let (_dir, store, webhook) = setup(false);
        store
            .repository::<SpiderIPPool>()
            .create(&pool("existing", &["10.0.0.1-10.0.0.5"]))
            .unwrap();

        let errors = webhook.validate_create(&pool("new", &["10.0.0.4-10.0.0.9"]));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, FieldErrorKind::Duplicate);
        assert!(errors[0].message.contains("existing"));

        // disjoint ranges in the same CIDR are fine
        let errors = webhook.validate_create(&pool("new", &["10.0.0.6-10.0.0.9"]));
        assert!(errors.is_empty());
    }

    #[test]
    fn test_create_with_spider_subnet_requires_owner() {
        let (_dir, store, webhook) = setup(true);

        let orphan = pool("p4", &["10.0.0.1-10.0.0.5"]);
        let errors = webhook.validate_create(&orphan);
        assert_eq!(errors[0].kind, FieldErrorKind::Forbidden);

        // with a live subnet covering the pool, creation passes
        let mut subnet = SpiderSubnet::new("s4");
        subnet.spec.ip_version = Some(IpVersion::V4);
        subnet.spec.subnet = "10.0.0.0/24".to_string();
        subnet.spec.ips = vec!["10.0.0.1-10.0.0.20".to_string()];
        store.repository::<SpiderSubnet>().create(&subnet).unwrap();

        let mut owned = pool("p4", &["10.0.0.1-10.0.0.5"]);
        owned.metadata.owner_references = Some(vec![OwnerReference {
            api_version: spiderpool_core::constants::API_VERSION.to_string(),
            kind: "SpiderSubnet".to_string(),
            name: "s4".to_string(),
            uid: "u".to_string(),
            controller: Some(true),
            ..Default::default()
        }]);
        assert!(webhook.validate_create(&owned).is_empty());

        // a pool reaching outside the subnet is rejected
        let mut outside = owned.clone();
        outside.spec.ips = vec!["10.0.0.1-10.0.0.30".to_string()];
        let errors = webhook.validate_create(&outside);
        assert_eq!(errors[0].kind, FieldErrorKind::Forbidden);
        assert!(errors[0].message.contains("not contained"));
    }

    #[test]
    fn test_update_immutable_fields() {
        let (_dir, _store, webhook) = setup(false);
        let old = pool("p4", &["10.0.0.1-10.0.0.9"]);

        let mut changed = old.clone();
        changed.spec.vlan = Some(100);
        let errors = webhook.validate_update(&old, &changed);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path, "spec.vlan");
        assert_eq!(errors[0].kind, FieldErrorKind::Forbidden);
    }

    #[test]
    fn test_update_cannot_remove_allocated_address() {
        let (_dir, _store, webhook) = setup(false);
        let mut old = pool("p4", &["10.0.0.1-10.0.0.9"]);
        let status = old.status.get_or_insert_with(Default::default);
        status.allocated_ips.insert(
            "10.0.0.9".parse().unwrap(),
            PoolAllocation {
                pod_uid: "u".to_string(),
                pod: "a".to_string(),
                namespace: "ns".to_string(),
                nic: "eth0".to_string(),
                owner_controller_kind: "Pod".to_string(),
                ..Default::default()
            },
        );

        // shrinking away the allocated .9 is forbidden
        let mut shrunk = old.clone();
        shrunk.spec.ips = vec!["10.0.0.1-10.0.0.8".to_string()];
        let errors = webhook.validate_update(&old, &shrunk);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("10.0.0.9"));

        // shrinking away free addresses is allowed
        let mut shrunk = old.clone();
        shrunk.spec.ips = vec!["10.0.0.5-10.0.0.9".to_string()];
        assert!(webhook.validate_update(&old, &shrunk).is_empty());
    }

    #[test]
    fn test_delete_gated_on_live_endpoints() {
        let (_dir, store, webhook) = setup(false);
        let mut p = pool("p4", &["10.0.0.1-10.0.0.9"]);
        let status = p.status.get_or_insert_with(Default::default);
        status.allocated_ips.insert(
            "10.0.0.1".parse().unwrap(),
            PoolAllocation {
                pod_uid: "u".to_string(),
                pod: "a".to_string(),
                namespace: "ns".to_string(),
                nic: "eth0".to_string(),
                owner_controller_kind: "Pod".to_string(),
                ..Default::default()
            },
        );

        // the owning endpoint is gone: deletion allowed
        assert!(webhook.validate_delete(&p).is_empty());

        store
            .repository::<SpiderEndpoint>()
            .create(&SpiderEndpoint::new("ns", "a"))
            .unwrap();
        let errors = webhook.validate_delete(&p);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, FieldErrorKind::Forbidden);
    }
}
