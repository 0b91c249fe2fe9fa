use super::field::{ErrorList, FieldError};
use spiderpool_core::ip;
use spiderpool_core::types::IpVersion;
use spiderpool_core::Route;

/// Field checks shared by the IPPool and Subnet specs: every entry must be
/// well-formed for the declared family and lie within the CIDR.
pub(crate) fn validate_shape(
    ip_version: Option<IpVersion>,
    subnet: &str,
    ips: &[String],
    exclude_ips: &[String],
    gateway: Option<&str>,
    vlan: Option<i64>,
    routes: &[Route],
) -> ErrorList {
    let mut errors = ErrorList::new();

    let Some(version) = ip_version else {
        errors.push(FieldError::not_supported(
            "spec.ipVersion",
            "must be 4 or 6",
        ));
        return errors;
    };

    if !ip::is_cidr(version, subnet) {
        errors.push(FieldError::invalid(
            "spec.subnet",
            format!("'{}' is not a valid {} CIDR", subnet, version),
        ));
        // everything below needs the CIDR
        return errors;
    }

    for (i, entry) in ips.iter().enumerate() {
        validate_range_in_subnet(&mut errors, version, subnet, entry, &format!("spec.ips[{}]", i));
    }
    for (i, entry) in exclude_ips.iter().enumerate() {
        validate_range_in_subnet(
            &mut errors,
            version,
            subnet,
            entry,
            &format!("spec.excludeIPs[{}]", i),
        );
    }

    if let Some(gw) = gateway {
        match ip::contains_ip(version, subnet, gw) {
            Ok(true) => {}
            Ok(false) => errors.push(FieldError::invalid(
                "spec.gateway",
                format!("'{}' is not within subnet '{}'", gw, subnet),
            )),
            Err(err) => errors.push(FieldError::invalid("spec.gateway", err.to_string())),
        }
    }

    if let Some(vlan) = vlan {
        if !(0..=4094).contains(&vlan) {
            errors.push(FieldError::invalid(
                "spec.vlan",
                format!("{} is out of range [0, 4094]", vlan),
            ));
        }
    }

    for (i, route) in routes.iter().enumerate() {
        if !ip::is_cidr(version, &route.dst) {
            errors.push(FieldError::invalid(
                format!("spec.routes[{}].dst", i),
                format!("'{}' is not a valid {} CIDR", route.dst, version),
            ));
        }
        if ip::parse_ip(version, &route.gw).is_err() {
            errors.push(FieldError::invalid(
                format!("spec.routes[{}].gw", i),
                format!("'{}' is not a valid {} address", route.gw, version),
            ));
        }
    }

    errors
}

fn validate_range_in_subnet(
    errors: &mut ErrorList,
    version: IpVersion,
    subnet: &str,
    entry: &str,
    path: &str,
) {
    if !ip::is_ip_range(version, entry) {
        errors.push(FieldError::invalid(
            path,
            format!("'{}' is not a valid {} range", entry, version),
        ));
        return;
    }
    match ip::contains_ip_range(version, subnet, entry) {
        Ok(true) => {}
        Ok(false) => errors.push(FieldError::invalid(
            path,
            format!("'{}' is not within subnet '{}'", entry, subnet),
        )),
        Err(err) => errors.push(FieldError::invalid(path, err.to_string())),
    }
}
