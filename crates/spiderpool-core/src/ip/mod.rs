//! Pure IP range algebra.
//!
//! Every routine takes the address family as its first argument and rejects
//! entries of the other family; mixing families is always an error, never
//! silently tolerated.

pub mod range;

pub use range::{parse_ip_range, IpRange};

use crate::types::IpVersion;
use ipnetwork::IpNetwork;
use std::collections::BTreeSet;
use std::net::IpAddr;
use thiserror::Error;

/// Error type for IP parsing and range algebra
#[derive(Error, Debug, PartialEq, Eq)]
pub enum IpError {
    #[error("failed to parse {kind} '{entry}'")]
    Parse { kind: &'static str, entry: String },

    #[error("'{entry}' is not an {version} entry")]
    VersionMismatch { entry: String, version: IpVersion },

    #[error("invalid IP range '{entry}': begin address is greater than end address")]
    RangeOrder { entry: String },
}

impl IpError {
    pub(crate) fn parse(kind: &'static str, entry: impl Into<String>) -> Self {
        Self::Parse {
            kind,
            entry: entry.into(),
        }
    }

    pub(crate) fn version_mismatch(entry: impl Into<String>, version: IpVersion) -> Self {
        Self::VersionMismatch {
            entry: entry.into(),
            version,
        }
    }
}

pub type Result<T> = std::result::Result<T, IpError>;

/// Numeric value of an address, family-agnostic (IPv4 maps into the low 32 bits)
pub(crate) fn ip_to_int(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u32::from(v4) as u128,
        IpAddr::V6(v6) => u128::from(v6),
    }
}

pub(crate) fn int_to_ip(version: IpVersion, n: u128) -> IpAddr {
    match version {
        IpVersion::V4 => IpAddr::V4(std::net::Ipv4Addr::from(n as u32)),
        IpVersion::V6 => IpAddr::V6(std::net::Ipv6Addr::from(n)),
    }
}

/// Parse a single address of the stated family
pub fn parse_ip(version: IpVersion, s: &str) -> Result<IpAddr> {
    let ip: IpAddr = s.trim().parse().map_err(|_| IpError::parse("IP", s))?;
    if !version.matches(&ip) {
        return Err(IpError::version_mismatch(s, version));
    }
    Ok(ip)
}

/// Parse a CIDR of the stated family
pub fn parse_cidr(version: IpVersion, s: &str) -> Result<IpNetwork> {
    let net: IpNetwork = s.trim().parse().map_err(|_| IpError::parse("CIDR", s))?;
    let matches = match net {
        IpNetwork::V4(_) => version == IpVersion::V4,
        IpNetwork::V6(_) => version == IpVersion::V6,
    };
    if !matches {
        return Err(IpError::version_mismatch(s, version));
    }
    Ok(net)
}

/// `∪ranges ∖ ∪excludes`, normalized to a sorted duplicate-free list.
///
/// Each entry is `a` or `a-b` with `a ≤ b`, parsed per the stated family.
pub fn assemble_total_ips(
    version: IpVersion,
    ranges: &[String],
    excludes: &[String],
) -> Result<Vec<IpAddr>> {
    let mut total = BTreeSet::new();
    for r in ranges {
        total.extend(parse_ip_range(version, r)?.iter());
    }
    for r in excludes {
        for ip in parse_ip_range(version, r)?.iter() {
            total.remove(&ip);
        }
    }
    Ok(total.into_iter().collect())
}

/// Expand a list of range strings into a sorted duplicate-free address list
pub fn convert_ip_ranges_to_ips(version: IpVersion, ranges: &[String]) -> Result<Vec<IpAddr>> {
    assemble_total_ips(version, ranges, &[])
}

/// Collapse an address list into minimal `a` / `a-b` range strings.
///
/// Inverse of [`convert_ip_ranges_to_ips`] on normalized input.
pub fn convert_ips_to_ip_ranges(version: IpVersion, ips: &[IpAddr]) -> Result<Vec<String>> {
    let mut sorted = BTreeSet::new();
    for ip in ips {
        if !version.matches(ip) {
            return Err(IpError::version_mismatch(ip.to_string(), version));
        }
        sorted.insert(ip_to_int(*ip));
    }

    let mut ranges = Vec::new();
    let mut run: Option<(u128, u128)> = None;
    for n in sorted {
        run = match run {
            Some((start, end)) if n == end + 1 => Some((start, n)),
            Some((start, end)) => {
                ranges.push(format_range(version, start, end));
                Some((n, n))
            }
            None => Some((n, n)),
        };
    }
    if let Some((start, end)) = run {
        ranges.push(format_range(version, start, end));
    }
    Ok(ranges)
}

fn format_range(version: IpVersion, start: u128, end: u128) -> String {
    if start == end {
        int_to_ip(version, start).to_string()
    } else {
        format!("{}-{}", int_to_ip(version, start), int_to_ip(version, end))
    }
}

/// `a ∖ b`; set identity on `a`. The result keeps `a`'s order unless
/// `sort_result` is set.
pub fn ips_diff_set(a: &[IpAddr], b: &[IpAddr], sort_result: bool) -> Vec<IpAddr> {
    let exclude: BTreeSet<&IpAddr> = b.iter().collect();
    let mut seen = BTreeSet::new();
    let mut out: Vec<IpAddr> = a
        .iter()
        .filter(|ip| !exclude.contains(ip) && seen.insert(**ip))
        .copied()
        .collect();
    if sort_result {
        out.sort_by_key(|ip| ip_to_int(*ip));
    }
    out
}

/// `a ∪ b`, sorted and duplicate-free
pub fn ips_union_set(a: &[IpAddr], b: &[IpAddr]) -> Vec<IpAddr> {
    let set: BTreeSet<IpAddr> = a.iter().chain(b.iter()).copied().collect();
    set.into_iter().collect()
}

/// Whether every address of `range` lies inside `cidr`
pub fn contains_ip_range(version: IpVersion, cidr: &str, range: &str) -> Result<bool> {
    let net = parse_cidr(version, cidr)?;
    let r = parse_ip_range(version, range)?;
    Ok(net.contains(r.start()) && net.contains(r.end()))
}

/// Whether a single address lies inside `cidr`
pub fn contains_ip(version: IpVersion, cidr: &str, ip: &str) -> Result<bool> {
    let net = parse_cidr(version, cidr)?;
    let addr = parse_ip(version, ip)?;
    Ok(net.contains(addr))
}

/// Syntactic predicate: is `n` a recognized IP version number
pub fn is_ip_version(n: u8) -> bool {
    IpVersion::from_number(n).is_some()
}

/// Syntactic predicate: is `s` a well-formed `a` or `a-b` entry of the family
pub fn is_ip_range(version: IpVersion, s: &str) -> bool {
    parse_ip_range(version, s).is_ok()
}

/// Syntactic predicate: is `s` a well-formed CIDR of the family
pub fn is_cidr(version: IpVersion, s: &str) -> bool {
    parse_cidr(version, s).is_ok()
}

/// Sort addresses of one family in numeric order
pub fn sort_ips(ips: &mut [IpAddr]) {
    ips.sort_by_key(|ip| ip_to_int(*ip));
}

/// Whether `b` immediately follows `a` within the same family
pub fn are_consecutive(a: IpAddr, b: IpAddr) -> bool {
    a.is_ipv4() == b.is_ipv4() && ip_to_int(b) == ip_to_int(a).wrapping_add(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn strs(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_assemble_total_ips() {
        let total = assemble_total_ips(
            IpVersion::V4,
            &strs(&["10.0.0.1-10.0.0.5", "10.0.0.10"]),
            &strs(&["10.0.0.2-10.0.0.3"]),
        )
        .unwrap();
        assert_eq!(
            total,
            vec![v4("10.0.0.1"), v4("10.0.0.4"), v4("10.0.0.5"), v4("10.0.0.10")]
        );
    }

    #[test]
    fn test_assemble_dedups_overlapping_ranges() {
        let total = assemble_total_ips(
            IpVersion::V4,
            &strs(&["10.0.0.1-10.0.0.3", "10.0.0.2-10.0.0.4"]),
            &[],
        )
        .unwrap();
        assert_eq!(total.len(), 4);
        assert_eq!(total[0], v4("10.0.0.1"));
        assert_eq!(total[3], v4("10.0.0.4"));
    }

    #[test]
    fn test_assemble_rejects_mixed_family() {
        let err = assemble_total_ips(IpVersion::V4, &strs(&["fd00::1"]), &[]).unwrap_err();
        assert!(matches!(err, IpError::VersionMismatch { .. }));

        let err = assemble_total_ips(IpVersion::V6, &strs(&["10.0.0.1"]), &[]).unwrap_err();
        assert!(matches!(err, IpError::VersionMismatch { .. }));
    }

    #[test]
    fn test_assemble_rejects_malformed() {
        let err = assemble_total_ips(IpVersion::V4, &strs(&["not-an-ip"]), &[]).unwrap_err();
        assert!(matches!(err, IpError::Parse { .. }));

        let err =
            assemble_total_ips(IpVersion::V4, &strs(&["10.0.0.5-10.0.0.1"]), &[]).unwrap_err();
        assert!(matches!(err, IpError::RangeOrder { .. }));
    }

    #[test]
    fn test_ranges_ips_inverse() {
        let ranges = strs(&["10.0.0.1-10.0.0.3", "10.0.0.7", "10.0.0.9-10.0.0.10"]);
        let ips = convert_ip_ranges_to_ips(IpVersion::V4, &ranges).unwrap();
        let back = convert_ips_to_ip_ranges(IpVersion::V4, &ips).unwrap();
        assert_eq!(back, ranges);

        let again = convert_ip_ranges_to_ips(IpVersion::V4, &back).unwrap();
        assert_eq!(again, ips);
    }

    #[test]
    fn test_convert_ips_merges_adjacent() {
        let ips = vec![v4("10.0.0.3"), v4("10.0.0.1"), v4("10.0.0.2")];
        let ranges = convert_ips_to_ip_ranges(IpVersion::V4, &ips).unwrap();
        assert_eq!(ranges, vec!["10.0.0.1-10.0.0.3".to_string()]);
    }

    #[test]
    fn test_ips_diff_set() {
        let a = vec![v4("10.0.0.1"), v4("10.0.0.2"), v4("10.0.0.3")];
        let b = vec![v4("10.0.0.2")];
        assert_eq!(ips_diff_set(&a, &b, false), vec![v4("10.0.0.1"), v4("10.0.0.3")]);

        // set identity: a \ a = ∅
        assert!(ips_diff_set(&a, &a, false).is_empty());
        // a \ ∅ = a
        assert_eq!(ips_diff_set(&a, &[], false), a);
    }

    #[test]
    fn test_ips_union_set() {
        let a = vec![v4("10.0.0.2")];
        let b = vec![v4("10.0.0.1"), v4("10.0.0.2")];
        assert_eq!(ips_union_set(&a, &b), vec![v4("10.0.0.1"), v4("10.0.0.2")]);
    }

    #[test]
    fn test_contains_ip_range() {
        assert!(contains_ip_range(IpVersion::V4, "10.0.0.0/24", "10.0.0.10-10.0.0.20").unwrap());
        assert!(!contains_ip_range(IpVersion::V4, "10.0.0.0/24", "10.0.0.200-10.0.1.5").unwrap());
        assert!(contains_ip_range(IpVersion::V6, "fd00::/64", "fd00::10").unwrap());
    }

    #[test]
    fn test_predicates() {
        assert!(is_ip_version(4));
        assert!(is_ip_version(6));
        assert!(!is_ip_version(0));

        assert!(is_ip_range(IpVersion::V4, "10.0.0.1"));
        assert!(is_ip_range(IpVersion::V4, "10.0.0.1-10.0.0.9"));
        assert!(!is_ip_range(IpVersion::V4, "10.0.0.9-10.0.0.1"));
        assert!(!is_ip_range(IpVersion::V6, "10.0.0.1"));

        assert!(is_cidr(IpVersion::V4, "10.0.0.0/16"));
        assert!(is_cidr(IpVersion::V6, "fd00::/64"));
        assert!(!is_cidr(IpVersion::V4, "10.0.0.0/33"));
        assert!(!is_cidr(IpVersion::V4, "fd00::/64"));
    }

    #[test]
    fn test_v6_arithmetic() {
        let total = assemble_total_ips(IpVersion::V6, &strs(&["fd00::1-fd00::4"]), &[]).unwrap();
        assert_eq!(total.len(), 4);
        assert_eq!(total[0], "fd00::1".parse::<IpAddr>().unwrap());
        assert_eq!(total[3], "fd00::4".parse::<IpAddr>().unwrap());
    }
}
