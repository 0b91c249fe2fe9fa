use sha2::{Digest, Sha256};
use spiderpool_core::types::{IpVersion, OwnerKind};

/// The application a pod belongs to, identified by its owning controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppRef {
    pub kind: OwnerKind,
    pub namespace: String,
    pub name: String,
}

impl AppRef {
    pub fn new(kind: OwnerKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// The label value stamped on auto-pools: `<kind>_<namespace>_<name>`
    pub fn label_value(&self) -> String {
        format!("{}_{}_{}", self.kind.as_str(), self.namespace, self.name)
    }
}

/// Deterministic auto-pool name: one pool per (application, family).
///
/// `auto-<kind>-<namespace>-<name>-v<family>-<hash8>`. The hash suffix
/// keeps the name within resource-name limits when the application name is
/// long, while staying stable across restarts.
pub fn auto_pool_name(app: &AppRef, version: IpVersion) -> String {
    let identity = format!(
        "{}/{}/{}/v{}",
        app.kind.as_str(),
        app.namespace,
        app.name,
        version.as_number()
    );
    let digest = Sha256::digest(identity.as_bytes());
    let hash: String = digest[..4].iter().map(|b| format!("{:02x}", b)).collect();

    let name = format!(
        "auto-{}-{}-{}-v{}-{}",
        app.kind.as_str().to_lowercase(),
        app.namespace,
        app.name,
        version.as_number(),
        hash
    );
    // keep within the DNS-1123 length limit, preserving the unique suffix
    if name.len() > 253 {
        let keep = 253 - 1 - hash.len();
        format!("{}-{}", &name[..keep], hash)
    } else {
        name
    }
}
