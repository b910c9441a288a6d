//! Deterministic names for operator-managed resources
//!
//! Names are pure functions of stable object identity so a pass that crashed
//! midway rediscovers what it created instead of creating it again.

use sha2::{Digest, Sha256};

/// Kubernetes object names are limited to 63 characters when used as labels
const MAX_NAME_LEN: usize = 63;

/// Pub/Sub subscription ids are limited to 255 characters
const MAX_SUBSCRIPTION_ID_LEN: usize = 255;

const SUBSCRIPTION_PREFIX: &str = "cre-ps";

fn short_hash(value: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(value.as_bytes()));
    digest[..8].to_string()
}

/// Cut `base` to fit `max` with a `{sep}{hash}` suffix appended
fn bounded(base: &str, max: usize, sep: char, hash: &str) -> String {
    let max_base = max - hash.len() - 1;
    let mut end = base.len().min(max_base);
    while !base.is_char_boundary(end) {
        end -= 1;
    }
    let base = base[..end].trim_end_matches(['-', '.', '_']);
    format!("{base}{sep}{hash}")
}

/// Pub/Sub subscription id for an object
///
/// `cre-ps_{namespace}_{name}_{uid}`. Ids over 255 characters are cut and
/// suffixed with a hash of the full id.
pub fn subscription_id(namespace: &str, name: &str, uid: &str) -> String {
    let id = format!("{SUBSCRIPTION_PREFIX}_{namespace}_{name}_{uid}");
    if id.len() <= MAX_SUBSCRIPTION_ID_LEN {
        return id;
    }
    bounded(&id, MAX_SUBSCRIPTION_ID_LEN, '_', &short_hash(&id))
}

/// Object name usable as a label value (63 characters max)
pub fn instance_label(name: &str) -> String {
    if name.len() <= MAX_NAME_LEN {
        return name.to_string();
    }
    bounded(name, MAX_NAME_LEN, '-', &short_hash(name))
}

/// Receive adapter workload name for an object and its subscription
///
/// `cre-ps-{name}-{hash}` where the hash is the first 8 hex chars of
/// sha256(subscription id). Long names are cut before the hash.
pub fn workload_name(name: &str, subscription_id: &str) -> String {
    bounded(
        &format!("{SUBSCRIPTION_PREFIX}-{name}"),
        MAX_NAME_LEN,
        '-',
        &short_hash(subscription_id),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_id() {
        assert_eq!(
            subscription_id("default", "orders", "a1b2-c3"),
            "cre-ps_default_orders_a1b2-c3"
        );
    }

    #[test]
    fn test_long_subscription_id_is_bounded() {
        let namespace = "n".repeat(63);
        let name = "m".repeat(253);
        let uid = "0f1e2d3c-4b5a-6978-8796-a5b4c3d2e1f0";

        let id = subscription_id(&namespace, &name, uid);
        assert_eq!(id.len(), 255);
        assert!(id.starts_with("cre-ps_nnn"));
        assert_eq!(id, subscription_id(&namespace, &name, uid));
        assert_ne!(id, subscription_id(&namespace, &name, "other-uid"));
    }

    #[test]
    fn test_instance_label() {
        assert_eq!(instance_label("my-ps"), "my-ps");

        let long = "x".repeat(253);
        let label = instance_label(&long);
        assert_eq!(label.len(), 63);
        assert_eq!(label, instance_label(&long));
        assert_ne!(label, instance_label(&"y".repeat(253)));
    }

    #[test]
    fn test_workload_name_is_stable() {
        let id = subscription_id("default", "orders", "uid-1");
        let first = workload_name("orders", &id);
        let second = workload_name("orders", &id);

        assert_eq!(first, second);
        assert!(first.starts_with("cre-ps-orders-"));
        assert_eq!(first.len(), "cre-ps-orders-".len() + 8);
    }

    #[test]
    fn test_workload_name_depends_on_subscription() {
        let a = workload_name("orders", "cre-ps_default_orders_uid-1");
        let b = workload_name("orders", "cre-ps_default_orders_uid-2");
        assert_ne!(a, b);
    }

    #[test]
    fn test_long_workload_name_is_truncated() {
        let name = "a".repeat(80);
        let workload = workload_name(&name, "sub");

        assert_eq!(workload.len(), 63);
        let hash = &format!("{:x}", Sha256::digest(b"sub"))[..8];
        assert!(workload.ends_with(hash));
    }

    #[test]
    fn test_truncation_does_not_leave_dangling_dash() {
        // "cre-ps-" + 46 chars + "-x..." puts a dash right at the cut
        let name = format!("{}-{}", "b".repeat(46), "c".repeat(20));
        let workload = workload_name(&name, "sub");
        assert!(!workload.contains("--"));
    }
}
