//! Workload identity (wlid) strings.
//!
//! A wlid names a workload *kind* in a cluster, not a pod instance:
//! `wlid://cluster-<cluster>/namespace-<ns>/<kind>-<name>`. Wildcard wlids
//! truncate the path after the cluster or namespace segment and address every
//! workload underneath.

use crate::error::{OperatorError, Result};

const WLID_PREFIX: &str = "wlid://";
const CLUSTER_SEGMENT: &str = "cluster-";
const NAMESPACE_SEGMENT: &str = "namespace-";

/// Builds a wlid for a workload.
pub fn build_wlid(cluster: &str, namespace: &str, kind: &str, name: &str) -> String {
    format!(
        "{}{}{}/{}{}/{}-{}",
        WLID_PREFIX,
        CLUSTER_SEGMENT,
        cluster,
        NAMESPACE_SEGMENT,
        namespace,
        kind.to_lowercase(),
        name
    )
}

/// Builds a wildcard wlid addressing all workloads of a cluster, or of one
/// namespace when `namespace` is non-empty.
pub fn build_wild_wlid(cluster: &str, namespace: &str) -> String {
    if namespace.is_empty() {
        format!("{}{}{}/", WLID_PREFIX, CLUSTER_SEGMENT, cluster)
    } else {
        format!(
            "{}{}{}/{}{}/",
            WLID_PREFIX, CLUSTER_SEGMENT, cluster, NAMESPACE_SEGMENT, namespace
        )
    }
}

/// Returns true if `id` looks like a wlid (wildcard or fully qualified).
pub fn is_wlid(id: &str) -> bool {
    id.starts_with(WLID_PREFIX)
}

/// Validates a fully qualified wlid: all three segments present and non-empty.
pub fn validate_wlid(wlid: &str) -> Result<()> {
    let (_, namespace, kind, name) = split_wlid(wlid)?;
    if namespace.is_empty() || kind.is_empty() || name.is_empty() {
        return Err(OperatorError::InvalidCommand(format!(
            "incomplete wlid: '{}'",
            wlid
        )));
    }
    Ok(())
}

/// Extracts the namespace segment of a wlid or wildcard wlid. Empty when the
/// wlid stops at the cluster segment.
pub fn namespace_of(wlid: &str) -> String {
    segments(wlid)
        .nth(1)
        .and_then(|s| s.strip_prefix(NAMESPACE_SEGMENT))
        .unwrap_or_default()
        .to_string()
}

/// Extracts the cluster segment of a wlid.
pub fn cluster_of(wlid: &str) -> String {
    segments(wlid)
        .next()
        .and_then(|s| s.strip_prefix(CLUSTER_SEGMENT))
        .unwrap_or_default()
        .to_string()
}

/// Extracts `(kind, name)` from a fully qualified wlid.
pub fn kind_and_name_of(wlid: &str) -> Result<(String, String)> {
    let (_, _, kind, name) = split_wlid(wlid)?;
    Ok((kind, name))
}

fn segments(wlid: &str) -> impl Iterator<Item = &str> {
    wlid.strip_prefix(WLID_PREFIX)
        .unwrap_or("")
        .split('/')
        .filter(|s| !s.is_empty())
}

fn split_wlid(wlid: &str) -> Result<(String, String, String, String)> {
    if !is_wlid(wlid) {
        return Err(OperatorError::InvalidCommand(format!(
            "not a wlid: '{}'",
            wlid
        )));
    }
    let cluster = cluster_of(wlid);
    let namespace = namespace_of(wlid);
    let workload = segments(wlid).nth(2).unwrap_or_default();
    let (kind, name) = workload.split_once('-').unwrap_or((workload, ""));
    Ok((
        cluster,
        namespace,
        kind.to_string(),
        name.to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_and_split() {
        let wlid = build_wlid("prod", "web", "Deployment", "frontend");
        assert_eq!(wlid, "wlid://cluster-prod/namespace-web/deployment-frontend");
        assert!(is_wlid(&wlid));
        assert!(validate_wlid(&wlid).is_ok());
        assert_eq!(cluster_of(&wlid), "prod");
        assert_eq!(namespace_of(&wlid), "web");
        let (kind, name) = kind_and_name_of(&wlid).unwrap();
        assert_eq!(kind, "deployment");
        assert_eq!(name, "frontend");
    }

    #[test]
    fn test_wild_wlid() {
        assert_eq!(build_wild_wlid("prod", ""), "wlid://cluster-prod/");
        assert_eq!(
            build_wild_wlid("prod", "web"),
            "wlid://cluster-prod/namespace-web/"
        );
        assert_eq!(namespace_of("wlid://cluster-prod/namespace-web/"), "web");
        assert_eq!(namespace_of("wlid://cluster-prod/"), "");
    }

    #[test]
    fn test_validate_rejects_incomplete() {
        assert!(validate_wlid("wlid://cluster-prod/").is_err());
        assert!(validate_wlid("wlid://cluster-prod/namespace-web/").is_err());
        assert!(validate_wlid("deployment-frontend").is_err());
    }

    #[test]
    fn test_name_with_dashes_survives() {
        let wlid = build_wlid("c", "ns", "StatefulSet", "my-db-0");
        let (kind, name) = kind_and_name_of(&wlid).unwrap();
        assert_eq!(kind, "statefulset");
        assert_eq!(name, "my-db-0");
    }
}
