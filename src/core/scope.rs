// src/core/scope.rs

//! The request-scope grammar shared by snapshots, event streams, and manual
//! refresh: an optional `clusters=<id,id>|` prefix followed by a
//! domain-specific selector.

use crate::core::errors::KubedeckError;

/// Domains that address exactly one cluster by construction.
const SINGLE_CLUSTER_DOMAINS: [&str; 2] = ["catalog", "node-maintenance"];

/// Returns true when a domain must resolve to exactly one cluster.
pub fn domain_requires_single_cluster(domain: &str) -> bool {
    domain.starts_with("object-") || SINGLE_CLUSTER_DOMAINS.contains(&domain)
}

/// The selector part of a scope, after the optional cluster-list prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeSelector {
    /// Cluster-wide addressing (`cluster`).
    Cluster,
    /// A single namespace (`namespace:<ns>`).
    Namespace(String),
    /// A single object (`object:<kind>/<ns>/<name>`).
    Object {
        kind: String,
        namespace: String,
        name: String,
    },
    /// A domain-specific selector the core passes through untouched.
    Other(String),
}

impl ScopeSelector {
    /// The selector rendered back to its wire form.
    pub fn as_wire(&self) -> String {
        match self {
            ScopeSelector::Cluster => "cluster".to_string(),
            ScopeSelector::Namespace(ns) => format!("namespace:{ns}"),
            ScopeSelector::Object {
                kind,
                namespace,
                name,
            } => format!("object:{kind}/{namespace}/{name}"),
            ScopeSelector::Other(raw) => raw.clone(),
        }
    }

    /// Namespace filter implied by this selector, if any.
    pub fn namespace(&self) -> Option<&str> {
        match self {
            ScopeSelector::Namespace(ns) => Some(ns),
            ScopeSelector::Object { namespace, .. } => Some(namespace),
            _ => None,
        }
    }
}

/// A parsed request scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    /// Explicitly requested cluster ids. Empty means "unspecified": resolution
    /// falls back to the primary cluster or the full configured order,
    /// depending on the domain.
    pub clusters: Vec<String>,
    pub selector: ScopeSelector,
    pub raw: String,
}

impl Scope {
    /// Parses the scope grammar: `clusters=<id,id>|<rest>` | `<rest>`.
    pub fn parse(raw: &str) -> Result<Self, KubedeckError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(KubedeckError::InvalidScope("scope is empty".to_string()));
        }

        let (clusters, rest) = match trimmed.strip_prefix("clusters=") {
            Some(after) => {
                let Some((list, rest)) = after.split_once('|') else {
                    return Err(KubedeckError::InvalidScope(format!(
                        "cluster-list scope '{trimmed}' is missing the '|' separator"
                    )));
                };
                let clusters: Vec<String> = list
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
                if clusters.is_empty() {
                    return Err(KubedeckError::InvalidScope(format!(
                        "cluster-list scope '{trimmed}' names no clusters"
                    )));
                }
                (clusters, rest)
            }
            None => (Vec::new(), trimmed),
        };

        if rest.is_empty() {
            return Err(KubedeckError::InvalidScope(format!(
                "scope '{trimmed}' has an empty selector"
            )));
        }

        let selector = if rest == "cluster" {
            ScopeSelector::Cluster
        } else if let Some(ns) = rest.strip_prefix("namespace:") {
            if ns.is_empty() {
                return Err(KubedeckError::InvalidScope(format!(
                    "scope '{trimmed}' names an empty namespace"
                )));
            }
            ScopeSelector::Namespace(ns.to_string())
        } else if let Some(obj) = rest.strip_prefix("object:") {
            let mut parts = obj.splitn(3, '/');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(kind), Some(namespace), Some(name))
                    if !kind.is_empty() && !name.is_empty() =>
                {
                    ScopeSelector::Object {
                        kind: kind.to_string(),
                        namespace: namespace.to_string(),
                        name: name.to_string(),
                    }
                }
                _ => {
                    return Err(KubedeckError::InvalidScope(format!(
                        "object scope '{trimmed}' must be object:<kind>/<ns>/<name>"
                    )));
                }
            }
        } else {
            ScopeSelector::Other(rest.to_string())
        };

        Ok(Self {
            clusters,
            selector,
            raw: trimmed.to_string(),
        })
    }

    /// The scope as forwarded to one cluster's subsystem: the selector without
    /// the cluster-list prefix.
    pub fn per_cluster_scope(&self) -> String {
        self.selector.as_wire()
    }
}
