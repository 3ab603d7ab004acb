// src/core/selection.rs

//! Parsing of kubeconfig selections and derivation of stable cluster identity.

use crate::core::errors::KubedeckError;
use serde::{Deserialize, Serialize};

/// One entry of the selection list the UI wants active, parsed from a raw
/// `"path:context"` string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSelection {
    /// Absolute path to the kubeconfig file. Required.
    pub path: String,
    /// The kubeconfig context to use. `None` selects the file's current context.
    pub context: Option<String>,
    /// The raw string this selection was parsed from.
    pub raw: String,
}

impl ClusterSelection {
    /// Parses a `"path:context"` selection string.
    ///
    /// The splitter is Windows-drive-letter aware: in `C:\Users\k\config:prod`
    /// the first colon belongs to the drive specifier and is not a separator.
    pub fn parse(raw: &str) -> Result<Self, KubedeckError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(KubedeckError::InvalidSelection(
                "selection string is empty".to_string(),
            ));
        }

        let search_from = drive_letter_prefix_len(trimmed);
        let (path, context) = match trimmed[search_from..].find(':') {
            Some(rel) => {
                let idx = search_from + rel;
                let path = &trimmed[..idx];
                let ctx = &trimmed[idx + 1..];
                (path, (!ctx.is_empty()).then(|| ctx.to_string()))
            }
            None => (trimmed, None),
        };

        if path.is_empty() {
            return Err(KubedeckError::InvalidSelection(format!(
                "selection '{trimmed}' has no kubeconfig path"
            )));
        }

        Ok(Self {
            path: path.to_string(),
            context,
            raw: trimmed.to_string(),
        })
    }

    /// The stable per-cluster key for all runtime maps.
    pub fn cluster_id(&self) -> String {
        cluster_id(&self.path, self.context.as_deref())
    }
}

/// Length of a leading Windows drive specifier (`C:`), or 0 when there is none.
/// Only a single ASCII letter followed by a colon and a path separator (or end
/// of string) counts; anything else is treated as a regular path.
fn drive_letter_prefix_len(s: &str) -> usize {
    let bytes = s.as_bytes();
    if bytes.len() >= 2
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes.len() == 2 || bytes[2] == b'\\' || bytes[2] == b'/')
    {
        2
    } else {
        0
    }
}

/// Final path component, handling both Unix and Windows separators.
fn base_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// Derives the stable cluster id: `baseName(path) + ":" + context` when a
/// context is present, the base name alone otherwise.
pub fn cluster_id(path: &str, context: Option<&str>) -> String {
    match context {
        Some(ctx) if !ctx.is_empty() => format!("{}:{ctx}", base_name(path)),
        _ => base_name(path).to_string(),
    }
}

/// Stable identity and display name for one live cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMeta {
    pub id: String,
    pub name: String,
}

impl ClusterMeta {
    pub fn from_selection(selection: &ClusterSelection) -> Self {
        let id = selection.cluster_id();
        let name = selection
            .context
            .clone()
            .unwrap_or_else(|| base_name(&selection.path).to_string());
        Self { id, name }
    }
}

/// Parses a full selection list, rejecting duplicates of the same cluster id.
pub fn parse_selection_list(raw: &[String]) -> Result<Vec<ClusterSelection>, KubedeckError> {
    let mut out = Vec::with_capacity(raw.len());
    let mut seen = std::collections::HashSet::new();
    for entry in raw {
        let selection = ClusterSelection::parse(entry)?;
        if !seen.insert(selection.cluster_id()) {
            return Err(KubedeckError::InvalidSelection(format!(
                "duplicate cluster id '{}' in selection",
                selection.cluster_id()
            )));
        }
        out.push(selection);
    }
    Ok(out)
}
