// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kubeconfig assembly for service bindings.
//!
//! A binding kubeconfig reuses the cluster block of the runtime's admin
//! kubeconfig (server URL and CA bundle) but authenticates with a
//! short-lived service-account token instead of the admin credentials.

use crate::error::{BrokerError, Result};

/// Cluster coordinates lifted from an admin kubeconfig.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterInfo {
    /// Cluster display name.
    pub name: String,
    /// API server URL.
    pub server: String,
    /// Base64-encoded CA bundle; empty when the admin config carries none.
    pub certificate_authority_data: String,
}

/// Extract the first cluster block from an admin kubeconfig.
///
/// The admin kubeconfigs handed out by the control plane always carry
/// exactly one cluster; anything else is rejected as malformed.
pub fn cluster_info(admin_kubeconfig: &str) -> Result<ClusterInfo> {
    let mut name = None;
    let mut server = None;
    let mut ca_data = None;
    let mut in_clusters = false;
    for line in admin_kubeconfig.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("clusters:") {
            in_clusters = true;
            continue;
        }
        // Any other top-level key ends the clusters block.
        if !line.starts_with([' ', '-']) && !trimmed.is_empty() && in_clusters {
            in_clusters = false;
        }
        if !in_clusters {
            continue;
        }
        if let Some(value) = scalar(trimmed, "name:") {
            name.get_or_insert(value);
        } else if let Some(value) = scalar(trimmed, "server:") {
            server.get_or_insert(value);
        } else if let Some(value) = scalar(trimmed, "certificate-authority-data:") {
            ca_data.get_or_insert(value);
        }
    }
    match (name, server) {
        (Some(name), Some(server)) => Ok(ClusterInfo {
            name,
            server,
            certificate_authority_data: ca_data.unwrap_or_default(),
        }),
        _ => Err(BrokerError::Internal(
            "admin kubeconfig has no cluster block".to_string(),
        )),
    }
}

fn scalar(line: &str, key: &str) -> Option<String> {
    line.strip_prefix(key)
        .map(|rest| rest.trim().trim_matches('"').to_string())
}

/// Render a token-authenticated kubeconfig for the given cluster.
pub fn render(cluster: &ClusterInfo, token: &str) -> String {
    format!(
        r#"apiVersion: v1
kind: Config
current-context: {name}
clusters:
- name: {name}
  cluster:
    server: {server}
    certificate-authority-data: {ca}
contexts:
- name: {name}
  context:
    cluster: {name}
    user: {name}-token
users:
- name: {name}-token
  user:
    token: {token}
"#,
        name = cluster.name,
        server = cluster.server,
        ca = cluster.certificate_authority_data,
        token = token,
    )
}
