// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hyperscaler credential pool.
//!
//! Credentials are gardener secret bindings labeled with a hyperscaler type
//! key. Dedicated bindings are claimed per tenant; shared bindings are
//! multiplexed across tenants by least-use. Selection never serializes
//! globally: concurrent claims converge through optimistic retries on the
//! binding's resource version.

pub mod pool;

pub use self::pool::{AccountPool, AccountProvider, SharedPool};

use crate::plans::CloudProvider;

/// Pool selection key. Openstack pools are per region; the other providers
/// pool globally.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HyperscalerType {
    key: String,
}

impl HyperscalerType {
    /// Key for a provider, with the region folded in where the pool is
    /// region-scoped.
    pub fn new(provider: CloudProvider, region: &str) -> Self {
        let key = match provider {
            CloudProvider::SapConvergedCloud => format!("openstack_{region}"),
            CloudProvider::Aws => "aws".to_string(),
            CloudProvider::Gcp => "gcp".to_string(),
            CloudProvider::Azure => "azure".to_string(),
            // Own-cluster plans skip credential resolution; the key is never
            // matched against a pool.
            CloudProvider::Unknown => "unknown".to_string(),
        };
        Self { key }
    }

    /// The label value carried by matching secret bindings.
    pub fn key(&self) -> &str {
        &self.key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openstack_key_is_region_scoped() {
        let ht = HyperscalerType::new(CloudProvider::SapConvergedCloud, "eu-de-1");
        assert_eq!(ht.key(), "openstack_eu-de-1");
        let aws = HyperscalerType::new(CloudProvider::Aws, "eu-central-1");
        assert_eq!(aws.key(), "aws");
    }
}
