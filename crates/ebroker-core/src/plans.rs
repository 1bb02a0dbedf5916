// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Service plan catalog and landscape policy.
//!
//! Plans are a fixed table loaded at startup; changes require a restart.
//! The EU-access policy restricts which platform regions force EU-resident
//! credentials and which global accounts may provision there at all.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::error::{BrokerError, Result};

/// Plan id of the `gcp` plan.
pub const GCP_PLAN_ID: &str = "ca6e5357-707f-4565-bbbd-b3ab732597c6";
/// Plan id of the `aws` plan.
pub const AWS_PLAN_ID: &str = "361c511f-f939-4621-b228-d0fb79a1fe15";
/// Plan id of the `azure` plan.
pub const AZURE_PLAN_ID: &str = "4deee563-e5ec-4731-b9b1-53b42d855f0c";
/// Plan id of the `azure_lite` plan.
pub const AZURE_LITE_PLAN_ID: &str = "8cb22518-aa26-44c5-91a0-e669ec9bf443";
/// Plan id of the `trial` plan.
pub const TRIAL_PLAN_ID: &str = "7d55d31d-35ae-4438-bf13-6ffdfa107d9f";
/// Plan id of the `sap-converged-cloud` plan.
pub const SAP_CONVERGED_CLOUD_PLAN_ID: &str = "03b812ac-c991-4528-b5bd-08b303523a63";
/// Plan id of the `free` plan.
pub const FREEMIUM_PLAN_ID: &str = "b1a5764e-2ea1-4f95-94c0-2b4538b37b55";
/// Plan id of the `own_cluster` plan.
pub const OWN_CLUSTER_PLAN_ID: &str = "03e3cb66-a4c6-4c6a-b4b0-5d42224debea";
/// Plan id of the `preview` plan.
pub const PREVIEW_PLAN_ID: &str = "5cb3d976-b85c-42ea-a636-79cadda109a9";

/// OSB service offering id for the managed Kyma runtime.
pub const KYMA_SERVICE_ID: &str = "47c9dcbf-ff30-448e-ab36-d3bad66ba281";

/// Cloud provider backing a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CloudProvider {
    /// Amazon Web Services.
    Aws,
    /// Microsoft Azure.
    Azure,
    /// Google Cloud Platform.
    Gcp,
    /// SapConvergedCloud (openstack).
    SapConvergedCloud,
    /// None; the tenant brings their own cluster.
    Unknown,
}

impl CloudProvider {
    /// Provider label value used on Kyma resources.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Aws => "AWS",
            Self::Azure => "Azure",
            Self::Gcp => "GCP",
            Self::SapConvergedCloud => "SapConvergedCloud",
            Self::Unknown => "unknown",
        }
    }
}

/// One entry of the static plan table.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    /// Plan GUID.
    pub id: &'static str,
    /// Plan name as exposed in the catalog.
    pub name: &'static str,
    /// Backing cloud provider.
    pub provider: CloudProvider,
    /// Whether bindings may be created against instances of this plan.
    pub bindable: bool,
    /// Whether the expiration service may expire instances of this plan.
    pub expirable: bool,
    /// Whether the cluster is owned by the tenant (no provisioner involved).
    pub own_cluster: bool,
    /// Whether credentials come from the shared pool instead of dedicated.
    pub shared_credentials: bool,
}

/// The fixed plan table.
pub const PLANS: &[Plan] = &[
    Plan {
        id: AWS_PLAN_ID,
        name: "aws",
        provider: CloudProvider::Aws,
        bindable: true,
        expirable: false,
        own_cluster: false,
        shared_credentials: false,
    },
    Plan {
        id: GCP_PLAN_ID,
        name: "gcp",
        provider: CloudProvider::Gcp,
        bindable: true,
        expirable: false,
        own_cluster: false,
        shared_credentials: false,
    },
    Plan {
        id: AZURE_PLAN_ID,
        name: "azure",
        provider: CloudProvider::Azure,
        bindable: true,
        expirable: false,
        own_cluster: false,
        shared_credentials: false,
    },
    Plan {
        id: AZURE_LITE_PLAN_ID,
        name: "azure_lite",
        provider: CloudProvider::Azure,
        bindable: true,
        expirable: false,
        own_cluster: false,
        shared_credentials: false,
    },
    Plan {
        id: TRIAL_PLAN_ID,
        name: "trial",
        provider: CloudProvider::Aws,
        bindable: true,
        expirable: true,
        own_cluster: false,
        shared_credentials: true,
    },
    Plan {
        id: FREEMIUM_PLAN_ID,
        name: "free",
        provider: CloudProvider::Aws,
        bindable: true,
        expirable: true,
        own_cluster: false,
        shared_credentials: false,
    },
    Plan {
        id: SAP_CONVERGED_CLOUD_PLAN_ID,
        name: "sap-converged-cloud",
        provider: CloudProvider::SapConvergedCloud,
        bindable: true,
        expirable: false,
        own_cluster: false,
        shared_credentials: true,
    },
    Plan {
        id: OWN_CLUSTER_PLAN_ID,
        name: "own_cluster",
        provider: CloudProvider::Unknown,
        bindable: true,
        expirable: false,
        own_cluster: true,
        shared_credentials: false,
    },
    Plan {
        id: PREVIEW_PLAN_ID,
        name: "preview",
        provider: CloudProvider::Aws,
        bindable: true,
        expirable: false,
        own_cluster: false,
        shared_credentials: false,
    },
];

/// Look up a plan by id.
pub fn plan_by_id(plan_id: &str) -> Result<&'static Plan> {
    PLANS
        .iter()
        .find(|p| p.id == plan_id)
        .ok_or_else(|| BrokerError::Validation {
            field: "plan_id".to_string(),
            message: format!("unknown plan {}", plan_id),
        })
}

/// Look up a plan by its catalog name.
pub fn plan_by_name(name: &str) -> Option<&'static Plan> {
    PLANS.iter().find(|p| p.name == name)
}

/// Whether the plan is the trial plan.
pub fn is_trial_plan(plan_id: &str) -> bool {
    plan_id == TRIAL_PLAN_ID
}

/// Whether the plan is the own-cluster plan (no provisioner involvement).
pub fn is_own_cluster_plan(plan_id: &str) -> bool {
    plan_id == OWN_CLUSTER_PLAN_ID
}

/// Whether the expiration service applies to the plan.
pub fn is_expirable_plan(plan_id: &str) -> bool {
    plan_by_id(plan_id).map(|p| p.expirable).unwrap_or(false)
}

/// Platform regions whose tenants must draw EU-resident credentials.
const EU_ACCESS_PLATFORM_REGIONS: &[&str] = &["cf-eu11", "cf-ch20"];

/// Whether the platform region forces EU-access credential selection.
pub fn is_eu_restricted_access(platform_region: &str) -> bool {
    EU_ACCESS_PLATFORM_REGIONS.contains(&platform_region)
}

/// Landscape policy applied before any operation is stored.
#[derive(Debug, Clone, Default)]
pub struct PlansPolicy {
    /// Global accounts allowed to provision under EU-restricted regions.
    pub eu_access_whitelist: HashSet<String>,
    /// Trial platform-region to provider-region mapping.
    pub trial_region_mapping: HashMap<String, String>,
    /// Converged-cloud platform-region to provider-regions mapping; the
    /// `sap-converged-cloud` plan is offered only where this maps.
    pub converged_cloud_region_mapping: HashMap<String, Vec<String>>,
}

impl PlansPolicy {
    /// Parse the whitelist from its YAML-shaped file content.
    ///
    /// The format is a single `whitelist:` key with a list of global account
    /// ids; a line-based parse is enough and avoids a YAML dependency.
    pub fn load_whitelist(&mut self, content: &str) {
        let mut in_list = false;
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.starts_with("whitelist:") {
                in_list = true;
                continue;
            }
            if in_list {
                if let Some(entry) = trimmed.strip_prefix("- ") {
                    self.eu_access_whitelist
                        .insert(entry.trim_matches('"').to_string());
                } else if !trimmed.is_empty() {
                    in_list = false;
                }
            }
        }
    }

    /// Parse the trial region mapping from `platform-region: provider-region` lines.
    pub fn load_trial_region_mapping(&mut self, content: &str) {
        for line in content.lines() {
            if let Some((from, to)) = line.split_once(':') {
                let (from, to) = (from.trim(), to.trim());
                if !from.is_empty() && !to.is_empty() {
                    self.trial_region_mapping
                        .insert(from.to_string(), to.to_string());
                }
            }
        }
    }

    /// Reject a provisioning request that violates EU-access policy.
    ///
    /// Under an EU-restricted platform region, the global account must be
    /// whitelisted and the requested provider region must not point outside
    /// the EU cluster set. Enforced before any operation row is stored.
    pub fn validate_eu_access(
        &self,
        platform_region: &str,
        global_account_id: &str,
        requested_region: Option<&str>,
    ) -> Result<()> {
        if !is_eu_restricted_access(platform_region) {
            return Ok(());
        }
        if !self.eu_access_whitelist.contains(global_account_id) {
            return Err(BrokerError::Validation {
                field: "global_account_id".to_string(),
                message: format!(
                    "global account {} is not whitelisted for EU access region {}",
                    global_account_id, platform_region
                ),
            });
        }
        if let Some(region) = requested_region {
            if !region.starts_with("eu-") && !region.starts_with("europe-") {
                return Err(BrokerError::Validation {
                    field: "region".to_string(),
                    message: format!(
                        "region {} is not allowed under EU access region {}",
                        region, platform_region
                    ),
                });
            }
        }
        Ok(())
    }

    /// Parse the converged-cloud mapping from `platform-region: r1 r2 ...` lines.
    pub fn load_converged_cloud_region_mapping(&mut self, content: &str) {
        for line in content.lines() {
            if let Some((from, to)) = line.split_once(':') {
                let regions: Vec<String> =
                    to.split_whitespace().map(str::to_string).collect();
                if !from.trim().is_empty() && !regions.is_empty() {
                    self.converged_cloud_region_mapping
                        .insert(from.trim().to_string(), regions);
                }
            }
        }
    }

    /// Provider regions the converged-cloud plan offers under the platform region.
    pub fn converged_cloud_regions(&self, platform_region: &str) -> &[String] {
        self.converged_cloud_region_mapping
            .get(platform_region)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Provider region used for a trial instance under the given platform region.
    pub fn trial_provider_region(&self, platform_region: &str) -> String {
        self.trial_region_mapping
            .get(platform_region)
            .cloned()
            .unwrap_or_else(|| "eu-central-1".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_lookup() {
        assert_eq!(plan_by_id(AWS_PLAN_ID).unwrap().name, "aws");
        assert!(plan_by_id("nope").is_err());
        assert!(is_trial_plan(TRIAL_PLAN_ID));
        assert!(is_expirable_plan(FREEMIUM_PLAN_ID));
        assert!(!is_expirable_plan(AWS_PLAN_ID));
        assert!(is_own_cluster_plan(OWN_CLUSTER_PLAN_ID));
    }

    #[test]
    fn test_eu_restricted_regions() {
        assert!(is_eu_restricted_access("cf-eu11"));
        assert!(is_eu_restricted_access("cf-ch20"));
        assert!(!is_eu_restricted_access("cf-eu10"));
    }

    #[test]
    fn test_whitelist_parsing() {
        let mut policy = PlansPolicy::default();
        policy.load_whitelist("whitelist:\n  - whitelisted-global-account-id\n  - \"another\"\n");
        assert!(
            policy
                .eu_access_whitelist
                .contains("whitelisted-global-account-id")
        );
        assert!(policy.eu_access_whitelist.contains("another"));
        assert_eq!(policy.eu_access_whitelist.len(), 2);
    }

    #[test]
    fn test_eu_access_validation() {
        let mut policy = PlansPolicy::default();
        policy.load_whitelist("whitelist:\n  - ga-ok\n");

        // unrestricted region: anything goes
        policy
            .validate_eu_access("cf-eu10", "ga-other", Some("us-west-1"))
            .unwrap();

        // restricted region, whitelisted account, EU region
        policy
            .validate_eu_access("cf-eu11", "ga-ok", Some("eu-central-1"))
            .unwrap();

        // restricted region, non-whitelisted account
        let err = policy
            .validate_eu_access("cf-eu11", "ga-other", Some("us-west-1"))
            .unwrap_err();
        assert!(matches!(err, BrokerError::Validation { .. }));

        // restricted region, whitelisted account, non-EU region
        let err = policy
            .validate_eu_access("cf-eu11", "ga-ok", Some("us-west-1"))
            .unwrap_err();
        assert!(matches!(err, BrokerError::Validation { .. }));
    }

    #[test]
    fn test_converged_cloud_region_mapping() {
        let mut policy = PlansPolicy::default();
        policy.load_converged_cloud_region_mapping("cf-eu20: eu-de-1 eu-de-2\n");
        assert_eq!(
            policy.converged_cloud_regions("cf-eu20"),
            &["eu-de-1".to_string(), "eu-de-2".to_string()]
        );
        assert!(policy.converged_cloud_regions("cf-eu10").is_empty());
    }

    #[test]
    fn test_trial_region_mapping() {
        let mut policy = PlansPolicy::default();
        policy.load_trial_region_mapping("cf-eu11: eu-central-1\ncf-us10: us-east-1\n");
        assert_eq!(policy.trial_provider_region("cf-eu11"), "eu-central-1");
        assert_eq!(policy.trial_provider_region("cf-us10"), "us-east-1");
        // unmapped falls back to the default trial region
        assert_eq!(policy.trial_provider_region("cf-ap21"), "eu-central-1");
    }
}
