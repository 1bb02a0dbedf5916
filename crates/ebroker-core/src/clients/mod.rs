// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Clients for the systems the broker drives.
//!
//! Every external surface is a trait so steps and managers can be exercised
//! against in-memory fakes. The EDP client is the only one speaking HTTP
//! directly from this crate; the others wrap control-plane APIs whose real
//! transports live outside this process.

pub mod controlplane;
pub mod edp;
pub mod gardener;
pub mod provisioner;
pub mod runtime_cluster;

pub use self::controlplane::{
    ControlPlaneClient, FakeControlPlane, KymaResource, RuntimeResource, RuntimeStatus,
};
pub use self::edp::{EdpApi, EdpClient, FakeEdp};
pub use self::gardener::{FakeGardener, GardenerClient, SecretBinding, Shoot};
pub use self::provisioner::{
    FakeProvisioner, ProvisionerClient, ProvisionerOperationStatus, ShootUpgradeParameters,
};
pub use self::runtime_cluster::{ClusterAccess, FakeRuntimeCluster, RuntimeClusterClient};
