//! Kindling - bootstrap orchestration and readiness verification for kubeadm clusters
//!
//! Kindling drives a set of freshly provisioned virtual machines from "powered on,
//! unconfigured" to "joined into a working multi-node cluster with required add-ons
//! installed," verifying each transition before proceeding.
//!
//! # Architecture
//!
//! The run is a pipeline of stage descriptors executed by one generic runner:
//! - Provision: apply infrastructure and re-apply until every reported address is
//!   a usable IPv4 address (the provider intermittently reports a wrong-family
//!   address on first creation)
//! - Bootstrap: initialize the control plane on node 0, then join the remaining
//!   nodes in index order using the minted join material
//! - Poll: take fresh cluster snapshots until a readiness predicate holds or the
//!   retry budget is exhausted
//! - Install: install a chart release into the now-ready cluster
//!
//! All external collaborators (terraform, ssh, kubectl, helm, packer) are driven
//! through narrow trait interfaces with CLI-backed implementations.
//!
//! # Modules
//!
//! - [`sshkey`] - Per-run Ed25519 SSH credential generation
//! - [`image`] - Packer image build and manifest lookup
//! - [`provision`] - Infrastructure provisioning with re-apply-until-valid retry
//! - [`remote`] - Remote command execution and file retrieval over SSH
//! - [`sequencer`] - Cluster bootstrap state machine (init, token, joins)
//! - [`readiness`] - Poll-until-predicate primitive over cluster snapshots
//! - [`kube`] - kubectl-backed cluster snapshot view
//! - [`install`] - Helm chart installation
//! - [`pipeline`] - Stage descriptors and the generic run driver
//! - [`retry`] - Bounded fixed-interval retry policy
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod error;
pub mod image;
pub mod install;
pub mod kube;
pub mod pipeline;
pub mod provision;
pub mod readiness;
pub mod remote;
pub mod retry;
pub mod sequencer;
pub mod sshkey;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================
// Centralized so CLI defaults, stage lists, and test fixtures stay consistent.

/// Namespace holding the control plane's own static pods
pub const SYSTEM_NAMESPACE: &str = "kube-system";

/// Well-known remote path of the cluster admin credential, readable only by root
pub const ADMIN_KUBECONFIG_PATH: &str = "/etc/kubernetes/admin.conf";

/// kubectl context written by kubeadm into the admin kubeconfig
pub const DEFAULT_KUBE_CONTEXT: &str = "kubernetes-admin@kubernetes";

/// Pod network CIDR passed to kubeadm init
pub const POD_NETWORK_CIDR: &str = "10.243.0.0/16";

/// Name prefix of the cluster DNS add-on pods
///
/// These pods stay Pending until a network plugin is installed, so readiness
/// checks that run before the CNI install must be able to exclude them.
pub const DNS_ADDON_PREFIX: &str = "coredns";

/// Terraform output key listing the provisioned node addresses
pub const ADDRESSES_OUTPUT_KEY: &str = "ips";
