//! Infrastructure provisioning with re-apply-until-valid retry.
//!
//! The underlying provider intermittently reports a malformed or wrong-family
//! address immediately after creating a machine. The documented workaround is
//! to re-run apply, and a partially valid set would break the ordering
//! convention (index 0 must be a real, reachable control-plane candidate), so
//! validation is whole-set: one bad address fails the attempt and the entire
//! apply is repeated.
//!
//! The re-apply loop is a named policy ([`reapply_until`]) parameterized by
//! the validation predicate, keeping the predicate swappable if the address
//! family requirements ever change.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::process::Command;
use tracing::{info, warn};

use crate::retry::RetryPolicy;
use crate::{Error, Result, ADDRESSES_OUTPUT_KEY};

/// One provisioned machine
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    /// Position in the node set; index 0 is the control-plane node
    pub index: usize,
    /// Validated IPv4 address reported by the provisioner
    pub address: Ipv4Addr,
    /// Login user for the remote channel
    pub ssh_user: String,
}

impl Node {
    /// The `user@host` target string for the remote channel
    pub fn ssh_target(&self) -> String {
        format!("{}@{}", self.ssh_user, self.address)
    }
}

/// Ordered, index-stable set of provisioned nodes.
///
/// Produced once per run by [`acquire`] and read-only thereafter. Index 0 is
/// the control-plane node by convention; all others are workers.
#[derive(Clone, Debug)]
pub struct NodeSet(Vec<Node>);

impl NodeSet {
    /// Number of nodes in the set
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate nodes in index order
    pub fn iter(&self) -> std::slice::Iter<'_, Node> {
        self.0.iter()
    }

    /// The control-plane node (index 0), if the set is non-empty
    pub fn control_plane(&self) -> Option<&Node> {
        self.0.first()
    }

    /// The worker nodes (index 1..N) in index order
    pub fn workers(&self) -> impl Iterator<Item = &Node> {
        self.0.iter().skip(1)
    }
}

/// Input variables handed to the provisioner for one run
#[derive(Clone, Debug)]
pub struct ProvisionVars {
    /// Path of the disk image the machines boot from
    pub image: String,
    /// authorized_keys lines granting the run access to the machines
    pub authorized_keys: Vec<String>,
    /// How many machines to create
    pub node_count: usize,
}

impl ProvisionVars {
    fn to_var_args(&self) -> Result<Vec<String>> {
        let keys_json = serde_json::to_string(&self.authorized_keys)
            .map_err(|e| Error::provisioning(format!("failed to encode authorized_keys: {}", e)))?;
        Ok(vec![
            "-var".to_string(),
            format!("image={}", self.image),
            "-var".to_string(),
            format!("authorized_keys={}", keys_json),
            "-var".to_string(),
            format!("node_count={}", self.node_count),
        ])
    }
}

/// Trait for the declarative infrastructure provisioner
///
/// Abstracts the terraform CLI for testability. One implementation is bound
/// to one working directory and one var set for its whole lifetime, so apply
/// and destroy stay symmetric.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Apply the declared infrastructure
    async fn apply(&self) -> Result<()>;

    /// Read a declared list output
    async fn output_list(&self, key: &str) -> Result<Vec<String>>;

    /// Tear the infrastructure down
    async fn destroy(&self) -> Result<()>;
}

/// Provisioner that shells out to the terraform CLI
pub struct TerraformCli {
    dir: PathBuf,
    vars: ProvisionVars,
}

impl TerraformCli {
    /// Create a provisioner bound to a terraform directory and var set
    pub fn new(dir: impl Into<PathBuf>, vars: ProvisionVars) -> Self {
        Self {
            dir: dir.into(),
            vars,
        }
    }

    async fn terraform(&self, args: &[String]) -> Result<std::process::Output> {
        let output = Command::new("terraform")
            .arg(format!("-chdir={}", self.dir.display()))
            .args(args)
            .output()
            .await
            .map_err(|e| Error::provisioning(format!("failed to run terraform: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::provisioning(format!(
                "terraform {} failed: {}",
                args.first().map(String::as_str).unwrap_or(""),
                stderr.trim()
            )));
        }

        Ok(output)
    }
}

#[async_trait]
impl Provisioner for TerraformCli {
    async fn apply(&self) -> Result<()> {
        self.terraform(&["init".to_string(), "-input=false".to_string()])
            .await?;

        let mut args = vec![
            "apply".to_string(),
            "-auto-approve".to_string(),
            "-input=false".to_string(),
        ];
        args.extend(self.vars.to_var_args()?);

        info!(dir = %self.dir.display(), "Applying infrastructure");
        self.terraform(&args).await?;
        Ok(())
    }

    async fn output_list(&self, key: &str) -> Result<Vec<String>> {
        let output = self
            .terraform(&["output".to_string(), "-json".to_string(), key.to_string()])
            .await?;

        serde_json::from_slice(&output.stdout).map_err(|e| {
            Error::provisioning(format!("output {} is not a string list: {}", key, e))
        })
    }

    async fn destroy(&self) -> Result<()> {
        let mut args = vec!["destroy".to_string(), "-auto-approve".to_string()];
        args.extend(self.vars.to_var_args()?);

        info!(dir = %self.dir.display(), "Destroying infrastructure");
        self.terraform(&args).await?;
        Ok(())
    }
}

/// Re-apply until the named list output satisfies `validate`.
///
/// Apply failures are fatal immediately; only validation failures re-apply.
/// On exhaustion the final validation failure is reported along with the
/// attempt count.
pub async fn reapply_until<P, V>(
    provisioner: &P,
    output_key: &str,
    policy: &RetryPolicy,
    validate: V,
) -> Result<Vec<String>>
where
    P: Provisioner + ?Sized,
    V: Fn(&[String]) -> std::result::Result<(), String>,
{
    let max = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        provisioner.apply().await?;
        let values = provisioner.output_list(output_key).await?;

        match validate(&values) {
            Ok(()) => return Ok(values),
            Err(reason) => {
                if attempt >= max {
                    return Err(Error::provisioning(format!(
                        "{} after {} attempts",
                        reason, attempt
                    )));
                }
                warn!(
                    attempt,
                    reason = %reason,
                    "Provisioner output not usable yet, re-applying"
                );
                tokio::time::sleep(policy.interval).await;
            }
        }
    }
}

/// Check that every address in the list parses as IPv4
pub fn all_ipv4(addresses: &[String]) -> std::result::Result<(), String> {
    for (index, address) in addresses.iter().enumerate() {
        if address.parse::<Ipv4Addr>().is_err() {
            return Err(format!(
                "output {}[{}]={:?} must be an IPv4 address",
                ADDRESSES_OUTPUT_KEY, index, address
            ));
        }
    }
    Ok(())
}

/// Acquire a usable node set of exactly `desired_node_count` machines.
///
/// Applies, validates the reported addresses (whole-set: any non-IPv4 entry
/// fails the attempt), and re-applies up to the policy budget.
pub async fn acquire<P>(
    provisioner: &P,
    desired_node_count: usize,
    ssh_user: &str,
    policy: &RetryPolicy,
) -> Result<NodeSet>
where
    P: Provisioner + ?Sized,
{
    if desired_node_count == 0 {
        return Err(Error::validation("desired node count must be at least 1"));
    }

    let addresses = reapply_until(provisioner, ADDRESSES_OUTPUT_KEY, policy, |addrs| {
        if addrs.len() != desired_node_count {
            return Err(format!(
                "output {} has {} addresses, expected {}",
                ADDRESSES_OUTPUT_KEY,
                addrs.len(),
                desired_node_count
            ));
        }
        all_ipv4(addrs)
    })
    .await?;

    let mut nodes = Vec::with_capacity(addresses.len());
    for (index, address) in addresses.iter().enumerate() {
        let address = address.parse::<Ipv4Addr>().map_err(|_| {
            Error::provisioning(format!(
                "output {}[{}]={:?} must be an IPv4 address",
                ADDRESSES_OUTPUT_KEY, index, address
            ))
        })?;
        nodes.push(Node {
            index,
            address,
            ssh_user: ssh_user.to_string(),
        });
    }

    info!(count = nodes.len(), "Acquired node set");
    Ok(NodeSet(nodes))
}
