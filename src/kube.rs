//! kubectl-backed cluster snapshot view.
//!
//! The orchestrator's query interface is reached through the kubectl CLI
//! against a locally stored kubeconfig plus a target context, the same way
//! the rest of the run drives its external collaborators. Listings are
//! requested as JSON and deserialized into the readiness snapshot types.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use crate::readiness::{ClusterView, NodeSnapshot, PodSnapshot};
use crate::{Error, Result};

#[derive(Debug, Deserialize)]
struct KubeList {
    #[serde(default)]
    items: Vec<KubeItem>,
}

#[derive(Debug, Deserialize)]
struct KubeItem {
    metadata: KubeMetadata,
    #[serde(default)]
    status: KubeStatus,
}

#[derive(Debug, Deserialize)]
struct KubeMetadata {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct KubeStatus {
    #[serde(default)]
    conditions: Vec<KubeCondition>,
}

#[derive(Debug, Deserialize)]
struct KubeCondition {
    #[serde(rename = "type")]
    type_: String,
    status: String,
}

impl KubeItem {
    fn is_ready(&self) -> bool {
        self.status
            .conditions
            .iter()
            .any(|condition| condition.type_ == "Ready" && condition.status == "True")
    }
}

fn parse_list(json: &[u8], what: &str) -> Result<KubeList> {
    serde_json::from_slice(json)
        .map_err(|e| Error::query(format!("failed to parse {} listing: {}", what, e)))
}

fn pod_snapshots(json: &[u8]) -> Result<Vec<PodSnapshot>> {
    Ok(parse_list(json, "pod")?
        .items
        .into_iter()
        .map(|item| PodSnapshot {
            ready: item.is_ready(),
            name: item.metadata.name,
        })
        .collect())
}

fn node_snapshots(json: &[u8]) -> Result<Vec<NodeSnapshot>> {
    Ok(parse_list(json, "node")?
        .items
        .into_iter()
        .map(|item| NodeSnapshot {
            ready: item.is_ready(),
            name: item.metadata.name,
        })
        .collect())
}

fn namespace_names(json: &[u8]) -> Result<Vec<String>> {
    Ok(parse_list(json, "namespace")?
        .items
        .into_iter()
        .map(|item| item.metadata.name)
        .collect())
}

/// Cluster view that shells out to kubectl
pub struct KubectlView {
    kubeconfig: PathBuf,
    context: String,
}

impl KubectlView {
    /// Create a view over the given kubeconfig and context
    pub fn new(kubeconfig: impl Into<PathBuf>, context: impl Into<String>) -> Self {
        Self {
            kubeconfig: kubeconfig.into(),
            context: context.into(),
        }
    }

    async fn kubectl(&self, args: &[&str]) -> Result<Vec<u8>> {
        let output = Command::new("kubectl")
            .arg("--kubeconfig")
            .arg(&self.kubeconfig)
            .arg("--context")
            .arg(&self.context)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::query(format!("failed to run kubectl: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::query(format!(
                "kubectl {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }

        Ok(output.stdout)
    }
}

#[async_trait]
impl ClusterView for KubectlView {
    async fn pods(&self, namespace: &str) -> Result<Vec<PodSnapshot>> {
        let json = self
            .kubectl(&["get", "pods", "-n", namespace, "-o", "json"])
            .await?;
        pod_snapshots(&json)
    }

    async fn nodes(&self) -> Result<Vec<NodeSnapshot>> {
        let json = self.kubectl(&["get", "nodes", "-o", "json"]).await?;
        node_snapshots(&json)
    }

    async fn namespaces(&self) -> Result<Vec<String>> {
        let json = self.kubectl(&["get", "namespaces", "-o", "json"]).await?;
        namespace_names(&json)
    }
}
