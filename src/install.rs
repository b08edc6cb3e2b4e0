//! Chart installation into the bootstrapped cluster.
//!
//! Add-ons are installed with `helm upgrade --install` once the readiness
//! poller has confirmed the control plane's own pods have scheduled. There is
//! no rollback: a failed install fails the run.

use std::path::PathBuf;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::process::Command;
use tracing::info;

use crate::{Error, Result};

/// One chart release to install after the cluster is ready
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChartSpec {
    /// Release name
    pub release: String,
    /// Chart reference (name within the repo, or a local path)
    pub chart: String,
    /// Target namespace, created if missing
    pub namespace: String,
    /// Chart version to pin, if any
    pub version: Option<String>,
    /// Chart repository URL, if the chart is not local
    pub repo_url: Option<String>,
    /// Values files applied in order
    pub values_files: Vec<PathBuf>,
}

/// Trait for the chart installer
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChartInstaller: Send + Sync {
    /// Install the release described by `spec`
    async fn install(&self, spec: &ChartSpec) -> Result<()>;
}

/// Installer that shells out to the helm CLI
pub struct HelmCli {
    kubeconfig: PathBuf,
    context: String,
}

impl HelmCli {
    /// Create an installer bound to a kubeconfig and context
    pub fn new(kubeconfig: impl Into<PathBuf>, context: impl Into<String>) -> Self {
        Self {
            kubeconfig: kubeconfig.into(),
            context: context.into(),
        }
    }
}

fn install_args(spec: &ChartSpec) -> Vec<String> {
    let mut args = vec![
        "upgrade".to_string(),
        "--install".to_string(),
        spec.release.clone(),
        spec.chart.clone(),
        "--namespace".to_string(),
        spec.namespace.clone(),
        "--create-namespace".to_string(),
    ];
    if let Some(repo_url) = &spec.repo_url {
        args.push(format!("--repo={}", repo_url));
    }
    if let Some(version) = &spec.version {
        args.push("--version".to_string());
        args.push(version.clone());
    }
    for values in &spec.values_files {
        args.push("--values".to_string());
        args.push(values.display().to_string());
    }
    args
}

#[async_trait]
impl ChartInstaller for HelmCli {
    async fn install(&self, spec: &ChartSpec) -> Result<()> {
        info!(
            release = %spec.release,
            namespace = %spec.namespace,
            "Installing chart release"
        );

        let output = Command::new("helm")
            .args(install_args(spec))
            .arg("--kubeconfig")
            .arg(&self.kubeconfig)
            .arg("--kube-context")
            .arg(&self.context)
            .output()
            .await
            .map_err(|e| Error::install(format!("failed to run helm: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::install(format!(
                "helm install of release {} failed: {}",
                spec.release,
                stderr.trim()
            )));
        }

        info!(release = %spec.release, "Chart release installed");
        Ok(())
    }
}
