//! Packer image build and manifest lookup.
//!
//! Building the disk image is a single external call with no internal state
//! machine: run `packer build` in the template's working directory, then read
//! the path of the produced qcow2 image out of `packer-manifest.json`. The
//! build is optional; a run may reuse an existing image supplied through
//! configuration.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use tokio::process::Command;
use tracing::info;

use crate::{Error, Result};

/// File name of the manifest packer writes next to the template
pub const MANIFEST_FILE: &str = "packer-manifest.json";

/// Trait for building a disk image from a template
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Build the image described by `template` inside `working_dir`
    async fn build(&self, template: &str, working_dir: &Path) -> Result<()>;
}

/// Image builder that shells out to the packer CLI
#[derive(Default, Clone)]
pub struct PackerCli;

impl PackerCli {
    /// Create a new packer-backed builder
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ImageBuilder for PackerCli {
    async fn build(&self, template: &str, working_dir: &Path) -> Result<()> {
        // Stale artifacts from an aborted build confuse the manifest lookup
        let _ = tokio::fs::remove_dir_all(working_dir.join("build")).await;
        let _ = tokio::fs::remove_file(working_dir.join(MANIFEST_FILE)).await;

        info!(template, dir = %working_dir.display(), "Building image with packer");

        let output = Command::new("packer")
            .arg("build")
            .arg(template)
            .current_dir(working_dir)
            .output()
            .await
            .map_err(|e| Error::image_build(format!("failed to run packer: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::image_build(format!(
                "packer build {} failed: {}",
                template, stderr
            )));
        }

        info!(template, "Image build complete");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct PackerManifest {
    builds: Vec<PackerManifestBuild>,
}

#[derive(Debug, Deserialize)]
struct PackerManifestBuild {
    files: Vec<PackerManifestFile>,
}

#[derive(Debug, Deserialize)]
struct PackerManifestFile {
    name: String,
}

/// Extract the qcow2 image path recorded in a packer manifest document
pub fn image_path_from_manifest(manifest_json: &str) -> Result<String> {
    let manifest: PackerManifest = serde_json::from_str(manifest_json)
        .map_err(|e| Error::image_build(format!("failed to parse {}: {}", MANIFEST_FILE, e)))?;

    for build in &manifest.builds {
        for file in &build.files {
            if file.name.ends_with(".qcow2") {
                return Ok(file.name.clone());
            }
        }
    }

    Err(Error::image_build(format!(
        "no .qcow2 image recorded in {}",
        MANIFEST_FILE
    )))
}

/// Read the manifest in `working_dir` and resolve the built image path
pub async fn locate_image(working_dir: &Path) -> Result<PathBuf> {
    let manifest_path = working_dir.join(MANIFEST_FILE);
    let content = tokio::fs::read_to_string(&manifest_path)
        .await
        .map_err(|e| {
            Error::image_build(format!(
                "failed to read {}: {}",
                manifest_path.display(),
                e
            ))
        })?;
    let name = image_path_from_manifest(&content)?;
    Ok(working_dir.join(name))
}
