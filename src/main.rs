//! Kindling - bootstrap freshly provisioned VMs into a verified kubeadm cluster

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kindling::image::{locate_image, ImageBuilder, PackerCli};
use kindling::install::HelmCli;
use kindling::kube::KubectlView;
use kindling::pipeline::{default_addons, default_stages, Pipeline, RunConfig};
use kindling::provision::{ProvisionVars, TerraformCli};
use kindling::remote::SshCli;
use kindling::retry::RetryPolicy;
use kindling::sshkey::generate_keypair;

/// Kindling - bring up a kubeadm cluster on freshly provisioned VMs and verify it
#[derive(Parser, Debug)]
#[command(name = "kindling", version, about, long_about = None)]
struct Cli {
    /// Number of machines to provision and join into the cluster
    #[arg(long, default_value = "2")]
    nodes: usize,

    /// Reuse an existing disk image instead of building one
    #[arg(long, env = "KINDLING_EXISTING_IMAGE")]
    existing_image: Option<PathBuf>,

    /// Skip infrastructure teardown at run end (for debugging)
    #[arg(long, env = "KINDLING_KEEP_INFRASTRUCTURE")]
    keep_infrastructure: bool,

    /// Additional authorized keys granted access to the machines,
    /// newline-separated, on top of the generated per-run key
    #[arg(long, env = "KINDLING_ADDITIONAL_KEYS")]
    additional_keys: Option<String>,

    /// Packer template the image is built from
    #[arg(long, default_value = "image.pkr.hcl")]
    packer_template: String,

    /// Directory containing the packer template
    #[arg(long, default_value = ".")]
    packer_dir: PathBuf,

    /// Directory containing the terraform configuration
    #[arg(long, default_value = "terraform")]
    terraform_dir: PathBuf,

    /// Login user on the provisioned machines
    #[arg(long, default_value = "terraform")]
    ssh_user: String,

    /// Hostname prefix the terraform configuration assigns to the machines
    #[arg(long, default_value = "kib")]
    node_name_prefix: String,

    /// Attempts for the re-apply-until-IPv4 provisioning loop
    #[arg(long, default_value = "5")]
    provision_attempts: u32,

    /// Attempts for each node's boot-time configuration gate
    #[arg(long, default_value = "5")]
    boot_attempts: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let keypair = generate_keypair()?;

    let image = match &cli.existing_image {
        Some(path) => {
            tracing::info!(image = %path.display(), "Reusing existing image");
            path.clone()
        }
        None => {
            let builder = PackerCli::new();
            builder.build(&cli.packer_template, &cli.packer_dir).await?;
            locate_image(&cli.packer_dir).await?
        }
    };

    let mut authorized_keys = vec![keypair.public_key.trim().to_string()];
    if let Some(extra) = &cli.additional_keys {
        authorized_keys.extend(
            extra
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(String::from),
        );
    }

    let provisioner = TerraformCli::new(
        &cli.terraform_dir,
        ProvisionVars {
            image: image.display().to_string(),
            authorized_keys,
            node_count: cli.nodes,
        },
    );
    let channel = SshCli::new(&keypair)?;

    // The cluster credential lands here after bootstrap and is discarded
    // with the run
    let kubeconfig = tempfile::Builder::new()
        .prefix("kindling-kubeconfig-")
        .tempfile()?;
    let view = KubectlView::new(kubeconfig.path(), kindling::DEFAULT_KUBE_CONTEXT);
    let installer = HelmCli::new(kubeconfig.path(), kindling::DEFAULT_KUBE_CONTEXT);

    let config = RunConfig {
        node_count: cli.nodes,
        ssh_user: cli.ssh_user.clone(),
        node_name_prefix: cli.node_name_prefix.clone(),
        keep_infrastructure: cli.keep_infrastructure,
        kubeconfig_path: kubeconfig.path().to_path_buf(),
        provision_policy: RetryPolicy::new(cli.provision_attempts, Duration::from_secs(1)),
        boot_policy: RetryPolicy::new(cli.boot_attempts, Duration::from_secs(5)),
    };

    let pipeline = Pipeline::new(&provisioner, &channel, &view, &installer, &config);
    let stages = default_stages(&config, default_addons());
    pipeline.run(&stages).await?;

    tracing::info!(nodes = cli.nodes, "Run complete, cluster formed and verified");
    Ok(())
}
