//! Stage descriptors and the generic run driver.
//!
//! A run is an ordered list of [`Stage`] values executed by one runner, so
//! single-node and multi-node variants, or runs with a different add-on list,
//! are configuration rather than separate code paths. State produced mid-run
//! (the node set, the join material, the kubeconfig) is threaded through a
//! [`RunContext`] value; nothing lives in process-global state, so concurrent
//! runs cannot interfere.
//!
//! The provisioned infrastructure is the one long-lived resource: the runner
//! guarantees teardown on every exit path, success or failure, unless
//! suppressed by configuration.

use std::path::PathBuf;
use std::time::Duration;

use tracing::{error, info};

use crate::install::{ChartInstaller, ChartSpec};
use crate::provision::{acquire, NodeSet, Provisioner};
use crate::readiness::{poll_until, ClusterView, PollMode, ReadinessCondition};
use crate::remote::RemoteChannel;
use crate::retry::RetryPolicy;
use crate::sequencer::{BootstrapSequencer, JoinMaterial};
use crate::{Error, Result, SYSTEM_NAMESPACE};

/// Configuration for one run
#[derive(Clone, Debug)]
pub struct RunConfig {
    /// How many machines to provision and join
    pub node_count: usize,
    /// Login user on the provisioned machines
    pub ssh_user: String,
    /// Hostname prefix the infrastructure template assigns to the machines
    pub node_name_prefix: String,
    /// Skip infrastructure teardown at run end
    pub keep_infrastructure: bool,
    /// Where the fetched cluster credential is written for the run's lifetime
    pub kubeconfig_path: PathBuf,
    /// Budget for the re-apply-until-IPv4 loop
    pub provision_policy: RetryPolicy,
    /// Budget for each node's boot-time configuration gate
    pub boot_policy: RetryPolicy,
}

/// One step of a run
#[derive(Clone, Debug)]
pub enum Stage {
    /// Acquire a validated node set
    Provision {
        /// Number of machines to create
        node_count: usize,
    },
    /// Form the cluster from the acquired node set
    Bootstrap,
    /// Block until a readiness condition holds
    Poll {
        /// Predicate to evaluate against fresh snapshots
        condition: ReadinessCondition,
        /// Attempt budget and interval
        policy: RetryPolicy,
        /// What exhaustion means
        mode: PollMode,
    },
    /// Install a chart release
    Install(ChartSpec),
}

/// State produced while a run executes, threaded through the stages
#[derive(Debug, Default)]
pub struct RunContext {
    /// The acquired node set, once a provision stage has run
    pub nodes: Option<NodeSet>,
    /// The minted join material, once a bootstrap stage has run
    pub join_material: Option<JoinMaterial>,
    /// Whether an apply was attempted, and teardown is therefore owed
    pub provision_attempted: bool,
}

/// Executes a stage list over a fixed set of collaborators
pub struct Pipeline<'a> {
    provisioner: &'a dyn Provisioner,
    channel: &'a dyn RemoteChannel,
    view: &'a dyn ClusterView,
    installer: &'a dyn ChartInstaller,
    config: &'a RunConfig,
}

impl<'a> Pipeline<'a> {
    /// Create a pipeline over the given collaborators
    pub fn new(
        provisioner: &'a dyn Provisioner,
        channel: &'a dyn RemoteChannel,
        view: &'a dyn ClusterView,
        installer: &'a dyn ChartInstaller,
        config: &'a RunConfig,
    ) -> Self {
        Self {
            provisioner,
            channel,
            view,
            installer,
            config,
        }
    }

    /// Run the stages in order, guaranteeing teardown on every exit path.
    ///
    /// Teardown runs whenever an apply was attempted, success or failure,
    /// unless suppressed by `keep_infrastructure`. A teardown failure never
    /// masks the run's own failure; on an otherwise successful run it is
    /// surfaced as the run result.
    pub async fn run(&self, stages: &[Stage]) -> Result<RunContext> {
        let mut ctx = RunContext::default();
        let result = self.execute(stages, &mut ctx).await;

        if ctx.provision_attempted {
            if self.config.keep_infrastructure {
                info!("Infrastructure teardown suppressed by configuration");
            } else {
                info!("Tearing down infrastructure");
                if let Err(e) = self.provisioner.destroy().await {
                    error!(error = %e, "Infrastructure teardown failed");
                    if result.is_ok() {
                        return Err(e);
                    }
                }
            }
        }

        result?;
        Ok(ctx)
    }

    async fn execute(&self, stages: &[Stage], ctx: &mut RunContext) -> Result<()> {
        for stage in stages {
            match stage {
                Stage::Provision { node_count } => {
                    info!(count = node_count, "Stage: provision");
                    ctx.provision_attempted = true;
                    let nodes = acquire(
                        self.provisioner,
                        *node_count,
                        &self.config.ssh_user,
                        &self.config.provision_policy,
                    )
                    .await?;
                    ctx.nodes = Some(nodes);
                }

                Stage::Bootstrap => {
                    info!("Stage: bootstrap");
                    let nodes = ctx.nodes.as_ref().ok_or_else(|| {
                        Error::validation("bootstrap stage requires a provision stage before it")
                    })?;
                    let mut sequencer =
                        BootstrapSequencer::new(self.channel, self.config.boot_policy.clone());
                    let material = sequencer.run(nodes).await?;
                    tokio::fs::write(&self.config.kubeconfig_path, &material.kubeconfig).await?;
                    ctx.join_material = Some(material);
                }

                Stage::Poll {
                    condition,
                    policy,
                    mode,
                } => {
                    info!(condition = %condition, "Stage: poll");
                    if ctx.join_material.is_none() {
                        return Err(Error::validation(
                            "poll stage requires a bootstrap stage before it",
                        ));
                    }
                    poll_until(self.view, condition, policy, *mode).await?;
                }

                Stage::Install(spec) => {
                    info!(release = %spec.release, "Stage: install");
                    if ctx.join_material.is_none() {
                        return Err(Error::validation(
                            "install stage requires a bootstrap stage before it",
                        ));
                    }
                    self.installer.install(spec).await?;
                }
            }
        }
        Ok(())
    }
}

/// The canonical run shape: provision, bootstrap, gate, install add-ons,
/// then verify the whole cluster converged.
pub fn default_stages(config: &RunConfig, addons: Vec<ChartSpec>) -> Vec<Stage> {
    let mut stages = vec![
        Stage::Provision {
            node_count: config.node_count,
        },
        Stage::Bootstrap,
        // Control plane responsive before anything is asked of the cluster
        Stage::Poll {
            condition: ReadinessCondition::PodReady {
                namespace: SYSTEM_NAMESPACE.to_string(),
                name: format!("kube-apiserver-{}-0", config.node_name_prefix),
            },
            policy: RetryPolicy::new(6, Duration::from_secs(10)),
            mode: PollMode::MustSucceed,
        },
        Stage::Poll {
            condition: ReadinessCondition::NodeCountIs {
                count: config.node_count,
            },
            policy: RetryPolicy::new(18, Duration::from_secs(10)),
            mode: PollMode::MustSucceed,
        },
        // The control plane's own static pods must have scheduled before
        // add-ons are installed
        Stage::Poll {
            condition: ReadinessCondition::PodsCreated {
                namespace: SYSTEM_NAMESPACE.to_string(),
                min_count: 8,
            },
            policy: RetryPolicy::new(10, Duration::from_secs(5)),
            mode: PollMode::MustSucceed,
        },
    ];

    for addon in addons {
        stages.push(Stage::Install(addon));
    }

    stages.push(Stage::Poll {
        condition: ReadinessCondition::AllPodsReady { exclude_dns: false },
        policy: RetryPolicy::new(24, Duration::from_secs(10)),
        mode: PollMode::MustSucceed,
    });
    // Final cluster-shape assertion: joins from outside the run's node set
    // would show up here
    stages.push(Stage::Poll {
        condition: ReadinessCondition::NodeCountIs {
            count: config.node_count,
        },
        policy: RetryPolicy::once(),
        mode: PollMode::MustSucceed,
    });
    stages.push(Stage::Poll {
        condition: ReadinessCondition::AllNodesReady,
        policy: RetryPolicy::new(5, Duration::from_secs(5)),
        mode: PollMode::MustSucceed,
    });

    stages
}

/// The add-ons the canonical run installs: a network plugin first, then
/// cert-manager
pub fn default_addons() -> Vec<ChartSpec> {
    vec![
        ChartSpec {
            release: "tigera-operator".to_string(),
            chart: "tigera-operator".to_string(),
            namespace: "tigera-operator".to_string(),
            version: Some("v3.30.3".to_string()),
            repo_url: Some("https://docs.tigera.io/calico/charts".to_string()),
            values_files: vec![PathBuf::from("calico-values.yml")],
        },
        ChartSpec {
            release: "cert-manager".to_string(),
            chart: "cert-manager".to_string(),
            namespace: "cert-manager".to_string(),
            version: Some("v1.19.1".to_string()),
            repo_url: Some("https://charts.jetstack.io".to_string()),
            values_files: vec![PathBuf::from("cert-manager-values.yml")],
        },
    ]
}
