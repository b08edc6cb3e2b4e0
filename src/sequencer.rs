//! Cluster bootstrap state machine.
//!
//! For N provisioned nodes, node 0 initializes the control plane and every
//! other node joins it, in index order. The run moves through a fixed set of
//! phases:
//!
//! 1. `Unprovisioned → NodesAcquired`: a usable node set exists
//! 2. `NodesAcquired → ControlPlaneInitializing`: node 0's boot-time
//!    configuration agent has finished and its container runtime is active
//! 3. `ControlPlaneInitializing → ControlPlaneReady`: kubeadm init succeeded,
//!    a join token is minted, and the admin credential is fetched
//! 4. `ControlPlaneReady → WorkersJoining`: nodes 1..N repeat the boot gates
//!    and execute the stored join command with elevated privilege
//! 5. `WorkersJoining → ClusterFormed`: every join returned without error
//!
//! No join executes before the control-plane step has produced
//! [`JoinMaterial`]; the material is written once and only read afterwards.
//! Initialization and joins are one-shot: a partial kubeadm init leaves
//! unrecoverable state, so there is no retry and any failure aborts the run.
//! Infrastructure teardown is the pipeline's responsibility, not ours.

use tracing::{debug, info};

use crate::provision::{Node, NodeSet};
use crate::remote::{run, run_with_retry, RemoteChannel};
use crate::retry::RetryPolicy;
use crate::{Error, Result, ADMIN_KUBECONFIG_PATH, POD_NETWORK_CIDR};

/// Boot-time configuration agent completion gate.
/// Retried because the SSH server itself may take a few seconds to start.
const CLOUD_INIT_WAIT: &str = "cloud-init status --wait";

/// Container runtime state probe
const RUNTIME_STATE: &str = "sudo systemctl show crio.service --property=ActiveState";

/// Expected runtime state output fragment
const RUNTIME_ACTIVE: &str = "ActiveState=active";

/// Mint a join token and print the full join command
const MINT_JOIN_COMMAND: &str = "sudo kubeadm token create --print-join-command";

/// Progress of one bootstrap run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// No usable node set yet
    Unprovisioned,
    /// A validated node set exists
    NodesAcquired,
    /// Node 0 is being gated and initialized
    ControlPlaneInitializing,
    /// Join material exists
    ControlPlaneReady,
    /// Workers are executing the join command
    WorkersJoining,
    /// Every node has joined
    ClusterFormed,
}

/// Everything a worker needs to join the cluster, produced exactly once
#[derive(Clone, Debug)]
pub struct JoinMaterial {
    /// The full join command printed by the token mint, without elevation
    pub join_command: String,
    /// Contents of the cluster admin credential file
    pub kubeconfig: String,
}

/// Drives a node set from powered-on to a formed cluster
pub struct BootstrapSequencer<'a, C: RemoteChannel + ?Sized> {
    channel: &'a C,
    boot_policy: RetryPolicy,
    phase: Phase,
}

impl<'a, C: RemoteChannel + ?Sized> BootstrapSequencer<'a, C> {
    /// Create a sequencer over the given channel.
    ///
    /// `boot_policy` bounds the wait for each node's boot-time configuration
    /// agent; everything else in the sequence is one-shot.
    pub fn new(channel: &'a C, boot_policy: RetryPolicy) -> Self {
        Self {
            channel,
            boot_policy,
            phase: Phase::Unprovisioned,
        }
    }

    /// The phase the run has reached
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Run the full bootstrap sequence over the node set.
    ///
    /// Returns the join material so callers can persist the kubeconfig for
    /// the readiness and install stages. Any failure aborts the run with the
    /// sequencer parked in the phase that failed.
    pub async fn run(&mut self, nodes: &NodeSet) -> Result<JoinMaterial> {
        let control_plane = nodes
            .control_plane()
            .ok_or_else(|| Error::validation("cannot bootstrap an empty node set"))?;
        self.phase = Phase::NodesAcquired;

        self.phase = Phase::ControlPlaneInitializing;
        self.await_boot(control_plane).await?;
        let material = self.init_control_plane(control_plane).await?;
        self.phase = Phase::ControlPlaneReady;

        self.phase = Phase::WorkersJoining;
        for worker in nodes.workers() {
            self.await_boot(worker).await?;
            self.join_worker(worker, &material).await?;
        }
        self.phase = Phase::ClusterFormed;

        info!(nodes = nodes.len(), "Cluster formed");
        Ok(material)
    }

    /// Gate on the node having finished booting.
    ///
    /// Both checks are preconditions for any kubeadm operation: initializing
    /// or joining before the container runtime is active fails
    /// deterministically.
    async fn await_boot(&self, node: &Node) -> Result<()> {
        debug!(node = %node.address, "Waiting for boot-time configuration");
        run_with_retry(self.channel, node, CLOUD_INIT_WAIT, &self.boot_policy).await?;

        let state = run(self.channel, node, RUNTIME_STATE).await?;
        if !state.contains(RUNTIME_ACTIVE) {
            return Err(Error::remote_exec(
                node.address.to_string(),
                RUNTIME_STATE,
                format!(
                    "expected output to contain `{}`, got: `{}`",
                    RUNTIME_ACTIVE,
                    state.trim()
                ),
            ));
        }
        Ok(())
    }

    /// Initialize the control plane and produce the run's join material
    async fn init_control_plane(&self, node: &Node) -> Result<JoinMaterial> {
        info!(node = %node.address, "Initializing control plane");

        let init_command = format!("sudo kubeadm init --pod-network-cidr={}", POD_NETWORK_CIDR);
        run(self.channel, node, &init_command).await?;

        let join_command = run(self.channel, node, MINT_JOIN_COMMAND).await?;
        let kubeconfig = self
            .channel
            .fetch_file(node, ADMIN_KUBECONFIG_PATH, true)
            .await?;

        info!(node = %node.address, "Control plane initialized, join material minted");
        Ok(JoinMaterial {
            join_command: join_command.trim().to_string(),
            kubeconfig,
        })
    }

    /// Join one worker using the stored join material
    async fn join_worker(&self, node: &Node, material: &JoinMaterial) -> Result<()> {
        info!(node = %node.address, "Joining worker");

        let command = format!("sudo {}", material.join_command);
        let log = run(self.channel, node, &command).await?;

        info!(
            node = %node.address,
            "===== kubeadm join log =====\n{}\n============================",
            log.trim_end()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    const JOIN_COMMAND: &str = "join --token abc";
    const KUBECONFIG: &str = "apiVersion: v1\nkind: Config\n";

    /// Scripted channel that records every call in order
    struct ScriptedChannel {
        calls: Mutex<Vec<(usize, String)>>,
        cloud_init_failures: u32,
        cloud_init_attempts: AtomicU32,
        runtime_active: bool,
        fail_init: bool,
        fail_joins: bool,
    }

    impl ScriptedChannel {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                cloud_init_failures: 0,
                cloud_init_attempts: AtomicU32::new(0),
                runtime_active: true,
                fail_init: false,
                fail_joins: false,
            }
        }

        fn recorded(&self) -> Vec<(usize, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RemoteChannel for ScriptedChannel {
        async fn exec(&self, node: &Node, command: &str) -> Result<String> {
            self.calls
                .lock()
                .unwrap()
                .push((node.index, command.to_string()));

            if command == CLOUD_INIT_WAIT {
                let attempt = self.cloud_init_attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt <= self.cloud_init_failures {
                    return Err(Error::remote_exec(
                        node.address.to_string(),
                        command,
                        "connection refused",
                    ));
                }
                return Ok("status: done\n".to_string());
            }
            if command == RUNTIME_STATE {
                return if self.runtime_active {
                    Ok("ActiveState=active\n".to_string())
                } else {
                    Ok("ActiveState=inactive\n".to_string())
                };
            }
            if command.starts_with("sudo kubeadm init") {
                return if self.fail_init {
                    Err(Error::remote_exec(
                        node.address.to_string(),
                        command,
                        "exit status 1",
                    ))
                } else {
                    Ok("Your Kubernetes control-plane has initialized successfully!\n".to_string())
                };
            }
            if command == MINT_JOIN_COMMAND {
                return Ok(format!("{}\n", JOIN_COMMAND));
            }
            if command.starts_with("sudo join") {
                return if self.fail_joins {
                    Err(Error::remote_exec(
                        node.address.to_string(),
                        command,
                        "exit status 1",
                    ))
                } else {
                    Ok("This node has joined the cluster\n".to_string())
                };
            }
            panic!("unexpected command: {}", command);
        }

        async fn fetch_file(
            &self,
            node: &Node,
            remote_path: &str,
            elevated: bool,
        ) -> Result<String> {
            self.calls
                .lock()
                .unwrap()
                .push((node.index, format!("fetch:{}:{}", remote_path, elevated)));
            assert!(elevated, "admin credential requires privilege escalation");
            Ok(KUBECONFIG.to_string())
        }
    }

    /// Build a node set through the public acquirer with a stub provisioner
    async fn node_set(count: usize) -> NodeSet {
        use crate::provision::{acquire, MockProvisioner};

        let addresses: Vec<String> = (0..count)
            .map(|i| format!("192.168.122.{}", 10 + i))
            .collect();
        let mut mock = MockProvisioner::new();
        mock.expect_apply().returning(|| Ok(()));
        mock.expect_output_list()
            .returning(move |_| Ok(addresses.clone()));
        acquire(&mock, count, "terraform", &RetryPolicy::new(1, Duration::ZERO))
            .await
            .unwrap()
    }

    fn boot_policy() -> RetryPolicy {
        RetryPolicy::new(5, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn two_node_bootstrap_propagates_the_join_command_with_sudo() {
        let channel = ScriptedChannel::new();
        let nodes = node_set(2).await;
        let mut sequencer = BootstrapSequencer::new(&channel, boot_policy());

        let material = sequencer.run(&nodes).await.unwrap();

        assert_eq!(sequencer.phase(), Phase::ClusterFormed);
        assert_eq!(material.join_command, JOIN_COMMAND);
        assert_eq!(material.kubeconfig, KUBECONFIG);

        // The worker ran exactly the minted command, elevated
        let joins: Vec<_> = channel
            .recorded()
            .into_iter()
            .filter(|(_, cmd)| cmd.starts_with("sudo join"))
            .collect();
        assert_eq!(joins, vec![(1, format!("sudo {}", JOIN_COMMAND))]);
    }

    #[tokio::test]
    async fn no_join_executes_before_the_control_plane_init() {
        let channel = ScriptedChannel::new();
        let nodes = node_set(3).await;
        let mut sequencer = BootstrapSequencer::new(&channel, boot_policy());

        sequencer.run(&nodes).await.unwrap();

        let calls = channel.recorded();
        let init_at = calls
            .iter()
            .position(|(_, cmd)| cmd.starts_with("sudo kubeadm init"))
            .expect("init must run");
        let fetch_at = calls
            .iter()
            .position(|(_, cmd)| cmd.starts_with("fetch:"))
            .expect("credential fetch must run");
        let join_positions: Vec<_> = calls
            .iter()
            .enumerate()
            .filter(|(_, (_, cmd))| cmd.starts_with("sudo join"))
            .map(|(i, _)| i)
            .collect();

        assert_eq!(join_positions.len(), 2);
        for position in join_positions {
            assert!(position > init_at);
            assert!(position > fetch_at);
        }

        // There is exactly one init call
        assert_eq!(
            calls
                .iter()
                .filter(|(_, cmd)| cmd.starts_with("sudo kubeadm init"))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn workers_join_in_index_order() {
        let channel = ScriptedChannel::new();
        let nodes = node_set(4).await;
        let mut sequencer = BootstrapSequencer::new(&channel, boot_policy());

        sequencer.run(&nodes).await.unwrap();

        let join_nodes: Vec<usize> = channel
            .recorded()
            .into_iter()
            .filter(|(_, cmd)| cmd.starts_with("sudo join"))
            .map(|(index, _)| index)
            .collect();
        assert_eq!(join_nodes, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn single_node_cluster_forms_with_zero_joins() {
        let channel = ScriptedChannel::new();
        let nodes = node_set(1).await;
        let mut sequencer = BootstrapSequencer::new(&channel, boot_policy());

        let material = sequencer.run(&nodes).await.unwrap();

        assert_eq!(sequencer.phase(), Phase::ClusterFormed);
        assert_eq!(material.join_command, JOIN_COMMAND);
        assert!(!channel
            .recorded()
            .iter()
            .any(|(_, cmd)| cmd.starts_with("sudo join")));
    }

    #[tokio::test]
    async fn inactive_runtime_aborts_before_init() {
        let channel = ScriptedChannel {
            runtime_active: false,
            ..ScriptedChannel::new()
        };
        let nodes = node_set(2).await;
        let mut sequencer = BootstrapSequencer::new(&channel, boot_policy());

        let err = sequencer.run(&nodes).await.unwrap_err();

        assert!(err.to_string().contains("ActiveState=active"));
        assert_eq!(sequencer.phase(), Phase::ControlPlaneInitializing);
        assert!(!channel
            .recorded()
            .iter()
            .any(|(_, cmd)| cmd.starts_with("sudo kubeadm init")));
    }

    #[tokio::test]
    async fn init_failure_is_fatal_without_retry() {
        let channel = ScriptedChannel {
            fail_init: true,
            ..ScriptedChannel::new()
        };
        let nodes = node_set(2).await;
        let mut sequencer = BootstrapSequencer::new(&channel, boot_policy());

        let err = sequencer.run(&nodes).await.unwrap_err();

        assert!(err.to_string().contains("kubeadm init"));
        assert_eq!(
            channel
                .recorded()
                .iter()
                .filter(|(_, cmd)| cmd.starts_with("sudo kubeadm init"))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn join_failure_is_fatal_to_the_run() {
        let channel = ScriptedChannel {
            fail_joins: true,
            ..ScriptedChannel::new()
        };
        let nodes = node_set(2).await;
        let mut sequencer = BootstrapSequencer::new(&channel, boot_policy());

        let err = sequencer.run(&nodes).await.unwrap_err();

        assert!(matches!(err, Error::RemoteExec { .. }));
        assert_eq!(sequencer.phase(), Phase::WorkersJoining);
    }

    #[tokio::test]
    async fn boot_gate_retries_while_ssh_comes_up() {
        let channel = ScriptedChannel {
            cloud_init_failures: 2,
            ..ScriptedChannel::new()
        };
        let nodes = node_set(1).await;
        let mut sequencer = BootstrapSequencer::new(&channel, boot_policy());

        sequencer.run(&nodes).await.unwrap();

        let waits = channel
            .recorded()
            .iter()
            .filter(|(_, cmd)| cmd == CLOUD_INIT_WAIT)
            .count();
        assert_eq!(waits, 3);
    }

    #[tokio::test]
    async fn credential_is_fetched_from_the_well_known_path_with_privilege() {
        let channel = ScriptedChannel::new();
        let nodes = node_set(1).await;
        let mut sequencer = BootstrapSequencer::new(&channel, boot_policy());

        sequencer.run(&nodes).await.unwrap();

        let fetches: Vec<_> = channel
            .recorded()
            .into_iter()
            .filter(|(_, cmd)| cmd.starts_with("fetch:"))
            .collect();
        assert_eq!(
            fetches,
            vec![(0, format!("fetch:{}:true", ADMIN_KUBECONFIG_PATH))]
        );
    }
}
