//! Poll-until-predicate readiness verification.
//!
//! Scheduler state is eventually consistent, so every gate in the run is a
//! [`ReadinessCondition`] evaluated against a fresh snapshot on each attempt.
//! An entity that has not appeared yet is treated exactly like one that is
//! not ready; absence and not-ready both extend the retry loop. Snapshot
//! errors extend the loop too, since the query interface itself races the
//! control plane coming up.

use std::fmt;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::{debug, info, warn};

use crate::retry::RetryPolicy;
use crate::{Error, Result, DNS_ADDON_PREFIX};

/// Point-in-time readiness of one pod
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodSnapshot {
    /// Pod name
    pub name: String,
    /// Whether the pod reports the Ready condition
    pub ready: bool,
}

/// Point-in-time readiness of one cluster node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeSnapshot {
    /// Node name
    pub name: String,
    /// Whether the node reports the Ready condition
    pub ready: bool,
}

/// Trait for taking snapshots of orchestrator-reported state
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterView: Send + Sync {
    /// List pods in a namespace
    async fn pods(&self, namespace: &str) -> Result<Vec<PodSnapshot>>;

    /// List registered cluster nodes
    async fn nodes(&self) -> Result<Vec<NodeSnapshot>>;

    /// List namespace names
    async fn namespaces(&self) -> Result<Vec<String>>;
}

/// A pure predicate over one cluster snapshot, re-evaluated each poll
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadinessCondition {
    /// At least `min_count` pods exist in the namespace, ready or not
    PodsCreated {
        /// Namespace to count pods in
        namespace: String,
        /// Minimum number of pods that must exist
        min_count: usize,
    },
    /// The named pod exists and reports Ready
    PodReady {
        /// Namespace of the pod
        namespace: String,
        /// Pod name
        name: String,
    },
    /// Exactly `count` nodes are registered with the cluster
    NodeCountIs {
        /// Expected node count
        count: usize,
    },
    /// At least one node is registered and every node reports Ready
    AllNodesReady,
    /// Every pod in every namespace reports Ready.
    ///
    /// With `exclude_dns` set, pods named after the cluster DNS add-on are
    /// skipped: they stay Pending until a network plugin is installed, so a
    /// poll that runs before the CNI install must not wait on them.
    AllPodsReady {
        /// Skip DNS add-on pods
        exclude_dns: bool,
    },
}

impl fmt::Display for ReadinessCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PodsCreated {
                namespace,
                min_count,
            } => write!(f, "at least {} pods created in {}", min_count, namespace),
            Self::PodReady { namespace, name } => write!(f, "pod {}/{} ready", namespace, name),
            Self::NodeCountIs { count } => write!(f, "node count == {}", count),
            Self::AllNodesReady => write!(f, "all nodes ready"),
            Self::AllPodsReady { exclude_dns: true } => {
                write!(f, "all pods ready (dns add-on excluded)")
            }
            Self::AllPodsReady { exclude_dns: false } => write!(f, "all pods ready"),
        }
    }
}

/// What exhausting the retry budget means for a poll
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollMode {
    /// Exhaustion fails the run
    MustSucceed,
    /// Exhaustion is logged and reported as unsatisfied
    BestEffort,
}

async fn evaluate<V>(view: &V, condition: &ReadinessCondition) -> Result<bool>
where
    V: ClusterView + ?Sized,
{
    match condition {
        ReadinessCondition::PodsCreated {
            namespace,
            min_count,
        } => Ok(view.pods(namespace).await?.len() >= *min_count),

        ReadinessCondition::PodReady { namespace, name } => Ok(view
            .pods(namespace)
            .await?
            .iter()
            .any(|pod| &pod.name == name && pod.ready)),

        ReadinessCondition::NodeCountIs { count } => Ok(view.nodes().await?.len() == *count),

        ReadinessCondition::AllNodesReady => {
            let nodes = view.nodes().await?;
            Ok(!nodes.is_empty() && nodes.iter().all(|node| node.ready))
        }

        ReadinessCondition::AllPodsReady { exclude_dns } => {
            for namespace in view.namespaces().await? {
                for pod in view.pods(&namespace).await? {
                    if *exclude_dns && pod.name.starts_with(DNS_ADDON_PREFIX) {
                        continue;
                    }
                    if !pod.ready {
                        return Ok(false);
                    }
                }
            }
            Ok(true)
        }
    }
}

/// Poll until the condition holds or the retry budget is exhausted.
///
/// Takes a fresh snapshot per attempt and sleeps `policy.interval` between
/// attempts, never after the last. Returns whether the condition was
/// satisfied; in [`PollMode::MustSucceed`] exhaustion is an error naming the
/// condition and the attempt count.
pub async fn poll_until<V>(
    view: &V,
    condition: &ReadinessCondition,
    policy: &RetryPolicy,
    mode: PollMode,
) -> Result<bool>
where
    V: ClusterView + ?Sized,
{
    let max = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match evaluate(view, condition).await {
            Ok(true) => {
                info!(condition = %condition, attempt, "Readiness condition satisfied");
                return Ok(true);
            }
            Ok(false) => {
                debug!(condition = %condition, attempt, "Readiness condition not satisfied yet");
            }
            Err(e) => {
                warn!(
                    condition = %condition,
                    attempt,
                    error = %e,
                    "Cluster snapshot failed, treating as not ready"
                );
            }
        }

        if attempt >= max {
            return match mode {
                PollMode::MustSucceed => Err(Error::ReadinessTimeout {
                    condition: condition.to_string(),
                    attempts: attempt,
                }),
                PollMode::BestEffort => {
                    warn!(condition = %condition, attempts = attempt, "Giving up on best-effort poll");
                    Ok(false)
                }
            };
        }

        tokio::time::sleep(policy.interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn policy(max_attempts: u32, interval: Duration) -> RetryPolicy {
        RetryPolicy::new(max_attempts, interval)
    }

    fn pod(name: &str, ready: bool) -> PodSnapshot {
        PodSnapshot {
            name: name.to_string(),
            ready,
        }
    }

    fn cluster_node(name: &str, ready: bool) -> NodeSnapshot {
        NodeSnapshot {
            name: name.to_string(),
            ready,
        }
    }

    /// View whose node count reaches the target on the given attempt
    fn converging_view(on_attempt: u32, target: usize) -> (MockClusterView, Arc<AtomicU32>) {
        let evaluations = Arc::new(AtomicU32::new(0));
        let count = evaluations.clone();
        let mut view = MockClusterView::new();
        view.expect_nodes().returning(move || {
            let n = count.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= on_attempt {
                Ok((0..target).map(|i| cluster_node(&format!("kib-{}", i), true)).collect())
            } else {
                Ok(vec![cluster_node("kib-0", true)])
            }
        });
        (view, evaluations)
    }

    #[tokio::test(start_paused = true)]
    async fn satisfied_on_third_snapshot_with_budget_of_five() {
        let (view, evaluations) = converging_view(3, 2);
        let condition = ReadinessCondition::NodeCountIs { count: 2 };
        let started = tokio::time::Instant::now();

        let satisfied = poll_until(
            &view,
            &condition,
            &policy(5, Duration::from_secs(10)),
            PollMode::MustSucceed,
        )
        .await
        .unwrap();

        assert!(satisfied);
        assert_eq!(evaluations.load(Ordering::SeqCst), 3);
        // Slept exactly twice, between the three attempts
        assert_eq!(started.elapsed(), Duration::from_secs(20));
    }

    #[tokio::test]
    async fn must_succeed_exhaustion_is_a_readiness_timeout() {
        let (view, _) = converging_view(100, 2);
        let condition = ReadinessCondition::NodeCountIs { count: 2 };

        let err = poll_until(
            &view,
            &condition,
            &policy(4, Duration::from_millis(1)),
            PollMode::MustSucceed,
        )
        .await
        .unwrap_err();

        match err {
            Error::ReadinessTimeout {
                condition,
                attempts,
            } => {
                assert_eq!(condition, "node count == 2");
                assert_eq!(attempts, 4);
            }
            other => panic!("Expected ReadinessTimeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn best_effort_exhaustion_reports_unsatisfied_without_failing() {
        let (view, _) = converging_view(100, 2);
        let condition = ReadinessCondition::NodeCountIs { count: 2 };

        let satisfied = poll_until(
            &view,
            &condition,
            &policy(2, Duration::from_millis(1)),
            PollMode::BestEffort,
        )
        .await
        .unwrap();

        assert!(!satisfied);
    }

    #[tokio::test]
    async fn a_pod_that_never_appears_is_simply_not_ready() {
        let mut view = MockClusterView::new();
        view.expect_pods().returning(|_| Ok(vec![]));

        let condition = ReadinessCondition::PodReady {
            namespace: "kube-system".to_string(),
            name: "kube-apiserver-kib-0".to_string(),
        };

        let err = poll_until(
            &view,
            &condition,
            &policy(2, Duration::from_millis(1)),
            PollMode::MustSucceed,
        )
        .await
        .unwrap_err();

        // Absence produces the same timeout as not-ready, not a distinct error
        assert!(matches!(err, Error::ReadinessTimeout { .. }));
    }

    #[tokio::test]
    async fn snapshot_errors_extend_the_loop_instead_of_aborting() {
        let calls = Arc::new(AtomicU32::new(0));
        let count = calls.clone();
        let mut view = MockClusterView::new();
        view.expect_nodes().returning(move || {
            if count.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::validation("connection refused"))
            } else {
                Ok(vec![cluster_node("kib-0", true), cluster_node("kib-1", true)])
            }
        });

        let satisfied = poll_until(
            &view,
            &ReadinessCondition::NodeCountIs { count: 2 },
            &policy(3, Duration::from_millis(1)),
            PollMode::MustSucceed,
        )
        .await
        .unwrap();

        assert!(satisfied);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn node_count_must_match_exactly() {
        let mut view = MockClusterView::new();
        view.expect_nodes().returning(|| {
            Ok(vec![
                cluster_node("kib-0", true),
                cluster_node("kib-1", true),
                cluster_node("stray", true),
            ])
        });

        let err = poll_until(
            &view,
            &ReadinessCondition::NodeCountIs { count: 2 },
            &policy(1, Duration::ZERO),
            PollMode::MustSucceed,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::ReadinessTimeout { .. }));
    }

    #[tokio::test]
    async fn all_nodes_ready_requires_at_least_one_node() {
        let mut view = MockClusterView::new();
        view.expect_nodes().returning(|| Ok(vec![]));

        let err = poll_until(
            &view,
            &ReadinessCondition::AllNodesReady,
            &policy(1, Duration::ZERO),
            PollMode::MustSucceed,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::ReadinessTimeout { .. }));
    }

    #[tokio::test]
    async fn dns_addon_pods_are_excluded_only_when_asked() {
        let make_view = || {
            let mut view = MockClusterView::new();
            view.expect_namespaces()
                .returning(|| Ok(vec!["kube-system".to_string()]));
            view.expect_pods().returning(|_| {
                Ok(vec![
                    pod("kube-apiserver-kib-0", true),
                    pod("coredns-5d78c9869d-abcde", false),
                ])
            });
            view
        };

        // Before a network plugin exists, coredns stays pending; excluded it
        // does not block readiness.
        let satisfied = poll_until(
            &make_view(),
            &ReadinessCondition::AllPodsReady { exclude_dns: true },
            &policy(1, Duration::ZERO),
            PollMode::MustSucceed,
        )
        .await
        .unwrap();
        assert!(satisfied);

        // Included, the pending pod keeps the condition unsatisfied.
        let err = poll_until(
            &make_view(),
            &ReadinessCondition::AllPodsReady { exclude_dns: false },
            &policy(1, Duration::ZERO),
            PollMode::MustSucceed,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::ReadinessTimeout { .. }));
    }

    #[tokio::test]
    async fn all_pods_ready_walks_every_namespace() {
        let mut view = MockClusterView::new();
        view.expect_namespaces()
            .returning(|| Ok(vec!["kube-system".to_string(), "cert-manager".to_string()]));
        view.expect_pods().returning(|namespace| {
            if namespace == "cert-manager" {
                Ok(vec![pod("cert-manager-abc", false)])
            } else {
                Ok(vec![pod("kube-apiserver-kib-0", true)])
            }
        });

        let err = poll_until(
            &view,
            &ReadinessCondition::AllPodsReady { exclude_dns: false },
            &policy(1, Duration::ZERO),
            PollMode::MustSucceed,
        )
        .await
        .unwrap_err();

        assert!(err.to_string().contains("all pods ready"));
    }
}
