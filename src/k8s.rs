use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::ListParams;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;

use crate::config::{ClusterConfig, ForwardConfig, TargetKind};

pub const RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);

const RUNNING_PHASE: &str = "Running";

/// Resolved transport configuration and client for one cluster. Immutable
/// once built; shared by every supervisor of that cluster.
#[derive(Clone)]
pub struct ClusterBinding {
    pub name: String,
    pub server: String,
    pub client: Client,
}

pub async fn resolve_cluster(cluster: &ClusterConfig) -> Result<ClusterBinding> {
    let kubeconfig = Kubeconfig::read_from(&cluster.kubeconfig).with_context(|| {
        format!(
            "failed to read kubeconfig {} for cluster '{}'",
            cluster.kubeconfig.display(),
            cluster.name
        )
    })?;
    let options = KubeConfigOptions {
        context: cluster.context.clone(),
        cluster: None,
        user: None,
    };
    let config = Config::from_custom_kubeconfig(kubeconfig, &options)
        .await
        .with_context(|| {
            format!(
                "failed to build client configuration for cluster '{}'",
                cluster.name
            )
        })?;
    let server = config.cluster_url.to_string();
    let client = Client::try_from(config).with_context(|| {
        format!(
            "failed to initialize Kubernetes client for cluster '{}'",
            cluster.name
        )
    })?;

    Ok(ClusterBinding {
        name: cluster.name.clone(),
        server,
        client,
    })
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: TargetKind,
        namespace: String,
        name: String,
    },
    #[error("pod {name} is not running (phase {phase})")]
    NotRunning { name: String, phase: String },
    #[error("no running pods found for service {0}")]
    NoEndpoints(String),
    #[error("kubernetes api error: {0}")]
    Transport(#[from] kube::Error),
    #[error("timed out resolving target after {0:?}")]
    Deadline(Duration),
}

/// Picks the concrete running pod a forward should tunnel to. Stateless:
/// every reconnect resolves afresh, which is how pod restarts are picked up.
pub async fn resolve_target(
    client: &Client,
    forward: &ForwardConfig,
) -> std::result::Result<String, ResolveError> {
    match timeout(RESOLVE_TIMEOUT, resolve_inner(client, forward)).await {
        Ok(result) => result,
        Err(_) => Err(ResolveError::Deadline(RESOLVE_TIMEOUT)),
    }
}

async fn resolve_inner(
    client: &Client,
    forward: &ForwardConfig,
) -> std::result::Result<String, ResolveError> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), &forward.namespace);

    if forward.kind == TargetKind::Pod {
        let pod = pods
            .get(&forward.service)
            .await
            .map_err(|error| not_found_or_transport(error, forward))?;
        let phase = pod_phase(&pod);
        if phase != RUNNING_PHASE {
            return Err(ResolveError::NotRunning {
                name: forward.service.clone(),
                phase,
            });
        }
        return Ok(forward.service.clone());
    }

    let services: Api<Service> = Api::namespaced(client.clone(), &forward.namespace);
    let service = services
        .get(&forward.service)
        .await
        .map_err(|error| not_found_or_transport(error, forward))?;
    let Some(selector) = service
        .spec
        .as_ref()
        .and_then(|spec| spec.selector.as_ref())
        .and_then(label_selector)
    else {
        return Err(ResolveError::NoEndpoints(forward.service.clone()));
    };

    let matching = pods.list(&ListParams::default().labels(&selector)).await?;
    matching
        .items
        .iter()
        .find(|pod| pod_phase(pod) == RUNNING_PHASE)
        .and_then(|pod| pod.metadata.name.clone())
        .ok_or_else(|| ResolveError::NoEndpoints(forward.service.clone()))
}

fn not_found_or_transport(error: kube::Error, forward: &ForwardConfig) -> ResolveError {
    match error {
        kube::Error::Api(ref response) if response.code == 404 => ResolveError::NotFound {
            kind: forward.kind,
            namespace: forward.namespace.clone(),
            name: forward.service.clone(),
        },
        other => ResolveError::Transport(other),
    }
}

fn pod_phase(pod: &Pod) -> String {
    pod.status
        .as_ref()
        .and_then(|status| status.phase.clone())
        .unwrap_or_default()
}

fn label_selector(labels: &BTreeMap<String, String>) -> Option<String> {
    if labels.is_empty() {
        return None;
    }
    Some(
        labels
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(","),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodStatus;
    use kube::core::ErrorResponse;

    fn forward() -> ForwardConfig {
        ForwardConfig {
            namespace: "default".to_string(),
            service: "api".to_string(),
            kind: TargetKind::Service,
            local_port: 18080,
            remote_port: 80,
            db_backup: None,
        }
    }

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Tested".to_string(),
            code,
        })
    }

    #[test]
    fn empty_selector_yields_none() {
        assert_eq!(label_selector(&BTreeMap::new()), None);
    }

    #[test]
    fn selector_is_comma_joined_and_ordered() {
        let labels = BTreeMap::from([
            ("app".to_string(), "api".to_string()),
            ("tier".to_string(), "backend".to_string()),
        ]);
        assert_eq!(label_selector(&labels).as_deref(), Some("app=api,tier=backend"));
    }

    #[test]
    fn missing_status_reads_as_empty_phase() {
        let pod = Pod::default();
        assert_eq!(pod_phase(&pod), "");

        let running = Pod {
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                ..PodStatus::default()
            }),
            ..Pod::default()
        };
        assert_eq!(pod_phase(&running), "Running");
    }

    #[test]
    fn api_404_maps_to_not_found() {
        let error = not_found_or_transport(api_error(404), &forward());
        assert!(matches!(error, ResolveError::NotFound { .. }));
        assert_eq!(error.to_string(), "service default/api not found");
    }

    #[test]
    fn other_api_errors_stay_transport() {
        let error = not_found_or_transport(api_error(500), &forward());
        assert!(matches!(error, ResolveError::Transport(_)));
    }
}
