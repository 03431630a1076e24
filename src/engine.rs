//! Streaming port-forward engine.
//!
//! One engine instance owns one loopback listener. Every accepted local
//! connection gets its own API-upgraded stream to the target pod; the
//! upgrade performed during `open` doubles as the dial check inside the
//! ready ceiling.

use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use kube::api::Portforwarder;
use std::net::Ipv4Addr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ForwardConfig;
use crate::k8s::ClusterBinding;

pub const READY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("timeout waiting for port-forward to become ready")]
    ReadyTimeout,
    #[error("failed to bind 127.0.0.1:{port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("port-forward dial failed: {0}")]
    Dial(#[source] kube::Error),
    #[error("local listener failed: {0}")]
    Accept(#[source] std::io::Error),
}

/// A live tunnel: the local socket is bound and the API upgrade verified.
pub struct TunnelConn {
    pods: Api<Pod>,
    pod_name: String,
    local_port: u16,
    remote_port: u16,
    listener: TcpListener,
    first: Option<Portforwarder>,
    cancel: CancellationToken,
}

/// Opens a tunnel for `pod_name`. Returning `Ok` is the ready signal; the
/// whole setup is bounded by [`READY_TIMEOUT`]. The bind address is always
/// loopback.
pub async fn open(
    binding: &ClusterBinding,
    forward: &ForwardConfig,
    pod_name: &str,
    cancel: CancellationToken,
) -> Result<TunnelConn, EngineError> {
    let pods: Api<Pod> = Api::namespaced(binding.client.clone(), &forward.namespace);

    let setup = async {
        let forwarder = pods
            .portforward(pod_name, &[forward.remote_port])
            .await
            .map_err(EngineError::Dial)?;
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, forward.local_port))
            .await
            .map_err(|source| EngineError::Bind {
                port: forward.local_port,
                source,
            })?;
        Ok::<_, EngineError>((forwarder, listener))
    };

    let (forwarder, listener) = timeout(READY_TIMEOUT, setup)
        .await
        .map_err(|_| EngineError::ReadyTimeout)??;

    Ok(TunnelConn {
        pods,
        pod_name: pod_name.to_string(),
        local_port: forward.local_port,
        remote_port: forward.remote_port,
        listener,
        first: Some(forwarder),
        cancel,
    })
}

impl TunnelConn {
    /// Serves connections until the cancellation token fires (`Ok`) or the
    /// tunnel fails (`Err`). The return is the terminated signal.
    pub async fn run(mut self) -> Result<(), EngineError> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                accepted = self.listener.accept() => {
                    let (local, peer) = accepted.map_err(EngineError::Accept)?;
                    let forwarder = match self.first.take() {
                        Some(forwarder) => forwarder,
                        None => self
                            .pods
                            .portforward(&self.pod_name, &[self.remote_port])
                            .await
                            .map_err(EngineError::Dial)?,
                    };
                    debug!(
                        peer = %peer,
                        pod = %self.pod_name,
                        local_port = self.local_port,
                        "accepted connection"
                    );
                    spawn_pump(forwarder, local, self.remote_port, self.pod_name.clone());
                }
            }
        }
    }
}

fn spawn_pump(mut forwarder: Portforwarder, mut local: TcpStream, remote_port: u16, pod_name: String) {
    tokio::spawn(async move {
        let Some(mut upstream) = forwarder.take_stream(remote_port) else {
            warn!(pod = %pod_name, remote_port, "port-forward stream missing");
            return;
        };
        match copy_bidirectional(&mut local, &mut upstream).await {
            Ok((sent, received)) => {
                debug!(pod = %pod_name, sent, received, "connection closed");
            }
            Err(error) => {
                debug!(pod = %pod_name, %error, "connection closed with error");
            }
        }
    });
}
