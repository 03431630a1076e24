//! Local liveness probing.
//!
//! A single ticker dispatches one short-lived probe per active tunnel each
//! tick. The probe only checks the local loopback socket; cluster-side
//! failures surface through the engine's own termination path.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::supervisor::{ForwardState, TunnelRecord};

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

pub fn spawn_monitor(
    records: Vec<Arc<TunnelRecord>>,
    check_interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for record in &records {
                        let record = record.clone();
                        tokio::spawn(check(record));
                    }
                }
                _ = shutdown.cancelled() => {
                    debug!("health monitor shutting down");
                    break;
                }
            }
        }
    })
}

async fn check(record: Arc<TunnelRecord>) {
    if record.state() != ForwardState::Active {
        return;
    }
    record.mark_probed();

    if probe(record.forward.local_port).await {
        return;
    }

    warn!(
        cluster = %record.cluster,
        namespace = %record.forward.namespace,
        service = %record.forward.service,
        local_port = record.forward.local_port,
        "health check failed, forcing reconnect"
    );
    record.request_reconnect();
}

/// A bounded TCP connect against the tunnel's loopback port.
pub async fn probe(port: u16) -> bool {
    matches!(
        timeout(PROBE_TIMEOUT, TcpStream::connect((Ipv4Addr::LOCALHOST, port))).await,
        Ok(Ok(_))
    )
}
