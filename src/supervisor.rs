use anyhow::Result;
use chrono::{DateTime, Local, TimeDelta};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Config, ForwardConfig};
use crate::engine;
use crate::health;
use crate::k8s::{self, ClusterBinding};

pub const UPDATE_BUS_CAPACITY: usize = 100;

const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ForwardState {
    Starting,
    Active,
    Reconnecting,
    Failed,
    Stopped,
}

impl ForwardState {
    pub fn label(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum BackupStatus {
    #[default]
    None,
    Pending,
    Running,
    Completed {
        size_mb: f64,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone)]
struct RecordState {
    state: ForwardState,
    last_error: String,
    last_probe_at: Option<DateTime<Local>>,
    reconnect_at: Option<DateTime<Local>>,
    retry_count: u32,
    backup: BackupStatus,
}

/// Shared view of one tunnel. The owning supervisor is the only writer of
/// the connection state; the probe and the backup runner go through the
/// dedicated methods below.
pub struct TunnelRecord {
    pub cluster: String,
    pub forward: ForwardConfig,
    state: RwLock<RecordState>,
    attempt: Mutex<CancellationToken>,
}

#[derive(Debug, Clone)]
pub struct TunnelSnapshot {
    pub cluster: String,
    pub namespace: String,
    pub service: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub has_backup: bool,
    pub state: ForwardState,
    pub last_error: String,
    pub last_probe_at: Option<DateTime<Local>>,
    pub reconnect_at: Option<DateTime<Local>>,
    pub retry_count: u32,
    pub backup: BackupStatus,
}

impl TunnelRecord {
    pub(crate) fn new(cluster: String, forward: ForwardConfig) -> Self {
        Self {
            cluster,
            forward,
            state: RwLock::new(RecordState {
                state: ForwardState::Starting,
                last_error: String::new(),
                last_probe_at: None,
                reconnect_at: None,
                retry_count: 0,
                backup: BackupStatus::None,
            }),
            attempt: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn snapshot(&self) -> TunnelSnapshot {
        let state = self.state.read();
        TunnelSnapshot {
            cluster: self.cluster.clone(),
            namespace: self.forward.namespace.clone(),
            service: self.forward.service.clone(),
            local_port: self.forward.local_port,
            remote_port: self.forward.remote_port,
            has_backup: self.forward.db_backup.is_some(),
            state: state.state,
            last_error: state.last_error.clone(),
            last_probe_at: state.last_probe_at,
            reconnect_at: state.reconnect_at,
            retry_count: state.retry_count,
            backup: state.backup.clone(),
        }
    }

    pub fn state(&self) -> ForwardState {
        self.state.read().state
    }

    pub fn last_error(&self) -> String {
        self.state.read().last_error.clone()
    }

    /// Asks the owning supervisor to tear down the current attempt and
    /// reconnect. Safe to call from any task; a no-op between attempts.
    pub fn request_reconnect(&self) {
        self.attempt.lock().cancel();
    }

    pub(crate) fn mark_probed(&self) {
        self.state.write().last_probe_at = Some(Local::now());
    }

    pub fn set_backup_pending(&self) {
        self.state.write().backup = BackupStatus::Pending;
    }

    pub fn set_backup_running(&self) {
        self.state.write().backup = BackupStatus::Running;
    }

    pub fn set_backup_completed(&self, size_mb: f64) {
        self.state.write().backup = BackupStatus::Completed { size_mb };
    }

    pub fn set_backup_failed(&self, error: String) {
        self.state.write().backup = BackupStatus::Failed { error };
    }

    pub(crate) fn install_attempt(&self, token: CancellationToken) {
        *self.attempt.lock() = token;
    }

    fn retry_count(&self) -> u32 {
        self.state.read().retry_count
    }

    pub(crate) fn set_starting(&self) {
        self.state.write().state = ForwardState::Starting;
    }

    pub(crate) fn set_active(&self) {
        let mut state = self.state.write();
        state.state = ForwardState::Active;
        state.last_error.clear();
        state.retry_count = 0;
        state.reconnect_at = None;
    }

    pub(crate) fn set_reconnecting(&self, error: &str, delay: Duration) -> u32 {
        let mut state = self.state.write();
        state.state = ForwardState::Reconnecting;
        state.last_error = error.to_string();
        state.reconnect_at =
            Some(Local::now() + TimeDelta::from_std(delay).unwrap_or_default());
        state.retry_count += 1;
        state.retry_count
    }

    pub(crate) fn set_failed(&self, error: &str) {
        let mut state = self.state.write();
        state.state = ForwardState::Failed;
        state.last_error = error.to_string();
    }

    pub(crate) fn set_stopped(&self) {
        self.state.write().state = ForwardState::Stopped;
    }
}

/// Bounded, lossy, single-consumer stream of record references. Publication
/// never blocks: when the consumer lags 100 updates behind, new ones are
/// dropped and the consumer resyncs on its own tick.
#[derive(Clone)]
pub struct UpdateBus {
    tx: mpsc::Sender<Arc<TunnelRecord>>,
}

impl UpdateBus {
    fn new() -> (Self, mpsc::Receiver<Arc<TunnelRecord>>) {
        let (tx, rx) = mpsc::channel(UPDATE_BUS_CAPACITY);
        (Self { tx }, rx)
    }

    pub fn publish(&self, record: &Arc<TunnelRecord>) {
        let _ = self.tx.try_send(record.clone());
    }
}

/// Wait before the next reconnect attempt: `reconnect_delay` for the first
/// failure, then `2^retry_count` seconds capped at 60.
pub fn backoff_delay(reconnect_delay: Duration, retry_count: u32) -> Duration {
    if retry_count == 0 {
        return reconnect_delay;
    }
    Duration::from_secs(1u64 << retry_count.min(6)).min(MAX_BACKOFF)
}

pub struct ForwardManager {
    records: Vec<Arc<TunnelRecord>>,
    bindings: HashMap<String, ClusterBinding>,
    bus: UpdateBus,
    updates: Mutex<Option<mpsc::Receiver<Arc<TunnelRecord>>>>,
    shutdown: CancellationToken,
    check_interval: Duration,
    reconnect_delay: Duration,
}

impl ForwardManager {
    /// Resolves every cluster binding and creates one record per configured
    /// forward. Kubeconfig failures here are fatal.
    pub async fn init(config: &Config) -> Result<Self> {
        let mut bindings = HashMap::new();
        let mut records = Vec::with_capacity(config.forward_count());

        for cluster in &config.clusters {
            let binding = k8s::resolve_cluster(cluster).await?;
            info!(cluster = %cluster.name, server = %binding.server, "resolved cluster binding");
            bindings.insert(cluster.name.clone(), binding);

            for forward in &cluster.forwards {
                records.push(Arc::new(TunnelRecord::new(
                    cluster.name.clone(),
                    forward.clone(),
                )));
            }
        }

        let (bus, updates) = UpdateBus::new();

        Ok(Self {
            records,
            bindings,
            bus,
            updates: Mutex::new(Some(updates)),
            shutdown: CancellationToken::new(),
            check_interval: config.check_interval,
            reconnect_delay: config.reconnect_delay,
        })
    }

    /// Spawns one supervisor task per record plus the health monitor.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::with_capacity(self.records.len() + 1);

        for record in &self.records {
            let Some(binding) = self.bindings.get(&record.cluster) else {
                error!(cluster = %record.cluster, "no binding for cluster, forward cannot run");
                record.set_failed(&format!("no cluster binding for '{}'", record.cluster));
                self.bus.publish(record);
                continue;
            };
            tasks.push(tokio::spawn(supervise(
                record.clone(),
                binding.clone(),
                self.bus.clone(),
                self.reconnect_delay,
                self.shutdown.clone(),
            )));
        }

        tasks.push(health::spawn_monitor(
            self.records.clone(),
            self.check_interval,
            self.shutdown.clone(),
        ));

        tasks
    }

    pub fn records(&self) -> &[Arc<TunnelRecord>] {
        &self.records
    }

    pub fn binding(&self, cluster: &str) -> Option<&ClusterBinding> {
        self.bindings.get(cluster)
    }

    pub fn snapshot(&self) -> Vec<TunnelSnapshot> {
        self.records.iter().map(|record| record.snapshot()).collect()
    }

    /// The single consumer's end of the update bus. Yields `None` once taken.
    pub fn take_updates(&self) -> Option<mpsc::Receiver<Arc<TunnelRecord>>> {
        self.updates.lock().take()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

enum AttemptEnd {
    Failed(String),
    Shutdown,
}

/// Drives one record through its state machine for the process lifetime.
/// All per-tunnel errors are absorbed here; retries are unbounded.
async fn supervise(
    record: Arc<TunnelRecord>,
    binding: ClusterBinding,
    bus: UpdateBus,
    reconnect_delay: Duration,
    shutdown: CancellationToken,
) {
    while !shutdown.is_cancelled() {
        let attempt = CancellationToken::new();
        record.install_attempt(attempt.clone());

        match run_attempt(&record, &binding, attempt, &bus, &shutdown).await {
            AttemptEnd::Shutdown => break,
            AttemptEnd::Failed(error) => {
                let delay = backoff_delay(reconnect_delay, record.retry_count());
                let retry_count = record.set_reconnecting(&error, delay);
                bus.publish(&record);
                warn!(
                    cluster = %record.cluster,
                    namespace = %record.forward.namespace,
                    service = %record.forward.service,
                    error = %error,
                    retry_in = ?delay,
                    retry_count,
                    "port-forward failed, will retry"
                );

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.cancelled() => break,
                }
            }
        }
    }

    record.set_stopped();
    bus.publish(&record);
    info!(
        cluster = %record.cluster,
        namespace = %record.forward.namespace,
        service = %record.forward.service,
        "supervisor stopped"
    );
}

async fn run_attempt(
    record: &Arc<TunnelRecord>,
    binding: &ClusterBinding,
    attempt: CancellationToken,
    bus: &UpdateBus,
    shutdown: &CancellationToken,
) -> AttemptEnd {
    record.set_starting();
    bus.publish(record);

    let pod_name = tokio::select! {
        resolved = k8s::resolve_target(&binding.client, &record.forward) => match resolved {
            Ok(name) => name,
            Err(error) => return AttemptEnd::Failed(format!("failed to find pod: {error}")),
        },
        _ = shutdown.cancelled() => return AttemptEnd::Shutdown,
    };

    let conn = tokio::select! {
        opened = engine::open(binding, &record.forward, &pod_name, attempt.clone()) => match opened {
            Ok(conn) => conn,
            Err(error) => return AttemptEnd::Failed(error.to_string()),
        },
        _ = shutdown.cancelled() => return AttemptEnd::Shutdown,
    };

    record.set_active();
    bus.publish(record);
    info!(
        cluster = %record.cluster,
        namespace = %record.forward.namespace,
        service = %record.forward.service,
        local_port = record.forward.local_port,
        remote_port = record.forward.remote_port,
        pod = %pod_name,
        "port-forward established"
    );

    tokio::select! {
        finished = conn.run() => match finished {
            // A clean engine exit means the attempt token fired under us,
            // which outside of shutdown is the probe kicking the tunnel.
            Ok(()) => AttemptEnd::Failed("connection reset by health probe".to_string()),
            Err(error) => AttemptEnd::Failed(error.to_string()),
        },
        _ = shutdown.cancelled() => {
            attempt.cancel();
            AttemptEnd::Shutdown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TargetKind;

    fn forward(local_port: u16) -> ForwardConfig {
        ForwardConfig {
            namespace: "default".to_string(),
            service: "api".to_string(),
            kind: TargetKind::Service,
            local_port,
            remote_port: 80,
            db_backup: None,
        }
    }

    fn record() -> Arc<TunnelRecord> {
        Arc::new(TunnelRecord::new("staging".to_string(), forward(18080)))
    }

    #[test]
    fn backoff_first_wait_is_reconnect_delay() {
        let delay = Duration::from_secs(5);
        assert_eq!(backoff_delay(delay, 0), Duration::from_secs(5));
    }

    #[test]
    fn backoff_grows_exponentially_to_the_cap() {
        let delay = Duration::from_secs(5);
        let waits: Vec<u64> = (0..9)
            .map(|count| backoff_delay(delay, count).as_secs())
            .collect();
        assert_eq!(waits, vec![5, 2, 4, 8, 16, 32, 60, 60, 60]);
    }

    #[test]
    fn backoff_stays_capped_for_large_counts() {
        assert_eq!(
            backoff_delay(Duration::from_secs(5), 40),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn new_record_starts_clean() {
        let record = record();
        let snapshot = record.snapshot();
        assert_eq!(snapshot.state, ForwardState::Starting);
        assert!(snapshot.last_error.is_empty());
        assert_eq!(snapshot.retry_count, 0);
        assert!(snapshot.last_probe_at.is_none());
        assert!(snapshot.reconnect_at.is_none());
        assert_eq!(snapshot.backup, BackupStatus::None);
    }

    #[test]
    fn reconnecting_records_error_and_bumps_retries() {
        let record = record();
        let count = record.set_reconnecting("dial failed", Duration::from_secs(5));
        assert_eq!(count, 1);

        let snapshot = record.snapshot();
        assert_eq!(snapshot.state, ForwardState::Reconnecting);
        assert_eq!(snapshot.last_error, "dial failed");
        assert!(snapshot.reconnect_at.is_some());

        assert_eq!(record.set_reconnecting("dial failed", Duration::from_secs(2)), 2);
    }

    #[test]
    fn active_entry_resets_retries_and_clears_error() {
        let record = record();
        record.set_reconnecting("dial failed", Duration::from_secs(5));
        record.set_reconnecting("dial failed", Duration::from_secs(2));
        record.set_active();

        let snapshot = record.snapshot();
        assert_eq!(snapshot.state, ForwardState::Active);
        assert!(snapshot.last_error.is_empty());
        assert_eq!(snapshot.retry_count, 0);
        assert!(snapshot.reconnect_at.is_none());
    }

    #[test]
    fn error_is_empty_exactly_when_active() {
        let record = record();
        record.set_reconnecting("boom", Duration::from_secs(1));
        assert!(!record.last_error().is_empty());

        record.set_starting();
        assert_eq!(record.state(), ForwardState::Starting);
        assert!(!record.last_error().is_empty());

        record.set_active();
        assert!(record.last_error().is_empty());
    }

    #[test]
    fn reconnect_request_fires_the_installed_token() {
        let record = record();
        let first = CancellationToken::new();
        record.install_attempt(first.clone());

        record.request_reconnect();
        assert!(first.is_cancelled());

        let second = CancellationToken::new();
        record.install_attempt(second.clone());
        let third = CancellationToken::new();
        record.install_attempt(third.clone());

        record.request_reconnect();
        assert!(!second.is_cancelled());
        assert!(third.is_cancelled());
    }

    #[test]
    fn failed_records_keep_their_error() {
        let record = record();
        record.set_failed("no cluster binding for 'staging'");
        let snapshot = record.snapshot();
        assert_eq!(snapshot.state, ForwardState::Failed);
        assert_eq!(snapshot.last_error, "no cluster binding for 'staging'");
    }

    #[test]
    fn backup_status_transitions() {
        let record = record();
        record.set_backup_pending();
        assert_eq!(record.snapshot().backup, BackupStatus::Pending);

        record.set_backup_running();
        assert_eq!(record.snapshot().backup, BackupStatus::Running);

        record.set_backup_completed(2.5);
        assert!(matches!(
            record.snapshot().backup,
            BackupStatus::Completed { size_mb } if (size_mb - 2.5).abs() < f64::EPSILON
        ));

        record.set_backup_failed("pg_dump failed".to_string());
        assert!(matches!(
            record.snapshot().backup,
            BackupStatus::Failed { error } if error == "pg_dump failed"
        ));
    }

    #[tokio::test]
    async fn bus_drops_updates_when_full() {
        let (bus, mut rx) = UpdateBus::new();
        let record = record();

        for _ in 0..UPDATE_BUS_CAPACITY + 20 {
            bus.publish(&record);
        }

        let mut delivered = 0;
        while rx.try_recv().is_ok() {
            delivered += 1;
        }
        assert_eq!(delivered, UPDATE_BUS_CAPACITY);
    }

    #[tokio::test]
    async fn bus_preserves_publication_order() {
        let (bus, mut rx) = UpdateBus::new();
        let first = record();
        let second = Arc::new(TunnelRecord::new("staging".to_string(), forward(18081)));

        bus.publish(&first);
        bus.publish(&second);

        let got = rx.try_recv().expect("first update");
        assert_eq!(got.forward.local_port, 18080);
        let got = rx.try_recv().expect("second update");
        assert_eq!(got.forward.local_port, 18081);
    }
}
