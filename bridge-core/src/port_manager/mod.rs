// bridge-core/src/port_manager/mod.rs
//
// Centralized port governance: range validation, TCP-level liveness probing,
// the process-wide allocation registry, the discovery scan mutex, and
// registration-file staleness hygiene. Probing failures are non-fatal and
// return false; registry conflicts are reported, never raised.

use crate::models::EaRegistration;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::task::JoinSet;


/// Design-fixed ZMQ data ports. Command = data+1, control = data+2.
pub const ZMQ_DATA_PORTS: [u16; 4] = [51810, 51820, 51830, 51840];
/// Fallback range for the webrequest proxy.
pub const PROXY_FALLBACK_PORTS: std::ops::RangeInclusive<u16> = 9089..=9099;
/// Fixed HTTP ports of the terminal-side agents.
pub const AGENT_HTTP_PORTS: [u16; 2] = [5101, 5102];

/// A registration older than this is a stale candidate.
const STALE_REGISTRATION_AGE: Duration = Duration::from_secs(5 * 60);
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(50);
const DEFAULT_SCAN_MUTEX_TIMEOUT: Duration = Duration::from_secs(30);

pub fn is_valid_port(port: u16) -> bool {
    port >= 1024
}

pub fn is_valid_zmq_data_port(port: u16) -> bool {
    ZMQ_DATA_PORTS.contains(&port)
}

pub fn is_valid_zmq_port_pair(data: u16, command: u16) -> bool {
    is_valid_zmq_data_port(data) && command == data + 1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortOwner {
    #[serde(rename = "zmq-data")]
    ZmqData,
    #[serde(rename = "zmq-command")]
    ZmqCommand,
    #[serde(rename = "webrequest-proxy")]
    WebrequestProxy,
    #[serde(rename = "agent-mt")]
    AgentMt,
    #[serde(rename = "agent-ct")]
    AgentCt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortAllocation {
    pub port: u16,
    pub owner: PortOwner,
    pub label: String,
    pub allocated_at: DateTime<Utc>,
    pub verified: bool,
}

/// Returned when `allocate` finds the port already taken.
#[derive(Debug, Clone)]
pub struct PortConflict {
    pub port: u16,
    pub existing_owner: PortOwner,
    pub existing_label: String,
    pub requested_owner: PortOwner,
    pub requested_label: String,
}

/// Liveness classification of one registration file.
#[derive(Debug)]
pub struct RegistrationValidation {
    pub path: PathBuf,
    pub registration: EaRegistration,
    pub alive: bool,
    pub stale: bool,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct ScanResult {
    pub port: u16,
    pub alive: bool,
}

pub struct PortManager {
    registry: RwLock<HashMap<u16, PortAllocation>>,
    scan_lock: Arc<Mutex<()>>,
    probe_timeout: Duration,
    scan_mutex_timeout: Duration,
    probe_host: String,
}

impl Default for PortManager {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT, DEFAULT_SCAN_MUTEX_TIMEOUT)
    }
}

impl PortManager {
    pub fn new(probe_timeout: Duration, scan_mutex_timeout: Duration) -> Self {
        Self {
            registry: RwLock::new(HashMap::new()),
            scan_lock: Arc::new(Mutex::new(())),
            probe_timeout,
            scan_mutex_timeout,
            probe_host: "127.0.0.1".to_string(),
        }
    }

    pub fn from_config(config: &crate::config::ZeroMqConfig) -> Self {
        Self::new(
            Duration::from_millis(config.probe_timeout_ms),
            DEFAULT_SCAN_MUTEX_TIMEOUT,
        )
    }

    /// True iff a TCP connect to the port succeeds within the probe timeout.
    /// No protocol exchange; a listening socket is enough.
    pub async fn tcp_probe(&self, port: u16) -> bool {
        self.tcp_probe_host(port, &self.probe_host.clone()).await
    }

    pub async fn tcp_probe_host(&self, port: u16, host: &str) -> bool {
        let addr = format!("{}:{}", host, port);
        matches!(
            tokio::time::timeout(self.probe_timeout, tokio::net::TcpStream::connect(&addr)).await,
            Ok(Ok(_))
        )
    }

    /// True iff the port can be bound locally (nothing is listening on it).
    pub fn is_port_available(&self, port: u16) -> bool {
        std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
    }

    /// Sequential bind-probe over [start, end], skipping allocated ports.
    pub async fn find_available_port(&self, start: u16, end: u16) -> Option<u16> {
        let registry = self.registry.read().await;
        for port in start..=end {
            if registry.contains_key(&port) {
                continue;
            }
            if self.is_port_available(port) {
                return Some(port);
            }
        }
        None
    }

    /// Insert into the registry. Returns the conflict descriptor iff the port
    /// is already allocated; the existing allocation is left untouched.
    pub async fn allocate(
        &self,
        port: u16,
        owner: PortOwner,
        label: &str,
    ) -> Option<PortConflict> {
        let mut registry = self.registry.write().await;
        if let Some(existing) = registry.get(&port) {
            tracing::warn!(
                "Port {} already allocated to {:?} ({}), requested by {:?} ({})",
                port,
                existing.owner,
                existing.label,
                owner,
                label
            );
            return Some(PortConflict {
                port,
                existing_owner: existing.owner,
                existing_label: existing.label.clone(),
                requested_owner: owner,
                requested_label: label.to_string(),
            });
        }
        registry.insert(
            port,
            PortAllocation {
                port,
                owner,
                label: label.to_string(),
                allocated_at: Utc::now(),
                verified: false,
            },
        );
        None
    }

    /// Idempotent removal.
    pub async fn release(&self, port: u16) {
        self.registry.write().await.remove(&port);
    }

    /// Idempotent removal of every allocation carrying the label.
    pub async fn release_by_label(&self, label: &str) {
        self.registry
            .write()
            .await
            .retain(|_, alloc| alloc.label != label);
    }

    /// Flag that a responding peer has been observed on the port.
    pub async fn mark_verified(&self, port: u16) {
        if let Some(alloc) = self.registry.write().await.get_mut(&port) {
            alloc.verified = true;
        }
    }

    pub async fn allocation(&self, port: u16) -> Option<PortAllocation> {
        self.registry.read().await.get(&port).cloned()
    }

    pub async fn allocations(&self) -> Vec<PortAllocation> {
        self.registry.read().await.values().cloned().collect()
    }

    /// Acquire the discovery scan mutex. Waits up to the configured timeout;
    /// expiry returns None so callers can fall back to stale data.
    pub async fn acquire_scan_lock(&self) -> Option<OwnedMutexGuard<()>> {
        match tokio::time::timeout(
            self.scan_mutex_timeout,
            self.scan_lock.clone().lock_owned(),
        )
        .await
        {
            Ok(guard) => Some(guard),
            Err(_) => {
                tracing::warn!(
                    "Scan mutex not acquired within {:?}; another scan is stuck",
                    self.scan_mutex_timeout
                );
                None
            }
        }
    }

    /// Classify registrations as alive/stale: stale when the file is older
    /// than five minutes, alive when the data (or command) port TCP-probes.
    pub async fn validate_registrations(
        &self,
        entries: Vec<(PathBuf, EaRegistration)>,
    ) -> Vec<RegistrationValidation> {
        let mut results = Vec::with_capacity(entries.len());
        for (path, registration) in entries {
            let stale = file_age(&path)
                .map(|age| age > STALE_REGISTRATION_AGE)
                .unwrap_or(false);
            let alive = match registration.probe_port() {
                Some(port) => self.tcp_probe(port).await,
                None => false,
            };
            let warnings = registration.validate().unwrap_or_default();
            for warning in &warnings {
                tracing::warn!("Registration {}: {}", registration.login, warning);
            }
            results.push(RegistrationValidation {
                path,
                registration,
                alive,
                stale,
                warnings,
            });
        }
        results
    }

    /// Delete registration files that are both stale and whose port fails the
    /// TCP probe. File-read errors are swallowed; a broken file is not a
    /// reason to abort discovery.
    pub async fn clean_stale_registrations(&self, dir: &Path) -> usize {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(_) => return 0,
        };

        let mut deleted = 0;
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let stale = match file_age(&path) {
                Some(age) => age > STALE_REGISTRATION_AGE,
                None => continue,
            };
            if !stale {
                continue;
            }
            let registration = match crate::models::read_registration_file(&path) {
                Ok(reg) => reg,
                Err(_) => continue,
            };
            let dead = match registration.probe_port() {
                Some(port) => !self.tcp_probe(port).await,
                None => true,
            };
            if dead {
                match std::fs::remove_file(&path) {
                    Ok(_) => {
                        tracing::info!(
                            "Removed stale registration {} ({})",
                            path.display(),
                            registration.login
                        );
                        deleted += 1;
                    }
                    Err(e) => {
                        tracing::warn!(
                            "Failed to remove stale registration {}: {}",
                            path.display(),
                            e
                        );
                    }
                }
            }
        }
        deleted
    }

    /// Parallel TCP probe across all candidate ports.
    pub async fn discover_live_ports(&self, candidates: &[u16]) -> Vec<ScanResult> {
        let mut set = JoinSet::new();
        for &port in candidates {
            let timeout = self.probe_timeout;
            let host = self.probe_host.clone();
            set.spawn(async move {
                let addr = format!("{}:{}", host, port);
                let alive = matches!(
                    tokio::time::timeout(timeout, tokio::net::TcpStream::connect(&addr)).await,
                    Ok(Ok(_))
                );
                ScanResult { port, alive }
            });
        }

        let mut results = Vec::with_capacity(candidates.len());
        while let Some(joined) = set.join_next().await {
            if let Ok(result) = joined {
                results.push(result);
            }
        }
        results.sort_by_key(|r| r.port);
        results
    }

    /// Pair-wise collision check across configured subsystems. Warnings only;
    /// startup proceeds regardless.
    pub fn detect_startup_conflicts(&self, known_ports: &[(u16, &str)]) -> Vec<(u16, String)> {
        let mut conflicts = Vec::new();
        for (i, (port_a, label_a)) in known_ports.iter().enumerate() {
            for (port_b, label_b) in &known_ports[i + 1..] {
                if port_a == port_b {
                    tracing::warn!(
                        "Startup port collision: {} and {} both configured for port {}",
                        label_a,
                        label_b,
                        port_a
                    );
                    conflicts.push((*port_a, format!("{} vs {}", label_a, label_b)));
                }
            }
        }
        conflicts
    }
}

fn file_age(path: &Path) -> Option<Duration> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    std::time::SystemTime::now().duration_since(modified).ok()
}

/// Read every parseable registration file in the directory.
pub fn read_registration_dir(dir: &Path) -> Result<Vec<(PathBuf, EaRegistration)>> {
    let mut out = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!("Registration directory {} unreadable: {}", dir.display(), e);
            return Ok(out);
        }
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match crate::models::read_registration_file(&path) {
            Ok(reg) => out.push((path, reg)),
            Err(e) => {
                tracing::warn!("Skipping unreadable registration {}: {}", path.display(), e);
            }
        }
    }
    Ok(out)
}
