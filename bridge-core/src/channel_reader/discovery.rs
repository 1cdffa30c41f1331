// bridge-core/src/channel_reader/discovery.rs
//
// Discovery and connection establishment: registration-file scan, candidate
// probing, bridge creation, and the PING/STATUS fallback for masters whose
// PUB stream stays quiet. At most one scan runs at a time; concurrent
// callers get the cached result.

use super::{ChannelReader, TerminalLink};
use crate::bridge::{BridgeOptions, ZmqBridge};
use crate::models::{EaRegistration, TerminalCommand, TerminalRole};
use crate::port_manager::{read_registration_dir, PortOwner};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

const FIRST_EVENT_WAIT: Duration = Duration::from_secs(3);

/// Options for an explicit (non-discovered) connect.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub host: String,
    pub data_port: Option<u16>,
    pub command_port: u16,
    pub control_port: Option<u16>,
    pub curve_enabled: bool,
    pub curve_server_key: Option<String>,
}

impl ConnectOptions {
    pub fn master(data_port: u16, command_port: u16) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            data_port: Some(data_port),
            command_port,
            control_port: None,
            curve_enabled: false,
            curve_server_key: None,
        }
    }

    pub fn slave(command_port: u16) -> Self {
        Self {
            data_port: None,
            ..Self::master(0, command_port)
        }
    }

    fn from_registration(registration: &EaRegistration) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            data_port: registration.data_port,
            command_port: registration.command_port.unwrap_or_default(),
            control_port: registration.derived_control_port(),
            curve_enabled: registration.curve_enabled.unwrap_or(false),
            curve_server_key: registration.curve_public_key.clone(),
        }
    }

    fn resolved_control_port(&self, role: TerminalRole) -> Option<u16> {
        if self.control_port.is_some() {
            return self.control_port;
        }
        match role {
            TerminalRole::Master => self.data_port.map(|p| p + 2),
            TerminalRole::Slave => Some(self.command_port + 1),
        }
    }

    fn probe_port(&self) -> u16 {
        self.data_port.unwrap_or(self.command_port)
    }
}

struct Candidate {
    terminal_id: String,
    role: TerminalRole,
    options: ConnectOptions,
}

impl ChannelReader {
    /// Discover terminals and connect to every live one. Returns the ids of
    /// all connected terminals (existing and new).
    pub async fn scan_and_connect(self: &Arc<Self>, force: bool) -> Vec<String> {
        let cache_ttl = Duration::from_millis(self.config.discovery.scan_cache_ms);

        if !force {
            if let Some(result) = self.cached_scan(cache_ttl).await {
                return result;
            }
        }

        let _guard = match self.port_manager.acquire_scan_lock().await {
            Some(guard) => guard,
            None => {
                // lock wait expired: let the caller proceed with stale data
                let cache = self.scan_cache.lock().await;
                return cache
                    .as_ref()
                    .map(|(_, result)| result.clone())
                    .unwrap_or_default();
            }
        };

        // A concurrent caller may have finished a full scan while this one
        // waited on the mutex; its result is still fresh.
        if !force {
            if let Some(result) = self.cached_scan(cache_ttl).await {
                return result;
            }
        }

        let result = self.run_scan().await;
        *self.scan_cache.lock().await = Some((Instant::now(), result.clone()));
        result
    }

    async fn cached_scan(&self, ttl: Duration) -> Option<Vec<String>> {
        let cache = self.scan_cache.lock().await;
        match &*cache {
            Some((at, result)) if at.elapsed() < ttl => Some(result.clone()),
            _ => None,
        }
    }

    async fn run_scan(self: &Arc<Self>) -> Vec<String> {
        let dir = self.registration_dir.clone();
        self.port_manager.clean_stale_registrations(&dir).await;

        let entries = read_registration_dir(&dir).unwrap_or_default();
        let mut candidates: Vec<Candidate> = Vec::new();
        for (path, registration) in entries {
            match registration.validate() {
                Ok(warnings) => {
                    for warning in warnings {
                        tracing::warn!("Registration {}: {}", path.display(), warning);
                    }
                    candidates.push(Candidate {
                        terminal_id: registration.terminal_id().to_string(),
                        role: registration.role,
                        options: ConnectOptions::from_registration(&registration),
                    });
                }
                Err(e) => {
                    tracing::warn!("Skipping registration {}: {}", path.display(), e);
                }
            }
        }

        // No registrations at all: fall back to the bounded list of known
        // port pairs so bare terminals are still discoverable.
        if candidates.is_empty() {
            tracing::debug!("No registrations found; probing fallback port pairs");
            for &(data, command) in &self.config.discovery.fallback_port_pairs {
                candidates.push(Candidate {
                    terminal_id: format!("terminal-{}", data),
                    role: TerminalRole::Master,
                    options: ConnectOptions::master(data, command),
                });
            }
        }

        let mut connected: Vec<String> = Vec::new();
        let mut to_probe: Vec<Candidate> = Vec::new();

        for candidate in candidates {
            let existing = self
                .links
                .read()
                .await
                .get(&candidate.terminal_id)
                .cloned();
            match existing {
                Some(link) if link.is_alive() => {
                    connected.push(candidate.terminal_id.clone());
                }
                Some(_) => {
                    // socket open but silent: stale, rebuild from scratch
                    tracing::info!("[{}] Stale link, reconnecting", candidate.terminal_id);
                    self.safe_disconnect(&candidate.terminal_id).await;
                    to_probe.push(candidate);
                }
                None => to_probe.push(candidate),
            }
        }

        // Parallel TCP probe; dead candidates are dropped.
        let probe_ports: Vec<u16> = to_probe.iter().map(|c| c.options.probe_port()).collect();
        let scan = self.port_manager.discover_live_ports(&probe_ports).await;
        let live_ports: HashSet<u16> =
            scan.iter().filter(|r| r.alive).map(|r| r.port).collect();

        for candidate in to_probe {
            if !live_ports.contains(&candidate.options.probe_port()) {
                continue;
            }
            let attached = match candidate.role {
                TerminalRole::Master => {
                    self.attach_master(&candidate.terminal_id, candidate.options)
                        .await
                }
                TerminalRole::Slave => {
                    self.attach_slave(&candidate.terminal_id, candidate.options)
                        .await
                }
            };
            if attached {
                connected.push(candidate.terminal_id);
            }
        }

        tracing::info!("Scan complete: {} terminal(s) connected", connected.len());
        connected
    }

    /// Explicit master connect, bypassing discovery.
    pub async fn connect(self: &Arc<Self>, terminal_id: &str, options: ConnectOptions) -> bool {
        *self.scan_cache.lock().await = None;
        self.attach_master(terminal_id, options).await
    }

    /// Explicit slave connect, bypassing discovery.
    pub async fn connect_slave(
        self: &Arc<Self>,
        terminal_id: &str,
        options: ConnectOptions,
    ) -> bool {
        *self.scan_cache.lock().await = None;
        self.attach_slave(terminal_id, options).await
    }

    /// Attach a pipe-transport terminal under the configured endpoint prefix.
    pub async fn connect_pipe(self: &Arc<Self>, terminal_id: &str) -> bool {
        let endpoints =
            crate::pipe::PipeEndpoints::for_terminal(&self.config.pipe.name_prefix, terminal_id);
        let options = crate::pipe::PipeOptions {
            reconnect_interval: Duration::from_millis(self.config.pipe.reconnect_interval_ms),
            command_timeout: Duration::from_millis(self.config.pipe.command_timeout_ms),
            staleness: Duration::from_millis(self.config.zeromq.staleness_ms),
        };
        let client = Arc::new(crate::pipe::PipeClient::new(
            terminal_id,
            endpoints,
            options,
            self.signal_tx.clone(),
        ));
        client.start();
        self.links
            .write()
            .await
            .insert(terminal_id.to_string(), TerminalLink::Pipe(client));
        *self.scan_cache.lock().await = None;
        true
    }

    /// Alias for `safe_disconnect`; the graceful path is the only path.
    pub async fn disconnect(&self, terminal_id: &str) {
        self.safe_disconnect(terminal_id).await;
    }

    fn bridge_options(&self, options: &ConnectOptions, mode_master: bool) -> BridgeOptions {
        let mut bridge = if mode_master {
            BridgeOptions::master(
                &options.host,
                options.data_port.unwrap_or_default(),
                options.command_port,
            )
        } else {
            BridgeOptions::slave(&options.host, options.command_port)
        };
        bridge.curve_enabled = options.curve_enabled;
        bridge.curve_server_key = options.curve_server_key.clone();
        bridge.command_timeout = Duration::from_millis(self.config.zeromq.command_timeout_ms);
        bridge.reconnect_interval =
            Duration::from_millis(self.config.zeromq.reconnect_interval_ms);
        bridge.staleness = Duration::from_millis(self.config.zeromq.staleness_ms);
        bridge
    }

    async fn attach_master(self: &Arc<Self>, terminal_id: &str, options: ConnectOptions) -> bool {
        let data_port = match options.data_port {
            Some(port) => port,
            None => {
                tracing::warn!("[{}] Master connect without a data port", terminal_id);
                return false;
            }
        };

        if self
            .port_manager
            .allocate(data_port, PortOwner::ZmqData, terminal_id)
            .await
            .is_some()
        {
            return false;
        }
        if self
            .port_manager
            .allocate(options.command_port, PortOwner::ZmqCommand, terminal_id)
            .await
            .is_some()
        {
            self.port_manager.release(data_port).await;
            return false;
        }

        let bridge = Arc::new(ZmqBridge::new(
            terminal_id,
            self.bridge_options(&options, true),
            self.signal_tx.clone(),
        ));
        if let Err(e) = bridge.start() {
            tracing::error!("[{}] Bridge start failed: {}", terminal_id, e);
            self.port_manager.release_by_label(terminal_id).await;
            return false;
        }
        self.links
            .write()
            .await
            .insert(terminal_id.to_string(), TerminalLink::Zmq(bridge.clone()));

        if let Some(control_port) = options.resolved_control_port(TerminalRole::Master) {
            let _ = self.control.open_channel(terminal_id, control_port);
        }

        // Wait for the first PUB frame; quiet masters get the PING/STATUS
        // fallback before being declared dead.
        let deadline = Instant::now() + FIRST_EVENT_WAIT;
        while Instant::now() < deadline && !bridge.has_received() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        if !bridge.has_received() {
            tracing::debug!(
                "[{}] No PUB traffic within {:?}, falling back to PING",
                terminal_id,
                FIRST_EVENT_WAIT
            );
            let ping = bridge.send_command(&TerminalCommand::Ping).await;
            if !ping.success {
                tracing::info!("[{}] PING failed, disconnecting", terminal_id);
                self.safe_disconnect(terminal_id).await;
                return false;
            }
            let status = bridge.send_command(&TerminalCommand::Status).await;
            if status.success {
                // synthetic CONNECTED with the full STATUS snapshot
                self.ingest_status_payload(&bridge, &status);
            }
            bridge.mark_alive();
        }

        self.port_manager.mark_verified(data_port).await;
        self.port_manager.mark_verified(options.command_port).await;
        true
    }

    async fn attach_slave(self: &Arc<Self>, terminal_id: &str, options: ConnectOptions) -> bool {
        if self
            .port_manager
            .allocate(options.command_port, PortOwner::ZmqCommand, terminal_id)
            .await
            .is_some()
        {
            return false;
        }

        let bridge = Arc::new(ZmqBridge::new(
            terminal_id,
            self.bridge_options(&options, false),
            self.signal_tx.clone(),
        ));
        if let Err(e) = bridge.start() {
            tracing::error!("[{}] Slave bridge start failed: {}", terminal_id, e);
            self.port_manager.release_by_label(terminal_id).await;
            return false;
        }
        self.links
            .write()
            .await
            .insert(terminal_id.to_string(), TerminalLink::Zmq(bridge.clone()));

        // Validate the command channel before committing to the poll loop.
        let status = bridge.send_command(&TerminalCommand::Status).await;
        if !status.success {
            tracing::info!(
                "[{}] Slave STATUS failed ({:?}), disconnecting",
                terminal_id,
                status.error
            );
            self.safe_disconnect(terminal_id).await;
            return false;
        }
        bridge.mark_alive();
        self.ingest_status_payload(&bridge, &status);

        if let Some(control_port) = options.resolved_control_port(TerminalRole::Slave) {
            let _ = self.control.open_channel(terminal_id, control_port);
        }
        self.port_manager.mark_verified(options.command_port).await;
        self.spawn_slave_poll(terminal_id);
        true
    }
}
