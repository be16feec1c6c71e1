use crate::binary::resolve_binary;
use crate::error::{ManagerError, Result};
use crate::importer::{self, ProfileImporter};
use crate::ports::{PortAllocator, PortRange, PortRequest};
use crate::store::{unix_now, ProfileRecord, StateDocument, StateStore, STATE_FILE_NAME};
use crate::supervisor::{LaunchSpec, ProcessHandle, Supervisor, SupervisorConfig};
use crate::wireguard;
use proxy_protocol::{
    AutoConnectFailure, AutoConnectReport, ConnectedProfile, ProfileEvent, ProfileState,
    ProfileSummary, ProxyType, SettingsView,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::{broadcast, Mutex, MutexGuard};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

const EVENT_CAPACITY: usize = 64;
pub const HEALTH_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_BIND_HOST: &str = "127.0.0.1";
pub const DEFAULT_SPAWN_GRACE: Duration = Duration::from_millis(250);
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Clone, Debug)]
pub struct ManagerConfig {
    pub data_dir: PathBuf,
    pub port_range: PortRange,
    pub bind_host: String,
    /// Fallback executable used when no path is saved in settings.
    pub binary: Option<PathBuf>,
    pub spawn_grace: Duration,
    pub stop_timeout: Duration,
}

impl ManagerConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            port_range: PortRange::default(),
            bind_host: DEFAULT_BIND_HOST.to_string(),
            binary: None,
            spawn_grace: DEFAULT_SPAWN_GRACE,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join(STATE_FILE_NAME)
    }

    pub fn profiles_dir(&self) -> PathBuf {
        self.data_dir.join("profiles")
    }

    pub fn run_dir(&self) -> PathBuf {
        self.data_dir.join("run")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ConnectOptions {
    pub port: Option<u16>,
    /// Stop whichever profile currently holds `port` and take it over.
    pub confirm_takeover: bool,
    pub allow_out_of_range: bool,
}

struct Inner {
    document: StateDocument,
    ports: PortAllocator,
    /// Profiles in `Connecting` or `Disconnecting`.
    transitions: HashMap<String, ProfileState>,
    handles: HashMap<String, ProcessHandle>,
}

impl Inner {
    fn record(&self, name: &str) -> Result<&ProfileRecord> {
        self.document
            .profile(name)
            .ok_or_else(|| ManagerError::ProfileNotFound(name.to_string()))
    }

    fn ensure_idle(&self, name: &str) -> Result<()> {
        if self.transitions.contains_key(name) {
            return Err(ManagerError::OperationInProgress(name.to_string()));
        }
        Ok(())
    }

    fn state_of(&self, name: &str) -> ProfileState {
        if let Some(state) = self.transitions.get(name) {
            return *state;
        }
        if self.handles.contains_key(name) {
            ProfileState::Running
        } else {
            ProfileState::Stopped
        }
    }

    fn active_count(&self) -> usize {
        let connecting = self
            .transitions
            .values()
            .filter(|state| **state == ProfileState::Connecting)
            .count();
        self.handles.len() + connecting
    }

    fn settings_view(&self) -> SettingsView {
        let range = self.ports.range();
        SettingsView {
            port_limit: self.document.port_limit,
            proxy_type: self.document.proxy_type,
            logging_enabled: self.document.logging_enabled,
            wireproxy_path: self.document.wireproxy_path.clone(),
            range_start: range.start(),
            range_end: range.end(),
        }
    }
}

/// Owns the profile registry and every wireproxy process started for it.
///
/// All mutations go through one async mutex. Process start and stop run with the lock
/// released; the `Connecting`/`Disconnecting` markers keep other operations off the
/// profile meanwhile.
pub struct ProfileManager {
    inner: Mutex<Inner>,
    store: StateStore,
    importer: ProfileImporter,
    supervisor: Supervisor,
    configured_binary: Option<PathBuf>,
    bind_host: String,
    events: broadcast::Sender<ProfileEvent>,
}

impl ProfileManager {
    pub fn open(config: ManagerConfig) -> Result<Self> {
        let store = StateStore::new(config.state_path());
        let loaded = store.load_or_recover()?;
        let document = loaded.document;
        let ports = PortAllocator::new(
            config.port_range,
            config.bind_host.clone(),
            document.port_limit,
        );
        let supervisor = Supervisor::new(SupervisorConfig {
            run_dir: config.run_dir(),
            log_dir: config.log_dir(),
            bind_host: config.bind_host.clone(),
            spawn_grace: config.spawn_grace,
            stop_timeout: config.stop_timeout,
        });
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        tracing::info!(
            state = %store.path().display(),
            profiles = document.profiles.len(),
            migrated_from = ?loaded.migrated_from,
            backup = ?loaded.backup.as_ref().map(|path| path.display().to_string()),
            "profile manager opened"
        );
        Ok(Self {
            inner: Mutex::new(Inner {
                document,
                ports,
                transitions: HashMap::new(),
                handles: HashMap::new(),
            }),
            store,
            importer: ProfileImporter::new(config.profiles_dir()),
            supervisor,
            configured_binary: config.binary,
            bind_host: config.bind_host,
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProfileEvent> {
        self.events.subscribe()
    }

    /// Address every wireproxy instance listens on.
    pub fn bind_host(&self) -> &str {
        &self.bind_host
    }

    /// Starts wireproxy for `name`. A running profile returns its current port.
    pub async fn connect(&self, name: &str, options: ConnectOptions) -> Result<u16> {
        let mut took_over = false;
        let (port, binary, wg_config, proxy_type, logging) = loop {
            let mut inner = self.inner.lock().await;
            inner.record(name)?;
            inner.ensure_idle(name)?;
            if let Some(handle) = inner.handles.get(name) {
                return Ok(handle.port());
            }
            let wg_config = self.importer.record_path(inner.record(name)?);
            if !wg_config.is_file() {
                return Err(ManagerError::InvalidConfig(format!(
                    "profile file {} is missing; run `wireproxy-ctl edit {name} <file>` to replace it",
                    wg_config.display()
                )));
            }
            if let Some(port) = options.port {
                let owner = inner
                    .ports
                    .owner_of(port)
                    .filter(|owner| *owner != name)
                    .map(str::to_string);
                if let Some(owner) = owner {
                    if !options.confirm_takeover || took_over {
                        return Err(ManagerError::PortConflict { port, owner });
                    }
                    drop(inner);
                    tracing::info!(profile = %name, owner = %owner, port, "taking over port");
                    self.disconnect(&owner).await?;
                    took_over = true;
                    continue;
                }
            }

            let binary = resolve_binary(
                inner.document.wireproxy_path.as_deref(),
                self.configured_binary.as_deref(),
            )?;
            let record = inner.record(name)?;
            let request = PortRequest {
                preferred: options.port,
                hint: record.last_port,
                allow_out_of_range: options.allow_out_of_range,
            };
            let proxy_type = record.effective_proxy_type(inner.document.proxy_type);
            let logging = inner.document.logging_enabled;
            let port = inner.ports.allocate(name, request)?;
            inner
                .transitions
                .insert(name.to_string(), ProfileState::Connecting);
            break (port, binary, wg_config, proxy_type, logging);
        };
        self.emit_state(name, ProfileState::Connecting, Some(port));

        let started = self
            .supervisor
            .start(LaunchSpec {
                profile: name,
                wg_config: &wg_config,
                binary: &binary,
                proxy_type,
                port,
                logging,
            })
            .await;

        let mut inner = self.inner.lock().await;
        inner.transitions.remove(name);
        let handle = match started {
            Ok(handle) => handle,
            Err(err) => {
                inner.ports.release(port);
                drop(inner);
                tracing::warn!(profile = %name, port, error = %err, "connect failed");
                self.emit_state(name, ProfileState::Stopped, None);
                return Err(err);
            }
        };
        let pid = handle.pid();
        inner.handles.insert(name.to_string(), handle);
        if let Some(record) = inner.document.profile_mut(name) {
            record.port = Some(port);
            record.running = true;
            record.pid = Some(pid);
            record.last_connected = Some(unix_now());
        }
        self.save_or_warn(&inner.document);
        drop(inner);
        tracing::info!(profile = %name, port, pid, "profile connected");
        self.emit_state(name, ProfileState::Running, Some(port));
        Ok(port)
    }

    /// Stops wireproxy for `name` and frees its port. A stopped profile is left as is.
    pub async fn disconnect(&self, name: &str) -> Result<()> {
        let handle = {
            let mut inner = self.inner.lock().await;
            inner.record(name)?;
            inner.ensure_idle(name)?;
            let Some(handle) = inner.handles.remove(name) else {
                return Ok(());
            };
            inner
                .transitions
                .insert(name.to_string(), ProfileState::Disconnecting);
            handle
        };
        let port = handle.port();
        self.emit_state(name, ProfileState::Disconnecting, Some(port));
        self.supervisor.stop(handle).await;

        let mut inner = self.inner.lock().await;
        inner.transitions.remove(name);
        inner.ports.release(port);
        if let Some(record) = inner.document.profile_mut(name) {
            record.mark_stopped();
        }
        self.save_or_warn(&inner.document);
        drop(inner);
        tracing::info!(profile = %name, port, "profile disconnected");
        self.emit_state(name, ProfileState::Stopped, None);
        Ok(())
    }

    /// Connects stopped profiles in name order until `port_limit` are active, starting
    /// at `from` when given. Failures are recorded and skipped; running out of ports ends
    /// the batch.
    pub async fn auto_connect_to_limit(
        &self,
        from: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<AutoConnectReport> {
        let candidates: Vec<String> = {
            let inner = self.inner.lock().await;
            if let Some(from) = from {
                inner.record(from)?;
            }
            let mut names: Vec<String> = inner
                .document
                .profiles
                .iter()
                .filter(|record| from.map_or(true, |from| record.name.as_str() >= from))
                .filter(|record| inner.state_of(&record.name) == ProfileState::Stopped)
                .map(|record| record.name.clone())
                .collect();
            names.sort();
            names
        };

        let mut report = AutoConnectReport::default();
        for name in candidates {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let (limit, active) = {
                let inner = self.inner.lock().await;
                (inner.document.port_limit, inner.active_count())
            };
            if limit > 0 && active >= limit as usize {
                break;
            }
            match self.connect(&name, ConnectOptions::default()).await {
                Ok(port) => report.connected.push(ConnectedProfile { name, port }),
                Err(err) => {
                    let exhausted = matches!(err, ManagerError::NoFreePort(_));
                    tracing::warn!(profile = %name, error = %err, "auto-connect skipped profile");
                    report.failed.push(AutoConnectFailure {
                        name,
                        kind: err.kind(),
                        message: err.to_string(),
                    });
                    if exhausted {
                        break;
                    }
                }
            }
        }
        tracing::info!(
            from,
            connected = report.connected.len(),
            failed = report.failed.len(),
            cancelled = report.cancelled,
            "auto-connect finished"
        );
        self.emit(ProfileEvent::AutoConnectFinished {
            report: report.clone(),
        });
        Ok(report)
    }

    pub async fn import(&self, config: &str, name: Option<&str>) -> Result<ProfileSummary> {
        let mut inner = self.inner.lock().await;
        let record = self.importer.import(&mut inner.document, config, name)?;
        self.commit_import(inner, record)
    }

    pub async fn import_file(&self, path: &Path) -> Result<ProfileSummary> {
        let mut inner = self.inner.lock().await;
        let record = self.importer.import_file(&mut inner.document, path)?;
        self.commit_import(inner, record)
    }

    /// First unused name derived from `base`, for retrying a duplicate import.
    pub async fn suggest_name(&self, base: &str) -> String {
        let inner = self.inner.lock().await;
        importer::suggest_name(&inner.document, base)
    }

    /// Registers profile files found in the profile directory but not in the state file.
    pub async fn discover(&self) -> Result<Vec<String>> {
        let mut inner = self.inner.lock().await;
        let found = self.importer.discover(&mut inner.document)?;
        if found.is_empty() {
            return Ok(found);
        }
        self.store.save(&inner.document)?;
        drop(inner);
        for name in &found {
            self.emit(ProfileEvent::Imported { name: name.clone() });
        }
        Ok(found)
    }

    /// Disconnects `name` if needed, then removes its config files and registry entry.
    pub async fn delete(&self, name: &str) -> Result<()> {
        if self.is_running(name).await? {
            self.disconnect(name).await?;
        }
        let mut inner = self.inner.lock().await;
        inner.ensure_idle(name)?;
        if inner.handles.contains_key(name) {
            return Err(ManagerError::OperationInProgress(name.to_string()));
        }
        let index = inner
            .document
            .profiles
            .iter()
            .position(|record| record.name == name)
            .ok_or_else(|| ManagerError::ProfileNotFound(name.to_string()))?;
        let record = inner.document.profiles.remove(index);
        if let Err(err) = self.store.save(&inner.document) {
            inner.document.profiles.insert(index, record);
            return Err(err);
        }
        drop(inner);
        if let Err(err) = self.importer.remove(&record) {
            tracing::warn!(profile = %name, error = %err, "failed to remove profile config");
        }
        self.supervisor.remove_generated_config(name);
        tracing::info!(profile = %name, "profile deleted");
        self.emit(ProfileEvent::Deleted {
            name: name.to_string(),
        });
        Ok(())
    }

    /// Replaces the WireGuard config of `name`, optionally renaming it. A running profile
    /// is disconnected first and left stopped.
    pub async fn edit(
        &self,
        name: &str,
        config: &str,
        new_name: Option<&str>,
    ) -> Result<ProfileSummary> {
        wireguard::validate(config)?;
        let new_name = new_name
            .map(str::trim)
            .filter(|candidate| !candidate.is_empty() && *candidate != name);
        if let Some(candidate) = new_name {
            importer::validate_name(candidate)?;
        }
        {
            let inner = self.inner.lock().await;
            inner.record(name)?;
            if let Some(candidate) = new_name.filter(|candidate| inner.document.contains(candidate)) {
                return Err(ManagerError::DuplicateProfile(candidate.to_string()));
            }
        }
        if self.is_running(name).await? {
            self.disconnect(name).await?;
        }

        let mut inner = self.inner.lock().await;
        inner.ensure_idle(name)?;
        if inner.handles.contains_key(name) {
            return Err(ManagerError::OperationInProgress(name.to_string()));
        }
        let previous = inner.record(name)?.clone();
        let old_path = self.importer.record_path(&previous);
        let target = match new_name {
            Some(candidate) => {
                if inner.document.contains(candidate) {
                    return Err(ManagerError::DuplicateProfile(candidate.to_string()));
                }
                self.importer.rename(&previous, candidate)?
            }
            None => old_path.clone(),
        };
        if let Err(err) = self.importer.write_config(&target, config) {
            self.undo_rename(&target, &old_path);
            return Err(err);
        }

        let updated = match inner.document.profile_mut(name) {
            Some(record) => {
                if let Some(candidate) = new_name {
                    record.name = candidate.to_string();
                }
                record.conf_path = Some(target.clone());
                record.clone()
            }
            None => return Err(ManagerError::ProfileNotFound(name.to_string())),
        };
        if let Err(err) = self.store.save(&inner.document) {
            if let Some(record) = inner.document.profile_mut(&updated.name) {
                *record = previous;
            }
            self.undo_rename(&target, &old_path);
            return Err(err);
        }
        if new_name.is_some() {
            self.supervisor.remove_generated_config(name);
        }
        let summary = self.summarize(&inner, &updated);
        drop(inner);
        tracing::info!(profile = %updated.name, renamed_from = ?new_name.map(|_| name), "profile updated");
        self.emit(ProfileEvent::Updated {
            name: updated.name,
            renamed_from: new_name.map(|_| name.to_string()),
        });
        Ok(summary)
    }

    /// Caps concurrently running profiles; 0 removes the cap. Running profiles above a
    /// lowered cap keep running.
    pub async fn set_port_limit(&self, limit: u32) -> Result<SettingsView> {
        self.update_settings(|inner| {
            inner.document.port_limit = limit;
            inner.ports.set_limit(limit);
            Ok(())
        })
        .await
    }

    /// Default proxy type for profiles connected from now on.
    pub async fn set_proxy_type(&self, proxy_type: ProxyType) -> Result<SettingsView> {
        self.update_settings(|inner| {
            inner.document.proxy_type = proxy_type;
            Ok(())
        })
        .await
    }

    pub async fn set_logging(&self, enabled: bool) -> Result<SettingsView> {
        self.update_settings(|inner| {
            inner.document.logging_enabled = enabled;
            Ok(())
        })
        .await
    }

    pub async fn set_wireproxy_path(&self, path: Option<&str>) -> Result<SettingsView> {
        let path = path.map(str::trim).filter(|path| !path.is_empty());
        if let Some(path) = path {
            if !Path::new(path).is_file() {
                return Err(ManagerError::BinaryNotFound);
            }
        }
        let path = path.map(str::to_string);
        self.update_settings(move |inner| {
            inner.document.wireproxy_path = path;
            Ok(())
        })
        .await
    }

    pub async fn list(&self) -> Vec<ProfileSummary> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<ProfileSummary> = inner
            .document
            .profiles
            .iter()
            .map(|record| self.summarize(&inner, record))
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows
    }

    pub async fn profile(&self, name: &str) -> Result<ProfileSummary> {
        let inner = self.inner.lock().await;
        let record = inner.record(name)?;
        Ok(self.summarize(&inner, record))
    }

    pub async fn settings(&self) -> SettingsView {
        self.inner.lock().await.settings_view()
    }

    pub async fn available_ports(&self, max: usize) -> Vec<u16> {
        self.inner.lock().await.ports.available(max)
    }

    /// Clears session fields left by a previous daemon run. A recorded process that is
    /// still alive and serving its port is terminated. Returns how many were terminated.
    pub async fn reconcile(&self) -> Result<usize> {
        let stale: Vec<(String, Option<u32>, Option<u16>)> = {
            let inner = self.inner.lock().await;
            inner
                .document
                .profiles
                .iter()
                .filter(|record| !inner.handles.contains_key(&record.name))
                .filter(|record| record.running || record.pid.is_some() || record.port.is_some())
                .map(|record| (record.name.clone(), record.pid, record.port))
                .collect()
        };
        if stale.is_empty() {
            return Ok(0);
        }

        let mut terminated = 0;
        for (name, pid, port) in &stale {
            if let Some(pid) = pid {
                if self.supervisor.terminate_orphan(name, *pid, *port).await {
                    terminated += 1;
                }
            }
        }

        let mut inner = self.inner.lock().await;
        for (name, _, _) in &stale {
            if inner.handles.contains_key(name) {
                continue;
            }
            if let Some(record) = inner.document.profile_mut(name) {
                record.mark_stopped();
            }
        }
        self.store.save(&inner.document)?;
        tracing::info!(stale = stale.len(), terminated, "reconciled sessions from previous run");
        Ok(terminated)
    }

    /// Releases profiles whose wireproxy exited on its own. Returns their names.
    pub async fn check_health(&self) -> Vec<String> {
        let exited: Vec<(String, ProcessHandle)> = {
            let mut inner = self.inner.lock().await;
            let names: Vec<String> = inner
                .handles
                .iter_mut()
                .filter_map(|(name, handle)| (!handle.is_alive()).then(|| name.clone()))
                .collect();
            let mut exited = Vec::new();
            for name in names {
                let Some(handle) = inner.handles.remove(&name) else {
                    continue;
                };
                inner.ports.release(handle.port());
                if let Some(record) = inner.document.profile_mut(&name) {
                    record.mark_stopped();
                }
                exited.push((name, handle));
            }
            if !exited.is_empty() {
                self.save_or_warn(&inner.document);
            }
            exited
        };

        let mut names = Vec::with_capacity(exited.len());
        for (name, handle) in exited {
            tracing::warn!(
                profile = %name,
                pid = handle.pid(),
                port = handle.port(),
                "wireproxy exited unexpectedly"
            );
            self.supervisor.stop(handle).await;
            self.emit_state(&name, ProfileState::Stopped, None);
            names.push(name);
        }
        names
    }

    /// Runs [`check_health`](Self::check_health) every `interval` until cancelled.
    pub async fn watch_health(&self, interval: Duration, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    self.check_health().await;
                }
            }
        }
    }

    /// Disconnects every running profile.
    pub async fn shutdown(&self) {
        let names: Vec<String> = self.inner.lock().await.handles.keys().cloned().collect();
        for name in names {
            if let Err(err) = self.disconnect(&name).await {
                tracing::warn!(profile = %name, error = %err, "disconnect during shutdown failed");
            }
        }
    }

    async fn is_running(&self, name: &str) -> Result<bool> {
        let inner = self.inner.lock().await;
        inner.record(name)?;
        inner.ensure_idle(name)?;
        Ok(inner.handles.contains_key(name))
    }

    fn commit_import(
        &self,
        mut inner: MutexGuard<'_, Inner>,
        record: ProfileRecord,
    ) -> Result<ProfileSummary> {
        if let Err(err) = self.store.save(&inner.document) {
            inner
                .document
                .profiles
                .retain(|existing| existing.name != record.name);
            let _ = self.importer.remove(&record);
            return Err(err);
        }
        let summary = self.summarize(&inner, &record);
        drop(inner);
        self.emit(ProfileEvent::Imported {
            name: record.name,
        });
        Ok(summary)
    }

    async fn update_settings<F>(&self, apply: F) -> Result<SettingsView>
    where
        F: FnOnce(&mut Inner) -> Result<()>,
    {
        let mut inner = self.inner.lock().await;
        let before = inner.document.clone();
        apply(&mut *inner)?;
        if let Err(err) = self.store.save(&inner.document) {
            inner.ports.set_limit(before.port_limit);
            inner.document = before;
            return Err(err);
        }
        let settings = inner.settings_view();
        drop(inner);
        tracing::info!(
            port_limit = settings.port_limit,
            proxy_type = %settings.proxy_type,
            logging = settings.logging_enabled,
            "settings updated"
        );
        self.emit(ProfileEvent::SettingsChanged {
            settings: settings.clone(),
        });
        Ok(settings)
    }

    fn summarize(&self, inner: &Inner, record: &ProfileRecord) -> ProfileSummary {
        let handle = inner.handles.get(&record.name);
        let endpoint_host = self
            .importer
            .read_config(record)
            .ok()
            .and_then(|text| wireguard::endpoint_host(&text));
        ProfileSummary {
            name: record.name.clone(),
            state: inner.state_of(&record.name),
            port: handle.map(ProcessHandle::port).or(record.port),
            proxy_type: record.effective_proxy_type(inner.document.proxy_type),
            pid: handle.map(ProcessHandle::pid).or(record.pid),
            last_port: record.last_port,
            last_connected: record.last_connected,
            endpoint_host,
        }
    }

    fn undo_rename(&self, target: &Path, original: &Path) {
        if target == original {
            return;
        }
        if let Err(err) = std::fs::rename(target, original) {
            tracing::warn!(path = %target.display(), error = %err, "failed to restore profile file name");
        }
    }

    fn save_or_warn(&self, document: &StateDocument) {
        if let Err(err) = self.store.save(document) {
            tracing::error!(path = %self.store.path().display(), error = %err, "failed to persist state");
        }
    }

    fn emit_state(&self, name: &str, state: ProfileState, port: Option<u16>) {
        self.emit(ProfileEvent::StateChanged {
            name: name.to_string(),
            state,
            port,
        });
    }

    fn emit(&self, event: ProfileEvent) {
        let _ = self.events.send(event);
    }
}
