use anyhow::Context;
use profile_manager::manager::{DEFAULT_BIND_HOST, DEFAULT_SPAWN_GRACE, DEFAULT_STOP_TIMEOUT};
use profile_manager::{ManagerConfig, PortRange};
use serde::Deserialize;
use std::path::Path;
use system_utils::path::expand_tilde;
use tokio::time::Duration;

const DEFAULT_DATA_DIR: &str = "~/.wireproxy-manager";

/// Optional `daemon.toml`. Every field falls back to a built-in default.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct DaemonConfig {
    pub(crate) data_dir: Option<String>,
    pub(crate) ports: Option<PortsConfig>,
    pub(crate) wireproxy: Option<WireproxyConfig>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct PortsConfig {
    pub(crate) range_start: Option<u16>,
    pub(crate) range_end: Option<u16>,
    pub(crate) bind_host: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct WireproxyConfig {
    pub(crate) binary: Option<String>,
    pub(crate) spawn_grace_ms: Option<u64>,
    pub(crate) stop_timeout_ms: Option<u64>,
}

impl DaemonConfig {
    pub(crate) fn manager_config(&self, data_dir_override: Option<&str>) -> anyhow::Result<ManagerConfig> {
        let data_dir = data_dir_override
            .or(self.data_dir.as_deref())
            .unwrap_or(DEFAULT_DATA_DIR);
        let ports = self.ports.as_ref();
        let defaults = PortRange::default();
        let range = PortRange::new(
            ports.and_then(|ports| ports.range_start).unwrap_or(defaults.start()),
            ports.and_then(|ports| ports.range_end).unwrap_or(defaults.end()),
        )
        .map_err(|err| anyhow::anyhow!("invalid [ports] section: {err}"))?;
        let bind_host = ports
            .and_then(|ports| ports.bind_host.clone())
            .unwrap_or_else(|| DEFAULT_BIND_HOST.to_string());

        let wireproxy = self.wireproxy.as_ref();
        let spawn_grace = wireproxy
            .and_then(|wireproxy| wireproxy.spawn_grace_ms)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_SPAWN_GRACE);
        let stop_timeout = wireproxy
            .and_then(|wireproxy| wireproxy.stop_timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_STOP_TIMEOUT);
        if stop_timeout.is_zero() {
            anyhow::bail!("wireproxy.stop_timeout_ms must be greater than 0");
        }

        Ok(ManagerConfig {
            data_dir: expand_tilde(data_dir),
            port_range: range,
            bind_host,
            binary: wireproxy
                .and_then(|wireproxy| wireproxy.binary.as_deref())
                .map(expand_tilde),
            spawn_grace,
            stop_timeout,
        })
    }
}

/// A missing file yields the defaults; a file that exists must parse.
pub(crate) fn load_daemon_config(path: &Path) -> anyhow::Result<DaemonConfig> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(DaemonConfig::default()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read config {}", path.display()))
        }
    };
    let config: DaemonConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config {}", path.display()))?;
    Ok(config)
}
