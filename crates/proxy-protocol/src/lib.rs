use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_DAEMON_ADDR: &str = "127.0.0.1:19410";

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProxyType {
    #[default]
    Socks,
    Http,
}

impl ProxyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyType::Socks => "socks",
            ProxyType::Http => "http",
        }
    }

    /// Section header WireProxy expects for this listener.
    pub fn wireproxy_section(&self) -> &'static str {
        match self {
            ProxyType::Socks => "Socks5",
            ProxyType::Http => "http",
        }
    }
}

impl fmt::Display for ProxyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProxyType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "socks" | "socks5" => Ok(ProxyType::Socks),
            "http" => Ok(ProxyType::Http),
            other => Err(format!("unknown proxy type {other}, expected socks or http")),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProfileState {
    Stopped,
    Connecting,
    Running,
    Disconnecting,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileSummary {
    pub name: String,
    pub state: ProfileState,
    pub port: Option<u16>,
    pub proxy_type: ProxyType,
    pub pid: Option<u32>,
    pub last_port: Option<u16>,
    pub last_connected: Option<u64>,
    pub endpoint_host: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SettingsView {
    pub port_limit: u32,
    pub proxy_type: ProxyType,
    pub logging_enabled: bool,
    pub wireproxy_path: Option<String>,
    pub range_start: u16,
    pub range_end: u16,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectedProfile {
    pub name: String,
    pub port: u16,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AutoConnectFailure {
    pub name: String,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AutoConnectReport {
    pub connected: Vec<ConnectedProfile>,
    pub failed: Vec<AutoConnectFailure>,
    pub cancelled: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProfileEvent {
    StateChanged {
        name: String,
        state: ProfileState,
        port: Option<u16>,
    },
    Imported {
        name: String,
    },
    Updated {
        name: String,
        renamed_from: Option<String>,
    },
    Deleted {
        name: String,
    },
    SettingsChanged {
        settings: SettingsView,
    },
    AutoConnectFinished {
        report: AutoConnectReport,
    },
}

/// Stable error codes carried over the control socket.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    CorruptState,
    UnsupportedSchema,
    NoFreePort,
    BinaryNotFound,
    SpawnFailed,
    InvalidConfig,
    DuplicateProfile,
    OperationInProgress,
    ProfileNotFound,
    PortOutOfRange,
    PortUnavailable,
    PortConflict,
    InvalidRequest,
    Io,
}

impl ErrorKind {
    /// Nothing changed on the daemon side; the same request can succeed once the
    /// caller frees a port, picks another name or waits.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorKind::NoFreePort
                | ErrorKind::DuplicateProfile
                | ErrorKind::OperationInProgress
                | ErrorKind::PortConflict
                | ErrorKind::PortUnavailable
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    List,
    Settings,
    AvailablePorts {
        max: usize,
    },
    Import {
        config: String,
        name: Option<String>,
    },
    Connect {
        name: String,
        port: Option<u16>,
        #[serde(default)]
        confirm_takeover: bool,
        #[serde(default)]
        allow_out_of_range: bool,
    },
    Disconnect {
        name: String,
    },
    /// Starts at `from` in name order when given.
    AutoConnect {
        #[serde(default)]
        from: Option<String>,
    },
    CancelAutoConnect,
    Delete {
        name: String,
    },
    Edit {
        name: String,
        config: String,
        new_name: Option<String>,
    },
    SetPortLimit {
        limit: u32,
    },
    SetProxyType {
        proxy_type: ProxyType,
    },
    SetLogging {
        enabled: bool,
    },
    SetWireproxyPath {
        path: Option<String>,
    },
    Watch,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlResponse {
    Ok,
    Profiles { items: Vec<ProfileSummary> },
    Profile { profile: ProfileSummary },
    Settings { settings: SettingsView },
    Ports { ports: Vec<u16> },
    Connected { name: String, host: String, port: u16 },
    AutoConnect { report: AutoConnectReport },
    Event { event: ProfileEvent },
    Error { kind: ErrorKind, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_type_parses_gui_labels() {
        assert_eq!("SOCKS5".parse::<ProxyType>().unwrap(), ProxyType::Socks);
        assert_eq!(" http ".parse::<ProxyType>().unwrap(), ProxyType::Http);
        assert!("shadowsocks".parse::<ProxyType>().is_err());
        assert_eq!(ProxyType::Socks.wireproxy_section(), "Socks5");
        assert_eq!(ProxyType::Http.wireproxy_section(), "http");
    }

    #[test]
    fn connect_request_flags_default_to_false() {
        let raw = r#"{"type":"connect","name":"nl-01","port":61000}"#;
        let request: ControlRequest = serde_json::from_str(raw).expect("deserialize");
        assert_eq!(
            request,
            ControlRequest::Connect {
                name: "nl-01".to_string(),
                port: Some(61000),
                confirm_takeover: false,
                allow_out_of_range: false,
            }
        );
    }

    #[test]
    fn auto_connect_start_is_optional() {
        let request: ControlRequest =
            serde_json::from_str(r#"{"type":"auto_connect"}"#).expect("deserialize");
        assert_eq!(request, ControlRequest::AutoConnect { from: None });
        let request: ControlRequest =
            serde_json::from_str(r#"{"type":"auto_connect","from":"de-02"}"#).expect("deserialize");
        assert_eq!(
            request,
            ControlRequest::AutoConnect {
                from: Some("de-02".to_string())
            }
        );
    }

    #[test]
    fn only_conditions_without_side_effects_are_recoverable() {
        assert!(ErrorKind::PortConflict.is_recoverable());
        assert!(ErrorKind::OperationInProgress.is_recoverable());
        assert!(!ErrorKind::SpawnFailed.is_recoverable());
        assert!(!ErrorKind::CorruptState.is_recoverable());
    }

    #[test]
    fn error_response_uses_snake_case_kind() {
        let response = ControlResponse::Error {
            kind: ErrorKind::NoFreePort,
            message: "no free port".to_string(),
        };
        let json = serde_json::to_string(&response).expect("serialize");
        assert!(json.contains(r#""type":"error""#));
        assert!(json.contains(r#""kind":"no_free_port""#));
    }

    #[test]
    fn event_is_tagged_by_event_name() {
        let event = ProfileEvent::StateChanged {
            name: "de-02".to_string(),
            state: ProfileState::Running,
            port: Some(60001),
        };
        let json = serde_json::to_string(&event).expect("serialize");
        assert!(json.contains(r#""event":"state_changed""#));
        assert!(json.contains(r#""state":"running""#));
    }
}
