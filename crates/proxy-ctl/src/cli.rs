use clap::{Parser, Subcommand, ValueEnum};
use proxy_protocol::{ProxyType, DEFAULT_DAEMON_ADDR};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "wireproxy-ctl",
    version,
    about = "Manage WireGuard profiles served through wireproxy-daemon"
)]
pub(crate) struct Args {
    #[arg(long, global = true, default_value = DEFAULT_DAEMON_ADDR)]
    pub(crate) addr: String,
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Switch {
    On,
    Off,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Show every profile with its state and port.
    List,
    /// Copy a WireGuard config into the profile directory.
    Import {
        file: PathBuf,
        /// Profile name; defaults to the file name.
        #[arg(long)]
        name: Option<String>,
    },
    Connect {
        name: String,
        #[arg(long)]
        port: Option<u16>,
        /// Take the port over from the profile currently using it.
        #[arg(long, default_value_t = false)]
        force: bool,
        #[arg(long, default_value_t = false)]
        allow_out_of_range: bool,
    },
    Disconnect {
        name: String,
    },
    /// Connect stopped profiles until the port limit is reached.
    AutoConnect {
        /// Skip profiles whose names sort before this one.
        #[arg(long)]
        from: Option<String>,
    },
    CancelAutoConnect,
    Delete {
        name: String,
    },
    /// Replace a profile's config, optionally renaming it. The profile is left stopped.
    Edit {
        name: String,
        file: PathBuf,
        #[arg(long)]
        rename: Option<String>,
    },
    /// Unassigned ports in the allocation range.
    Ports {
        #[arg(long, default_value_t = 20)]
        max: usize,
    },
    Settings,
    SetLimit {
        /// 0 removes the limit.
        limit: u32,
    },
    SetProxyType {
        proxy_type: ProxyType,
    },
    SetLogging {
        #[arg(value_enum)]
        state: Switch,
    },
    /// Path to the wireproxy executable; omit to fall back to PATH.
    SetBinary {
        path: Option<String>,
    },
    /// Print profile events as they happen.
    Watch,
}
