use clap::Parser;
use proxy_protocol::DEFAULT_DAEMON_ADDR;

#[derive(Parser, Debug)]
#[command(
    name = "wireproxy-daemon",
    version,
    about = "Runs WireProxy instances for imported WireGuard profiles"
)]
pub(crate) struct Args {
    #[arg(long, default_value = "~/.wireproxy-manager/daemon.toml")]
    pub(crate) config: String,
    #[arg(long, default_value = DEFAULT_DAEMON_ADDR)]
    pub(crate) listen_addr: String,
    /// Overrides `data_dir` from the config file.
    #[arg(long)]
    pub(crate) data_dir: Option<String>,
    #[arg(long, default_value_t = false)]
    pub(crate) log_to_stderr: bool,
}
