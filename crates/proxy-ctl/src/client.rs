use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use proxy_protocol::{
    AutoConnectReport, ControlRequest, ControlResponse, ErrorKind, ProfileEvent, ProfileSummary,
    SettingsView,
};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::{Framed, LinesCodec};

const DAEMON_TIMEOUT: Duration = Duration::from_secs(5);
/// Connects may wait for a port takeover plus wireproxy startup.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// An error the daemon reported, as opposed to a transport failure.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub(crate) struct DaemonError {
    pub(crate) kind: ErrorKind,
    pub(crate) message: String,
}

pub(crate) struct DaemonClient {
    addr: String,
}

impl DaemonClient {
    pub(crate) fn new(addr: String) -> Self {
        Self { addr }
    }

    pub(crate) async fn list(&self) -> anyhow::Result<Vec<ProfileSummary>> {
        match self.send_request(ControlRequest::List).await? {
            ControlResponse::Profiles { items } => Ok(items),
            other => unexpected(other),
        }
    }

    pub(crate) async fn import(&self, config: String, name: Option<String>) -> anyhow::Result<ProfileSummary> {
        match self.send_request(ControlRequest::Import { config, name }).await? {
            ControlResponse::Profile { profile } => Ok(profile),
            other => unexpected(other),
        }
    }

    pub(crate) async fn connect(
        &self,
        name: String,
        port: Option<u16>,
        confirm_takeover: bool,
        allow_out_of_range: bool,
    ) -> anyhow::Result<(String, u16)> {
        let request = ControlRequest::Connect {
            name,
            port,
            confirm_takeover,
            allow_out_of_range,
        };
        match self.send_request_within(request, Some(CONNECT_TIMEOUT)).await? {
            ControlResponse::Connected { host, port, .. } => Ok((host, port)),
            other => unexpected(other),
        }
    }

    /// Waits for the whole batch; there is no read timeout.
    pub(crate) async fn auto_connect(&self, from: Option<String>) -> anyhow::Result<AutoConnectReport> {
        match self
            .send_request_within(ControlRequest::AutoConnect { from }, None)
            .await?
        {
            ControlResponse::AutoConnect { report } => Ok(report),
            other => unexpected(other),
        }
    }

    pub(crate) async fn edit(
        &self,
        name: String,
        config: String,
        new_name: Option<String>,
    ) -> anyhow::Result<ProfileSummary> {
        let request = ControlRequest::Edit {
            name,
            config,
            new_name,
        };
        match self.send_request_within(request, Some(CONNECT_TIMEOUT)).await? {
            ControlResponse::Profile { profile } => Ok(profile),
            other => unexpected(other),
        }
    }

    pub(crate) async fn available_ports(&self, max: usize) -> anyhow::Result<Vec<u16>> {
        match self.send_request(ControlRequest::AvailablePorts { max }).await? {
            ControlResponse::Ports { ports } => Ok(ports),
            other => unexpected(other),
        }
    }

    /// Requests answered with the current settings.
    pub(crate) async fn settings(&self, request: ControlRequest) -> anyhow::Result<SettingsView> {
        match self.send_request(request).await? {
            ControlResponse::Settings { settings } => Ok(settings),
            other => unexpected(other),
        }
    }

    /// Requests answered with a bare acknowledgement. Disconnects and deletes may have
    /// to wait for wireproxy to exit.
    pub(crate) async fn acknowledge(&self, request: ControlRequest) -> anyhow::Result<()> {
        match self.send_request_within(request, Some(CONNECT_TIMEOUT)).await? {
            ControlResponse::Ok => Ok(()),
            other => unexpected(other),
        }
    }

    /// Calls `on_event` for each event until the daemon closes the stream.
    pub(crate) async fn watch<F>(&self, mut on_event: F) -> anyhow::Result<()>
    where
        F: FnMut(ProfileEvent),
    {
        let mut framed = self.open().await?;
        let payload = serde_json::to_string(&ControlRequest::Watch)?;
        framed.send(payload).await?;
        while let Some(line) = framed.next().await {
            let line = line.context("wireproxy-daemon read error")?;
            match serde_json::from_str::<ControlResponse>(&line)
                .context("failed to parse wireproxy-daemon event")?
            {
                ControlResponse::Event { event } => on_event(event),
                ControlResponse::Ok => {}
                other => return unexpected(other),
            }
        }
        Ok(())
    }

    async fn send_request(&self, request: ControlRequest) -> anyhow::Result<ControlResponse> {
        self.send_request_within(request, Some(DAEMON_TIMEOUT)).await
    }

    async fn send_request_within(
        &self,
        request: ControlRequest,
        read_timeout: Option<Duration>,
    ) -> anyhow::Result<ControlResponse> {
        let mut framed = self.open().await?;
        let payload = serde_json::to_string(&request)?;
        timeout(DAEMON_TIMEOUT, framed.send(payload))
            .await
            .context("wireproxy-daemon send timeout")??;
        let response = match read_timeout {
            Some(limit) => timeout(limit, framed.next())
                .await
                .context("wireproxy-daemon read timeout")?,
            None => framed.next().await,
        };
        let response = response
            .context("wireproxy-daemon closed connection")?
            .context("wireproxy-daemon read error")?;
        let response: ControlResponse =
            serde_json::from_str(&response).context("failed to parse wireproxy-daemon response")?;
        if let ControlResponse::Error { kind, message } = response {
            return Err(DaemonError { kind, message }.into());
        }
        Ok(response)
    }

    async fn open(&self) -> anyhow::Result<Framed<TcpStream, LinesCodec>> {
        let stream = timeout(DAEMON_TIMEOUT, TcpStream::connect(&self.addr))
            .await
            .context("wireproxy-daemon connect timeout")?
            .with_context(|| format!("failed to connect {} (is wireproxy-daemon running?)", self.addr))?;
        Ok(Framed::new(stream, LinesCodec::new()))
    }
}

fn unexpected<T>(response: ControlResponse) -> anyhow::Result<T> {
    anyhow::bail!("unexpected response: {:?}", response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime")
    }

    /// Answers the first request on the listener with `reply`.
    async fn serve_once(reply: ControlResponse) -> (String, tokio::task::JoinHandle<ControlRequest>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut framed = Framed::new(stream, LinesCodec::new());
            let line = framed.next().await.expect("request").expect("line");
            framed
                .send(serde_json::to_string(&reply).unwrap())
                .await
                .unwrap();
            serde_json::from_str(&line).expect("request json")
        });
        (addr, task)
    }

    #[test]
    fn daemon_errors_keep_their_kind() {
        runtime().block_on(async {
            let (addr, server) = serve_once(ControlResponse::Error {
                kind: ErrorKind::PortConflict,
                message: "port 61000 is used by running profile nl".to_string(),
            })
            .await;
            let client = DaemonClient::new(addr);
            let err = client
                .connect("de".to_string(), Some(61000), false, false)
                .await
                .expect_err("conflict");
            let daemon = err.downcast_ref::<DaemonError>().expect("daemon error");
            assert_eq!(daemon.kind, ErrorKind::PortConflict);
            assert!(matches!(
                server.await.unwrap(),
                ControlRequest::Connect { port: Some(61000), confirm_takeover: false, .. }
            ));
        });
    }

    #[test]
    fn connect_reports_daemon_bind_address() {
        runtime().block_on(async {
            let (addr, server) = serve_once(ControlResponse::Connected {
                name: "nl".to_string(),
                host: "0.0.0.0".to_string(),
                port: 61001,
            })
            .await;
            let bound = DaemonClient::new(addr)
                .connect("nl".to_string(), None, false, false)
                .await
                .expect("connected");
            assert_eq!(bound, ("0.0.0.0".to_string(), 61001));
            server.await.unwrap();
        });
    }

    #[test]
    fn mismatched_response_is_rejected() {
        runtime().block_on(async {
            let (addr, _server) = serve_once(ControlResponse::Ok).await;
            let err = DaemonClient::new(addr).list().await.expect_err("mismatch");
            assert!(err.to_string().contains("unexpected response"));
        });
    }

    #[test]
    fn unreachable_daemon_reports_address() {
        runtime().block_on(async {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
            let addr = listener.local_addr().expect("addr").to_string();
            drop(listener);
            let err = DaemonClient::new(addr.clone()).list().await.expect_err("refused");
            assert!(format!("{err:#}").contains(&addr));
        });
    }
}
