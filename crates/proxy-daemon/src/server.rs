use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use profile_manager::{ConnectOptions, ManagerError, ProfileManager};
use proxy_protocol::{ControlRequest, ControlResponse, ErrorKind};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;

pub(crate) struct ServerContext {
    manager: Arc<ProfileManager>,
    auto_connect: Mutex<Option<CancellationToken>>,
    shutdown: CancellationToken,
}

impl ServerContext {
    pub(crate) fn new(manager: Arc<ProfileManager>, shutdown: CancellationToken) -> Self {
        Self {
            manager,
            auto_connect: Mutex::new(None),
            shutdown,
        }
    }
}

/// One request per connection, except `watch`, which streams events until the peer
/// hangs up or the daemon stops.
pub(crate) async fn handle_connection(
    stream: TcpStream,
    context: Arc<ServerContext>,
) -> anyhow::Result<()> {
    let mut framed = Framed::new(stream, LinesCodec::new());
    let Some(line) = framed.next().await else {
        return Ok(());
    };
    let line = line.context("failed to read request line")?;
    let request: ControlRequest = match serde_json::from_str(&line) {
        Ok(request) => request,
        Err(err) => {
            let payload = serde_json::to_string(&ControlResponse::Error {
                kind: ErrorKind::InvalidRequest,
                message: format!("invalid request: {err}"),
            })?;
            framed.send(payload).await?;
            return Ok(());
        }
    };

    if matches!(request, ControlRequest::Watch) {
        return stream_events(framed, &context).await;
    }

    let response = dispatch(&context, request).await;
    let payload = serde_json::to_string(&response)?;
    framed.send(payload).await?;
    Ok(())
}

pub(crate) async fn dispatch(context: &ServerContext, request: ControlRequest) -> ControlResponse {
    let manager = &context.manager;
    let result = match request {
        ControlRequest::List => Ok(ControlResponse::Profiles {
            items: manager.list().await,
        }),
        ControlRequest::Settings => Ok(ControlResponse::Settings {
            settings: manager.settings().await,
        }),
        ControlRequest::AvailablePorts { max } => Ok(ControlResponse::Ports {
            ports: manager.available_ports(max).await,
        }),
        ControlRequest::Import { config, name } => manager
            .import(&config, name.as_deref())
            .await
            .map(|profile| ControlResponse::Profile { profile }),
        ControlRequest::Connect {
            name,
            port,
            confirm_takeover,
            allow_out_of_range,
        } => {
            let options = ConnectOptions {
                port,
                confirm_takeover,
                allow_out_of_range,
            };
            manager
                .connect(&name, options)
                .await
                .map(|port| ControlResponse::Connected {
                    name,
                    host: manager.bind_host().to_string(),
                    port,
                })
        }
        ControlRequest::Disconnect { name } => {
            manager.disconnect(&name).await.map(|_| ControlResponse::Ok)
        }
        ControlRequest::AutoConnect { from } => {
            return run_auto_connect(context, from.as_deref()).await
        }
        ControlRequest::CancelAutoConnect => {
            if let Some(token) = context.auto_connect.lock().await.as_ref() {
                token.cancel();
                tracing::info!("auto-connect cancellation requested");
            }
            Ok(ControlResponse::Ok)
        }
        ControlRequest::Delete { name } => manager.delete(&name).await.map(|_| ControlResponse::Ok),
        ControlRequest::Edit {
            name,
            config,
            new_name,
        } => manager
            .edit(&name, &config, new_name.as_deref())
            .await
            .map(|profile| ControlResponse::Profile { profile }),
        ControlRequest::SetPortLimit { limit } => manager
            .set_port_limit(limit)
            .await
            .map(|settings| ControlResponse::Settings { settings }),
        ControlRequest::SetProxyType { proxy_type } => manager
            .set_proxy_type(proxy_type)
            .await
            .map(|settings| ControlResponse::Settings { settings }),
        ControlRequest::SetLogging { enabled } => manager
            .set_logging(enabled)
            .await
            .map(|settings| ControlResponse::Settings { settings }),
        ControlRequest::SetWireproxyPath { path } => manager
            .set_wireproxy_path(path.as_deref())
            .await
            .map(|settings| ControlResponse::Settings { settings }),
        ControlRequest::Watch => Ok(ControlResponse::Error {
            kind: ErrorKind::InvalidRequest,
            message: "watch must be the only request on its connection".to_string(),
        }),
    };
    result.unwrap_or_else(error_response)
}

async fn run_auto_connect(context: &ServerContext, from: Option<&str>) -> ControlResponse {
    let token = {
        let mut slot = context.auto_connect.lock().await;
        if slot.is_some() {
            return ControlResponse::Error {
                kind: ErrorKind::OperationInProgress,
                message: "auto-connect is already running".to_string(),
            };
        }
        let token = context.shutdown.child_token();
        *slot = Some(token.clone());
        token
    };
    let report = context.manager.auto_connect_to_limit(from, &token).await;
    context.auto_connect.lock().await.take();
    report
        .map(|report| ControlResponse::AutoConnect { report })
        .unwrap_or_else(error_response)
}

async fn stream_events(
    mut framed: Framed<TcpStream, LinesCodec>,
    context: &ServerContext,
) -> anyhow::Result<()> {
    let mut events = context.manager.subscribe();
    framed
        .send(serde_json::to_string(&ControlResponse::Ok)?)
        .await?;
    loop {
        tokio::select! {
            _ = context.shutdown.cancelled() => return Ok(()),
            incoming = framed.next() => {
                // Watchers send nothing; EOF or an error means the peer left.
                if incoming.is_none() || matches!(incoming, Some(Err(_))) {
                    return Ok(());
                }
            }
            event = events.recv() => match event {
                Ok(event) => {
                    let payload = serde_json::to_string(&ControlResponse::Event { event })?;
                    framed.send(payload).await?;
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "watcher fell behind, events dropped");
                }
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}

fn error_response(err: ManagerError) -> ControlResponse {
    if err.is_recoverable() {
        tracing::info!(error = %err, "request rejected");
    } else {
        tracing::warn!(error = %err, "request failed");
    }
    ControlResponse::Error {
        kind: err.kind(),
        message: err.to_string(),
    }
}
