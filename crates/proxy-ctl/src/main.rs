mod cli;
mod client;
mod output;

use crate::cli::{Args, Command, Switch};
use crate::client::{DaemonClient, DaemonError};
use anyhow::Context;
use clap::Parser;
use proxy_protocol::{ControlRequest, ErrorKind};
use std::path::Path;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let client = DaemonClient::new(args.addr);
    if let Err(err) = run(&client, args.command).await {
        if let Some(hint) = err.downcast_ref::<DaemonError>().and_then(hint_for) {
            eprintln!("{hint}");
        }
        return Err(err);
    }
    Ok(())
}

async fn run(client: &DaemonClient, command: Command) -> anyhow::Result<()> {
    match command {
        Command::List => println!("{}", output::profile_table(&client.list().await?)),
        Command::Import { file, name } => {
            let config = read_config(&file)?;
            let name = name.or_else(|| file_stem(&file));
            let profile = client.import(config, name).await?;
            println!("imported {}", profile.name);
        }
        Command::Connect {
            name,
            port,
            force,
            allow_out_of_range,
        } => {
            let (host, port) = client
                .connect(name.clone(), port, force, allow_out_of_range)
                .await?;
            println!("{name} listening on {host}:{port}");
        }
        Command::Disconnect { name } => {
            client
                .acknowledge(ControlRequest::Disconnect { name: name.clone() })
                .await?;
            println!("{name} disconnected");
        }
        Command::AutoConnect { from } => {
            let report = client.auto_connect(from).await?;
            println!("{}", output::auto_connect_summary(&report));
        }
        Command::CancelAutoConnect => {
            client.acknowledge(ControlRequest::CancelAutoConnect).await?;
        }
        Command::Delete { name } => {
            client
                .acknowledge(ControlRequest::Delete { name: name.clone() })
                .await?;
            println!("{name} deleted");
        }
        Command::Edit { name, file, rename } => {
            let config = read_config(&file)?;
            let profile = client.edit(name, config, rename).await?;
            println!("{} updated", profile.name);
        }
        Command::Ports { max } => {
            let ports = client.available_ports(max).await?;
            let ports: Vec<String> = ports.iter().map(u16::to_string).collect();
            println!("{}", ports.join(" "));
        }
        Command::Settings => print_settings(client, ControlRequest::Settings).await?,
        Command::SetLimit { limit } => {
            print_settings(client, ControlRequest::SetPortLimit { limit }).await?
        }
        Command::SetProxyType { proxy_type } => {
            print_settings(client, ControlRequest::SetProxyType { proxy_type }).await?
        }
        Command::SetLogging { state } => {
            let enabled = state == Switch::On;
            print_settings(client, ControlRequest::SetLogging { enabled }).await?
        }
        Command::SetBinary { path } => {
            print_settings(client, ControlRequest::SetWireproxyPath { path }).await?
        }
        Command::Watch => {
            client
                .watch(|event| println!("{}", output::event_line(&event)))
                .await?
        }
    }
    Ok(())
}

async fn print_settings(client: &DaemonClient, request: ControlRequest) -> anyhow::Result<()> {
    let settings = client.settings(request).await?;
    println!("{}", output::settings_block(&settings));
    Ok(())
}

fn read_config(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn file_stem(path: &Path) -> Option<String> {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
}

fn hint_for(err: &DaemonError) -> Option<&'static str> {
    match err.kind {
        ErrorKind::PortConflict => Some("hint: rerun with --force to stop the other profile and take its port"),
        ErrorKind::PortOutOfRange => Some("hint: rerun with --allow-out-of-range to use it anyway"),
        ErrorKind::DuplicateProfile => Some("hint: pass --name (import) or --rename (edit) with an unused name"),
        ErrorKind::BinaryNotFound => Some("hint: install wireproxy on PATH or run `wireproxy-ctl set-binary <path>`"),
        kind if kind.is_recoverable() => Some("hint: nothing was changed; retry once the port or profile is free"),
        _ => None,
    }
}
