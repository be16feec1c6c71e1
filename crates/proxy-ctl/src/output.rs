use proxy_protocol::{AutoConnectReport, ProfileEvent, ProfileState, ProfileSummary, SettingsView};
use std::time::{Duration, UNIX_EPOCH};

pub(crate) fn state_label(state: ProfileState) -> &'static str {
    match state {
        ProfileState::Stopped => "stopped",
        ProfileState::Connecting => "connecting",
        ProfileState::Running => "running",
        ProfileState::Disconnecting => "disconnecting",
    }
}

pub(crate) fn timestamp(seconds: u64) -> String {
    humantime::format_rfc3339_seconds(UNIX_EPOCH + Duration::from_secs(seconds)).to_string()
}

pub(crate) fn profile_table(rows: &[ProfileSummary]) -> String {
    if rows.is_empty() {
        return "no profiles imported".to_string();
    }
    let name_width = rows
        .iter()
        .map(|row| row.name.len())
        .max()
        .unwrap_or(0)
        .max("NAME".len());
    let mut out = format!(
        "{:<name_width$}  {:<13}  {:<5}  {:<5}  {:<28}  {}\n",
        "NAME", "STATE", "PORT", "TYPE", "ENDPOINT", "LAST CONNECTED"
    );
    for row in rows {
        let port = match (row.port, row.last_port) {
            (Some(port), _) => port.to_string(),
            (None, Some(last)) => format!("({last})"),
            (None, None) => "-".to_string(),
        };
        out.push_str(&format!(
            "{:<name_width$}  {:<13}  {:<5}  {:<5}  {:<28}  {}\n",
            row.name,
            state_label(row.state),
            port,
            row.proxy_type.as_str(),
            row.endpoint_host.as_deref().unwrap_or("-"),
            row.last_connected.map(timestamp).unwrap_or_else(|| "never".to_string()),
        ));
    }
    out.trim_end().to_string()
}

pub(crate) fn settings_block(settings: &SettingsView) -> String {
    let limit = match settings.port_limit {
        0 => "unlimited".to_string(),
        limit => limit.to_string(),
    };
    format!(
        "port limit:  {limit}\nproxy type:  {}\nlogging:     {}\nwireproxy:   {}\nport range:  {}-{}",
        settings.proxy_type,
        if settings.logging_enabled { "on" } else { "off" },
        settings.wireproxy_path.as_deref().unwrap_or("(search PATH)"),
        settings.range_start,
        settings.range_end,
    )
}

pub(crate) fn auto_connect_summary(report: &AutoConnectReport) -> String {
    let mut lines = Vec::new();
    for connected in &report.connected {
        lines.push(format!("connected {} on port {}", connected.name, connected.port));
    }
    for failed in &report.failed {
        lines.push(format!("failed    {}: {}", failed.name, failed.message));
    }
    if report.cancelled {
        lines.push("cancelled before all profiles were tried".to_string());
    }
    if lines.is_empty() {
        lines.push("nothing to connect".to_string());
    }
    lines.join("\n")
}

pub(crate) fn event_line(event: &ProfileEvent) -> String {
    match event {
        ProfileEvent::StateChanged { name, state, port } => match port {
            Some(port) => format!("{name}: {} (port {port})", state_label(*state)),
            None => format!("{name}: {}", state_label(*state)),
        },
        ProfileEvent::Imported { name } => format!("{name}: imported"),
        ProfileEvent::Updated {
            name,
            renamed_from: Some(old),
        } => format!("{name}: updated (renamed from {old})"),
        ProfileEvent::Updated { name, .. } => format!("{name}: updated"),
        ProfileEvent::Deleted { name } => format!("{name}: deleted"),
        ProfileEvent::SettingsChanged { settings } => format!(
            "settings: limit {} type {} logging {}",
            settings.port_limit,
            settings.proxy_type,
            if settings.logging_enabled { "on" } else { "off" }
        ),
        ProfileEvent::AutoConnectFinished { report } => format!(
            "auto-connect: {} connected, {} failed{}",
            report.connected.len(),
            report.failed.len(),
            if report.cancelled { ", cancelled" } else { "" }
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxy_protocol::{AutoConnectFailure, ConnectedProfile, ErrorKind, ProxyType};

    fn row(name: &str, state: ProfileState, port: Option<u16>) -> ProfileSummary {
        ProfileSummary {
            name: name.to_string(),
            state,
            port,
            proxy_type: ProxyType::Socks,
            pid: None,
            last_port: Some(60004),
            last_connected: Some(0),
            endpoint_host: Some("nl-ams.example.net".to_string()),
        }
    }

    #[test]
    fn table_marks_remembered_ports() {
        let table = profile_table(&[
            row("nl", ProfileState::Running, Some(60001)),
            row("de-frankfurt", ProfileState::Stopped, None),
        ]);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("NAME"));
        assert!(lines[1].contains("running") && lines[1].contains("60001"));
        assert!(lines[2].contains("(60004)"));
        assert!(lines[2].contains("1970-01-01T00:00:00Z"));
        assert_eq!(profile_table(&[]), "no profiles imported");
    }

    #[test]
    fn report_lists_each_outcome() {
        let report = AutoConnectReport {
            connected: vec![ConnectedProfile {
                name: "a".to_string(),
                port: 60000,
            }],
            failed: vec![AutoConnectFailure {
                name: "b".to_string(),
                kind: ErrorKind::SpawnFailed,
                message: "exited during startup".to_string(),
            }],
            cancelled: true,
        };
        let text = auto_connect_summary(&report);
        assert!(text.contains("connected a on port 60000"));
        assert!(text.contains("failed    b: exited during startup"));
        assert!(text.ends_with("cancelled before all profiles were tried"));
        assert_eq!(
            auto_connect_summary(&AutoConnectReport::default()),
            "nothing to connect"
        );
    }

    #[test]
    fn event_lines_are_compact() {
        let event = ProfileEvent::StateChanged {
            name: "nl".to_string(),
            state: ProfileState::Connecting,
            port: Some(60002),
        };
        assert_eq!(event_line(&event), "nl: connecting (port 60002)");
        let renamed = ProfileEvent::Updated {
            name: "new".to_string(),
            renamed_from: Some("old".to_string()),
        };
        assert_eq!(event_line(&renamed), "new: updated (renamed from old)");
    }
}
