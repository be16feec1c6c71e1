use crate::error::{ManagerError, Result};
use proxy_protocol::ProxyType;
use std::path::Path;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub entries: Vec<(String, String)>,
}

impl Section {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.as_str())
    }

    fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// Splits an INI-style WireGuard config into sections. Comments (`#`, `;`) and blank
/// lines are dropped; anything else that is not `[Section]` or `Key = Value` is rejected.
pub fn parse(text: &str) -> Result<Vec<Section>> {
    let mut sections: Vec<Section> = Vec::new();
    for (index, raw) in text.lines().enumerate() {
        let line = raw.trim().trim_start_matches('\u{feff}');
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
            sections.push(Section {
                name: name.trim().to_string(),
                entries: Vec::new(),
            });
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(ManagerError::InvalidConfig(format!(
                "line {}: expected `Key = Value`",
                index + 1
            )));
        };
        let Some(section) = sections.last_mut() else {
            return Err(ManagerError::InvalidConfig(format!(
                "line {}: `{}` appears before any section",
                index + 1,
                key.trim()
            )));
        };
        let value = value.split('#').next().unwrap_or_default().trim();
        section
            .entries
            .push((key.trim().to_string(), value.to_string()));
    }
    Ok(sections)
}

/// Checks the minimal shape WireProxy needs: one `[Interface]` with a `PrivateKey`
/// and at least one `[Peer]` with a `PublicKey`.
pub fn validate(text: &str) -> Result<Vec<Section>> {
    let sections = parse(text)?;
    let interfaces: Vec<&Section> = sections.iter().filter(|s| s.is("Interface")).collect();
    match interfaces.as_slice() {
        [] => {
            return Err(ManagerError::InvalidConfig(
                "missing [Interface] section".to_string(),
            ))
        }
        [interface] => {
            if interface.get("PrivateKey").map_or(true, str::is_empty) {
                return Err(ManagerError::InvalidConfig(
                    "[Interface] has no PrivateKey".to_string(),
                ));
            }
        }
        _ => {
            return Err(ManagerError::InvalidConfig(
                "more than one [Interface] section".to_string(),
            ))
        }
    }
    let has_peer = sections
        .iter()
        .filter(|section| section.is("Peer"))
        .any(|peer| peer.get("PublicKey").is_some_and(|key| !key.is_empty()));
    if !has_peer {
        return Err(ManagerError::InvalidConfig(
            "no [Peer] section with a PublicKey".to_string(),
        ));
    }
    Ok(sections)
}

/// Host part of the first peer `Endpoint`, without port or IPv6 brackets.
pub fn endpoint_host(text: &str) -> Option<String> {
    let sections = parse(text).ok()?;
    let endpoint = sections
        .iter()
        .filter(|section| section.is("Peer"))
        .find_map(|peer| peer.get("Endpoint"))?
        .trim();
    let host = if let Some(rest) = endpoint.strip_prefix('[') {
        rest.split(']').next().unwrap_or_default()
    } else {
        match endpoint.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|ch| ch.is_ascii_digit()) => host,
            _ => endpoint,
        }
    };
    let host = host.trim();
    (!host.is_empty()).then(|| host.to_string())
}

/// Configuration WireProxy reads with `-c`: the WireGuard file plus one local listener.
pub fn render_wireproxy_config(
    wg_config: &Path,
    proxy_type: ProxyType,
    bind_host: &str,
    port: u16,
) -> String {
    format!(
        "WGConfig = \"{}\"\n\n[{}]\nBindAddress = {}:{}\n",
        wg_config.display(),
        proxy_type.wireproxy_section(),
        bind_host,
        port
    )
}

#[cfg(test)]
pub(crate) const SAMPLE_CONFIG: &str = "\
[Interface]
# client key
PrivateKey = yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk=
Address = 10.2.0.2/32
DNS = 10.2.0.1

[Peer]
PublicKey = xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=
AllowedIPs = 0.0.0.0/0
Endpoint = nl-ams.example.net:51820
";

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn accepts_standard_config() {
        let sections = validate(SAMPLE_CONFIG).expect("valid");
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].get("address"), Some("10.2.0.2/32"));
    }

    #[test]
    fn section_and_key_names_are_case_insensitive() {
        let text = "[interface]\nprivatekey = abc\n[PEER]\npublickey = def\n";
        assert!(validate(text).is_ok());
    }

    #[test]
    fn rejects_missing_pieces() {
        let no_interface = "[Peer]\nPublicKey = def\n";
        let no_private = "[Interface]\nAddress = 10.0.0.2/32\n[Peer]\nPublicKey = def\n";
        let empty_private = "[Interface]\nPrivateKey =\n[Peer]\nPublicKey = def\n";
        let no_peer = "[Interface]\nPrivateKey = abc\n";
        let peer_without_key = "[Interface]\nPrivateKey = abc\n[Peer]\nEndpoint = a:1\n";
        let two_interfaces = "[Interface]\nPrivateKey = a\n[Interface]\nPrivateKey = b\n[Peer]\nPublicKey = c\n";
        for text in [
            no_interface,
            no_private,
            empty_private,
            no_peer,
            peer_without_key,
            two_interfaces,
        ] {
            assert!(
                matches!(validate(text), Err(ManagerError::InvalidConfig(_))),
                "accepted: {text}"
            );
        }
    }

    #[test]
    fn rejects_garbage_lines() {
        assert!(validate("hello world").is_err());
        assert!(validate("PrivateKey = abc\n[Interface]\n").is_err());
        assert!(validate("").is_err());
    }

    #[test]
    fn endpoint_host_variants() {
        assert_eq!(
            endpoint_host(SAMPLE_CONFIG).as_deref(),
            Some("nl-ams.example.net")
        );
        let v6 = "[Interface]\nPrivateKey = a\n[Peer]\nPublicKey = b\nEndpoint = [2001:db8::1]:51820\n";
        assert_eq!(endpoint_host(v6).as_deref(), Some("2001:db8::1"));
        let commented = "[Peer]\nEndpoint = 198.51.100.7:443 # fast\n";
        assert_eq!(endpoint_host(commented).as_deref(), Some("198.51.100.7"));
        assert_eq!(endpoint_host("[Interface]\nPrivateKey = a\n"), None);
    }

    #[test]
    fn renders_socks_and_http_listeners() {
        let conf = PathBuf::from("/data/profiles/nl.conf");
        let socks = render_wireproxy_config(&conf, ProxyType::Socks, "127.0.0.1", 60000);
        assert_eq!(
            socks,
            "WGConfig = \"/data/profiles/nl.conf\"\n\n[Socks5]\nBindAddress = 127.0.0.1:60000\n"
        );
        let http = render_wireproxy_config(&conf, ProxyType::Http, "127.0.0.1", 60001);
        assert!(http.contains("[http]\nBindAddress = 127.0.0.1:60001"));
    }
}
