use crate::ports::PortRange;
use std::fs;
use std::net::TcpListener;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) fn temp_dir(prefix: &str) -> PathBuf {
    let mut dir = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    dir.push(format!("{prefix}-{nanos}"));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

/// A small range starting at a port the OS just handed out, so it is very likely free.
pub(crate) fn scratch_range(len: u16) -> PortRange {
    let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind");
    let start = listener.local_addr().expect("addr").port().min(65535 - len);
    PortRange::new(start, start + len - 1).expect("range")
}

/// Writes an executable shell script standing in for wireproxy.
#[cfg(unix)]
pub(crate) fn fake_wireproxy(dir: &std::path::Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("wireproxy");
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write fake wireproxy");
    let mut perms = fs::metadata(&path).expect("metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).expect("chmod fake wireproxy");
    path
}
