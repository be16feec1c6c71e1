use profile_manager::PortRange;
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

pub(crate) fn scratch_range(len: u16) -> PortRange {
    let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind");
    let start = listener.local_addr().expect("addr").port().min(65535 - len);
    PortRange::new(start, start + len - 1).expect("range")
}
