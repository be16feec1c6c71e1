use std::net::TcpListener;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

/// True when nothing on this host currently holds `host:port`.
pub fn port_is_bindable(host: &str, port: u16) -> bool {
    TcpListener::bind((host, port)).is_ok()
}

/// True when something accepts TCP connections on `host:port` within `wait`.
pub async fn port_accepts(host: &str, port: u16, wait: Duration) -> bool {
    matches!(timeout(wait, TcpStream::connect((host, port))).await, Ok(Ok(_)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bound_port_is_not_bindable() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind");
        let port = listener.local_addr().expect("addr").port();
        assert!(!port_is_bindable("127.0.0.1", port));
        drop(listener);
        assert!(port_is_bindable("127.0.0.1", port));
    }

    #[test]
    fn accepts_only_while_listening() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");
        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind");
        let port = listener.local_addr().expect("addr").port();
        rt.block_on(async {
            assert!(port_accepts("127.0.0.1", port, Duration::from_millis(500)).await);
        });
        drop(listener);
        rt.block_on(async {
            assert!(!port_accepts("127.0.0.1", port, Duration::from_millis(200)).await);
        });
    }
}
