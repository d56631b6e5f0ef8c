//! Local port liveness check

use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Whether something accepts TCP connections on `host:port`
pub async fn probe(host: &str, port: u16, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!("Probe of {}:{} failed: {}", host, port, e);
            false
        }
        Err(_) => {
            debug!("Probe of {}:{} timed out", host, port);
            false
        }
    }
}
