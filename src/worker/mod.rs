//! Worker runtime: pollers, the bounded dispatcher and the supervisor that
//! keeps the process registered in the fleet.

mod dispatcher;
pub mod monitor;
mod poller;
mod supervisor;

use std::net::{IpAddr, UdpSocket};

pub use dispatcher::{Dispatcher, Submission};
pub use monitor::MonitorEvent;
pub use poller::Poller;
pub use supervisor::{Worker, WorkerHandle, WorkerStatus};

/// First non-loopback local address, then `$HOSTNAME`, then a random id.
pub fn default_worker_id() -> String {
    if let Some(ip) = local_ip() {
        return ip.to_string();
    }

    match std::env::var("HOSTNAME") {
        Ok(host) if !host.trim().is_empty() => host,
        _ => {
            let id = uuid::Uuid::new_v4().to_string();
            tracing::warn!(worker_id = %id, "No local address or hostname, using a random worker id");
            id
        }
    }
}

// Connecting a UDP socket sends nothing; it only selects the outbound interface.
fn local_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("192.0.2.1:80").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_loopback() && !ip.is_unspecified()).then_some(ip)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_worker_id_is_not_empty() {
        let id = default_worker_id();
        assert!(!id.trim().is_empty());
        assert_ne!(id, "127.0.0.1");
    }
}
