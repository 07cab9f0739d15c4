//! Peer-side plumbing shared by the producer and consumer binaries:
//! the signaller REST client, the STUN external-endpoint capability,
//! the producer's on-disk state, and TOML configuration.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

use pinhole_types::models::UdpOptions;

pub mod client;
pub mod config;
pub mod state;
pub mod stun;

/// Install the global tracing subscriber. `RUST_LOG` wins over the
/// configured level.
pub fn init_tracing(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Resolve a peer's advertised endpoint into a UDP target address.
pub fn resolve_endpoint(options: &UdpOptions) -> io::Result<SocketAddr> {
    (options.external_ip.as_str(), options.external_port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no address for {}", options.external_ip),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_endpoint_parses_plain_ip() {
        let addr = resolve_endpoint(&UdpOptions {
            external_ip: "203.0.113.9".into(),
            external_port: 50000,
        })
        .unwrap();
        assert_eq!(addr.to_string(), "203.0.113.9:50000");
    }
}
