//! External-endpoint discovery.
//!
//! A peer behind NAT cannot know the address the outside world sees for
//! its UDP socket; a STUN binding request answers that. Servers are tried
//! in order and the first XOR-MAPPED-ADDRESS wins. Producers call this
//! again immediately before accepting each transfer — NAT bindings are
//! ephemeral and the advertised endpoint must be the live one.

use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use stun::agent::TransactionId;
use stun::message::{Getter, Message, Setter, BINDING_REQUEST};
use stun::xoraddr::XorMappedAddress;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum StunError {
    #[error("all stun servers failed")]
    AllServersFailed,
    #[error("stun query against {server} failed: {reason}")]
    Query { server: String, reason: String },
}

pub struct StunClient {
    servers: Vec<String>,
    local_port: u16,
    timeout: Duration,
}

impl StunClient {
    pub fn new(servers: Vec<String>, local_port: u16, timeout: Duration) -> Self {
        Self {
            servers,
            local_port,
            timeout,
        }
    }

    /// The socket's public `(ip, port)` as observed from the internet.
    pub fn query(&self) -> Result<SocketAddr, StunError> {
        for server in &self.servers {
            match self.query_server(server) {
                Ok(addr) => return Ok(addr),
                Err(e) => debug!(server, error = %e, "stun server failed, trying next"),
            }
        }
        Err(StunError::AllServersFailed)
    }

    fn query_server(&self, server: &str) -> Result<SocketAddr, StunError> {
        let fail = |reason: String| StunError::Query {
            server: server.to_string(),
            reason,
        };

        let server_addr = server
            .to_socket_addrs()
            .map_err(|e| fail(format!("resolve: {e}")))?
            .find(|a| a.is_ipv4())
            .ok_or_else(|| fail("no ipv4 address".into()))?;

        let socket = UdpSocket::bind(("0.0.0.0", self.local_port))
            .map_err(|e| fail(format!("bind: {e}")))?;
        socket
            .connect(server_addr)
            .map_err(|e| fail(format!("connect: {e}")))?;
        socket
            .set_read_timeout(Some(self.timeout))
            .map_err(|e| fail(format!("set timeout: {e}")))?;

        let mut request = Message::new();
        request
            .build(&[
                Box::new(TransactionId::new()) as Box<dyn Setter>,
                Box::new(BINDING_REQUEST),
            ])
            .map_err(|e| fail(format!("build request: {e}")))?;
        socket
            .send(&request.raw)
            .map_err(|e| fail(format!("send: {e}")))?;

        let mut buf = [0u8; 1500];
        let n = socket
            .recv(&mut buf)
            .map_err(|e| fail(format!("recv: {e}")))?;

        let mut response = Message::new();
        response.raw = buf[..n].to_vec();
        response
            .decode()
            .map_err(|e| fail(format!("decode: {e}")))?;

        let mut mapped = XorMappedAddress::default();
        mapped
            .get_from(&response)
            .map_err(|e| fail(format!("xor-mapped-address: {e}")))?;

        Ok(SocketAddr::new(mapped.ip, mapped.port))
    }
}
