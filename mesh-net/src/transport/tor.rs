//! Tor SOCKS5 dialer (§4.7): onion-only, DNS-leak-proof, with per-isolation
//! stream separation via derived SOCKS credentials.

use std::time::Instant;

use async_trait::async_trait;
use mesh_identity::is_valid_onion_host;
use tokio::net::TcpStream;
use tracing::info;

use super::socks5::{handshake, isolation_credentials};
use super::{DialError, Dialer, DialerStats, DialerStatsSnapshot, DialerStream};

pub struct TorSocks5Dialer {
    proxy_addr: String,
    stats: DialerStats,
}

impl TorSocks5Dialer {
    pub fn new(proxy_addr: impl Into<String>) -> Self {
        Self {
            proxy_addr: proxy_addr.into(),
            stats: DialerStats::default(),
        }
    }

    fn parse_onion_endpoint(endpoint: &str) -> Result<(&str, u16), DialError> {
        let (host, port_str) = endpoint
            .rsplit_once(':')
            .ok_or_else(|| DialError::InvalidEndpoint(endpoint.to_string()))?;
        if !is_valid_onion_host(host) {
            return Err(DialError::InvalidEndpoint(format!(
                "{endpoint} is not a valid onion address; refusing to avoid a DNS leak"
            )));
        }
        let port: u16 = port_str
            .parse()
            .map_err(|_| DialError::InvalidEndpoint(endpoint.to_string()))?;
        Ok((host, port))
    }
}

#[async_trait]
impl Dialer for TorSocks5Dialer {
    fn can_handle(&self, endpoint: &str) -> bool {
        Self::parse_onion_endpoint(endpoint).is_ok()
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn dial(
        &self,
        endpoint: &str,
        _peer_id: &str,
        isolation_key: Option<&[u8]>,
    ) -> Result<DialerStream, DialError> {
        self.stats.record_attempt();
        let started = Instant::now();

        match self.dial_inner(endpoint, isolation_key).await {
            Ok(stream) => {
                self.stats.record_success(started);
                info!(endpoint, "tor socks5 dial succeeded");
                Ok(stream)
            }
            Err(e) => {
                self.stats.record_failure(e.to_string());
                Err(e)
            }
        }
    }

    fn stats(&self) -> DialerStatsSnapshot {
        self.stats.snapshot()
    }
}

impl TorSocks5Dialer {
    async fn dial_inner(
        &self,
        endpoint: &str,
        isolation_key: Option<&[u8]>,
    ) -> Result<DialerStream, DialError> {
        let (host, port) = Self::parse_onion_endpoint(endpoint)?;
        let mut stream = TcpStream::connect(&self.proxy_addr).await?;
        let auth = isolation_key.map(isolation_credentials);
        let auth_ref = auth.as_ref().map(|(u, p)| (u.as_str(), p.as_str()));
        handshake(&mut stream, host, port, auth_ref).await?;
        Ok(Box::new(stream))
    }
}
