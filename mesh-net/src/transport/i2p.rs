//! I2P SOCKS5 dialer (§4.7): `.i2p`-only, no authentication.

use std::time::Instant;

use async_trait::async_trait;
use mesh_identity::is_valid_i2p_host;
use tokio::net::TcpStream;
use tracing::info;

use super::socks5::handshake;
use super::{DialError, Dialer, DialerStats, DialerStatsSnapshot, DialerStream};

pub struct I2pSocks5Dialer {
    proxy_addr: String,
    stats: DialerStats,
}

impl I2pSocks5Dialer {
    pub fn new(proxy_addr: impl Into<String>) -> Self {
        Self {
            proxy_addr: proxy_addr.into(),
            stats: DialerStats::default(),
        }
    }

    fn parse_i2p_endpoint(endpoint: &str) -> Result<(&str, u16), DialError> {
        let (host, port_str) = endpoint
            .rsplit_once(':')
            .ok_or_else(|| DialError::InvalidEndpoint(endpoint.to_string()))?;
        if !is_valid_i2p_host(host) {
            return Err(DialError::InvalidEndpoint(format!(
                "{endpoint} is not a valid .i2p address"
            )));
        }
        let port: u16 = port_str
            .parse()
            .map_err(|_| DialError::InvalidEndpoint(endpoint.to_string()))?;
        Ok((host, port))
    }
}

#[async_trait]
impl Dialer for I2pSocks5Dialer {
    fn can_handle(&self, endpoint: &str) -> bool {
        Self::parse_i2p_endpoint(endpoint).is_ok()
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn dial(
        &self,
        endpoint: &str,
        _peer_id: &str,
        _isolation_key: Option<&[u8]>,
    ) -> Result<DialerStream, DialError> {
        self.stats.record_attempt();
        let started = Instant::now();

        match self.dial_inner(endpoint).await {
            Ok(stream) => {
                self.stats.record_success(started);
                info!(endpoint, "i2p socks5 dial succeeded");
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

impl I2pSocks5Dialer {
    async fn dial_inner(&self, endpoint: &str) -> Result<DialerStream, DialError> {
        let (host, port) = Self::parse_i2p_endpoint(endpoint)?;
        let mut stream = TcpStream::connect(&self.proxy_addr).await?;
        handshake(&mut stream, host, port, None).await?;
        Ok(Box::new(stream))
    }
}
