//! RFC 1928 / RFC 1929 SOCKS5 client handshake, used by the Tor and I2P
//! dialers (§4.7) to reach the local SOCKS proxy.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use thiserror::Error;

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_NO_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const REP_SUCCEEDED: u8 = 0x00;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Socks5Error {
    #[error("proxy offered no acceptable authentication method")]
    NoAcceptableMethod,
    #[error("proxy rejected username/password authentication")]
    AuthFailed,
    #[error("proxy returned connect reply code {0}")]
    ConnectFailed(u8),
    #[error("unexpected proxy reply")]
    Protocol,
}

fn greeting(with_auth: bool) -> Vec<u8> {
    if with_auth {
        vec![VERSION, 2, METHOD_NO_AUTH, METHOD_USER_PASS]
    } else {
        vec![VERSION, 1, METHOD_NO_AUTH]
    }
}

fn auth_request(username: &str, password: &str) -> Vec<u8> {
    let mut buf = vec![0x01, username.len() as u8];
    buf.extend_from_slice(username.as_bytes());
    buf.push(password.len() as u8);
    buf.extend_from_slice(password.as_bytes());
    buf
}

fn connect_request(host: &str, port: u16) -> Vec<u8> {
    let mut buf = vec![VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN, host.len() as u8];
    buf.extend_from_slice(host.as_bytes());
    buf.extend_from_slice(&port.to_be_bytes());
    buf
}

/// Perform the SOCKS5 handshake over an already-connected stream to the
/// proxy, then issue a CONNECT request for `host:port`. `auth` is
/// `Some((username, password))` to force stream isolation.
pub async fn handshake<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    auth: Option<(&str, &str)>,
) -> Result<(), Socks5Error>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    stream
        .write_all(&greeting(auth.is_some()))
        .await
        .map_err(|_| Socks5Error::Protocol)?;
    let mut method_reply = [0u8; 2];
    stream
        .read_exact(&mut method_reply)
        .await
        .map_err(|_| Socks5Error::Protocol)?;
    if method_reply[0] != VERSION {
        return Err(Socks5Error::Protocol);
    }
    match method_reply[1] {
        METHOD_NO_AUTH => {}
        METHOD_USER_PASS => {
            let (user, pass) = auth.ok_or(Socks5Error::Protocol)?;
            stream
                .write_all(&auth_request(user, pass))
                .await
                .map_err(|_| Socks5Error::Protocol)?;
            let mut auth_reply = [0u8; 2];
            stream
                .read_exact(&mut auth_reply)
                .await
                .map_err(|_| Socks5Error::Protocol)?;
            if auth_reply[1] != 0x00 {
                return Err(Socks5Error::AuthFailed);
            }
        }
        METHOD_NO_ACCEPTABLE => return Err(Socks5Error::NoAcceptableMethod),
        _ => return Err(Socks5Error::Protocol),
    }

    stream
        .write_all(&connect_request(host, port))
        .await
        .map_err(|_| Socks5Error::Protocol)?;
    let mut reply_head = [0u8; 4];
    stream
        .read_exact(&mut reply_head)
        .await
        .map_err(|_| Socks5Error::Protocol)?;
    if reply_head[0] != VERSION {
        return Err(Socks5Error::Protocol);
    }
    if reply_head[1] != REP_SUCCEEDED {
        return Err(Socks5Error::ConnectFailed(reply_head[1]));
    }
    // Drain the bound address echoed back by the proxy (ATYP-dependent).
    match reply_head[3] {
        0x01 => {
            let mut rest = [0u8; 6];
            stream.read_exact(&mut rest).await.map_err(|_| Socks5Error::Protocol)?;
        }
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await.map_err(|_| Socks5Error::Protocol)?;
            let mut rest = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut rest).await.map_err(|_| Socks5Error::Protocol)?;
        }
        0x04 => {
            let mut rest = [0u8; 18];
            stream.read_exact(&mut rest).await.map_err(|_| Socks5Error::Protocol)?;
        }
        _ => return Err(Socks5Error::Protocol),
    }
    Ok(())
}

/// `username = base64(sha256(isolation_key)[0..16])`,
/// `password = base64(sha256(isolation_key)[16..32])`, both unpadded, so
/// distinct isolation keys land on distinct Tor circuits (§4.7).
pub fn isolation_credentials(isolation_key: &[u8]) -> (String, String) {
    use base64::engine::general_purpose::STANDARD_NO_PAD;
    use base64::Engine;
    use sha2::{Digest, Sha256};

    let digest = Sha256::digest(isolation_key);
    let username = STANDARD_NO_PAD.encode(&digest[0..16]);
    let password = STANDARD_NO_PAD.encode(&digest[16..32]);
    (username, password)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    #[test]
    fn isolation_credentials_are_deterministic_and_distinct() {
        let (u1, p1) = isolation_credentials(b"circuit-a");
        let (u2, p2) = isolation_credentials(b"circuit-a");
        assert_eq!((&u1, &p1), (&u2, &p2));
        let (u3, _) = isolation_credentials(b"circuit-b");
        assert_ne!(u1, u3);
        assert!(!u1.contains('='));
    }

    async fn run_fake_proxy(mut server: TcpStream, expect_auth: bool, reply_code: u8) {
        let mut head = [0u8; 2];
        server.read_exact(&mut head).await.unwrap();
        let nmethods = head[1] as usize;
        let mut methods = vec![0u8; nmethods];
        server.read_exact(&mut methods).await.unwrap();

        let chosen = if expect_auth { METHOD_USER_PASS } else { METHOD_NO_AUTH };
        server.write_all(&[VERSION, chosen]).await.unwrap();

        if expect_auth {
            let mut auth_head = [0u8; 2];
            server.read_exact(&mut auth_head).await.unwrap();
            let ulen = auth_head[1] as usize;
            let mut rest = vec![0u8; ulen];
            server.read_exact(&mut rest).await.unwrap();
            let mut plen = [0u8; 1];
            server.read_exact(&mut plen).await.unwrap();
            let mut pass = vec![0u8; plen[0] as usize];
            server.read_exact(&mut pass).await.unwrap();
            server.write_all(&[0x01, 0x00]).await.unwrap();
        }

        let mut req_head = [0u8; 5];
        server.read_exact(&mut req_head).await.unwrap();
        let domain_len = req_head[4] as usize;
        let mut domain_and_port = vec![0u8; domain_len + 2];
        server.read_exact(&mut domain_and_port).await.unwrap();

        server
            .write_all(&[VERSION, reply_code, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn handshake_succeeds_without_auth() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_task = tokio::spawn(async move {
            let (server, _) = listener.accept().await.unwrap();
            run_fake_proxy(server, false, REP_SUCCEEDED).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        handshake(&mut client, "example56charbase32xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx.onion", 443, None)
            .await
            .unwrap();
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn handshake_with_isolation_auth_succeeds() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_task = tokio::spawn(async move {
            let (server, _) = listener.accept().await.unwrap();
            run_fake_proxy(server, true, REP_SUCCEEDED).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let (user, pass) = isolation_credentials(b"iso-key-1");
        handshake(&mut client, "abc.onion", 80, Some((&user, &pass)))
            .await
            .unwrap();
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn handshake_reports_connect_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_task = tokio::spawn(async move {
            let (server, _) = listener.accept().await.unwrap();
            run_fake_proxy(server, false, 0x05 /* connection refused */).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let err = handshake(&mut client, "abc.onion", 80, None).await.unwrap_err();
        assert_eq!(err, Socks5Error::ConnectFailed(0x05));
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn handshake_over_duplex_reports_protocol_error_on_eof() {
        let (mut a, mut b) = duplex(64);
        drop(b.shutdown().await);
        let err = handshake(&mut a, "abc.onion", 80, None).await.unwrap_err();
        assert_eq!(err, Socks5Error::Protocol);
    }
}
