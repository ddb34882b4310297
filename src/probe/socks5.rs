//! SOCKS5 probe: RFC 1928 method negotiation (with RFC 1929 user/pass when
//! a credential is supplied), CONNECT to the intel host, then the intel
//! request over the stream. The whole handshake runs inline under the
//! probe's deadline; nothing is handed to another task.

use anyhow::{bail, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{ProbeCx, ProbeSuccess};
use crate::dial::{tls_handshake, Conn, Deadline};
use crate::endpoint::{Credential, Endpoint, Protocol};
use crate::ipinfo::{self, RequestForm};

const VER: u8 = 0x05;
const METHOD_NONE: u8 = 0x00;
const METHOD_USERPASS: u8 = 0x02;
const METHOD_UNACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_V4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_V6: u8 = 0x04;

/// Diagnostic strings for CONNECT reply codes. Worded so the classifier
/// sees the same vocabulary as plain dial errors (a REP=5 short-circuits an
/// endpoint exactly like a refused TCP connect).
fn reply_text(rep: u8) -> &'static str {
    match rep {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown reply",
    }
}

/// Negotiate methods, authenticate if asked, and CONNECT to `host:port`.
/// On success the stream is a transparent pipe to the target.
pub async fn handshake<S: Conn>(
    stream: &mut S,
    host: &str,
    port: u16,
    cred: Option<&Credential>,
    deadline: &Deadline,
) -> Result<()> {
    let cred = cred.filter(|c| !c.is_empty());
    let greeting: &[u8] = if cred.is_some() {
        &[VER, 2, METHOD_NONE, METHOD_USERPASS]
    } else {
        &[VER, 1, METHOD_NONE]
    };
    deadline.io("socks5 greeting", stream.write_all(greeting)).await?;

    let mut choice = [0u8; 2];
    deadline
        .io("socks5 greeting", stream.read_exact(&mut choice))
        .await?;
    if choice[0] != VER {
        bail!("socks5: bad version {:#04x}", choice[0]);
    }
    match choice[1] {
        METHOD_NONE => {}
        METHOD_USERPASS => {
            let Some(cred) = cred else {
                bail!("socks5: server demands credentials");
            };
            if cred.user.len() > 255 || cred.pass.len() > 255 {
                bail!("socks5: user/pass too long");
            }
            let mut msg = Vec::with_capacity(3 + cred.user.len() + cred.pass.len());
            msg.push(0x01);
            msg.push(cred.user.len() as u8);
            msg.extend_from_slice(cred.user.as_bytes());
            msg.push(cred.pass.len() as u8);
            msg.extend_from_slice(cred.pass.as_bytes());
            deadline.io("socks5 auth", stream.write_all(&msg)).await?;

            let mut status = [0u8; 2];
            deadline
                .io("socks5 auth", stream.read_exact(&mut status))
                .await?;
            if status[1] != 0x00 {
                bail!("socks5 authentication failed");
            }
        }
        METHOD_UNACCEPTABLE => bail!("socks5: no acceptable auth method"),
        m => bail!("socks5: unexpected method {m:#04x}"),
    }

    let mut req = Vec::with_capacity(22);
    req.extend_from_slice(&[VER, CMD_CONNECT, 0x00]);
    match host.parse::<std::net::IpAddr>() {
        Ok(std::net::IpAddr::V4(v4)) => {
            req.push(ATYP_V4);
            req.extend_from_slice(&v4.octets());
        }
        Ok(std::net::IpAddr::V6(v6)) => {
            req.push(ATYP_V6);
            req.extend_from_slice(&v6.octets());
        }
        Err(_) => {
            if host.len() > 255 {
                bail!("socks5: hostname too long");
            }
            req.push(ATYP_DOMAIN);
            req.push(host.len() as u8);
            req.extend_from_slice(host.as_bytes());
        }
    }
    req.extend_from_slice(&port.to_be_bytes());
    deadline.io("socks5 request", stream.write_all(&req)).await?;

    let mut head = [0u8; 4];
    deadline
        .io("socks5 reply", stream.read_exact(&mut head))
        .await?;
    if head[0] != VER {
        bail!("socks5: bad version {:#04x} in reply", head[0]);
    }
    if head[1] != 0x00 {
        bail!("socks5: {}", reply_text(head[1]));
    }

    // Drain BND.ADDR + BND.PORT.
    match head[3] {
        ATYP_V4 => {
            let mut rest = [0u8; 4 + 2];
            deadline.io("socks5 reply", stream.read_exact(&mut rest)).await?;
        }
        ATYP_V6 => {
            let mut rest = [0u8; 16 + 2];
            deadline.io("socks5 reply", stream.read_exact(&mut rest)).await?;
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            deadline.io("socks5 reply", stream.read_exact(&mut len)).await?;
            let mut rest = vec![0u8; len[0] as usize + 2];
            deadline.io("socks5 reply", stream.read_exact(&mut rest)).await?;
        }
        a => bail!("socks5: bad address type {a:#04x} in reply"),
    }
    Ok(())
}

pub async fn probe(
    endpoint: &Endpoint,
    cred: &Credential,
    cx: &ProbeCx<'_>,
) -> Result<ProbeSuccess> {
    let mut stream = cx
        .dialer
        .connect(
            &endpoint.host,
            endpoint.port,
            &cx.deadline,
            cx.half(),
            &cx.tracker,
        )
        .await?;

    handshake(
        &mut stream,
        &cx.intel.host,
        cx.intel.port,
        Some(cred),
        &cx.deadline,
    )
    .await?;

    let info = if cx.intel.tls {
        let mut tls = tls_handshake(stream, &cx.intel.host, &cx.deadline, cx.half()).await?;
        ipinfo::fetch(
            &mut tls,
            RequestForm::Origin,
            None,
            cx.intel,
            &cx.deadline,
            cx.requests,
        )
        .await?
    } else {
        ipinfo::fetch(
            &mut stream,
            RequestForm::Origin,
            None,
            cx.intel,
            &cx.deadline,
            cx.requests,
        )
        .await?
    };

    Ok(ProbeSuccess {
        protocol: Protocol::Socks5,
        info,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(2))
    }

    #[tokio::test]
    async fn no_auth_handshake() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let srv = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            server.write_all(&[0x05, 0x00]).await.unwrap();

            let mut head = [0u8; 4];
            server.read_exact(&mut head).await.unwrap();
            assert_eq!(&head, &[0x05, 0x01, 0x00, 0x03]);
            let mut len = [0u8; 1];
            server.read_exact(&mut len).await.unwrap();
            let mut rest = vec![0u8; len[0] as usize + 2];
            server.read_exact(&mut rest).await.unwrap();
            assert_eq!(&rest[..len[0] as usize], b"intel.test");

            server
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });
        handshake(&mut client, "intel.test", 443, None, &deadline())
            .await
            .unwrap();
        srv.await.unwrap();
    }

    #[tokio::test]
    async fn userpass_negotiation() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let cred = Credential::new("user", "pw");
        let srv = tokio::spawn(async move {
            let mut greeting = [0u8; 4];
            server.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x02, 0x00, 0x02]);
            server.write_all(&[0x05, 0x02]).await.unwrap();

            let mut auth = [0u8; 2 + 4 + 1 + 2];
            server.read_exact(&mut auth).await.unwrap();
            assert_eq!(&auth, &[0x01, 4, b'u', b's', b'e', b'r', 2, b'p', b'w']);
            server.write_all(&[0x01, 0x00]).await.unwrap();

            let mut req = [0u8; 4 + 1 + 4 + 2];
            server.read_exact(&mut req).await.unwrap();
            server
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });
        handshake(&mut client, "10.1.1.1", 443, Some(&cred), &deadline())
            .await
            .unwrap();
        srv.await.unwrap();
    }

    #[tokio::test]
    async fn auth_rejection_classifies_auth() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let cred = Credential::new("user", "bad");
        tokio::spawn(async move {
            let mut greeting = [0u8; 4];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[0x05, 0x02]).await.unwrap();
            let mut auth = [0u8; 9];
            server.read_exact(&mut auth).await.unwrap();
            server.write_all(&[0x01, 0x01]).await.unwrap();
        });
        let err = handshake(&mut client, "h.test", 443, Some(&cred), &deadline())
            .await
            .unwrap_err();
        assert_eq!(
            crate::classify::classify(&err),
            crate::classify::FailureKind::Auth
        );
    }

    #[tokio::test]
    async fn refused_reply_classifies_refused() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[0x05, 0x00]).await.unwrap();
            let mut req = vec![0u8; 64];
            let _ = server.read(&mut req).await.unwrap();
            server
                .write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });
        let err = handshake(&mut client, "1.2.3.4", 443, None, &deadline())
            .await
            .unwrap_err();
        assert_eq!(
            crate::classify::classify(&err),
            crate::classify::FailureKind::Refused
        );
    }
}
