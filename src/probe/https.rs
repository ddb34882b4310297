//! HTTPS-tunnel probe: TLS to the proxy itself, CONNECT to the intel host,
//! then the intel request over the tunnel. A proxy that answers the TLS
//! handshake with plaintext HTTP gets one retry through the plain HTTP
//! prober; if that also fails the original handshake error stands and is
//! reported as `https_to_http`.

use anyhow::Result;

use super::{http, ProbeCx, ProbeSuccess};
use crate::classify::looks_like_plain_http;
use crate::dial::tls_handshake;
use crate::endpoint::{Credential, Endpoint, Protocol};
use crate::ipinfo::{self, RequestForm};
use crate::probe::wire;

pub async fn probe(
    endpoint: &Endpoint,
    cred: &Credential,
    cx: &ProbeCx<'_>,
) -> Result<ProbeSuccess> {
    let stream = cx
        .dialer
        .connect(
            &endpoint.host,
            endpoint.port,
            &cx.deadline,
            cx.half(),
            &cx.tracker,
        )
        .await?;

    let tls = match tls_handshake(stream, &endpoint.host, &cx.deadline, cx.half()).await {
        Ok(tls) => tls,
        Err(err) if looks_like_plain_http(&err) => {
            // The peer is most likely a plain HTTP proxy on this port. One
            // retry through the HTTP prober; the original handshake error
            // stands if that fails too.
            return http::probe(endpoint, cred, cx).await.map_err(|_| err);
        }
        Err(err) => return Err(err),
    };

    let cred_opt = (!cred.is_empty()).then_some(cred);
    let tunnel =
        wire::connect_through(tls, &cx.intel.host, cx.intel.port, cred_opt, &cx.deadline).await?;

    let info = if cx.intel.tls {
        let mut inner = tls_handshake(tunnel, &cx.intel.host, &cx.deadline, cx.half()).await?;
        ipinfo::fetch(
            &mut inner,
            RequestForm::Origin,
            None,
            cx.intel,
            &cx.deadline,
            cx.requests,
        )
        .await?
    } else {
        let mut tunnel = tunnel;
        ipinfo::fetch(
            &mut tunnel,
            RequestForm::Origin,
            None,
            cx.intel,
            &cx.deadline,
            cx.requests,
        )
        .await?
    };

    Ok(ProbeSuccess {
        protocol: Protocol::Https,
        info,
    })
}
