//! Plain HTTP proxy probe: absolute-form GET for the intel document with
//! optional `Proxy-Authorization`. Proxy-side errors surface as the HTTP
//! status of the response.

use anyhow::Result;

use super::{ProbeCx, ProbeSuccess};
use crate::endpoint::{Credential, Endpoint, Protocol};
use crate::ipinfo::{self, RequestForm};

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
    let info = ipinfo::fetch(
        &mut stream,
        RequestForm::Absolute,
        Some(cred),
        cx.intel,
        &cx.deadline,
        cx.requests,
    )
    .await?;
    Ok(ProbeSuccess {
        protocol: Protocol::Http,
        info,
    })
}
