//! Egress IP intelligence fetched through the proxy under test. A probe
//! only counts as a success once this request confirms real end-to-end
//! egress and yields a country code.

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use url::Url;

use crate::dial::{Conn, Deadline};
use crate::endpoint::Credential;
use crate::probe::wire;

pub const PRIMARY_IPAPI: &str = "https://sni-api.furry.ist/ipapi";

/// Browser-mimicking UA, kept identical across every request we issue.
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                              (KHTML, like Gecko) Chrome/144.0.0.0 Safari/537.36";

/// Body size cap for the intel response.
pub const MAX_BODY_BYTES: usize = 32 * 1024;

/// Pre-parsed intel endpoint. `tls` decides whether probers layer TLS over
/// their tunnel before talking to it.
#[derive(Debug, Clone)]
pub struct IntelTarget {
    pub url: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub tls: bool,
}

impl IntelTarget {
    pub fn parse(raw: &str) -> Result<Self> {
        let u = Url::parse(raw).with_context(|| format!("invalid intel url {raw:?}"))?;
        let tls = match u.scheme() {
            "https" => true,
            "http" => false,
            other => bail!("intel url must be http(s), got {other:?}"),
        };
        let host = u
            .host_str()
            .with_context(|| format!("intel url {raw:?} has no host"))?
            .trim_matches(|c| c == '[' || c == ']')
            .to_string();
        let port = u.port_or_known_default().unwrap_or(if tls { 443 } else { 80 });
        let mut path = u.path().to_string();
        if let Some(q) = u.query() {
            path.push('?');
            path.push_str(q);
        }
        Ok(Self {
            url: raw.to_string(),
            host,
            port,
            path,
            tls,
        })
    }
}

/// Extracted intel fields. Empty strings render as `-` in output lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpInfo {
    pub isp: String,
    pub ip_type: String,
    pub country: String,
    pub status: u16,
}

#[derive(Debug, Default, Deserialize)]
struct AsnResp {
    #[serde(default)]
    name: String,
    #[serde(default, rename = "type")]
    kind: String,
}

#[derive(Debug, Default, Deserialize)]
struct CompanyResp {
    #[serde(default)]
    name: String,
    #[serde(default, rename = "type")]
    kind: String,
}

#[derive(Debug, Default, Deserialize)]
struct IpApiData {
    #[serde(default)]
    country: String,
    #[serde(default)]
    asn: AsnResp,
    #[serde(default)]
    company: CompanyResp,
}

#[derive(Debug, Default, Deserialize)]
struct IpApiResp {
    #[serde(default)]
    ipapi: IpApiData,
    #[serde(default)]
    code: i64,
}

/// Request-URI form for the intel GET.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestForm {
    /// Absolute-form through a plain HTTP proxy (`GET http://… HTTP/1.1`),
    /// optionally with `Proxy-Authorization`.
    Absolute,
    /// Origin-form on an established tunnel (`GET /path HTTP/1.1`).
    Origin,
}

/// Issue one GET for the intel document and validate the response. Exactly
/// one `requests` increment per call.
pub async fn fetch<S: Conn>(
    stream: &mut S,
    form: RequestForm,
    proxy_cred: Option<&Credential>,
    intel: &IntelTarget,
    deadline: &Deadline,
    requests: &AtomicU64,
) -> Result<IpInfo> {
    use tokio::io::AsyncWriteExt;

    let uri = match form {
        RequestForm::Absolute => intel.url.as_str(),
        RequestForm::Origin => intel.path.as_str(),
    };
    let default_port = if intel.tls { 443 } else { 80 };
    let host_header = if intel.port == default_port {
        intel.host.clone()
    } else {
        format!("{}:{}", intel.host, intel.port)
    };
    let mut req = format!(
        "GET {uri} HTTP/1.1\r\nHost: {host_header}\r\nUser-Agent: {USER_AGENT}\r\n\
         Accept: application/json\r\nAccept-Language: zh-CN,zh;q=0.9\r\n"
    );
    if form == RequestForm::Absolute {
        if let Some(cred) = proxy_cred.filter(|c| !c.is_empty()) {
            req.push_str(&format!(
                "Proxy-Authorization: Basic {}\r\n",
                cred.basic_token()
            ));
        }
    }
    req.push_str("Connection: close\r\n\r\n");

    requests.fetch_add(1, Ordering::Relaxed);
    deadline
        .io("write intel request", stream.write_all(req.as_bytes()))
        .await?;

    let (head, leftover) = wire::read_response_head(stream, deadline).await?;
    if head.status == 407 || head.status == 401 {
        bail!("proxy authentication required: status={}", head.status);
    }
    if head.status != 200 {
        bail!("ipinfo status={}", head.status);
    }

    let body = wire::read_body(
        stream,
        leftover,
        head.content_length(),
        MAX_BODY_BYTES,
        deadline,
    )
    .await?;

    parse_body(&body).map(|mut info| {
        info.status = head.status;
        info
    })
}

fn parse_body(body: &[u8]) -> Result<IpInfo> {
    let text = std::str::from_utf8(body).unwrap_or_default().trim();
    if !text.starts_with('{') {
        bail!("ipinfo invalid response: not json");
    }
    let data: IpApiResp =
        serde_json::from_str(text).map_err(|e| anyhow::anyhow!("ipinfo json parse failed: {e}"))?;
    if data.code != 200 {
        bail!("ipinfo api error: code={}", data.code);
    }
    let ip = data.ipapi;
    if ip.country.trim().is_empty() {
        bail!("ipinfo invalid response: missing country");
    }
    let isp = if !ip.company.name.trim().is_empty() {
        ip.company.name.trim().to_string()
    } else {
        ip.asn.name.trim().to_string()
    };
    let ip_type = if !ip.asn.kind.trim().is_empty() {
        ip.asn.kind.trim().to_string()
    } else {
        ip.company.kind.trim().to_string()
    };
    Ok(IpInfo {
        isp,
        ip_type,
        country: ip.country.trim().to_string(),
        status: 200,
    })
}
