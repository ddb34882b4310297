//! CDN address-range filter. Endpoints whose IP falls inside a known CDN
//! range are skipped before dispatch; probing a CDN edge only measures the
//! CDN, not the candidate proxy. Any individual source may fail to load, a
//! partial table is fine, a fully-empty table disables skipping.

use std::net::IpAddr;
use std::time::Duration;

use anyhow::{bail, Result};
use ipnet::{Ipv4Net, Ipv6Net};
use serde::Deserialize;

use crate::ipinfo::USER_AGENT;

/// Source URLs, overridable for tests.
#[derive(Debug, Clone)]
pub struct CdnSources {
    pub cloudflare_v4: String,
    pub cloudflare_v6: String,
    pub fastly: String,
    pub aws: String,
}

impl Default for CdnSources {
    fn default() -> Self {
        Self {
            cloudflare_v4: "https://www.cloudflare.com/ips-v4".into(),
            cloudflare_v6: "https://www.cloudflare.com/ips-v6".into(),
            fastly: "https://api.fastly.com/public-ip-list".into(),
            aws: "https://ip-ranges.amazonaws.com/ip-ranges.json".into(),
        }
    }
}

/// Two provider-tagged CIDR lists. The lists stay small (a few hundred
/// entries) so matching is a linear scan; immutable after load.
#[derive(Debug, Default)]
pub struct CdnFilter {
    v4: Vec<(Ipv4Net, String)>,
    v6: Vec<(Ipv6Net, String)>,
}

impl CdnFilter {
    pub fn add_cidr(&mut self, provider: &str, cidr: &str) {
        let cidr = cidr.trim();
        if cidr.is_empty() {
            return;
        }
        if cidr.contains(':') {
            if let Ok(net) = cidr.parse::<Ipv6Net>() {
                self.v6.push((net, provider.to_string()));
            }
        } else if let Ok(net) = cidr.parse::<Ipv4Net>() {
            self.v4.push((net, provider.to_string()));
        }
    }

    pub fn match_ip(&self, ip: IpAddr) -> Option<&str> {
        match ip {
            IpAddr::V4(v4) => self
                .v4
                .iter()
                .find(|(net, _)| net.contains(&v4))
                .map(|(_, p)| p.as_str()),
            IpAddr::V6(v6) => self
                .v6
                .iter()
                .find(|(net, _)| net.contains(&v6))
                .map(|(_, p)| p.as_str()),
        }
    }

    pub fn len(&self) -> (usize, usize) {
        (self.v4.len(), self.v6.len())
    }

    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }
}

#[derive(Deserialize)]
struct FastlyList {
    #[serde(default)]
    addresses: Vec<String>,
    #[serde(default)]
    ipv6_addresses: Vec<String>,
}

#[derive(Deserialize)]
struct AwsPrefix {
    #[serde(default)]
    ip_prefix: String,
    #[serde(default)]
    region: String,
    #[serde(default)]
    service: String,
}

#[derive(Deserialize)]
struct AwsPrefix6 {
    #[serde(default)]
    ipv6_prefix: String,
    #[serde(default)]
    region: String,
    #[serde(default)]
    service: String,
}

#[derive(Deserialize)]
struct AwsRanges {
    #[serde(default)]
    prefixes: Vec<AwsPrefix>,
    #[serde(default)]
    ipv6_prefixes: Vec<AwsPrefix6>,
}

/// Fetch all sources and build the filter. Errors only when every source
/// failed and the table came out empty.
pub async fn load(sources: &CdnSources, timeout: Duration) -> Result<CdnFilter> {
    let client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()?;
    let mut filter = CdnFilter::default();

    let cloudflare = futures::future::join_all(
        [&sources.cloudflare_v4, &sources.cloudflare_v6]
            .into_iter()
            .map(|url| fetch_text(&client, url)),
    );
    let (cloudflare, fastly, aws) = futures::future::join3(
        cloudflare,
        fetch_json::<FastlyList>(&client, &sources.fastly),
        fetch_json::<AwsRanges>(&client, &sources.aws),
    )
    .await;

    for result in cloudflare {
        match result {
            Ok(body) => {
                for field in body.split_whitespace() {
                    filter.add_cidr("cloudflare", field);
                }
            }
            Err(e) => tracing::debug!("cloudflare range list failed: {e:#}"),
        }
    }

    match fastly {
        Ok(list) => {
            for cidr in list.addresses.iter().chain(&list.ipv6_addresses) {
                filter.add_cidr("fastly", cidr);
            }
        }
        Err(e) => tracing::debug!("fastly range list failed: {e:#}"),
    }

    match aws {
        Ok(ranges) => {
            for p in &ranges.prefixes {
                if p.service == "CLOUDFRONT" && p.region == "GLOBAL" && !p.ip_prefix.is_empty() {
                    filter.add_cidr("cloudfront", &p.ip_prefix);
                }
            }
            for p in &ranges.ipv6_prefixes {
                if p.service == "CLOUDFRONT" && p.region == "GLOBAL" && !p.ipv6_prefix.is_empty() {
                    filter.add_cidr("cloudfront", &p.ipv6_prefix);
                }
            }
        }
        Err(e) => tracing::debug!("aws range list failed: {e:#}"),
    }

    if filter.is_empty() {
        bail!("cdn cidr table empty (all sources failed?)");
    }
    Ok(filter)
}

async fn fetch_text(client: &reqwest::Client, url: &str) -> Result<String> {
    let resp = client.get(url).send().await?;
    if !resp.status().is_success() {
        bail!("status={}", resp.status().as_u16());
    }
    Ok(resp.text().await?)
}

async fn fetch_json<T: serde::de::DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
) -> Result<T> {
    let resp = client.get(url).send().await?;
    if !resp.status().is_success() {
        bail!("status={}", resp.status().as_u16());
    }
    Ok(resp.json().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn cidr_matching() {
        let mut f = CdnFilter::default();
        f.add_cidr("cloudflare", "104.16.0.0/13");
        f.add_cidr("fastly", "2a04:4e40::/32");
        f.add_cidr("junk", "not-a-cidr");

        assert_eq!(f.match_ip("104.16.1.1".parse().unwrap()), Some("cloudflare"));
        assert_eq!(f.match_ip("9.9.9.9".parse().unwrap()), None);
        assert_eq!(
            f.match_ip("2a04:4e40::1".parse().unwrap()),
            Some("fastly")
        );
        assert_eq!(f.len(), (1, 1));
    }

    #[tokio::test]
    async fn loads_from_all_sources_and_tolerates_failures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cf4"))
            .respond_with(ResponseTemplate::new(200).set_body_string("104.16.0.0/13\n172.64.0.0/13"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/fastly"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"addresses":["151.101.0.0/16"],"ipv6_addresses":["2a04:4e40::/32"]}"#,
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/aws"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"prefixes":[
                    {"ip_prefix":"13.32.0.0/15","region":"GLOBAL","service":"CLOUDFRONT"},
                    {"ip_prefix":"3.5.0.0/16","region":"us-east-1","service":"S3"}],
                   "ipv6_prefixes":[
                    {"ipv6_prefix":"2600:9000::/28","region":"GLOBAL","service":"CLOUDFRONT"}]}"#,
            ))
            .mount(&server)
            .await;

        let sources = CdnSources {
            cloudflare_v4: format!("{}/cf4", server.uri()),
            cloudflare_v6: format!("{}/missing-v6", server.uri()),
            fastly: format!("{}/fastly", server.uri()),
            aws: format!("{}/aws", server.uri()),
        };
        let filter = load(&sources, Duration::from_secs(5)).await.unwrap();
        assert_eq!(filter.len(), (4, 2));
        assert_eq!(
            filter.match_ip("13.33.1.1".parse().unwrap()),
            Some("cloudfront")
        );
        assert_eq!(filter.match_ip("3.5.1.1".parse().unwrap()), None);
    }

    #[tokio::test]
    async fn empty_table_is_an_error() {
        let server = MockServer::start().await;
        let sources = CdnSources {
            cloudflare_v4: format!("{}/a", server.uri()),
            cloudflare_v6: format!("{}/b", server.uri()),
            fastly: format!("{}/c", server.uri()),
            aws: format!("{}/d", server.uri()),
        };
        assert!(load(&sources, Duration::from_secs(2)).await.is_err());
    }
}
