//! Protocol probers. One probe = one (protocol, credential) attempt against
//! one endpoint, bounded by a deadline. Probes open fresh connections,
//! never keep idle ones, and never leave work running after they return:
//! every handshake runs inline on the probe's own task and every socket is
//! owned by the probe's [`ConnTracker`](crate::track::ConnTracker).

pub mod http;
pub mod https;
pub mod socks5;
pub mod wire;

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use crate::classify::{classify, FailureKind};
use crate::dial::{Deadline, Dialer};
use crate::endpoint::{Credential, Endpoint, Protocol};
use crate::ipinfo::{IntelTarget, IpInfo};
use crate::track::ConnTracker;

/// Everything a prober needs besides the target and credential.
pub struct ProbeCx<'a> {
    pub dialer: &'a Dialer,
    pub intel: &'a IntelTarget,
    pub deadline: Deadline,
    pub timeout: Duration,
    pub tracker: Arc<ConnTracker>,
    pub requests: &'a AtomicU64,
}

impl ProbeCx<'_> {
    /// Sub-operation budget: nested handshakes get at most half the probe
    /// timeout, never more than what is left.
    pub fn half(&self) -> Duration {
        self.timeout / 2
    }
}

/// A confirmed working combination. `protocol` may differ from the probed
/// one when the HTTPS prober fell back to plain HTTP.
#[derive(Debug, Clone)]
pub struct ProbeSuccess {
    pub protocol: Protocol,
    pub info: IpInfo,
}

/// A failed attempt, classified once at the site that observed the error.
#[derive(Debug)]
pub struct ProbeFailure {
    pub kind: FailureKind,
    pub error: anyhow::Error,
}

/// Run one probe. The connection tracker is scoped to this call; by the
/// time it returns, every socket the probe opened has been dropped.
pub async fn run(
    protocol: Protocol,
    endpoint: &Endpoint,
    cred: &Credential,
    dialer: &Dialer,
    intel: &IntelTarget,
    timeout: Duration,
    requests: &AtomicU64,
) -> Result<ProbeSuccess, ProbeFailure> {
    let tracker = ConnTracker::new();
    let cx = ProbeCx {
        dialer,
        intel,
        deadline: Deadline::after(timeout),
        timeout,
        tracker: Arc::clone(&tracker),
        requests,
    };
    let result = match protocol {
        Protocol::Http => http::probe(endpoint, cred, &cx).await,
        Protocol::Https => https::probe(endpoint, cred, &cx).await,
        Protocol::Socks5 => socks5::probe(endpoint, cred, &cx).await,
    };
    debug_assert_eq!(tracker.live(), 0, "probe leaked a socket");
    result.map_err(|error| ProbeFailure {
        kind: classify(&error),
        error,
    })
}
