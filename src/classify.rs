//! Coarse classification of transport errors.
//!
//! Every error is classified exactly once, at the site that observed it; the
//! per-endpoint state machine only aggregates the resulting kinds. When one
//! endpoint accumulates several failures, `choose_primary` picks the most
//! diagnostic kind by a fixed priority order, so reruns are reproducible.

use std::io::ErrorKind;

/// Closed set of probe failure reasons. Skip reasons (`bad_line`,
/// `cdn_<provider>`) live in the same counter namespace but never come out
/// of a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Auth,
    IpInfo,
    Non204,
    ConnectFail,
    Tls,
    Timeout,
    Refused,
    Unreachable,
    Reset,
    Dial,
    Dns,
    Eof,
    HttpsToHttp,
    Other,
}

/// Diagnostic priority, highest first.
pub const PRIORITY: [FailureKind; 14] = [
    FailureKind::Auth,
    FailureKind::IpInfo,
    FailureKind::Non204,
    FailureKind::ConnectFail,
    FailureKind::Tls,
    FailureKind::Timeout,
    FailureKind::Refused,
    FailureKind::Unreachable,
    FailureKind::Reset,
    FailureKind::Dial,
    FailureKind::Dns,
    FailureKind::Eof,
    FailureKind::HttpsToHttp,
    FailureKind::Other,
];

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Auth => "auth",
            FailureKind::IpInfo => "ipinfo",
            FailureKind::Non204 => "non204",
            FailureKind::ConnectFail => "connect_fail",
            FailureKind::Tls => "tls",
            FailureKind::Timeout => "timeout",
            FailureKind::Refused => "refused",
            FailureKind::Unreachable => "unreachable",
            FailureKind::Reset => "reset",
            FailureKind::Dial => "dial",
            FailureKind::Dns => "dns",
            FailureKind::Eof => "eof",
            FailureKind::HttpsToHttp => "https_to_http",
            FailureKind::Other => "other",
        }
    }

    /// Kinds that mark the whole endpoint as unreachable and abort any
    /// remaining protocol/credential attempts.
    pub fn is_unreachable_signal(self) -> bool {
        matches!(
            self,
            FailureKind::Reset | FailureKind::Unreachable | FailureKind::Refused
        )
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Find the first run of three digits in `s` and parse it as an HTTP status.
fn parse_status_from_text(s: &str) -> Option<u16> {
    let b = s.as_bytes();
    for w in b.windows(3) {
        if w.iter().all(u8::is_ascii_digit) {
            return std::str::from_utf8(w).ok()?.parse().ok();
        }
    }
    None
}

fn is_auth_status(code: u16) -> bool {
    code == 407 || code == 401
}

/// TLS handshake failure signatures that indicate the peer actually spoke
/// plaintext HTTP. Covers both the generic phrasing and the vocabulary of
/// the TLS library in use (a plaintext response surfaces as a corrupt or
/// invalid first record).
pub fn looks_like_plain_http(err: &anyhow::Error) -> bool {
    let msg = format!("{err:#}").to_lowercase();
    msg.contains("server gave http response to https client")
        || msg.contains("first record does not look like a tls handshake")
        || msg.contains("corrupt message")
        || msg.contains("invalid message")
        || msg.contains("handshake failure")
        || msg.contains("tls: internal error")
}

fn io_error(err: &anyhow::Error) -> Option<&std::io::Error> {
    err.chain().find_map(|c| c.downcast_ref::<std::io::Error>())
}

fn is_timeout(err: &anyhow::Error, msg: &str) -> bool {
    if let Some(io) = io_error(err) {
        if io.kind() == ErrorKind::TimedOut || io.kind() == ErrorKind::WouldBlock {
            return true;
        }
    }
    msg.contains("timed out") || msg.contains("deadline has elapsed")
}

fn is_dial_like(err: &anyhow::Error, msg: &str) -> bool {
    if let Some(io) = io_error(err) {
        match io.kind() {
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected => return true,
            _ => {}
        }
        // EHOSTUNREACH / ENETUNREACH
        if matches!(io.raw_os_error(), Some(101) | Some(113)) {
            return true;
        }
    }
    msg.contains("connection refused")
        || msg.contains("no route to host")
        || msg.contains("unreachable")
        || msg.contains("connection reset")
        || msg.contains("broken pipe")
}

/// Map a low-level error to its `FailureKind`. Matching order mirrors the
/// diagnostic priority: specific proxy-level signatures win over generic
/// transport ones.
pub fn classify(err: &anyhow::Error) -> FailureKind {
    let msg = format!("{err:#}").to_lowercase();

    if looks_like_plain_http(err) {
        return FailureKind::HttpsToHttp;
    }

    if msg.contains("connect failed") {
        if let Some(code) = parse_status_from_text(&msg) {
            if is_auth_status(code) {
                return FailureKind::Auth;
            }
        }
        return FailureKind::ConnectFail;
    }

    if msg.contains("non-204") {
        if let Some(code) = parse_status_from_text(&msg) {
            if is_auth_status(code) {
                return FailureKind::Auth;
            }
        }
        return FailureKind::Non204;
    }

    if msg.contains("proxy authentication")
        || msg.contains("authentication failed")
        || msg.contains("407")
    {
        return FailureKind::Auth;
    }

    if is_timeout(err, &msg) {
        return FailureKind::Timeout;
    }

    if msg.contains("tls") || msg.contains("handshake") {
        return FailureKind::Tls;
    }

    if msg.contains("no such host")
        || msg.contains("failed to lookup")
        || msg.contains("name or service not known")
        || msg.contains("nodename nor servname")
    {
        return FailureKind::Dns;
    }

    if is_dial_like(err, &msg) {
        if msg.contains("connection refused")
            || io_error(err).is_some_and(|e| e.kind() == ErrorKind::ConnectionRefused)
        {
            return FailureKind::Refused;
        }
        if msg.contains("no route") || msg.contains("unreachable") {
            return FailureKind::Unreachable;
        }
        if msg.contains("reset")
            || io_error(err).is_some_and(|e| e.kind() == ErrorKind::ConnectionReset)
        {
            return FailureKind::Reset;
        }
        return FailureKind::Dial;
    }

    if msg.contains("ipinfo") || msg.contains("json") {
        return FailureKind::IpInfo;
    }

    if msg.contains("eof") || io_error(err).is_some_and(|e| e.kind() == ErrorKind::UnexpectedEof) {
        return FailureKind::Eof;
    }

    FailureKind::Other
}

/// Choose the kind that represents an endpoint after multiple failed
/// attempts: highest-priority observed kind, else the classification of the
/// last underlying error, else `other`.
pub fn choose_primary(observed: &[FailureKind], last_err: Option<&anyhow::Error>) -> FailureKind {
    for p in PRIORITY {
        if observed.contains(&p) {
            return p;
        }
    }
    last_err.map(classify).unwrap_or(FailureKind::Other)
}
