//! End-to-end runs against in-process mock proxies and a mock intel
//! endpoint. The intel URL is pointed at a plain-HTTP host so the whole
//! exchange stays hermetic.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use proxyvet::app::{self, AppConfig};
use proxyvet::cli::Mode;
use proxyvet::parse::parse_line;

const INTEL_BODY: &str = r#"{"ipapi":{"country":"US","asn":{"name":"ExampleNet","type":"isp"},"company":{"name":"ExampleCorp","type":"business"}},"code":200}"#;

fn intel_response() -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        INTEL_BODY.len(),
        INTEL_BODY
    )
}

async fn read_until_blank_line(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// SOCKS5 proxy that accepts NO_AUTH, then answers the tunneled intel
/// request itself.
async fn spawn_socks5_intel() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut head = [0u8; 2];
                stream.read_exact(&mut head).await.unwrap();
                assert_eq!(head[0], 0x05);
                let mut methods = vec![0u8; head[1] as usize];
                stream.read_exact(&mut methods).await.unwrap();
                stream.write_all(&[0x05, 0x00]).await.unwrap();

                let mut req = [0u8; 4];
                stream.read_exact(&mut req).await.unwrap();
                assert_eq!(req[1], 0x01);
                match req[3] {
                    0x01 => {
                        let mut rest = [0u8; 6];
                        stream.read_exact(&mut rest).await.unwrap();
                    }
                    0x03 => {
                        let mut len = [0u8; 1];
                        stream.read_exact(&mut len).await.unwrap();
                        let mut rest = vec![0u8; len[0] as usize + 2];
                        stream.read_exact(&mut rest).await.unwrap();
                    }
                    _ => panic!("unexpected atyp"),
                }
                stream
                    .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                    .await
                    .unwrap();

                let _req = read_until_blank_line(&mut stream).await;
                stream.write_all(intel_response().as_bytes()).await.unwrap();
            });
        }
    });
    addr
}

/// HTTP proxy answering absolute-form GETs; requires `user:pass` when
/// `required_auth` is set, else replies 407.
async fn spawn_http_proxy(required_auth: Option<&'static str>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let req = read_until_blank_line(&mut stream).await;
                assert!(req.starts_with("GET http://"), "not absolute-form: {req}");
                let authorized = match required_auth {
                    None => true,
                    Some(token) => req.contains(&format!("Proxy-Authorization: Basic {token}")),
                };
                if authorized {
                    stream.write_all(intel_response().as_bytes()).await.unwrap();
                } else {
                    stream
                        .write_all(
                            b"HTTP/1.1 407 Proxy Authentication Required\r\nContent-Length: 0\r\n\r\n",
                        )
                        .await
                        .unwrap();
                }
            });
        }
    });
    addr
}

/// A proxy speaking several protocols on one port, keyed off the first
/// byte: TLS client hello gets a plaintext HTTP error (a proxy that only
/// speaks plain HTTP), SOCKS5 gets a full handshake, anything else is
/// treated as an absolute-form HTTP proxy request.
async fn spawn_polyglot_proxy() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut first = [0u8; 1];
                stream.read_exact(&mut first).await.unwrap();
                match first[0] {
                    0x16 => {
                        // TLS record from the HTTPS prober: answer like a
                        // confused plain HTTP server.
                        let mut drain = [0u8; 1024];
                        let _ = stream.read(&mut drain).await;
                        let _ = stream
                            .write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n")
                            .await;
                    }
                    0x05 => {
                        let mut n = [0u8; 1];
                        stream.read_exact(&mut n).await.unwrap();
                        let mut methods = vec![0u8; n[0] as usize];
                        stream.read_exact(&mut methods).await.unwrap();
                        stream.write_all(&[0x05, 0x00]).await.unwrap();
                        let mut req = [0u8; 4];
                        stream.read_exact(&mut req).await.unwrap();
                        let mut len = [0u8; 1];
                        stream.read_exact(&mut len).await.unwrap();
                        let mut rest = vec![0u8; len[0] as usize + 2];
                        stream.read_exact(&mut rest).await.unwrap();
                        stream
                            .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                            .await
                            .unwrap();
                        let _req = read_until_blank_line(&mut stream).await;
                        stream.write_all(intel_response().as_bytes()).await.unwrap();
                    }
                    _ => {
                        let rest = read_until_blank_line(&mut stream).await;
                        let req = format!("{}{}", first[0] as char, rest);
                        assert!(req.contains("GET http://"), "unexpected request: {req}");
                        stream.write_all(intel_response().as_bytes()).await.unwrap();
                    }
                }
            });
        }
    });
    addr
}

struct TestRun {
    dir: tempfile::TempDir,
}

impl TestRun {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    async fn config(&self, input_lines: &str, mode: Mode) -> AppConfig {
        let input = self.dir.path().join("input.txt");
        tokio::fs::write(&input, input_lines).await.unwrap();
        let mut cfg = AppConfig::new(input, self.dir.path().join("out.txt"));
        cfg.mode = mode;
        cfg.timeout = Duration::from_secs(3);
        cfg.concurrency = 4;
        cfg.unsafe_mode = true;
        cfg.progress_every = Duration::from_secs(30);
        cfg.intel_url = "http://intel.test/ipapi".into();
        cfg
    }

    async fn output_lines(&self, path: &PathBuf) -> Vec<String> {
        tokio::fs::read_to_string(path)
            .await
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }
}

#[tokio::test]
async fn socks5_success_emits_intel_line() {
    let proxy = spawn_socks5_intel().await;
    let t = TestRun::new();
    let cfg = t
        .config(&format!("{}:{}\n", proxy.ip(), proxy.port()), Mode::Socks5)
        .await;
    let report = app::run(cfg).await.unwrap();

    assert_eq!(report.summary.done, 1);
    assert_eq!(report.summary.ok_endpoints, 1);
    assert_eq!(report.summary.ok_lines, 1);
    assert_eq!(report.summary.fail, 0);
    assert_eq!(report.summary.skip, 0);
    assert_eq!(report.summary.requests, 1);

    let lines = t.output_lines(&report.output).await;
    assert_eq!(
        lines,
        vec![format!(
            "socks5://{}:{}#[ExampleCorp][isp][US]",
            proxy.ip(),
            proxy.port()
        )]
    );
}

#[tokio::test]
async fn auth_proxy_succeeds_with_inline_credential() {
    // base64("u:p")
    let proxy = spawn_http_proxy(Some("dTpw")).await;
    let t = TestRun::new();
    let cfg = t
        .config(
            &format!("http://u:p@{}:{}\n", proxy.ip(), proxy.port()),
            Mode::Auto,
        )
        .await;
    let report = app::run(cfg).await.unwrap();

    assert_eq!(report.summary.ok_endpoints, 1);
    assert_eq!(report.summary.ok_lines, 1);
    assert_eq!(report.summary.fail, 0);
    // The empty-credential 407 is discarded because the protocol succeeded.
    assert!(report.fail_reasons.is_empty());

    let lines = t.output_lines(&report.output).await;
    assert_eq!(
        lines,
        vec![format!(
            "http://u:p@{}:{}#[ExampleCorp][isp][US]",
            proxy.ip(),
            proxy.port()
        )]
    );

    // Output round-trips through the parser.
    let parsed = parse_line(&lines[0], None).unwrap();
    assert_eq!(parsed.endpoint.authority(), format!("{}:{}", proxy.ip(), proxy.port()));
    assert_eq!(parsed.inline_cred.unwrap().user, "u");
}

#[tokio::test]
async fn https_falls_back_to_plain_http() {
    let proxy = spawn_polyglot_proxy().await;
    let t = TestRun::new();
    // Auto mode on a non-special port probes HTTPS first; the polyglot
    // proxy speaks plaintext, so the fallback lands on HTTP.
    let cfg = t
        .config(&format!("{}:{}\n", proxy.ip(), proxy.port()), Mode::Auto)
        .await;
    let report = app::run(cfg).await.unwrap();

    assert_eq!(report.summary.ok_endpoints, 1);
    assert_eq!(report.summary.ok_lines, 1);
    assert_eq!(report.summary.fail, 0);
    let lines = t.output_lines(&report.output).await;
    assert_eq!(lines.len(), 1);
    assert!(
        lines[0].starts_with(&format!("http://{}:{}#", proxy.ip(), proxy.port())),
        "expected http scheme after fallback, got {}",
        lines[0]
    );
}

#[tokio::test]
async fn all_mode_collects_one_success_per_protocol() {
    let proxy = spawn_polyglot_proxy().await;
    let t = TestRun::new();
    let cfg = t
        .config(&format!("{}:{}\n", proxy.ip(), proxy.port()), Mode::All)
        .await;
    let report = app::run(cfg).await.unwrap();

    assert_eq!(report.summary.ok_endpoints, 1);
    // https degrades to http (one line), socks5 works directly (second
    // line); the direct http attempt must not duplicate the first.
    assert_eq!(report.summary.ok_lines, 2);
    let lines = t.output_lines(&report.output).await;
    assert_eq!(lines.len(), 2);
    assert!(lines.iter().any(|l| l.starts_with("http://")));
    assert!(lines.iter().any(|l| l.starts_with("socks5://")));
}

#[tokio::test]
async fn refused_endpoint_short_circuits() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let t = TestRun::new();
    let cfg = t
        .config(&format!("{}:{}\n", addr.ip(), addr.port()), Mode::All)
        .await;
    let report = app::run(cfg).await.unwrap();

    assert_eq!(report.summary.done, 1);
    assert_eq!(report.summary.ok_endpoints, 0);
    assert_eq!(report.summary.fail, 1);
    assert_eq!(report.fail_reasons.get("refused"), Some(&1));
    assert!(t.output_lines(&report.output).await.is_empty());
    // The first refused connect aborts the endpoint; nothing ever reached
    // the request stage.
    assert_eq!(report.summary.requests, 0);
}

#[tokio::test]
async fn comments_blanks_and_bad_lines() {
    let t = TestRun::new();
    let cfg = t
        .config("# comment\n\nnot_a_valid_line\n", Mode::Auto)
        .await;
    let report = app::run(cfg).await.unwrap();

    assert_eq!(report.summary.done, 1);
    assert_eq!(report.summary.skip, 1);
    assert_eq!(report.summary.fail, 0);
    assert_eq!(report.summary.ok_endpoints, 0);
    assert_eq!(report.skip_reasons.get("bad_line"), Some(&1));
}

#[tokio::test]
async fn counters_balance_over_mixed_input() {
    let proxy = spawn_socks5_intel().await;
    let t = TestRun::new();
    let refused = {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let a = l.local_addr().unwrap();
        drop(l);
        a
    };
    let input = format!(
        "# header\n{}:{}\nbroken_line\n{}:{}\n",
        proxy.ip(),
        proxy.port(),
        refused.ip(),
        refused.port()
    );
    let cfg = t.config(&input, Mode::Socks5).await;
    let report = app::run(cfg).await.unwrap();

    let s = report.summary;
    assert_eq!(s.done, 3);
    assert_eq!(s.done, s.ok_endpoints + s.fail + s.skip);
    assert_eq!(s.ok_endpoints, 1);
    assert_eq!(s.fail, 1);
    assert_eq!(s.skip, 1);
}
