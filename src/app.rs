//! Run orchestration: streaming dispatcher, worker pool, result writer,
//! progress reporter and the admission sampler, glued by bounded channels.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, Mutex};

use crate::admission::{self, AdmissionState};
use crate::cdn::{self, CdnFilter, CdnSources};
use crate::cli::Mode;
use crate::dial::{Dialer, UpstreamDialer, UpstreamMode};
use crate::endpoint::{format_result_line, Credential, Endpoint, Outcome};
use crate::ipinfo::IntelTarget;
use crate::parse;
use crate::platform;
use crate::stats::{format_eta, Counters, ReasonCounters, Summary};
use crate::worker::{worker_loop, WorkerCtx};

/// Input lines above this are counted as bad lines rather than parsed.
const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

const WRITE_BUF_BYTES: usize = 512 * 1024;
const FLUSH_EVERY: Duration = Duration::from_millis(500);
const FLUSH_EVERY_RECORDS: usize = 256;
const CDN_LOAD_TIMEOUT: Duration = Duration::from_secs(12);

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub endpoint: Endpoint,
    pub mode: UpstreamMode,
    pub auth: Option<Credential>,
}

/// Full run configuration. `Cli::into_config` builds this for the binary;
/// tests construct it directly.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub input: PathBuf,
    pub output: PathBuf,
    pub mode: Mode,
    pub default_port: Option<u16>,
    pub timeout: Duration,
    pub delay: Duration,
    pub concurrency: usize,
    pub progress_every: Duration,
    pub auth_file: Option<PathBuf>,
    pub mem_budget: f64,
    pub mem_per_job: i64,
    pub gc_limit: f64,
    pub unsafe_mode: bool,
    pub skip_cdn: bool,
    pub upstream: Option<UpstreamConfig>,
    pub verbose: bool,
    pub intel_url: String,
    pub cdn_sources: CdnSources,
}

impl AppConfig {
    pub fn new(input: PathBuf, output: PathBuf) -> Self {
        Self {
            input,
            output,
            mode: Mode::Auto,
            default_port: None,
            timeout: Duration::from_secs(10),
            delay: Duration::ZERO,
            concurrency: 0,
            progress_every: Duration::from_secs(1),
            auth_file: None,
            mem_budget: 0.55,
            mem_per_job: 256 * 1024,
            gc_limit: 0.75,
            unsafe_mode: false,
            skip_cdn: false,
            upstream: None,
            verbose: false,
            intel_url: crate::ipinfo::PRIMARY_IPAPI.to_string(),
            cdn_sources: CdnSources::default(),
        }
    }
}

/// Final counters plus the per-reason tallies.
#[derive(Debug)]
pub struct RunReport {
    pub summary: Summary,
    pub fail_reasons: HashMap<String, u64>,
    pub skip_reasons: HashMap<String, u64>,
    pub output: PathBuf,
}

/// Resolve the worker count from the request, CPU count and resource
/// limits. Returns `(workers, mem_limit, fd_limit)`.
pub fn cap_concurrency(
    requested: usize,
    unsafe_mode: bool,
    mem_budget: f64,
    mem_per_job: i64,
) -> (usize, Option<i64>, u64) {
    let mem_limit = platform::detect_mem_limit_bytes();
    let fd_limit = platform::detect_fd_limit().unwrap_or(0);

    let mut workers = if requested > 0 {
        requested
    } else {
        let cpus = num_cpus::get();
        let base = if cpus >= 8 { cpus * 3000 } else { cpus * 2000 };
        base.max(1000)
    };

    if !unsafe_mode && fd_limit > 0 {
        // Budget roughly four descriptors per in-flight endpoint.
        let by_fd = ((fd_limit * 70 / 100) / 4).max(1000) as usize;
        workers = workers.min(by_fd);
    }
    if !unsafe_mode {
        if let Some(mem) = mem_limit {
            let per_job = mem_per_job.max(1);
            let mut budget = (mem as f64 * mem_budget) as i64;
            if budget <= 0 {
                budget = mem / 2;
            }
            let by_mem = ((budget / per_job).max(1000)) as usize;
            workers = workers.min(by_mem);
        }
        workers = workers.max(1000);
    }
    (workers.max(1), mem_limit, fd_limit)
}

/// Streaming pre-count of work items for the ETA: every non-blank,
/// non-comment line counts, parseable or not.
pub async fn count_work_items(path: &std::path::Path) -> Result<u64> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("open input file {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut line = String::new();
    let mut n = 0u64;
    loop {
        line.clear();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            break;
        }
        let t = line.trim();
        if t.is_empty() || t.starts_with('#') {
            continue;
        }
        n += 1;
    }
    Ok(n)
}

pub async fn run(cfg: AppConfig) -> Result<RunReport> {
    let intel = IntelTarget::parse(&cfg.intel_url)?;

    let _ = platform::raise_fd_limit(100_000);

    let total = count_work_items(&cfg.input).await?;
    if total == 0 {
        bail!("input file {} has no work items", cfg.input.display());
    }

    let auths = parse::load_auth_file(cfg.auth_file.as_deref())?;

    let cdn: Option<CdnFilter> = if cfg.skip_cdn {
        match cdn::load(&cfg.cdn_sources, CDN_LOAD_TIMEOUT).await {
            Ok(filter) => {
                let (v4, v6) = filter.len();
                tracing::info!("cdn ranges loaded: v4={v4} v6={v6} (cloudflare/fastly/cloudfront)");
                Some(filter)
            }
            Err(e) => {
                tracing::warn!("cdn range fetch failed, not skipping cdn ranges: {e:#}");
                None
            }
        }
    } else {
        None
    };

    let dialer = match &cfg.upstream {
        Some(up) => Dialer::Upstream(UpstreamDialer {
            endpoint: up.endpoint.clone(),
            mode: up.mode,
            cred: up.auth.clone(),
        }),
        None => Dialer::Direct,
    };

    let (workers, mem_limit, fd_limit) =
        cap_concurrency(cfg.concurrency, cfg.unsafe_mode, cfg.mem_budget, cfg.mem_per_job);

    tracing::info!(
        "start: ips={} mode={} timeout={} concurrency={} memLimit={} fdLimit={} out={} unsafe={}",
        total,
        cfg.mode,
        humantime::format_duration(cfg.timeout),
        workers,
        platform::human_bytes(mem_limit.unwrap_or(0)),
        fd_limit,
        cfg.output.display(),
        cfg.unsafe_mode,
    );

    let out_file = std::fs::File::create(&cfg.output)
        .with_context(|| format!("create output file {}", cfg.output.display()))?;
    let mut writer = std::io::BufWriter::with_capacity(WRITE_BUF_BYTES, out_file);

    let counters = Counters::new();
    let fail_reasons = ReasonCounters::new();
    let skip_reasons = ReasonCounters::new();
    let admission_state = AdmissionState::new(workers as i64);
    let admission_task = if cfg.unsafe_mode {
        None
    } else {
        Some(admission::spawn_controller(
            Arc::clone(&admission_state),
            workers as i64,
            mem_limit,
            fd_limit,
        ))
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    let signal_task = {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, draining in-flight probes");
                shutdown.store(true, Ordering::Relaxed);
            }
        })
    };

    let queue_cap = (workers / 4).clamp(128, 4096);
    let (job_tx, job_rx) = mpsc::channel(queue_cap);
    let (outcome_tx, mut outcome_rx) = mpsc::channel::<Outcome>(queue_cap);
    let job_rx = Arc::new(Mutex::new(job_rx));

    // Progress reporter.
    let progress_task = {
        let counters = Arc::clone(&counters);
        let admission_state = Arc::clone(&admission_state);
        let every = cfg.progress_every;
        tokio::spawn(async move {
            let start = std::time::Instant::now();
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            let mut last_done = 0u64;
            let mut last_req = 0u64;
            let mut ema_ips = 0f64;
            let mut ema_qps = 0f64;
            loop {
                ticker.tick().await;
                let s = Summary::capture(&counters);
                let cur_ips = (s.done - last_done) as f64 / every.as_secs_f64();
                let cur_qps = (s.requests - last_req) as f64 / every.as_secs_f64();
                ema_ips = if ema_ips == 0.0 {
                    cur_ips
                } else {
                    ema_ips * 0.80 + cur_ips * 0.20
                };
                ema_qps = if ema_qps == 0.0 {
                    cur_qps
                } else {
                    ema_qps * 0.80 + cur_qps * 0.20
                };
                last_done = s.done;
                last_req = s.requests;

                let left = total.saturating_sub(s.done);
                let eta = if ema_ips > 0.0 {
                    Duration::from_secs_f64(left as f64 / ema_ips)
                } else {
                    Duration::ZERO
                };
                eprintln!(
                    "ips:{:9}/{:<9} left:{:<9} ip/s:{:8.1} qps:{:8.1} eta:{:<10} ok:{:<6} fail:{:<8} skip:{:<6} dyn:{:<6} act:{:<6} up:{}",
                    s.done,
                    total,
                    left,
                    ema_ips,
                    ema_qps,
                    format_eta(eta),
                    s.ok_endpoints,
                    s.fail,
                    s.skip,
                    admission_state.limit(),
                    admission_state.active(),
                    format_eta(start.elapsed()),
                );
            }
        })
    };

    // Result writer: the only task touching the output file and the only
    // place `done` advances for dispatched endpoints.
    let writer_task = {
        let counters = Arc::clone(&counters);
        let fail_reasons = Arc::clone(&fail_reasons);
        let verbose = cfg.verbose;
        tokio::spawn(async move {
            let mut pending = 0usize;
            let mut flush = tokio::time::interval(FLUSH_EVERY);
            flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    outcome = outcome_rx.recv() => {
                        let Some(outcome) = outcome else {
                            let _ = writer.flush();
                            break;
                        };
                        if outcome.successes.is_empty() {
                            counters.fail.fetch_add(1, Ordering::Relaxed);
                            let why = outcome
                                .fail_kind
                                .map(|k| k.as_str())
                                .unwrap_or("other");
                            fail_reasons.inc(why);
                            if verbose {
                                eprintln!(
                                    "FAIL {} why={} err={}",
                                    outcome.endpoint,
                                    why,
                                    outcome.last_error.as_deref().unwrap_or("-"),
                                );
                            }
                        } else {
                            counters.ok_endpoints.fetch_add(1, Ordering::Relaxed);
                            counters
                                .ok_lines
                                .fetch_add(outcome.successes.len() as u64, Ordering::Relaxed);
                            for s in &outcome.successes {
                                let line = format_result_line(&outcome.endpoint, s);
                                if let Err(e) = writeln!(writer, "{line}") {
                                    tracing::error!("write failed: {e}");
                                } else {
                                    pending += 1;
                                    if pending >= FLUSH_EVERY_RECORDS {
                                        let _ = writer.flush();
                                        pending = 0;
                                    }
                                }
                            }
                        }
                        counters.done.fetch_add(1, Ordering::Relaxed);
                    }
                    _ = flush.tick() => {
                        let _ = writer.flush();
                        pending = 0;
                    }
                }
            }
        })
    };

    // Worker pool.
    let ctx = Arc::new(WorkerCtx {
        mode: cfg.mode,
        auths,
        timeout: cfg.timeout,
        delay: cfg.delay,
        dialer,
        intel,
        counters: Arc::clone(&counters),
        admission: Arc::clone(&admission_state),
    });
    let mut worker_tasks = Vec::with_capacity(workers);
    for _ in 0..workers {
        worker_tasks.push(tokio::spawn(worker_loop(
            Arc::clone(&ctx),
            Arc::clone(&job_rx),
            outcome_tx.clone(),
        )));
    }
    drop(outcome_tx);

    // Streaming dispatcher.
    let dispatcher = {
        let counters = Arc::clone(&counters);
        let skip_reasons = Arc::clone(&skip_reasons);
        let shutdown = Arc::clone(&shutdown);
        let input = cfg.input.clone();
        let default_port = cfg.default_port;
        tokio::spawn(async move {
            let file = match tokio::fs::File::open(&input).await {
                Ok(f) => f,
                Err(e) => {
                    tracing::error!("open input file {}: {e}", input.display());
                    return;
                }
            };
            let mut reader = BufReader::new(file);
            let mut line = String::new();
            loop {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                line.clear();
                let read = match reader.read_line(&mut line).await {
                    Ok(n) => n,
                    Err(e) => {
                        tracing::error!("read input file: {e}");
                        break;
                    }
                };
                if read == 0 {
                    break;
                }
                let raw = line.trim();
                if raw.is_empty() || raw.starts_with('#') {
                    continue;
                }
                if raw.len() > MAX_LINE_BYTES {
                    counters.skip.fetch_add(1, Ordering::Relaxed);
                    skip_reasons.inc("bad_line");
                    counters.done.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                let job = match parse::parse_line(raw, default_port) {
                    Ok(job) => job,
                    Err(e) => {
                        tracing::debug!("bad line {raw:?}: {e:#}");
                        counters.skip.fetch_add(1, Ordering::Relaxed);
                        skip_reasons.inc("bad_line");
                        counters.done.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                };
                if let Some(filter) = &cdn {
                    if let Some(provider) = job.endpoint.ip().and_then(|ip| filter.match_ip(ip)) {
                        counters.skip.fetch_add(1, Ordering::Relaxed);
                        skip_reasons.inc(&format!("cdn_{provider}"));
                        counters.done.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                }
                if job_tx.send(job).await.is_err() {
                    break;
                }
            }
            // Dropping the sender closes the job channel; workers drain and
            // exit.
        })
    };

    dispatcher.await.ok();
    for task in worker_tasks {
        task.await.ok();
    }
    writer_task.await.ok();
    progress_task.abort();
    if let Some(task) = admission_task {
        task.abort();
    }
    signal_task.abort();

    let summary = Summary::capture(&counters);
    eprintln!(
        "done. out={} okIP={} okLines={} fail={} skip={}",
        cfg.output.display(),
        summary.ok_endpoints,
        summary.ok_lines,
        summary.fail,
        summary.skip,
    );
    if summary.fail > 0 {
        tracing::info!("top failure reasons: {}", fail_reasons.top(8));
    }

    Ok(RunReport {
        summary,
        fail_reasons: fail_reasons.snapshot(),
        skip_reasons: skip_reasons.snapshot(),
        output: cfg.output,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap_concurrency_unsafe_respects_request() {
        let (workers, _, _) = cap_concurrency(4, true, 0.55, 256 * 1024);
        assert_eq!(workers, 4);
    }

    #[test]
    fn cap_concurrency_enforces_floor_when_safe() {
        let (workers, _, fd_limit) = cap_concurrency(10, false, 0.55, 256 * 1024);
        assert!(workers >= 1000 || fd_limit == 0);
    }

    #[tokio::test]
    async fn count_skips_comments_and_blanks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.txt");
        tokio::fs::write(&path, "# c\n\n1.2.3.4:80\nfoo\n   \n").await.unwrap();
        assert_eq!(count_work_items(&path).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn missing_input_is_fatal() {
        let cfg = AppConfig::new(PathBuf::from("/nonexistent/in.txt"), PathBuf::from("/tmp/x"));
        assert!(run(cfg).await.is_err());
    }
}
