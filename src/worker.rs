//! Per-endpoint probing state machine and the worker task around it.
//!
//! One worker handles one endpoint at a time; protocol and credential
//! attempts run strictly sequentially on the worker's own task. A `reset`,
//! `unreachable` or `refused` failure marks the endpoint dead and aborts
//! every remaining attempt, across protocols.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::Mutex;

use crate::admission::AdmissionState;
use crate::classify::{choose_primary, FailureKind};
use crate::cli::Mode;
use crate::dial::Dialer;
use crate::endpoint::{Credential, Job, Outcome, Protocol, Success};
use crate::ipinfo::IntelTarget;
use crate::parse::protocol_order;
use crate::probe;
use crate::stats::Counters;

/// Immutable context shared by every worker.
pub struct WorkerCtx {
    pub mode: Mode,
    pub auths: Vec<Credential>,
    pub timeout: Duration,
    pub delay: Duration,
    pub dialer: Dialer,
    pub intel: IntelTarget,
    pub counters: Arc<Counters>,
    pub admission: Arc<AdmissionState>,
}

/// Credential order for one endpoint: the empty credential always goes
/// first; a non-empty inline credential replaces the configured list.
pub fn effective_credentials(
    defaults: &[Credential],
    inline: Option<&Credential>,
) -> Vec<Credential> {
    let mut out = vec![Credential::default()];
    match inline {
        Some(cred) if !cred.is_empty() => out.push(cred.clone()),
        Some(_) => {}
        None => out.extend(defaults.iter().filter(|c| !c.is_empty()).cloned()),
    }
    out
}

/// Protocols to try for one job, in order.
pub fn effective_protocols(mode: Mode, job: &Job) -> Vec<Protocol> {
    match mode.fixed_protocol() {
        Some(p) => vec![p],
        None => protocol_order(job.hint, job.endpoint.port).to_vec(),
    }
}

/// Block until the admission controller admits one more probe.
async fn admission_gate(adm: &AdmissionState) {
    loop {
        if adm.is_paused() {
            tokio::time::sleep(Duration::from_millis(10)).await;
            continue;
        }
        let limit = adm.limit();
        if limit <= 0 || (adm.active() as i64) < limit {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

struct ActiveGuard<'a>(&'a AdmissionState);

impl<'a> ActiveGuard<'a> {
    fn enter(adm: &'a AdmissionState) -> Self {
        adm.active.fetch_add(1, Ordering::Relaxed);
        Self(adm)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Run the protocol/credential loop for one endpoint.
pub async fn process_job(ctx: &WorkerCtx, job: &Job) -> Outcome {
    let creds = effective_credentials(&ctx.auths, job.inline_cred.as_ref());
    let protocols = effective_protocols(ctx.mode, job);

    let mut successes: Vec<Success> = Vec::new();
    let mut reasons: Vec<FailureKind> = Vec::new();
    let mut last_error: Option<anyhow::Error> = None;
    let mut endpoint_dead = false;

    'protocols: for proto in protocols {
        if endpoint_dead {
            break;
        }
        let mut ok_this_protocol = false;

        for cred in &creds {
            admission_gate(&ctx.admission).await;
            let result = {
                let _active = ActiveGuard::enter(&ctx.admission);
                probe::run(
                    proto,
                    &job.endpoint,
                    cred,
                    &ctx.dialer,
                    &ctx.intel,
                    ctx.timeout,
                    &ctx.counters.requests,
                )
                .await
            };

            match result {
                Ok(s) => {
                    // The HTTPS prober may land on plain HTTP; keep one
                    // success per resulting protocol.
                    if !successes.iter().any(|x| x.protocol == s.protocol) {
                        successes.push(Success {
                            protocol: s.protocol,
                            cred: cred.clone(),
                            info: s.info,
                        });
                    }
                    ok_this_protocol = true;
                    break;
                }
                Err(f) => {
                    reasons.push(f.kind);
                    let dead = f.kind.is_unreachable_signal();
                    last_error = Some(f.error);
                    if dead {
                        endpoint_dead = true;
                        continue 'protocols;
                    }
                }
            }
        }

        if ctx.mode == Mode::Auto && ok_this_protocol {
            break;
        }
    }

    let fail_kind = if successes.is_empty() {
        Some(choose_primary(&reasons, last_error.as_ref()))
    } else {
        None
    };

    Outcome {
        endpoint: job.endpoint.clone(),
        successes,
        fail_kind,
        last_error: last_error.map(|e| format!("{e:#}")),
    }
}

/// Worker task: pull jobs until the channel closes, push one outcome per
/// job, optionally pause between endpoints.
pub async fn worker_loop(
    ctx: Arc<WorkerCtx>,
    jobs: Arc<Mutex<mpsc::Receiver<Job>>>,
    out: mpsc::Sender<Outcome>,
) {
    loop {
        let job = { jobs.lock().await.recv().await };
        let Some(job) = job else {
            break;
        };
        let outcome = process_job(&ctx, &job).await;
        if out.send(outcome).await.is_err() {
            break;
        }
        if !ctx.delay.is_zero() {
            tokio::time::sleep(ctx.delay).await;
        }
    }
}
