//! Long-lived driver (§4.5): serializes scans, coalesces events between scans, schedules
//! delayed re-runs with a bounded timer, applies backoff on scan failure.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use hyper::service::{make_service_fn, service_fn};
use hyper::Server;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::bot_identity::BotIdentityCache;
use crate::config::Config;
use crate::forge::ForgeClient;
use crate::identity::PrIdentity;
use crate::scan::{self, PrScanResult, ScanOutcome};
use crate::webhook;

/// The platform's maximum single-shot timer delay (§5 "the wakeup timer is clamped to
/// ≤2³¹−1 ms").
const MAX_TIMER_MS: u64 = (i32::MAX) as u64;

/// Scans that fail back off for a fixed 10 minutes (§4.5 step 2, §7).
const ERROR_BACKOFF: Duration = Duration::from_secs(10 * 60);

/// Everything [`Scheduler`] needs to bind and re-bind its own webhook listener (§4.5 step 2,
/// §6.2). Kept as a plain value rather than read from [`Config`] field-by-field so the
/// listener can be rebuilt with nothing but `&self`.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub addr: SocketAddr,
    pub webhook_path: String,
    pub webhook_secret: String,
    pub owner_repo: String,
    pub staging_branch: String,
}

struct SchedulerState {
    running: bool,
    rerun: bool,
    pending: Option<Vec<PrIdentity>>,
    last_scan: Option<PrScanResult>,
    /// `Some` while the webhook listener is up; sending on it triggers graceful shutdown
    /// (§4.5 step 2: "closes and recreates the HTTP listener" during error backoff).
    listener_shutdown: Option<oneshot::Sender<()>>,
}

/// Owns the one piece of shared mutable state in the whole system (§5, §9 "no global mutable
/// state": `lastScan`, pending ids, and the timer all live here instead of at module scope),
/// plus the webhook listener itself, so the scheduler can actually stop accepting deliveries
/// during its error backoff rather than merely sleeping while the listener keeps queuing them.
pub struct Scheduler<C: ForgeClient + ?Sized> {
    client: Arc<C>,
    config: Config,
    bot_identity: BotIdentityCache,
    listener: ListenerConfig,
    state: Mutex<SchedulerState>,
}

impl<C: ForgeClient + ?Sized + 'static> Scheduler<C> {
    pub fn new(client: Arc<C>, config: Config, listener: ListenerConfig) -> Self {
        Scheduler {
            client,
            config,
            bot_identity: BotIdentityCache::new(),
            listener,
            state: Mutex::new(SchedulerState {
                running: false,
                rerun: false,
                pending: Some(Vec::new()),
                last_scan: None,
                listener_shutdown: None,
            }),
        }
    }

    /// Starts the webhook listener and kicks off the initial full scan (§4.5). Everything
    /// afterward is driven by webhook events and the scan loop's own timer.
    pub async fn start(self: &Arc<Self>) {
        self.spawn_listener();
        self.run(None).await;
    }

    /// Binds the webhook HTTP endpoint and serves it until [`Scheduler::stop_listener`] fires
    /// (§6.2). Grounded on the teacher's `main.rs` `hyper::Server::bind(...).serve(...)` setup,
    /// moved here so the scan loop can close and recreate it around the error backoff.
    fn spawn_listener(self: &Arc<Self>) {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock();
            state.listener_shutdown = Some(tx);
        }

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let addr = scheduler.listener.addr;
            let webhook_path = scheduler.listener.webhook_path.clone();
            let webhook_secret = scheduler.listener.webhook_secret.clone();
            let owner_repo = scheduler.listener.owner_repo.clone();
            let staging_branch = scheduler.listener.staging_branch.clone();

            let make_svc = make_service_fn(move |_conn| {
                let scheduler = Arc::clone(&scheduler);
                let webhook_path = webhook_path.clone();
                let webhook_secret = webhook_secret.clone();
                let owner_repo = owner_repo.clone();
                let staging_branch = staging_branch.clone();
                async move {
                    Ok::<_, Infallible>(service_fn(move |req| {
                        let scheduler = Arc::clone(&scheduler);
                        let webhook_path = webhook_path.clone();
                        let webhook_secret = webhook_secret.clone();
                        let owner_repo = owner_repo.clone();
                        let staging_branch = staging_branch.clone();
                        async move {
                            let result = webhook::serve(
                                req,
                                &webhook_path,
                                &webhook_secret,
                                &owner_repo,
                                &staging_branch,
                                scheduler,
                            )
                            .await;
                            Ok::<_, Infallible>(result.unwrap_or_else(|e| {
                                hyper::Response::builder()
                                    .status(hyper::StatusCode::INTERNAL_SERVER_ERROR)
                                    .body(hyper::Body::from(e.to_string()))
                                    .unwrap()
                            }))
                        }
                    }))
                }
            });

            log::info!("listening on {}", addr);
            let server = Server::bind(&addr)
                .serve(make_svc)
                .with_graceful_shutdown(async {
                    rx.await.ok();
                });
            if let Err(e) = server.await {
                log::error!("webhook listener exited: {}", e);
            }
        });
    }

    /// Closes the listener so the forge stops delivering (connection refused rather than
    /// queued) for the duration of the error backoff (§4.5 step 2, §5).
    fn stop_listener(&self) {
        let tx = self.state.lock().listener_shutdown.take();
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
    }

    /// §4.5 `run(newPrIds)`. `None` clears the optimization and forces a full scan; `Some`
    /// merges the ids into the pending set. Reentrant: if a scan is already running, this
    /// just marks `rerun` and returns.
    pub async fn run(self: &Arc<Self>, new_pr_ids: Option<Vec<PrIdentity>>) {
        {
            let mut state = self.state.lock();
            match new_pr_ids {
                None => state.pending = None,
                Some(ids) => match &mut state.pending {
                    Some(pending) => pending.extend(ids),
                    None => {}
                },
            }
            if state.running {
                state.rerun = true;
                return;
            }
            state.running = true;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.scan_loop().await;
        });
    }

    async fn scan_loop(self: Arc<Self>) {
        loop {
            let (snapshot, last_scan) = {
                let mut state = self.state.lock();
                state.rerun = false;
                let snapshot = state.pending.take();
                state.pending = Some(Vec::new());
                (snapshot, state.last_scan.clone())
            };

            // Isolated with `catch_unwind` so a bug that panics somewhere inside a single
            // PR's processing degrades to a failed scan (which already has backoff/retry
            // handling below) instead of unwinding through `scan_loop` and skipping the
            // `state.running = false` at the bottom of this loop, which would wedge every
            // future `run()` call forever (§5, §7).
            let outcome = match std::panic::AssertUnwindSafe(scan::execute(
                self.client.as_ref(),
                &self.config,
                &self.bot_identity,
                last_scan.as_ref(),
                snapshot.as_deref(),
            ))
            .catch_unwind()
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => {
                    log::error!("scan task panicked; treating as a failed scan");
                    ScanOutcome {
                        result: PrScanResult::default(),
                        staged_this_scan: false,
                        errors: vec!["scan panicked".to_string()],
                    }
                }
            };

            if outcome.errors.is_empty() {
                let rerun_in = outcome.result.min_delay_ms;
                {
                    let mut state = self.state.lock();
                    state.last_scan = Some(outcome.result);
                }
                self.arm_timer(rerun_in);
            } else {
                for e in &outcome.errors {
                    log::error!("scan failed: {}", e);
                }
                {
                    let mut state = self.state.lock();
                    state.last_scan = None;
                    state.rerun = true;
                }
                log::warn!("backing off for {:?} after scan failure", ERROR_BACKOFF);
                self.stop_listener();
                tokio::time::sleep(ERROR_BACKOFF).await;
                self.spawn_listener();
            }

            let should_rerun = {
                let mut state = self.state.lock();
                if state.rerun {
                    true
                } else {
                    state.running = false;
                    false
                }
            };
            if !should_rerun {
                break;
            }
        }
    }

    fn arm_timer(self: &Arc<Self>, rerun_in: Option<u64>) {
        let delay_ms = match rerun_in {
            Some(ms) => ms.min(MAX_TIMER_MS),
            None => return,
        };
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            this.run(Some(Vec::new())).await;
        });
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn max_timer_ms_fits_i32() {
        assert!(super::MAX_TIMER_MS <= i32::MAX as u64);
    }
}
