use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parley_common::Result;
use parley_config::SupervisorConfig;
use parley_db::{CrashLog, CrashRecord};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// Linear backoff: `base * attempt`, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RestartPolicy {
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
        }
    }

    pub fn restart_delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt).min(self.max_delay)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorOutcome {
    /// The unit returned `Ok`.
    Completed,
    Cancelled,
    /// The unit crashed `attempts` times in a row; the loop gave up.
    Exhausted { attempts: u32 },
}

/// Restarts a unit of work after crashes, recording each crash durably.
/// Errors and panics both count as crashes.
pub struct RestartSupervisor {
    actor: String,
    policy: RestartPolicy,
    crash_log: Arc<dyn CrashLog>,
}

impl RestartSupervisor {
    pub fn new(actor: impl Into<String>, policy: RestartPolicy, crash_log: Arc<dyn CrashLog>) -> Self {
        Self {
            actor: actor.into(),
            policy,
            crash_log,
        }
    }

    pub fn policy(&self) -> &RestartPolicy {
        &self.policy
    }

    /// Run `make_unit` until it completes, the token is cancelled, or the
    /// attempt budget is spent. Each unit gets a child of `cancel`.
    #[instrument(skip_all, fields(actor = %self.actor))]
    pub async fn run<F, Fut>(&self, mut make_unit: F, cancel: CancellationToken) -> SupervisorOutcome
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return SupervisorOutcome::Cancelled;
            }
            attempt += 1;

            let unit_cancel = cancel.child_token();
            let mut unit = tokio::spawn(make_unit(unit_cancel.clone()));

            let crash = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    unit_cancel.cancel();
                    unit.abort();
                    match unit.await {
                        Err(e) if e.is_panic() => {
                            warn!(error = %describe_join_error(e), "unit panicked while stopping");
                        }
                        _ => {}
                    }
                    info!(attempt, "unit aborted on cancellation");
                    return SupervisorOutcome::Cancelled;
                }
                joined = &mut unit => match joined {
                    Ok(Ok(())) => {
                        info!(attempt, "unit completed");
                        return SupervisorOutcome::Completed;
                    }
                    Ok(Err(e)) => e.to_string(),
                    Err(e) => describe_join_error(e),
                },
            };

            error!(attempt, error = %crash, "unit crashed");
            let record = CrashRecord::now(&self.actor, attempt, &crash);
            if let Err(e) = self.crash_log.append(&record).await {
                warn!(error = %e, "failed to record crash");
            }

            if attempt >= self.policy.max_attempts {
                error!(attempts = attempt, "restart budget exhausted, giving up");
                return SupervisorOutcome::Exhausted { attempts: attempt };
            }

            let delay = self.policy.restart_delay(attempt);
            info!(attempt, delay_ms = delay.as_millis() as u64, "restarting unit");
            tokio::select! {
                _ = cancel.cancelled() => return SupervisorOutcome::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

fn describe_join_error(e: JoinError) -> String {
    if !e.is_panic() {
        return e.to_string();
    }
    let payload = e.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    format!("panicked: {message}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parley_common::Error;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[derive(Default)]
    struct MemoryCrashLog {
        records: Mutex<Vec<CrashRecord>>,
    }

    #[async_trait]
    impl CrashLog for MemoryCrashLog {
        async fn append(&self, record: &CrashRecord) -> Result<()> {
            self.records.lock().unwrap().push(record.clone());
            Ok(())
        }

        async fn recent(&self, limit: usize) -> Result<Vec<CrashRecord>> {
            let records = self.records.lock().unwrap();
            Ok(records.iter().rev().take(limit).cloned().collect())
        }
    }

    fn policy(max_attempts: u32) -> RestartPolicy {
        RestartPolicy {
            max_attempts,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
        }
    }

    #[test]
    fn delay_grows_linearly_and_caps() {
        let policy = policy(10);
        assert_eq!(policy.restart_delay(1), Duration::from_secs(5));
        assert_eq!(policy.restart_delay(3), Duration::from_secs(15));
        assert_eq!(policy.restart_delay(12), Duration::from_secs(60));
        assert_eq!(policy.restart_delay(u32::MAX), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn crashes_are_logged_then_budget_exhausts() {
        let log = Arc::new(MemoryCrashLog::default());
        let supervisor = RestartSupervisor::new("live-bot", policy(4), log.clone());
        let started = Instant::now();

        let outcome = supervisor
            .run(
                |_| async { Err::<(), _>(Error::Channel("connection refused".into())) },
                CancellationToken::new(),
            )
            .await;

        assert_eq!(outcome, SupervisorOutcome::Exhausted { attempts: 4 });
        // 5 + 10 + 15, no delay after the last attempt.
        assert_eq!(started.elapsed(), Duration::from_secs(30));

        let records = log.records.lock().unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(records[2].attempt, 3);
        assert_eq!(records[2].actor, "live-bot");
        assert!(records[2].error.contains("connection refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn panic_counts_as_crash_and_unit_is_restarted() {
        let log = Arc::new(MemoryCrashLog::default());
        let supervisor = RestartSupervisor::new("unit", policy(3), log.clone());
        let calls = Arc::new(AtomicU32::new(0));

        let outcome = supervisor
            .run(
                {
                    let calls = calls.clone();
                    move |_| {
                        let n = calls.fetch_add(1, Ordering::SeqCst);
                        async move {
                            if n == 0 {
                                panic!("boom");
                            }
                            Ok::<(), Error>(())
                        }
                    }
                },
                CancellationToken::new(),
            )
            .await;

        assert_eq!(outcome, SupervisorOutcome::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let records = log.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].error, "panicked: boom");
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_pending_delay() {
        let log = Arc::new(MemoryCrashLog::default());
        let supervisor = RestartSupervisor::new("unit", policy(10), log.clone());
        let cancel = CancellationToken::new();
        let started = Instant::now();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                cancel.cancel();
            })
        };

        let outcome = supervisor
            .run(|_| async { Err::<(), _>(Error::Channel("down".into())) }, cancel)
            .await;
        canceller.await.unwrap();

        assert_eq!(outcome, SupervisorOutcome::Cancelled);
        assert_eq!(started.elapsed(), Duration::from_secs(1));
        assert_eq!(log.records.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_aborts_running_unit_immediately() {
        struct DropFlag(Arc<AtomicU32>);
        impl Drop for DropFlag {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let log = Arc::new(MemoryCrashLog::default());
        let supervisor = RestartSupervisor::new("unit", policy(3), log.clone());
        let cancel = CancellationToken::new();
        let dropped = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(2)).await;
                cancel.cancel();
            })
        };

        let outcome = supervisor
            .run(
                {
                    let dropped = dropped.clone();
                    move |_| {
                        let flag = DropFlag(dropped.clone());
                        async move {
                            let _flag = flag;
                            // Ignores its token; only the abort stops it.
                            std::future::pending::<()>().await;
                            Ok::<(), Error>(())
                        }
                    }
                },
                cancel,
            )
            .await;
        canceller.await.unwrap();

        assert_eq!(outcome, SupervisorOutcome::Cancelled);
        assert_eq!(started.elapsed(), Duration::from_secs(2));
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        assert!(log.records.lock().unwrap().is_empty());
    }
}
