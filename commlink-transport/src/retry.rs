//! Retry engine
//!
//! One algorithm serves every transport: within an attempt limit and a
//! wall-clock timeout, keep calling the transport's single-shot open
//! (`connect`, `listen` or port open) until the handle is usable, the retry
//! flag is withdrawn or the run is cancelled.
//!
//! The loop runs on its own spawned task, never on a link dispatcher, so a
//! slow attempt cannot hold up callback delivery. At most one such task is
//! alive per transport; [`RetryWorker::stop`] cancels it and waits for it to
//! exit before the caller releases the handle.

use async_trait::async_trait;
use commlink_core::{RetryPolicy, Status};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// What the retry loop drives
#[async_trait]
pub trait Reconnect: Send + Sync + 'static {
    /// Word used in status messages, e.g. `"Connection"` or `"Listen"`
    fn retry_noun(&self) -> &'static str;

    /// `true` once the handle can carry traffic again
    fn is_usable(&self) -> bool;

    /// The transport's "retry still wanted" flag
    fn retry_flag(&self) -> &AtomicBool;

    /// One open attempt; its own failure is reported by the transport
    async fn try_once(&self) -> bool;

    fn report(&self, status: Status, message: &str);
}

/// How a retry run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// The handle is usable again
    Recovered,
    /// The run exceeded the policy timeout
    TimedOut,
    /// Every allowed attempt failed
    Exhausted,
    /// The retry flag was withdrawn or the run was cancelled
    Cancelled,
}

impl fmt::Display for RetryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RetryOutcome::Recovered => "Recovered",
            RetryOutcome::TimedOut => "Timeout",
            RetryOutcome::Exhausted => "Attempts Exhausted",
            RetryOutcome::Cancelled => "Cancelled",
        };
        f.write_str(name)
    }
}

/// Run one retry loop to completion
///
/// The outcome is reported through `target.report` and the retry flag is
/// cleared on return whatever the outcome: after a failed run the transport
/// stays idle until the application opens it again.
pub async fn run_retry<R: Reconnect + ?Sized>(
    target: &R,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> RetryOutcome {
    let noun = target.retry_noun();
    let started = Instant::now();
    target.report(Status::Info, &format!("{} Retry Start", noun));

    let mut stopped = RetryOutcome::Exhausted;
    for attempt in 1..=policy.count {
        if started.elapsed() >= policy.timeout {
            stopped = RetryOutcome::TimedOut;
            break;
        }
        if cancel.is_cancelled() || !target.retry_flag().load(Ordering::SeqCst) {
            stopped = RetryOutcome::Cancelled;
            break;
        }
        if target.is_usable() {
            stopped = RetryOutcome::Recovered;
            break;
        }

        target.report(
            Status::Info,
            &format!("{} Retry Attempt : {}/{}", noun, attempt, policy.count),
        );
        let connected = tokio::select! {
            _ = cancel.cancelled() => {
                stopped = RetryOutcome::Cancelled;
                break;
            }
            connected = target.try_once() => connected,
        };
        if connected {
            continue;
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                stopped = RetryOutcome::Cancelled;
                break;
            }
            _ = tokio::time::sleep(policy.interval) => {}
        }
    }

    target.retry_flag().store(false, Ordering::SeqCst);
    let outcome = if target.is_usable() {
        RetryOutcome::Recovered
    } else {
        stopped
    };
    log::debug!(
        "{} retry finished after {:?}: {}",
        noun,
        started.elapsed(),
        outcome
    );
    match outcome {
        RetryOutcome::Recovered => target.report(Status::Info, &format!("{} Retry Success", noun)),
        RetryOutcome::Cancelled => target.report(Status::Info, &format!("{} Retry Stop", noun)),
        RetryOutcome::TimedOut | RetryOutcome::Exhausted => {
            target.report(Status::Error, &format!("{} Retry Failure : {}", noun, outcome))
        }
    }
    outcome
}

struct RetryTask {
    cancel: CancellationToken,
    handle: JoinHandle<RetryOutcome>,
}

#[derive(Default)]
struct RetrySlot {
    task: Option<RetryTask>,
    suspended: bool,
}

/// Owner of a transport's retry task
#[derive(Default)]
pub struct RetryWorker {
    slot: Mutex<RetrySlot>,
}

impl RetryWorker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a retry run for `target`
    ///
    /// No-op (returns `false`) if the policy is disabled, the worker is
    /// suspended, a run is still alive, or there is no tokio runtime to
    /// spawn on.
    pub fn start<R: Reconnect>(&self, target: Arc<R>, policy: RetryPolicy) -> bool {
        if !policy.enabled {
            log::debug!("{} retry disabled by policy", target.retry_noun());
            return false;
        }

        let mut slot = self.slot.lock();
        if slot.suspended {
            return false;
        }
        if slot.task.as_ref().is_some_and(|task| !task.handle.is_finished()) {
            return false;
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                drop(slot);
                target.report(
                    Status::Error,
                    &format!("{} Retry Failure : No Async Runtime", target.retry_noun()),
                );
                return false;
            }
        };

        target.retry_flag().store(true, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = runtime.spawn(async move { run_retry(target.as_ref(), &policy, &token).await });
        slot.task = Some(RetryTask { cancel, handle });
        true
    }

    /// `true` while a retry run is alive
    pub fn is_running(&self) -> bool {
        self.slot
            .lock()
            .task
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// Refuse new runs until [`resume`](Self::resume); used while a transport closes
    pub fn suspend(&self) {
        self.slot.lock().suspended = true;
    }

    pub fn resume(&self) {
        self.slot.lock().suspended = false;
    }

    /// Cancel the current run, if any, and wait for it to exit
    pub async fn stop(&self) -> Option<RetryOutcome> {
        let task = self.slot.lock().task.take()?;
        task.cancel.cancel();
        match task.handle.await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                log::error!("Retry task ended abnormally: {}", e);
                None
            }
        }
    }

    /// Cancel the current run without waiting (for `Drop`)
    pub fn abort(&self) {
        let mut slot = self.slot.lock();
        slot.suspended = true;
        if let Some(task) = slot.task.take() {
            task.cancel.cancel();
        }
    }
}

impl fmt::Debug for RetryWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryWorker")
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    /// Target that becomes usable after `succeed_on` attempts (never if 0)
    struct FakeTarget {
        attempts: AtomicU32,
        succeed_on: u32,
        usable: AtomicBool,
        flag: AtomicBool,
        messages: Mutex<Vec<(Status, String)>>,
    }

    impl FakeTarget {
        fn new(succeed_on: u32) -> Arc<Self> {
            Arc::new(Self {
                attempts: AtomicU32::new(0),
                succeed_on,
                usable: AtomicBool::new(false),
                flag: AtomicBool::new(true),
                messages: Mutex::new(Vec::new()),
            })
        }

        fn messages(&self) -> Vec<(Status, String)> {
            self.messages.lock().clone()
        }
    }

    #[async_trait]
    impl Reconnect for FakeTarget {
        fn retry_noun(&self) -> &'static str {
            "Connection"
        }

        fn is_usable(&self) -> bool {
            self.usable.load(Ordering::SeqCst)
        }

        fn retry_flag(&self) -> &AtomicBool {
            &self.flag
        }

        async fn try_once(&self) -> bool {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if self.succeed_on != 0 && n >= self.succeed_on {
                self.usable.store(true, Ordering::SeqCst);
                // A successful open withdraws the retry flag itself
                self.flag.store(false, Ordering::SeqCst);
                return true;
            }
            false
        }

        fn report(&self, status: Status, message: &str) {
            self.messages.lock().push((status, message.to_string()));
        }
    }

    fn fast_policy(count: u32, timeout_ms: u64) -> RetryPolicy {
        RetryPolicy::new(count, Duration::from_millis(timeout_ms)).with_interval(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_exhausts_attempt_limit() {
        let target = FakeTarget::new(0);
        let outcome = run_retry(target.as_ref(), &fast_policy(3, 5_000), &CancellationToken::new()).await;
        assert_eq!(outcome, RetryOutcome::Exhausted);
        assert_eq!(target.attempts.load(Ordering::SeqCst), 3);
        assert!(!target.flag.load(Ordering::SeqCst));

        let messages = target.messages();
        assert_eq!(messages.first().unwrap().1, "Connection Retry Start");
        let attempts: Vec<&str> = messages
            .iter()
            .filter(|(_, message)| message.starts_with("Connection Retry Attempt"))
            .map(|(_, message)| message.as_str())
            .collect();
        assert_eq!(
            attempts,
            ["Connection Retry Attempt : 1/3", "Connection Retry Attempt : 2/3", "Connection Retry Attempt : 3/3"]
        );
        assert_eq!(
            messages.last().unwrap(),
            &(Status::Error, "Connection Retry Failure : Attempts Exhausted".to_string())
        );
    }

    #[tokio::test]
    async fn test_times_out() {
        let target = FakeTarget::new(0);
        let policy = RetryPolicy::new(1_000, Duration::from_millis(60)).with_interval(Duration::from_millis(20));
        let started = Instant::now();
        let outcome = run_retry(target.as_ref(), &policy, &CancellationToken::new()).await;
        assert_eq!(outcome, RetryOutcome::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(target.attempts.load(Ordering::SeqCst) < 1_000);
        assert_eq!(
            target.messages().last().unwrap().1,
            "Connection Retry Failure : Timeout"
        );
    }

    #[tokio::test]
    async fn test_recovers() {
        let target = FakeTarget::new(2);
        let outcome = run_retry(target.as_ref(), &fast_policy(10, 5_000), &CancellationToken::new()).await;
        assert_eq!(outcome, RetryOutcome::Recovered);
        assert_eq!(target.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(
            target.messages().last().unwrap(),
            &(Status::Info, "Connection Retry Success".to_string())
        );
    }

    #[tokio::test]
    async fn test_already_usable_makes_no_attempt() {
        let target = FakeTarget::new(0);
        target.usable.store(true, Ordering::SeqCst);
        let outcome = run_retry(target.as_ref(), &fast_policy(5, 5_000), &CancellationToken::new()).await;
        assert_eq!(outcome, RetryOutcome::Recovered);
        assert_eq!(target.attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_flag_withdrawn_cancels() {
        let target = FakeTarget::new(0);
        target.flag.store(false, Ordering::SeqCst);
        let outcome = run_retry(target.as_ref(), &fast_policy(5, 5_000), &CancellationToken::new()).await;
        assert_eq!(outcome, RetryOutcome::Cancelled);
        assert_eq!(target.attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_worker_single_run_and_stop() {
        let worker = RetryWorker::new();
        let target = FakeTarget::new(0);
        let policy = RetryPolicy::new(1_000, Duration::from_secs(30)).with_interval(Duration::from_millis(20));

        assert!(worker.start(target.clone(), policy.clone()));
        assert!(worker.is_running());
        // A second start while the first run is alive is a no-op
        assert!(!worker.start(target.clone(), policy));

        let outcome = worker.stop().await;
        assert_eq!(outcome, Some(RetryOutcome::Cancelled));
        assert!(!worker.is_running());
        assert_eq!(worker.stop().await, None);

        let starts = target
            .messages()
            .iter()
            .filter(|(_, message)| message == "Connection Retry Start")
            .count();
        assert_eq!(starts, 1);
    }

    #[tokio::test]
    async fn test_suspended_worker_refuses_to_start() {
        let worker = RetryWorker::new();
        let target = FakeTarget::new(0);
        worker.suspend();
        assert!(!worker.start(target.clone(), fast_policy(3, 5_000)));
        assert!(target.messages().is_empty());

        worker.resume();
        assert!(worker.start(target.clone(), fast_policy(3, 5_000)));
        assert_eq!(worker.stop().await, Some(RetryOutcome::Cancelled));
    }

    #[tokio::test]
    async fn test_worker_respects_disabled_policy() {
        let worker = RetryWorker::new();
        let target = FakeTarget::new(0);
        target.flag.store(false, Ordering::SeqCst);
        assert!(!worker.start(target.clone(), RetryPolicy::disabled()));
        assert!(!worker.is_running());
        assert!(!target.flag.load(Ordering::SeqCst));
    }

    #[test]
    fn test_worker_without_runtime() {
        let worker = RetryWorker::new();
        let target = FakeTarget::new(0);
        assert!(!worker.start(target.clone(), RetryPolicy::default()));
        assert_eq!(
            target.messages().last().unwrap().1,
            "Connection Retry Failure : No Async Runtime"
        );
    }
}
