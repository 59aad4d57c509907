//! Cancellable background work: single-owner tasks and debounced recomputation.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::context::{UsageSnapshot, usage};
use crate::models::ModelProfile;
use crate::providers::ChatMessage;

/// A spawned task with exactly one owner. Dropping it cancels it.
#[derive(Debug)]
pub struct CancellableTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl CancellableTask {
    /// Spawns `f` with a token it should watch for cooperative shutdown.
    pub fn spawn<F, Fut>(f: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let handle = tokio::spawn(f(token.clone()));
        Self { token, handle }
    }

    /// Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for CancellableTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Coalesces bursts of triggers into one run after `quiet` has elapsed with no new trigger.
#[derive(Debug)]
pub struct Debouncer {
    quiet: Duration,
    pending: Option<CancellableTask>,
}

impl Debouncer {
    pub fn new(quiet: Duration) -> Self {
        Self { quiet, pending: None }
    }

    pub fn trigger<F>(&mut self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.cancel();
        let quiet = self.quiet;
        self.pending = Some(CancellableTask::spawn(move |token| async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(quiet) => job(),
            }
        }));
    }

    /// Drops any pending run.
    pub fn cancel(&mut self) {
        if let Some(task) = self.pending.take() {
            task.cancel();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.as_ref().is_some_and(|t| !t.is_finished() && !t.is_cancelled())
    }
}

/// Debounced budget accounting. Snapshots are published on a watch channel;
/// `None` means nothing has been computed since the last reset.
#[derive(Debug)]
pub struct BudgetMonitor {
    debouncer: Debouncer,
    tx: Arc<watch::Sender<Option<UsageSnapshot>>>,
    generation: Arc<AtomicU64>,
}

impl BudgetMonitor {
    pub fn new(quiet: Duration) -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            debouncer: Debouncer::new(quiet),
            tx: Arc::new(tx),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<UsageSnapshot>> {
        self.tx.subscribe()
    }

    pub fn latest(&self) -> Option<UsageSnapshot> {
        self.tx.borrow().clone()
    }

    pub fn is_pending(&self) -> bool {
        self.debouncer.is_pending()
    }

    /// Schedules a recomputation; earlier pending ones are superseded.
    pub fn schedule(
        &mut self,
        history: Vec<ChatMessage>,
        system: String,
        draft: Option<String>,
        model: ModelProfile,
    ) {
        let tx = Arc::clone(&self.tx);
        let generation = Arc::clone(&self.generation);
        let scheduled_in = generation.load(Ordering::SeqCst);
        self.debouncer.trigger(move || {
            let snap = usage(&history, &system, draft.as_deref(), &model);
            tracing::debug!(estimated = snap.estimated, level = snap.level.as_str(), "usage recomputed");
            tx.send_if_modified(|current| {
                if generation.load(Ordering::SeqCst) != scheduled_in {
                    return false;
                }
                *current = Some(snap);
                true
            });
        });
    }

    /// Computes and publishes immediately, cancelling any pending run.
    pub fn recompute_now(
        &mut self,
        history: &[ChatMessage],
        system: &str,
        draft: Option<&str>,
        model: &ModelProfile,
    ) -> UsageSnapshot {
        self.debouncer.cancel();
        let snap = usage(history, system, draft, model);
        self.tx.send_replace(Some(snap.clone()));
        snap
    }

    /// Clears pending timers and the published snapshot.
    pub fn reset(&mut self) {
        self.debouncer.cancel();
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.tx.send_replace(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn burst_of_triggers_runs_once() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut d = Debouncer::new(Duration::from_millis(300));
        for _ in 0..5 {
            let r = Arc::clone(&runs);
            d.trigger(move || {
                r.fetch_add(1, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!d.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_trigger_never_runs() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut d = Debouncer::new(Duration::from_millis(50));
        let r = Arc::clone(&runs);
        d.trigger(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        assert!(d.is_pending());
        d.cancel();
        d.cancel();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_task_cancels_it() {
        let flag = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&flag);
        let task = CancellableTask::spawn(move |token| async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_secs(1)) => { f.store(1, Ordering::SeqCst); }
            }
        });
        drop(task);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(flag.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_publishes_after_quiet_period() {
        let mut m = BudgetMonitor::new(Duration::from_millis(300));
        let rx = m.subscribe();
        let model = ModelProfile::with_soft_limit("m", 10_000);
        m.schedule(vec![ChatMessage::user("hello")], String::new(), None, model.clone());
        m.schedule(
            vec![ChatMessage::user("hello")],
            String::new(),
            Some("draft text".into()),
            model.clone(),
        );
        assert!(rx.borrow().is_none());
        tokio::time::sleep(Duration::from_millis(400)).await;
        let snap = rx.borrow().clone().unwrap();
        let expected = usage(&[ChatMessage::user("hello")], "", Some("draft text"), &model);
        assert_eq!(snap, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_discards_pending_recomputation() {
        let mut m = BudgetMonitor::new(Duration::from_millis(300));
        let model = ModelProfile::with_soft_limit("m", 10_000);
        m.recompute_now(&[], "", None, &model);
        assert!(m.latest().is_some());
        m.schedule(vec![ChatMessage::user("stale")], String::new(), None, model);
        m.reset();
        assert!(!m.is_pending());
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(m.latest().is_none());
    }
}
