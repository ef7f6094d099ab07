use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

/// Marker error a work closure returns when it unwound because of a
/// cooperative cancellation. The engine treats it as a clean interruption
/// rather than a failure, so no user-facing text is produced for it.
#[derive(Debug)]
pub struct Interrupted;

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "action interrupted")
    }
}

impl std::error::Error for Interrupted {}

pub type ActionFuture = Pin<Box<dyn Future<Output = anyhow::Result<Option<String>>> + Send>>;

/// A unit of work. Re-invokable so a resumable task can be restarted from
/// scratch when the world goes idle.
pub type Work = Arc<dyn Fn(ExecSignals) -> ActionFuture + Send + Sync>;

/// Cancellation and pause signals handed to a running task. Tasks observe
/// them at their own suspension points.
pub struct ExecSignals {
    pub cancel: CancellationToken,
    pause: watch::Receiver<bool>,
}

impl ExecSignals {
    /// Suspension point: waits out a pause, and fails with [`Interrupted`]
    /// once cancellation has been signalled.
    pub async fn checkpoint(&mut self) -> anyhow::Result<()> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(Interrupted.into());
            }
            if !*self.pause.borrow() {
                return Ok(());
            }
            tokio::select! {
                res = self.pause.changed() => {
                    if res.is_err() {
                        return Ok(());
                    }
                }
                _ = self.cancel.cancelled() => {}
            }
        }
    }

    /// Races a world primitive against cancellation. Returns `None` when the
    /// task was told to unwind before the primitive finished.
    pub async fn race<T>(
        &self,
        fut: impl Future<Output = anyhow::Result<T>>,
    ) -> anyhow::Result<Option<T>> {
        tokio::select! {
            res = fut => res.map(Some),
            _ = self.cancel.cancelled() => Ok(None),
        }
    }
}

/// Outcome of one engine run. `interrupted` and `timed_out` may both be set
/// when a stop raced the deadline; callers suppress user-facing text only
/// for `interrupted && !timed_out`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    pub message: Option<String>,
    pub interrupted: bool,
    pub timed_out: bool,
}

#[derive(Clone)]
struct ResumeState {
    work: Work,
    timeout_mins: i64,
}

/// The execution engine. At most one task runs at a time; starting a new one
/// cancels the previous one first and waits for it to acknowledge.
pub struct Coder {
    executing: AtomicBool,
    generating: AtomicBool,
    stopped: AtomicBool,
    current: StdMutex<Option<CancellationToken>>,
    resume: StdMutex<Option<ResumeState>>,
    run_lock: AsyncMutex<()>,
    pause_tx: watch::Sender<bool>,
}

impl Default for Coder {
    fn default() -> Self {
        Self::new()
    }
}

impl Coder {
    pub fn new() -> Self {
        let (pause_tx, _) = watch::channel(false);
        Self {
            executing: AtomicBool::new(false),
            generating: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            current: StdMutex::new(None),
            resume: StdMutex::new(None),
            run_lock: AsyncMutex::new(()),
            pause_tx,
        }
    }

    pub fn is_executing(&self) -> bool {
        self.executing.load(Ordering::SeqCst)
    }

    pub fn is_generating(&self) -> bool {
        self.generating.load(Ordering::SeqCst)
    }

    pub fn is_idle(&self) -> bool {
        !self.is_executing() && !self.is_generating()
    }

    /// Marks the engine as generating a new action until the guard drops.
    pub fn begin_generation(&self) -> GenerationGuard<'_> {
        self.generating.store(true, Ordering::SeqCst);
        GenerationGuard { coder: self }
    }

    /// Runs `work` under a fresh cancellation scope, superseding any task
    /// already running. `timeout_mins <= 0` means no deadline.
    pub async fn execute(&self, work: Work, timeout_mins: i64) -> ExecResult {
        self.execute_inner(work, timeout_mins).await
    }

    /// Like [`execute`](Self::execute), but remembers the work closure so a
    /// later world idle signal restarts it from scratch, implementing
    /// best-effort continuation of endless actions.
    pub async fn execute_resume(&self, work: Work, timeout_mins: i64) -> ExecResult {
        *self.resume.lock().unwrap() = Some(ResumeState {
            work: work.clone(),
            timeout_mins,
        });
        self.execute_inner(work, timeout_mins).await
    }

    /// Re-invokes the remembered resumable work if the engine is idle and no
    /// explicit stop intervened since it last ran.
    pub async fn resume_from_idle(&self) -> Option<ExecResult> {
        if !self.is_idle() || self.stopped.load(Ordering::SeqCst) {
            return None;
        }
        let state = self.resume.lock().unwrap().clone()?;
        Some(self.execute_inner(state.work, state.timeout_mins).await)
    }

    /// Cooperative cancellation: signals the running task to unwind and
    /// blocks until it has released the engine. No-op when idle.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let token = self.current.lock().unwrap().clone();
        if let Some(token) = token {
            token.cancel();
        }
        let _ = self.run_lock.lock().await;
    }

    /// Clears the resumable flag without touching the current task, so a
    /// resumable action will not restart after it naturally finishes.
    pub fn cancel_resume(&self) {
        *self.resume.lock().unwrap() = None;
    }

    /// Resets the engine to idle, discarding any resumable flag.
    pub fn clear(&self) {
        self.cancel_resume();
        self.unpause();
        self.stopped.store(false, Ordering::SeqCst);
    }

    /// Cooperative pause: the running task holds at its next checkpoint.
    pub fn pause(&self) {
        self.pause_tx.send_replace(true);
    }

    pub fn unpause(&self) {
        self.pause_tx.send_replace(false);
    }

    async fn execute_inner(&self, work: Work, timeout_mins: i64) -> ExecResult {
        self.stop().await;
        let _running = self.run_lock.lock().await;

        let token = CancellationToken::new();
        *self.current.lock().unwrap() = Some(token.clone());
        self.unpause();
        self.stopped.store(false, Ordering::SeqCst);
        self.executing.store(true, Ordering::SeqCst);

        let signals = ExecSignals {
            cancel: token.clone(),
            pause: self.pause_tx.subscribe(),
        };
        let mut handle = tokio::spawn((work)(signals));

        let deadline = (timeout_mins > 0).then(|| Duration::from_secs(timeout_mins as u64 * 60));
        let (message, timed_out) = match deadline {
            Some(limit) => {
                tokio::select! {
                    joined = &mut handle => (finish(joined), false),
                    // Hard watchdog: fires even if the task never observes
                    // the cancellation token.
                    _ = tokio::time::sleep(limit) => {
                        handle.abort();
                        (
                            Some(format!(
                                "Action timed out after {timeout_mins} minute(s) and was stopped."
                            )),
                            true,
                        )
                    }
                }
            }
            None => (finish(handle.await), false),
        };

        let interrupted = token.is_cancelled();
        self.executing.store(false, Ordering::SeqCst);
        *self.current.lock().unwrap() = None;

        ExecResult {
            message,
            interrupted,
            timed_out,
        }
    }
}

fn finish(joined: Result<anyhow::Result<Option<String>>, tokio::task::JoinError>) -> Option<String> {
    match joined {
        Ok(Ok(message)) => message,
        Ok(Err(err)) if err.is::<Interrupted>() => None,
        Ok(Err(err)) => Some(format!("Action failed: {err:#}")),
        Err(join_err) if join_err.is_cancelled() => None,
        Err(join_err) => Some(format!("Action crashed: {join_err}")),
    }
}

pub struct GenerationGuard<'a> {
    coder: &'a Coder,
}

impl Drop for GenerationGuard<'_> {
    fn drop(&mut self) {
        self.coder.generating.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn noisy_work(log: Arc<StdMutex<Vec<&'static str>>>, tag: &'static str) -> Work {
        Arc::new(move |sig| {
            let log = log.clone();
            Box::pin(async move {
                sig.cancel.cancelled().await;
                log.lock().unwrap().push(tag);
                Ok(None)
            })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn second_execute_supersedes_first() {
        let coder = Arc::new(Coder::new());
        let log = Arc::new(StdMutex::new(Vec::new()));

        let first = noisy_work(log.clone(), "first_saw_cancel");
        let c = coder.clone();
        let first_run = tokio::spawn(async move { c.execute(first, -1).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(coder.is_executing());

        let log2 = log.clone();
        let second: Work = Arc::new(move |_sig| {
            let log2 = log2.clone();
            Box::pin(async move {
                log2.lock().unwrap().push("second_ran");
                Ok(Some("done".to_string()))
            })
        });
        let second_res = coder.execute(second, -1).await;

        let first_res = first_run.await.unwrap();
        assert!(first_res.interrupted);
        assert!(!first_res.timed_out);
        assert!(first_res.message.is_none());
        assert_eq!(second_res.message.as_deref(), Some("done"));
        assert!(!second_res.interrupted);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["first_saw_cancel", "second_ran"]
        );
        assert!(coder.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_even_for_uncooperative_work() {
        let coder = Coder::new();
        let work: Work = Arc::new(|_sig| {
            Box::pin(async move {
                // Never checks the token.
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Some("never".to_string()))
            })
        });
        let res = coder.execute(work, 1).await;
        assert!(res.timed_out);
        assert!(!res.interrupted);
        assert!(res.message.unwrap().contains("timed out"));
        assert!(coder.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_before_deadline_is_interrupted_not_timed_out() {
        let coder = Arc::new(Coder::new());
        let work: Work = Arc::new(|sig| {
            Box::pin(async move {
                let out = sig
                    .race(async {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        Ok("finished".to_string())
                    })
                    .await?;
                Ok(out)
            })
        });

        let c = coder.clone();
        let run = tokio::spawn(async move { c.execute(work, 10).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        coder.stop().await;

        let res = run.await.unwrap();
        assert!(res.interrupted);
        assert!(!res.timed_out);
        assert!(res.message.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn resume_restarts_same_work_on_idle_but_not_after_stop() {
        let coder = Coder::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let work: Work = Arc::new(move |_sig| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Some("lap done".to_string()))
            })
        });

        let res = coder.execute_resume(work, 3).await;
        assert_eq!(res.message.as_deref(), Some("lap done"));
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // World went idle with no interruption: same closure runs again.
        let res = coder.resume_from_idle().await.expect("resumed");
        assert_eq!(res.message.as_deref(), Some("lap done"));
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        // An explicit stop blocks the restart.
        coder.stop().await;
        assert!(coder.resume_from_idle().await.is_none());
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_resume_clears_the_flag_without_stopping() {
        let coder = Coder::new();
        let work: Work = Arc::new(|_sig| Box::pin(async { Ok(None) }));
        let _ = coder.execute_resume(work, -1).await;
        coder.cancel_resume();
        assert!(coder.resume_from_idle().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn pause_holds_checkpoints_until_unpaused() {
        let coder = Arc::new(Coder::new());
        let laps = Arc::new(AtomicUsize::new(0));

        let counter = laps.clone();
        let work: Work = Arc::new(move |mut sig| {
            let counter = counter.clone();
            Box::pin(async move {
                loop {
                    sig.checkpoint().await?;
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
        });

        let c = coder.clone();
        let run = tokio::spawn(async move { c.execute(work, -1).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(laps.load(Ordering::SeqCst) > 0);

        coder.pause();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let frozen = laps.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(laps.load(Ordering::SeqCst), frozen);

        coder.unpause();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(laps.load(Ordering::SeqCst) > frozen);

        coder.stop().await;
        let res = run.await.unwrap();
        assert!(res.interrupted);
        assert!(res.message.is_none());
    }
}
