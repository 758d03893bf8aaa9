//! Human-signal gate.
//!
//! A phase that needs a human decision posts a structured question to
//! the tracker and suspends on an in-process oneshot channel. The gate
//! resolves exactly one of two ways: a response signal arrives bearing
//! the question id and a chosen option, or the timeout fires and the
//! configured default rule applies. A signal delivered after the
//! timeout finds no registered waiter and is dropped.
//!
//! Suspension is cooperative. Waiting holds no worker thread, so any
//! number of runs can be dormant at a gate simultaneously.

pub mod channel;
pub mod question;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::clients::tracker::TrackerClient;
use crate::error::GateError;

pub use channel::SignalWatcher;
pub use question::{
    Decision, DecisionSource, PendingQuestion, Question, QuestionOption, QuestionType,
    TimeoutPolicy,
};

/// Default deadline for an unanswered question.
pub const DEFAULT_QUESTION_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// Posts questions and suspends callers until a response or timeout.
pub struct SignalGate {
    tracker: Arc<dyn TrackerClient>,
    timeout: Duration,
    policy: TimeoutPolicy,
    /// Pending question id -> waiter. The entry is registered before
    /// the question is posted, so a response racing the post is kept,
    /// and removed when the wait resolves.
    waiters: Mutex<HashMap<Uuid, oneshot::Sender<String>>>,
    /// Per-run serialization so a run can never have two questions
    /// outstanding at once.
    run_locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl SignalGate {
    pub fn new(tracker: Arc<dyn TrackerClient>, timeout: Duration, policy: TimeoutPolicy) -> Self {
        Self {
            tracker,
            timeout,
            policy,
            waiters: Mutex::new(HashMap::new()),
            run_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Posts `question` on the work item and suspends until a matching
    /// response signal arrives or the timeout elapses.
    ///
    /// A second `ask` for the same run waits for the first to resolve
    /// before posting.
    pub async fn ask(
        &self,
        run_id: Uuid,
        work_item_id: &str,
        question: Question,
    ) -> Result<Decision, GateError> {
        self.ask_with(run_id, work_item_id, question, |_| {}).await
    }

    /// Like [`ask`](Self::ask), but invokes `on_posted` with the
    /// [`PendingQuestion`] after posting and before suspending, so the
    /// caller can persist the suspension point.
    pub async fn ask_with<F>(
        &self,
        run_id: Uuid,
        work_item_id: &str,
        question: Question,
        on_posted: F,
    ) -> Result<Decision, GateError>
    where
        F: FnOnce(&PendingQuestion) + Send,
    {
        if question.options.is_empty() {
            return Err(GateError::NoOptions(question.id));
        }

        let run_lock = self.run_lock(run_id);
        let _serial = run_lock.lock().await;

        // Register before posting: once the question is visible on the
        // tracker a response can arrive at any moment.
        let (tx, rx) = oneshot::channel();
        {
            let mut waiters = self.waiters.lock().expect("waiter registry poisoned");
            waiters.insert(question.id, tx);
        }

        let posted_id = match self.tracker.post_question(work_item_id, &question).await {
            Ok(id) => id,
            Err(e) => {
                self.forget(question.id);
                return Err(e.into());
            }
        };
        if posted_id != question.id {
            // The tracker assigned its own id; re-key the waiter.
            let mut waiters = self.waiters.lock().expect("waiter registry poisoned");
            if let Some(tx) = waiters.remove(&question.id) {
                waiters.insert(posted_id, tx);
            }
        }

        let pending = PendingQuestion {
            question: question.clone(),
            posted_id,
            posted_at: Utc::now(),
            deadline: Utc::now() + chrono::Duration::from_std(self.timeout).unwrap_or_default(),
        };
        on_posted(&pending);

        tracing::info!(
            question_id = %posted_id,
            question_type = %pending.question.question_type,
            deadline = %pending.deadline,
            "question posted, suspending until response or timeout"
        );

        self.await_decision(posted_id, &question, pending.deadline, rx)
            .await
    }

    /// Reattaches to a question posted by an earlier process, waiting
    /// only until the stored deadline. A deadline already in the past
    /// resolves to the timeout default immediately, without re-posting.
    pub async fn resume_pending(
        &self,
        run_id: Uuid,
        pending: PendingQuestion,
    ) -> Result<Decision, GateError> {
        let run_lock = self.run_lock(run_id);
        let _serial = run_lock.lock().await;

        let (tx, rx) = oneshot::channel();
        {
            let mut waiters = self.waiters.lock().expect("waiter registry poisoned");
            waiters.insert(pending.posted_id, tx);
        }

        tracing::info!(
            question_id = %pending.posted_id,
            deadline = %pending.deadline,
            "reattached to previously posted question"
        );

        self.await_decision(pending.posted_id, &pending.question, pending.deadline, rx)
            .await
    }

    async fn await_decision(
        &self,
        posted_id: Uuid,
        question: &Question,
        deadline: DateTime<Utc>,
        rx: oneshot::Receiver<String>,
    ) -> Result<Decision, GateError> {
        let remaining = (deadline - Utc::now()).to_std().unwrap_or_default();

        let decision = tokio::select! {
            response = rx => match response {
                Ok(option_id) => Decision {
                    question_id: posted_id,
                    option_id: Some(option_id),
                    source: DecisionSource::Human,
                },
                // Sender dropped without a value: the wait was cancelled.
                Err(_) => {
                    return Err(GateError::Cancelled);
                }
            },
            _ = tokio::time::sleep(remaining) => {
                self.forget(posted_id);
                let option_id = question
                    .timeout_default(self.policy)
                    .map(|id| id.to_string());
                tracing::warn!(
                    question_id = %posted_id,
                    default = option_id.as_deref().unwrap_or("<no action>"),
                    "question timed out, applying default resolution"
                );
                Decision {
                    question_id: posted_id,
                    option_id,
                    source: DecisionSource::TimeoutDefault,
                }
            }
        };

        Ok(decision)
    }

    /// Delivers a response signal. Returns `true` if a waiter was
    /// resumed; a late or unknown signal is a no-op.
    pub fn deliver(&self, question_id: Uuid, option_id: &str) -> bool {
        let sender = {
            let mut waiters = self.waiters.lock().expect("waiter registry poisoned");
            waiters.remove(&question_id)
        };

        match sender {
            Some(tx) => {
                let resumed = tx.send(option_id.to_string()).is_ok();
                if !resumed {
                    tracing::debug!(question_id = %question_id, "waiter gone before delivery");
                }
                resumed
            }
            None => {
                tracing::debug!(
                    question_id = %question_id,
                    "signal for unknown or already-resolved question ignored"
                );
                false
            }
        }
    }

    /// Cancels the wait on a question, if any. The suspended caller
    /// observes [`GateError::Cancelled`].
    pub fn cancel(&self, question_id: Uuid) {
        self.forget(question_id);
    }

    /// Number of questions currently awaiting resolution.
    pub fn pending_count(&self) -> usize {
        self.waiters.lock().expect("waiter registry poisoned").len()
    }

    fn forget(&self, question_id: Uuid) {
        let mut waiters = self.waiters.lock().expect("waiter registry poisoned");
        waiters.remove(&question_id);
    }

    /// Drops the per-run serialization state once a run reaches a
    /// terminal status, so finished runs do not accumulate in the
    /// registry.
    pub fn release_run(&self, run_id: Uuid) {
        let mut locks = self.run_locks.lock().expect("run lock registry poisoned");
        locks.remove(&run_id);
    }

    /// Number of runs with serialization state still held.
    pub fn tracked_runs(&self) -> usize {
        self.run_locks.lock().expect("run lock registry poisoned").len()
    }

    fn run_lock(&self, run_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.run_locks.lock().expect("run lock registry poisoned");
        locks
            .entry(run_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}
