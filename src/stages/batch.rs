//! Bounded-pool batch runner shared by all stages.

use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::retry::{RetryOutcome, run_with_retry};
use super::{ItemStep, OutcomeKind, StageContext, Tracked};
use crate::errors::StageError;
use crate::item::ItemStatus;
use crate::progress::{EventKind, ProgressEvent};

/// Items in input order, plus the first session-fatal error, if any.
#[derive(Debug)]
pub struct BatchReport<T> {
    pub items: Vec<T>,
    pub fatal: Option<StageError>,
}

impl<T: Tracked> BatchReport<T> {
    pub fn count(&self, status: ItemStatus) -> usize {
        self.items.iter().filter(|i| i.status() == status).count()
    }
}

/// Process `items` with at most `ctx.pool_size` in flight.
///
/// Before each item starts, cancellation is checked; items never started
/// stay `Pending`. A session-fatal error cancels a stage-local token so no
/// new items start, lets in-flight items finish, and is returned in the
/// report. Fatal errors after the first are reported as warnings. Returns
/// only when every started item has finished, so no item is left
/// `InProgress`.
pub async fn run_batch<T, S>(ctx: &StageContext, step: Arc<S>, items: Vec<T>) -> BatchReport<T>
where
    T: Tracked,
    S: ItemStep<T>,
{
    let stage = step.kind();
    let total = items.len();
    let stage_token = ctx.cancel.child_token();
    let semaphore = Arc::new(Semaphore::new(ctx.pool_size.max(1)));
    let mut finished: Vec<Option<T>> = vec![None; total];
    // Copies of started items, used if a task dies without returning its item.
    let mut started: Vec<Option<T>> = vec![None; total];
    let mut tasks = JoinSet::new();

    for (index, item) in items.into_iter().enumerate() {
        let permit = tokio::select! {
            biased;
            _ = stage_token.cancelled() => None,
            permit = semaphore.clone().acquire_owned() => permit.ok(),
        };
        let Some(permit) = permit else {
            finished[index] = Some(item);
            continue;
        };

        started[index] = Some(item.clone());
        let ctx = ctx.clone();
        let step = step.clone();
        let token = stage_token.clone();
        tasks.spawn(async move {
            let _permit = permit;
            let worker = tokio::spawn(async move {
                process_item(&ctx, step.as_ref(), &token, item).await
            });
            (index, worker.await)
        });
    }

    let mut fatal: Option<StageError> = None;
    while let Some(joined) = tasks.join_next().await {
        let Ok((index, result)) = joined else {
            continue;
        };
        match result {
            Ok((item, item_fatal)) => {
                if let Some(err) = item_fatal {
                    if fatal.is_none() {
                        tracing::warn!(%stage, error = %err, "session-fatal error, stopping stage");
                        fatal = Some(err);
                    } else {
                        ctx.progress
                            .send(ProgressEvent::item(
                                EventKind::Warning,
                                stage,
                                item.id(),
                                format!("Additional fatal error after the first: {}", err),
                            ))
                            .await;
                    }
                }
                finished[index] = Some(item);
            }
            Err(join_err) => {
                let Some(mut item) = started[index].take() else {
                    continue;
                };
                tracing::error!(%stage, item_id = item.id(), error = %join_err, "stage task died");
                item.set_status(ItemStatus::Failed);
                item.set_failure(Some(format!("worker task failed: {}", join_err)));
                ctx.record(stage, OutcomeKind::Failed);
                ctx.progress
                    .send(ProgressEvent::item(
                        EventKind::Error,
                        stage,
                        item.id(),
                        format!("{} {} aborted: {}", stage, item.id(), join_err),
                    ))
                    .await;
                finished[index] = Some(item);
            }
        }
    }

    let report = BatchReport {
        items: finished.into_iter().flatten().collect(),
        fatal,
    };
    let (done, failed) = (report.count(ItemStatus::Done), report.count(ItemStatus::Failed));
    let pending = report.count(ItemStatus::Pending);
    tracing::info!(%stage, total, done, failed, pending, "stage batch finished");
    ctx.progress
        .send(ProgressEvent::new(
            EventKind::Info,
            format!(
                "{}: {} succeeded, {} failed, {} not started",
                stage, done, failed, pending
            ),
        ))
        .await;
    report
}

async fn attempt_once<T, S>(ctx: &StageContext, step: &S, item: &T) -> Result<S::Output, StageError>
where
    T: Tracked,
    S: ItemStep<T>,
{
    let result = match tokio::time::timeout(ctx.call_timeout, step.attempt(item)).await {
        Ok(result) => result,
        Err(_) => Err(StageError::Timeout {
            secs: ctx.call_timeout.as_secs(),
        }),
    };
    if let Err(err) = &result
        && err.is_retryable()
    {
        ctx.progress
            .send(ProgressEvent::item(
                EventKind::Warning,
                step.kind(),
                item.id(),
                format!("{} {} attempt failed: {}", step.kind(), item.id(), err),
            ))
            .await;
    }
    result
}

async fn process_item<T, S>(
    ctx: &StageContext,
    step: &S,
    token: &CancellationToken,
    mut item: T,
) -> (T, Option<StageError>)
where
    T: Tracked,
    S: ItemStep<T>,
{
    let stage = step.kind();
    item.set_status(ItemStatus::InProgress);
    ctx.record(stage, OutcomeKind::Attempted);

    let item_ref = &item;
    let outcome = run_with_retry(&ctx.retry, token, move || attempt_once(ctx, step, item_ref)).await;

    match outcome {
        RetryOutcome::Succeeded { value, retries } => {
            step.apply(&mut item, value);
            item.set_retries(retries);
            item.set_status(ItemStatus::Done);
            ctx.record(stage, OutcomeKind::Succeeded);
            let message = step.success_message(&item);
            ctx.progress
                .send(ProgressEvent::item(EventKind::Success, stage, item.id(), message))
                .await;
            (item, None)
        }
        RetryOutcome::Failed { error, retries } => {
            item.set_retries(retries);
            item.set_status(ItemStatus::Failed);
            item.set_failure(Some(error.to_string()));
            ctx.record(stage, OutcomeKind::Failed);
            tracing::warn!(%stage, item_id = item.id(), retries, %error, "item failed");
            ctx.progress
                .send(ProgressEvent::item(
                    EventKind::Error,
                    stage,
                    item.id(),
                    format!("{} {} failed after {} retries: {}", stage, item.id(), retries, error),
                ))
                .await;
            if error.is_session_fatal() {
                token.cancel();
                (item, Some(error))
            } else {
                (item, None)
            }
        }
        RetryOutcome::Cancelled {
            last_error,
            retries,
        } => {
            item.set_retries(retries);
            item.set_status(ItemStatus::Failed);
            item.set_failure(Some(format!("cancelled before retry: {}", last_error)));
            ctx.record(stage, OutcomeKind::Failed);
            ctx.progress
                .send(ProgressEvent::item(
                    EventKind::Warning,
                    stage,
                    item.id(),
                    format!("{} {} cancelled before retry", stage, item.id()),
                ))
                .await;
            (item, None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{Payload, WorkItem};
    use crate::progress::{self, ProgressReceiver};
    use crate::session::StageKind;
    use crate::stages::RetryPolicy;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Step whose behaviour per item id is scripted by the test.
    struct ScriptedStep {
        fail: HashMap<String, StageError>,
        delay: Duration,
        slow: HashMap<String, Duration>,
        attempts: Mutex<HashMap<String, usize>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedStep {
        fn new(fail: Vec<(&str, StageError)>) -> Self {
            Self {
                fail: fail.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
                delay: Duration::from_millis(5),
                slow: HashMap::new(),
                attempts: Mutex::new(HashMap::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }

        fn attempts_for(&self, id: &str) -> usize {
            self.attempts.lock().unwrap().get(id).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl ItemStep<WorkItem> for ScriptedStep {
        type Output = String;

        fn kind(&self) -> StageKind {
            StageKind::Transform
        }

        async fn attempt(&self, item: &WorkItem) -> Result<String, StageError> {
            *self.attempts.lock().unwrap().entry(item.id.clone()).or_default() += 1;
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let delay = self.slow.get(&item.id).copied().unwrap_or(self.delay);
            tokio::time::sleep(delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            match self.fail.get(&item.id) {
                Some(err) => Err(err.clone()),
                None => Ok(format!("prompt for {}", item.id)),
            }
        }

        fn apply(&self, item: &mut WorkItem, output: String) {
            item.payload.prompt = Some(output);
        }
    }

    fn items(n: usize) -> Vec<WorkItem> {
        (1..=n)
            .map(|i| WorkItem::new(format!("p{i}"), format!("https://r/p{i}"), Payload::default()))
            .collect()
    }

    fn context(
        pool_size: usize,
    ) -> (StageContext, ProgressReceiver, mpsc::UnboundedReceiver<super::super::StageOutcome>) {
        let (progress, events) = progress::channel(1024);
        let (outcomes, outcome_rx) = mpsc::unbounded_channel();
        let ctx = StageContext {
            progress,
            outcomes,
            cancel: CancellationToken::new(),
            retry: RetryPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
            pool_size,
            call_timeout: Duration::from_secs(5),
        };
        (ctx, events, outcome_rx)
    }

    #[tokio::test]
    async fn test_done_plus_failed_equals_batch_size() {
        let (ctx, _events, mut outcomes) = context(2);
        let step = Arc::new(ScriptedStep::new(vec![(
            "p3",
            StageError::InvalidResponse("empty".into()),
        )]));
        let report = run_batch(&ctx, step.clone(), items(5)).await;

        assert!(report.fatal.is_none());
        assert_eq!(report.items.len(), 5);
        assert_eq!(report.count(ItemStatus::Done), 4);
        assert_eq!(report.count(ItemStatus::Failed), 1);
        assert_eq!(report.count(ItemStatus::InProgress), 0);
        // exactly max_retries retries for the failing item
        assert_eq!(step.attempts_for("p3"), 3);
        assert_eq!(report.items[2].retries, 2);
        assert_eq!(step.attempts_for("p1"), 1);

        drop(ctx);
        let mut attempted = 0;
        while let Ok(outcome) = outcomes.try_recv() {
            if outcome.kind == OutcomeKind::Attempted {
                attempted += 1;
            }
        }
        assert_eq!(attempted, 5);
    }

    #[tokio::test]
    async fn test_items_returned_in_input_order() {
        let (ctx, _events, _outcomes) = context(3);
        let step = Arc::new(ScriptedStep::new(vec![]));
        let report = run_batch(&ctx, step, items(6)).await;
        let ids: Vec<&str> = report.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["p1", "p2", "p3", "p4", "p5", "p6"]);
        assert_eq!(
            report.items[0].payload.prompt.as_deref(),
            Some("prompt for p1")
        );
    }

    #[tokio::test]
    async fn test_pool_size_bounds_concurrency() {
        let (ctx, _events, _outcomes) = context(2);
        let step = Arc::new(ScriptedStep::new(vec![]));
        run_batch(&ctx, step.clone(), items(8)).await;
        assert!(step.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_fatal_error_stops_new_items() {
        let (ctx, _events, _outcomes) = context(1);
        let step = Arc::new(ScriptedStep::new(vec![(
            "p2",
            StageError::EngineUnavailable("no engine".into()),
        )]));
        let report = run_batch(&ctx, step.clone(), items(5)).await;

        assert_eq!(
            report.fatal,
            Some(StageError::EngineUnavailable("no engine".into()))
        );
        assert_eq!(step.attempts_for("p2"), 1);
        assert_eq!(report.items[0].status, ItemStatus::Done);
        assert_eq!(report.items[1].status, ItemStatus::Failed);
        assert_eq!(report.count(ItemStatus::InProgress), 0);
        // the stage token was cancelled, not the session token
        assert!(!ctx.cancel.is_cancelled());
        assert!(report.count(ItemStatus::Pending) >= 2);
    }

    #[tokio::test]
    async fn test_later_fatal_errors_become_warnings() {
        let (ctx, mut events, _outcomes) = context(2);
        let mut step = ScriptedStep::new(vec![
            ("p1", StageError::EngineUnavailable("first".into())),
            ("p2", StageError::EngineUnavailable("second".into())),
        ]);
        step.slow.insert("p2".into(), Duration::from_millis(40));
        let report = run_batch(&ctx, Arc::new(step), items(2)).await;
        drop(ctx);

        assert_eq!(
            report.fatal,
            Some(StageError::EngineUnavailable("first".into()))
        );
        assert_eq!(report.count(ItemStatus::Failed), 2);

        let mut extra = Vec::new();
        while let Some(event) = events.recv().await {
            if event.kind == EventKind::Warning
                && event.message.starts_with("Additional fatal error after the first")
            {
                extra.push(event);
            }
        }
        assert_eq!(extra.len(), 1);
        assert_eq!(extra[0].item_id(), Some("p2"));
        assert!(extra[0].message.contains("second"));
    }

    #[tokio::test]
    async fn test_cancelled_session_leaves_items_pending() {
        let (ctx, _events, _outcomes) = context(2);
        ctx.cancel.cancel();
        let step = Arc::new(ScriptedStep::new(vec![]));
        let report = run_batch(&ctx, step.clone(), items(4)).await;
        assert_eq!(report.count(ItemStatus::Pending), 4);
        assert_eq!(step.attempts_for("p1"), 0);
    }

    #[tokio::test]
    async fn test_slow_attempt_times_out() {
        let (mut ctx, _events, _outcomes) = context(1);
        ctx.call_timeout = Duration::from_millis(10);
        ctx.retry.max_retries = 0;
        let mut step = ScriptedStep::new(vec![]);
        step.delay = Duration::from_millis(200);
        let report = run_batch(&ctx, Arc::new(step), items(1)).await;
        assert_eq!(report.items[0].status, ItemStatus::Failed);
        assert!(report.items[0].failure.as_deref().unwrap().contains("Timed out"));
    }

    #[tokio::test]
    async fn test_errors_are_reported_with_item_id() {
        let (ctx, mut events, _outcomes) = context(2);
        let step = Arc::new(ScriptedStep::new(vec![(
            "p2",
            StageError::ModelUnavailable("offline".into()),
        )]));
        run_batch(&ctx, step, items(2)).await;
        drop(ctx);

        let mut error_ids = Vec::new();
        while let Some(event) = events.recv().await {
            if event.kind == EventKind::Error {
                error_ids.push(event.item_id().map(str::to_string));
            }
        }
        assert_eq!(error_ids, vec![Some("p2".to_string())]);
    }
}
