//! Token-budget scheduling for fan-out model calls.
//!
//! Each model key owns one fixed window of `window` length. A batch is charged its
//! estimated input cost before it starts and each result's output tokens as it lands;
//! when nothing fits, the run sleeps until the window resets.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use forge_core::AppConfig;
use forge_providers::StatusSink;
use forge_types::{ModelCallResult, ModelSpec};

use crate::error::Cancelled;

/// A deferred model call. Nothing happens until the scheduler polls it.
pub type CallThunk<'a> = BoxFuture<'a, ModelCallResult>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateWindowState {
    pub consumed: u64,
    pub window_start: Instant,
}

impl RateWindowState {
    fn fresh() -> Self {
        Self {
            consumed: 0,
            window_start: Instant::now(),
        }
    }

    fn roll(&mut self, window: Duration) {
        if self.window_start.elapsed() > window {
            self.consumed = 0;
            self.window_start = Instant::now();
        }
    }
}

/// Per-model rate windows. Clones share state; each model key gets its own lock so
/// runs against one model are serialized while different models never contend.
#[derive(Clone, Default)]
pub struct RateWindows {
    windows: Arc<StdMutex<HashMap<String, Arc<Mutex<RateWindowState>>>>>,
}

impl RateWindows {
    pub fn new() -> Self {
        Self::default()
    }

    fn window(&self, key: &str) -> Arc<Mutex<RateWindowState>> {
        let mut windows = self
            .windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        windows
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(RateWindowState::fresh())))
            .clone()
    }

    pub async fn snapshot(&self, key: &str) -> Option<RateWindowState> {
        let window = {
            let windows = self
                .windows
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            windows.get(key).cloned()
        }?;
        let state = *window.lock().await;
        Some(state)
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Tokens-per-window budget keyed by `provider/model`.
    pub budgets: HashMap<String, u64>,
    pub window: Duration,
    pub safety_margin: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            budgets: HashMap::new(),
            window: Duration::from_secs(60),
            safety_margin: Duration::from_secs(1),
        }
    }
}

impl SchedulerConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            budgets: config.rate_limits.clone(),
            window: config.scheduler.window(),
            safety_margin: config.scheduler.safety_margin(),
        }
    }

    pub fn with_budget(mut self, model: &ModelSpec, tokens_per_window: u64) -> Self {
        self.budgets.insert(model.key(), tokens_per_window);
        self
    }
}

#[derive(Clone)]
pub struct Scheduler {
    windows: RateWindows,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(windows: RateWindows, config: SchedulerConfig) -> Self {
        Self { windows, config }
    }

    pub fn windows(&self) -> &RateWindows {
        &self.windows
    }

    /// Runs `calls` against `model`, returning one result per call in input order.
    /// Call failures come back as error results; only cancellation aborts the run.
    pub async fn run<'a>(
        &self,
        model: &ModelSpec,
        per_call_tokens: u64,
        calls: Vec<CallThunk<'a>>,
        cancel: &CancellationToken,
        status: &dyn StatusSink,
    ) -> Result<Vec<ModelCallResult>, Cancelled> {
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }
        let key = model.key();
        let Some(budget) = self.config.budgets.get(&key).copied().filter(|b| *b > 0) else {
            tracing::debug!(model = %key, calls = calls.len(), "no token budget; running unthrottled");
            return run_concurrently(calls.into_iter().enumerate().collect(), cancel, |_| {})
                .await
                .map(|results| results.into_iter().map(|(_, r)| r).collect());
        };

        let total = calls.len();
        let window = self.windows.window(&key);
        let mut state = window.lock().await;
        let mut pending = calls.into_iter().enumerate().collect::<Vec<_>>();
        pending.reverse();
        let mut results: Vec<Option<ModelCallResult>> = (0..total).map(|_| None).collect();

        while !pending.is_empty() {
            if cancel.is_cancelled() {
                return Err(Cancelled);
            }
            state.roll(self.config.window);
            let available = budget.saturating_sub(state.consumed);
            let remaining = pending.len();
            let mut fit = if per_call_tokens == 0 {
                remaining
            } else {
                ((available / per_call_tokens) as usize).min(remaining)
            };
            // an oversized call still runs, alone, once the window is empty
            if fit == 0 && state.consumed == 0 {
                fit = 1;
            }

            if fit == 0 {
                let elapsed = state.window_start.elapsed();
                let delay = self.config.window.saturating_sub(elapsed) + self.config.safety_margin;
                tracing::info!(
                    model = %key,
                    consumed = state.consumed,
                    budget,
                    wait_ms = delay.as_millis() as u64,
                    "token budget exhausted; waiting for window reset"
                );
                status.status(format!(
                    "Rate limit reached for {key}; waiting {}s for the token window to reset ({remaining} call(s) queued)",
                    delay.as_secs_f64().ceil() as u64
                ));
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }

            let batch = (0..fit).filter_map(|_| pending.pop()).collect::<Vec<_>>();
            state.consumed = state
                .consumed
                .saturating_add(per_call_tokens.saturating_mul(batch.len() as u64));
            tracing::info!(
                model = %key,
                batch = batch.len(),
                remaining = pending.len(),
                consumed = state.consumed,
                budget,
                "dispatching batch"
            );

            let consumed = &mut state.consumed;
            let finished = run_concurrently(batch, cancel, |result| {
                if let Ok(output) = result {
                    *consumed = consumed.saturating_add(output.usage.completion_tokens);
                }
            })
            .await?;
            for (index, result) in finished {
                results[index] = Some(result);
            }
        }

        Ok(results.into_iter().flatten().collect())
    }
}

async fn run_concurrently<'a, F>(
    calls: Vec<(usize, CallThunk<'a>)>,
    cancel: &CancellationToken,
    mut on_result: F,
) -> Result<Vec<(usize, ModelCallResult)>, Cancelled>
where
    F: FnMut(&ModelCallResult),
{
    let mut in_flight = calls
        .into_iter()
        .map(|(index, call)| async move { (index, call.await) })
        .collect::<FuturesUnordered<_>>();
    let mut finished = Vec::with_capacity(in_flight.len());
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Cancelled),
            next = in_flight.next() => next,
        };
        let Some((index, result)) = next else { break };
        on_result(&result);
        finished.push((index, result));
    }
    finished.sort_by_key(|(index, _)| *index);
    Ok(finished)
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_providers::{NoopStatus, RecordingStatus};
    use forge_types::{CallErrorKind, ModelCallError, ModelCallOutput, TokenUsage};
    use futures::FutureExt;

    fn ok_call<'a>(text: &'static str, output_tokens: u64) -> CallThunk<'a> {
        async move { Ok(ModelCallOutput::text(text, TokenUsage::new(0, output_tokens))) }.boxed()
    }

    fn model() -> ModelSpec {
        ModelSpec::new("test", "model")
    }

    #[tokio::test(start_paused = true)]
    async fn unbudgeted_model_runs_everything_at_once() {
        let scheduler = Scheduler::new(RateWindows::new(), SchedulerConfig::default());
        let started = Instant::now();
        let calls = (0..5)
            .map(|_| {
                async move {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(ModelCallOutput::text("done", TokenUsage::default()))
                }
                .boxed()
            })
            .collect();
        let results = scheduler
            .run(&model(), 1_000_000, calls, &CancellationToken::new(), &NoopStatus)
            .await
            .expect("results");
        assert_eq!(results.len(), 5);
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn results_keep_input_order_and_failures_stay_local() {
        let config = SchedulerConfig::default().with_budget(&model(), 10_000);
        let scheduler = Scheduler::new(RateWindows::new(), config);
        let calls = vec![
            async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok(ModelCallOutput::text("first", TokenUsage::default()))
            }
            .boxed(),
            async { Err(ModelCallError::new(CallErrorKind::Transport, "boom")) }.boxed(),
            ok_call("third", 0),
        ];
        let results = scheduler
            .run(&model(), 100, calls, &CancellationToken::new(), &NoopStatus)
            .await
            .expect("results");
        assert_eq!(results[0].as_ref().map(|o| o.text.as_str()), Ok("first"));
        assert!(results[1].is_err());
        assert_eq!(results[2].as_ref().map(|o| o.text.as_str()), Ok("third"));
    }

    #[tokio::test(start_paused = true)]
    async fn batches_wait_for_window_reset() {
        let windows = RateWindows::new();
        let config = SchedulerConfig::default().with_budget(&model(), 1_000);
        let scheduler = Scheduler::new(windows.clone(), config);
        let status = RecordingStatus::default();
        let started = Instant::now();
        let starts = Arc::new(StdMutex::new(Vec::new()));

        let calls = (0..7)
            .map(|_| {
                let starts = starts.clone();
                async move {
                    starts.lock().unwrap().push(started.elapsed());
                    Ok(ModelCallOutput::text("ok", TokenUsage::default()))
                }
                .boxed()
            })
            .collect();
        let results = scheduler
            .run(&model(), 300, calls, &CancellationToken::new(), &status)
            .await
            .expect("results");
        assert_eq!(results.len(), 7);

        let starts = starts.lock().unwrap().clone();
        let at = |secs: u64| starts.iter().filter(|d| d.as_secs() == secs).count();
        assert_eq!(at(0), 3);
        assert_eq!(at(61), 3);
        assert_eq!(at(122), 1);
        assert_eq!(status.lines().len(), 2);
        assert!(status.lines()[0].contains("test/model"));

        // no rolling 60s interval ever sees more than the budget in input charges
        for start in &starts {
            let charged = starts
                .iter()
                .filter(|d| **d >= *start && **d < *start + Duration::from_secs(60))
                .count() as u64
                * 300;
            assert!(charged <= 1_000);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn output_tokens_are_charged_to_the_window() {
        let windows = RateWindows::new();
        let config = SchedulerConfig::default().with_budget(&model(), 1_000);
        let scheduler = Scheduler::new(windows.clone(), config);
        scheduler
            .run(
                &model(),
                100,
                vec![ok_call("a", 40), ok_call("b", 60)],
                &CancellationToken::new(),
                &NoopStatus,
            )
            .await
            .expect("results");
        let state = windows.snapshot("test/model").await.expect("window");
        assert_eq!(state.consumed, 300);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_call_runs_alone_once_window_is_empty() {
        let config = SchedulerConfig::default().with_budget(&model(), 500);
        let scheduler = Scheduler::new(RateWindows::new(), config);
        let started = Instant::now();
        let starts = Arc::new(StdMutex::new(Vec::new()));
        let calls = (0..2)
            .map(|_| {
                let starts = starts.clone();
                async move {
                    starts.lock().unwrap().push(started.elapsed());
                    Ok(ModelCallOutput::text("big", TokenUsage::default()))
                }
                .boxed()
            })
            .collect();
        let results = scheduler
            .run(&model(), 2_000, calls, &CancellationToken::new(), &NoopStatus)
            .await
            .expect("results");
        assert_eq!(results.len(), 2);
        let starts = starts.lock().unwrap().clone();
        assert_eq!(starts[0], Duration::ZERO);
        assert_eq!(starts[1], Duration::from_secs(61));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_cost_calls_all_fit() {
        let config = SchedulerConfig::default().with_budget(&model(), 10);
        let scheduler = Scheduler::new(RateWindows::new(), config);
        let calls = (0..4).map(|_| ok_call("free", 0)).collect();
        let started = Instant::now();
        let results = scheduler
            .run(&model(), 0, calls, &CancellationToken::new(), &NoopStatus)
            .await
            .expect("results");
        assert_eq!(results.len(), 4);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_window_wait() {
        let config = SchedulerConfig::default().with_budget(&model(), 100);
        let scheduler = Scheduler::new(RateWindows::new(), config);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });
        let started = Instant::now();
        let calls = (0..3).map(|_| ok_call("x", 0)).collect();
        let outcome = scheduler
            .run(&model(), 100, calls, &cancel, &NoopStatus)
            .await;
        assert_eq!(outcome.err(), Some(Cancelled));
        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_drops_in_flight_calls() {
        let scheduler = Scheduler::new(RateWindows::new(), SchedulerConfig::default());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });
        let calls = vec![async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(ModelCallOutput::text("never", TokenUsage::default()))
        }
        .boxed()];
        let outcome = scheduler
            .run(&model(), 10, calls, &cancel, &NoopStatus)
            .await;
        assert_eq!(outcome.err(), Some(Cancelled));
    }
}
