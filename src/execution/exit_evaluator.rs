use chrono::{DateTime, Duration, Utc};
use dashmap::DashSet;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

use super::executor::TradeExecutor;
use super::price_feed::PriceAggregator;
use crate::config::EngineConfig;
use crate::db::PositionRepository;
use crate::error::EngineError;
use crate::models::{
    ExitDecision, ExitReason, Position, PositionStatus, PositionUpdate, Trade, TradeSide,
};
use crate::resilience::{Resilience, RetryQueue, TaskFuture};
use crate::Result;

const REPOSITORY_KEY: &str = "repository";

/// Take-profit / stop-loss / max-holding-time rules
///
/// Thresholds are fractional P&L: 0.15 is +15%, -0.10 is -10%.
#[derive(Debug, Clone)]
pub struct ExitEvaluator {
    take_profit_threshold: f64,
    stop_loss_threshold: f64,
    max_holding_time: Duration,
}

impl ExitEvaluator {
    pub fn new(take_profit_threshold: f64, stop_loss_threshold: f64, max_holding_time: Duration) -> Self {
        Self {
            take_profit_threshold,
            stop_loss_threshold,
            max_holding_time,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.take_profit_threshold,
            config.stop_loss_threshold,
            config.max_holding_time(),
        )
    }

    /// Check if position should exit (uses current time)
    pub fn evaluate(&self, position: &Position, current_price: f64) -> Result<ExitDecision> {
        self.evaluate_at(position, current_price, Utc::now())
    }

    /// Check if position should exit with explicit timestamp
    ///
    /// Rules apply in priority order: take profit, stop loss, holding time.
    pub fn evaluate_at(
        &self,
        position: &Position,
        current_price: f64,
        now: DateTime<Utc>,
    ) -> Result<ExitDecision> {
        let current_pnl = pnl_fraction(position, current_price)?;

        if current_pnl >= self.take_profit_threshold {
            return Ok(ExitDecision {
                should_exit: true,
                reason: format!("Take profit triggered at {:.2}%", current_pnl * 100.0),
                current_pnl,
                exit_reason: Some(ExitReason::TakeProfit),
            });
        }

        if current_pnl <= self.stop_loss_threshold {
            return Ok(ExitDecision {
                should_exit: true,
                reason: format!("Stop loss triggered at {:.2}%", current_pnl * 100.0),
                current_pnl,
                exit_reason: Some(ExitReason::StopLoss),
            });
        }

        if now - position.entry_time >= self.max_holding_time {
            return Ok(ExitDecision {
                should_exit: true,
                reason: "Maximum holding time reached".to_string(),
                current_pnl,
                exit_reason: Some(ExitReason::MaxHoldingTime),
            });
        }

        Ok(ExitDecision {
            should_exit: false,
            reason: format!("Holding at {:.2}%", current_pnl * 100.0),
            current_pnl,
            exit_reason: None,
        })
    }
}

fn pnl_fraction(position: &Position, current_price: f64) -> Result<f64> {
    let valid = |v: f64| v.is_finite() && v > 0.0;
    if !valid(position.entry_price) || !valid(position.amount) || !valid(current_price) {
        return Err(EngineError::InvalidMetric(format!(
            "position {}: entry {} amount {} price {}",
            position.id, position.entry_price, position.amount, current_price
        )));
    }

    let entry_value = position.entry_price * position.amount;
    let current_value = current_price * position.amount;
    Ok((current_value - entry_value) / entry_value)
}

#[derive(Debug, Default)]
pub struct ExitBatchReport {
    pub evaluated: usize,
    pub exited: usize,
    pub failed: usize,
    /// Already sold, waiting for the close to be persisted
    pub awaiting_persist: usize,
    pub decisions: Vec<(Uuid, ExitDecision)>,
}

/// Evaluates every open position and carries out exits
#[derive(Clone)]
pub struct ExitMonitor {
    evaluator: ExitEvaluator,
    prices: Arc<PriceAggregator>,
    repository: Arc<dyn PositionRepository>,
    executor: Arc<dyn TradeExecutor>,
    resilience: Resilience,
    retry_queue: Arc<RetryQueue>,
    max_concurrent: usize,
    // Positions whose exit order filled but whose close is not stored yet
    exits_filled: Arc<DashSet<Uuid>>,
}

impl ExitMonitor {
    pub fn new(
        evaluator: ExitEvaluator,
        prices: Arc<PriceAggregator>,
        repository: Arc<dyn PositionRepository>,
        executor: Arc<dyn TradeExecutor>,
        resilience: Resilience,
        retry_queue: Arc<RetryQueue>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            evaluator,
            prices,
            repository,
            executor,
            resilience,
            retry_queue,
            max_concurrent: max_concurrent.max(1),
            exits_filled: Arc::new(DashSet::new()),
        }
    }

    pub fn evaluator(&self) -> &ExitEvaluator {
        &self.evaluator
    }

    /// One pass over all open positions
    ///
    /// Failing to list positions aborts the batch; anything after that is
    /// isolated per position.
    pub async fn run_batch(&self) -> Result<ExitBatchReport> {
        let positions = self
            .resilience
            .call(REPOSITORY_KEY, |_| self.repository.get_open_positions())
            .await?;
        let mut report = ExitBatchReport::default();

        // Closes that reached the repository no longer need guarding
        let listed: HashSet<Uuid> = positions.iter().map(|p| p.id).collect();
        self.exits_filled.retain(|id| listed.contains(id));

        if positions.is_empty() {
            return Ok(report);
        }

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut tasks = JoinSet::new();

        for position in positions {
            let monitor = self.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = monitor.process_position(&position).await;
                (position, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if matches!(joined, Ok((_, Ok(None)))) {
                report.awaiting_persist += 1;
                continue;
            }

            report.evaluated += 1;
            match joined {
                Ok((_, Ok(None))) => {}
                Ok((position, Ok(Some(decision)))) => {
                    if decision.should_exit {
                        report.exited += 1;
                    }
                    report.decisions.push((position.id, decision));
                }
                Ok((position, Err(e))) => {
                    report.failed += 1;
                    tracing::warn!(
                        position = %position.id,
                        asset = %position.symbol,
                        "Exit evaluation failed: {}",
                        e
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::error!("Exit evaluation task panicked: {}", e);
                }
            }
        }

        tracing::info!(
            evaluated = report.evaluated,
            exited = report.exited,
            failed = report.failed,
            awaiting_persist = report.awaiting_persist,
            "Exit batch complete"
        );

        Ok(report)
    }

    /// `None` when the position was already sold and only its close is pending
    async fn process_position(&self, position: &Position) -> Result<Option<ExitDecision>> {
        if self.exits_filled.contains(&position.id) {
            tracing::debug!(position = %position.id, "Exit already filled, awaiting persistence");
            return Ok(None);
        }

        let quote = self.prices.get_price(&position.asset_id).await?;
        let decision = self.evaluator.evaluate(position, quote.price)?;

        if !decision.should_exit {
            tracing::debug!(asset = %position.symbol, "{}", decision.reason);
            let update = PositionUpdate {
                unrealized_pnl: Some((quote.price - position.entry_price) * position.amount),
                ..PositionUpdate::default()
            };
            let saved = self
                .resilience
                .call(REPOSITORY_KEY, |_| {
                    self.repository.update_position(position.id, update.clone())
                })
                .await;
            if let Err(e) = saved {
                tracing::debug!(position = %position.id, "Unrealized P&L not saved: {}", e);
            }
            return Ok(Some(decision));
        }

        tracing::info!(
            position = %position.id,
            asset = %position.symbol,
            price = quote.price,
            "🚪 {}",
            decision.reason
        );

        self.close(position, &decision, quote.price).await?;
        Ok(Some(decision))
    }

    /// Mark, execute, then persist. A failed execution leaves the position
    /// `ExitRequested` so the next cycle re-evaluates it.
    async fn close(&self, position: &Position, decision: &ExitDecision, price: f64) -> Result<()> {
        if position.status == PositionStatus::Open {
            let mark = PositionUpdate {
                status: Some(PositionStatus::ExitRequested),
                ..PositionUpdate::default()
            };
            self.resilience
                .call(REPOSITORY_KEY, |_| {
                    self.repository.update_position(position.id, mark.clone())
                })
                .await?;
        }

        let fill = self.executor.submit_exit(position, decision, price).await?;
        self.exits_filled.insert(position.id);

        let realized_pnl = (fill.price - position.entry_price) * fill.amount;
        let update = PositionUpdate {
            status: Some(PositionStatus::Closed),
            realized_pnl: Some(realized_pnl),
            unrealized_pnl: None,
            exit_price: Some(fill.price),
            exit_time: Some(fill.timestamp),
            exit_reason: decision.exit_reason,
        };
        let trade = Trade {
            id: Uuid::new_v4(),
            position_id: position.id,
            asset_id: position.asset_id.clone(),
            side: TradeSide::Sell,
            price: fill.price,
            amount: fill.amount,
            timestamp: fill.timestamp,
            tx_signature: fill.tx_signature,
        };

        tracing::info!(
            position = %position.id,
            asset = %position.symbol,
            realized_pnl,
            "✓ Closed position @ ${:.4}",
            fill.price
        );

        self.persist_exit(position.id, update, trade).await;
        Ok(())
    }

    /// The order already went out; persistence failures are retried until
    /// they succeed
    async fn persist_exit(&self, id: Uuid, update: PositionUpdate, trade: Trade) {
        let repository = self.repository.clone();
        let result = self
            .resilience
            .call(REPOSITORY_KEY, |_| {
                write_exit(repository.clone(), id, update.clone(), trade.clone())
            })
            .await;

        if let Err(e) = result {
            tracing::warn!(position = %id, "Persisting exit failed, queued for retry: {}", e);
            self.retry_queue
                .enqueue_persistent(format!("persist_exit:{}", id), move || {
                    write_exit(repository.clone(), id, update.clone(), trade.clone())
                })
                .await;
        }
    }
}

/// Both writes are idempotent: the update overwrites, the trade id is fixed
fn write_exit(
    repository: Arc<dyn PositionRepository>,
    id: Uuid,
    update: PositionUpdate,
    trade: Trade,
) -> TaskFuture {
    Box::pin(async move {
        repository.update_position(id, update).await?;
        repository.record_trade(&trade).await
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::PriceProvider;
    use crate::db::InMemoryPositionRepository;
    use crate::execution::DryRunExecutor;
    use crate::models::{AssetDescriptor, Fill, PriceQuote, PriceSource, TradeSignal};
    use crate::resilience::{CircuitBreakerRegistry, RetryPolicy};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn position_at(entry_price: f64, entry_time: DateTime<Utc>) -> Position {
        Position::open(
            &AssetDescriptor::new("mint", "TKN"),
            entry_price,
            10.0,
            entry_time,
            0.15,
            -0.10,
        )
    }

    fn evaluator() -> ExitEvaluator {
        ExitEvaluator::new(0.15, -0.10, Duration::hours(1))
    }

    #[test]
    fn test_take_profit() {
        let now = Utc::now();
        let decision = evaluator()
            .evaluate_at(&position_at(1.0, now), 1.2, now)
            .unwrap();

        assert!(decision.should_exit);
        assert_eq!(decision.exit_reason, Some(ExitReason::TakeProfit));
        assert!((decision.current_pnl - 0.2).abs() < 1e-9);
        assert!(decision.reason.starts_with("Take profit triggered at 20.00%"));
    }

    #[test]
    fn test_stop_loss() {
        let now = Utc::now();
        let decision = evaluator()
            .evaluate_at(&position_at(1.0, now), 0.85, now)
            .unwrap();

        assert!(decision.should_exit);
        assert_eq!(decision.exit_reason, Some(ExitReason::StopLoss));
        assert!((decision.current_pnl + 0.15).abs() < 1e-9);
        assert!(decision.reason.starts_with("Stop loss triggered at -15.00%"));
    }

    #[test]
    fn test_max_holding_time_at_flat_price() {
        let now = Utc::now();
        let decision = evaluator()
            .evaluate_at(&position_at(1.0, now - Duration::hours(2)), 1.0, now)
            .unwrap();

        assert!(decision.should_exit);
        assert_eq!(decision.exit_reason, Some(ExitReason::MaxHoldingTime));
        assert_eq!(decision.current_pnl, 0.0);
        assert_eq!(decision.reason, "Maximum holding time reached");
    }

    #[test]
    fn test_no_exit_inside_band() {
        let now = Utc::now();
        let decision = evaluator()
            .evaluate_at(&position_at(1.0, now), 1.05, now)
            .unwrap();

        assert!(!decision.should_exit);
        assert!(decision.exit_reason.is_none());
        assert!((decision.current_pnl - 0.05).abs() < 1e-9);
    }

    #[test]
    fn test_take_profit_beats_holding_time() {
        let now = Utc::now();
        let decision = evaluator()
            .evaluate_at(&position_at(1.0, now - Duration::hours(5)), 1.2, now)
            .unwrap();

        assert_eq!(decision.exit_reason, Some(ExitReason::TakeProfit));
    }

    #[test]
    fn test_degenerate_position_is_invalid_metric() {
        let now = Utc::now();
        let err = evaluator()
            .evaluate_at(&position_at(0.0, now), 1.0, now)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidMetric(_)));

        let err = evaluator()
            .evaluate_at(&position_at(1.0, now), f64::NAN, now)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidMetric(_)));
    }

    // ---- batch mode ----

    struct StaticPrices(HashMap<String, f64>);

    #[async_trait]
    impl PriceProvider for StaticPrices {
        fn source(&self) -> PriceSource {
            PriceSource::Jupiter
        }

        async fn get_current_price(&self, asset_id: &str) -> Result<Option<PriceQuote>> {
            Ok(self.0.get(asset_id).map(|&price| PriceQuote {
                price,
                source: PriceSource::Jupiter,
                timestamp: Utc::now(),
                confidence: 1.0,
            }))
        }
    }

    struct RejectingExecutor;

    #[async_trait]
    impl TradeExecutor for RejectingExecutor {
        async fn submit_entry(&self, _signal: &TradeSignal) -> Result<Fill> {
            Err(EngineError::Execution("rejected".into()))
        }

        async fn submit_exit(&self, _p: &Position, _d: &ExitDecision, _price: f64) -> Result<Fill> {
            Err(EngineError::Execution("rejected".into()))
        }
    }

    /// Fails to persist closes until `healthy` is set
    struct FlakyRepository {
        inner: InMemoryPositionRepository,
        healthy: AtomicBool,
    }

    #[async_trait]
    impl PositionRepository for FlakyRepository {
        async fn get_open_positions(&self) -> Result<Vec<Position>> {
            self.inner.get_open_positions().await
        }

        async fn open_position(&self, position: &Position) -> Result<()> {
            self.inner.open_position(position).await
        }

        async fn update_position(&self, id: Uuid, update: PositionUpdate) -> Result<()> {
            if update.status == Some(PositionStatus::Closed) && !self.healthy.load(Ordering::SeqCst) {
                return Err(EngineError::Repository("connection reset".into()));
            }
            self.inner.update_position(id, update).await
        }

        async fn record_trade(&self, trade: &Trade) -> Result<()> {
            self.inner.record_trade(trade).await
        }
    }

    /// Counts exit orders on top of the dry-run fills
    #[derive(Default)]
    struct CountingExecutor {
        inner: DryRunExecutor,
        exits: AtomicUsize,
    }

    #[async_trait]
    impl TradeExecutor for CountingExecutor {
        async fn submit_entry(&self, signal: &TradeSignal) -> Result<Fill> {
            self.inner.submit_entry(signal).await
        }

        async fn submit_exit(&self, p: &Position, d: &ExitDecision, price: f64) -> Result<Fill> {
            self.exits.fetch_add(1, Ordering::SeqCst);
            self.inner.submit_exit(p, d, price).await
        }
    }

    fn monitor(
        prices: HashMap<String, f64>,
        repository: Arc<dyn PositionRepository>,
        executor: Arc<dyn TradeExecutor>,
        retry_queue: Arc<RetryQueue>,
    ) -> ExitMonitor {
        monitor_with_threshold(5, prices, repository, executor, retry_queue)
    }

    fn monitor_with_threshold(
        failure_threshold: u32,
        prices: HashMap<String, f64>,
        repository: Arc<dyn PositionRepository>,
        executor: Arc<dyn TradeExecutor>,
        retry_queue: Arc<RetryQueue>,
    ) -> ExitMonitor {
        let resilience = Resilience::new(
            Arc::new(CircuitBreakerRegistry::new(
                failure_threshold,
                std::time::Duration::from_secs(60),
            )),
            RetryPolicy::none(),
        );
        let aggregator = Arc::new(PriceAggregator::new(
            vec![Arc::new(StaticPrices(prices))],
            std::time::Duration::from_secs(60),
            resilience.clone(),
        ));

        ExitMonitor::new(
            evaluator(),
            aggregator,
            repository,
            executor,
            resilience,
            retry_queue,
            4,
        )
    }

    fn asset(id: &str) -> AssetDescriptor {
        AssetDescriptor::new(id, id.to_uppercase())
    }

    #[tokio::test]
    async fn test_batch_closes_and_records_trade() {
        let repo = Arc::new(InMemoryPositionRepository::new());
        let winner = Position::open(&asset("win"), 1.0, 10.0, Utc::now(), 0.15, -0.10);
        let holder = Position::open(&asset("hold"), 1.0, 10.0, Utc::now(), 0.15, -0.10);
        repo.open_position(&winner).await.unwrap();
        repo.open_position(&holder).await.unwrap();

        let prices = HashMap::from([("win".to_string(), 1.3), ("hold".to_string(), 1.02)]);
        let report = monitor(
            prices,
            repo.clone(),
            Arc::new(DryRunExecutor::new()),
            Arc::new(RetryQueue::new(RetryPolicy::none())),
        )
        .run_batch()
        .await
        .unwrap();

        assert_eq!(report.evaluated, 2);
        assert_eq!(report.exited, 1);
        assert_eq!(report.failed, 0);

        let closed = repo.get(winner.id).await.unwrap();
        assert_eq!(closed.status, PositionStatus::Closed);
        assert!((closed.realized_pnl.unwrap() - 3.0).abs() < 1e-9);

        let trades = repo.trades().await;
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].side, TradeSide::Sell);
        assert_eq!(trades[0].position_id, winner.id);

        let open = repo.get_open_positions().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, holder.id);
        assert!((open[0].unrealized_pnl.unwrap() - 0.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_missing_price_isolated_per_position() {
        let repo = Arc::new(InMemoryPositionRepository::new());
        let priced = Position::open(&asset("priced"), 1.0, 1.0, Utc::now(), 0.15, -0.10);
        let unpriced = Position::open(&asset("ghost"), 1.0, 1.0, Utc::now(), 0.15, -0.10);
        repo.open_position(&priced).await.unwrap();
        repo.open_position(&unpriced).await.unwrap();

        let report = monitor(
            HashMap::from([("priced".to_string(), 0.8)]),
            repo.clone(),
            Arc::new(DryRunExecutor::new()),
            Arc::new(RetryQueue::new(RetryPolicy::none())),
        )
        .run_batch()
        .await
        .unwrap();

        assert_eq!(report.evaluated, 2);
        assert_eq!(report.exited, 1);
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn test_rejected_exit_stays_requested() {
        let repo = Arc::new(InMemoryPositionRepository::new());
        let position = Position::open(&asset("tkn"), 1.0, 1.0, Utc::now(), 0.15, -0.10);
        repo.open_position(&position).await.unwrap();

        let report = monitor(
            HashMap::from([("tkn".to_string(), 0.5)]),
            repo.clone(),
            Arc::new(RejectingExecutor),
            Arc::new(RetryQueue::new(RetryPolicy::none())),
        )
        .run_batch()
        .await
        .unwrap();

        assert_eq!(report.failed, 1);
        let stored = repo.get(position.id).await.unwrap();
        assert_eq!(stored.status, PositionStatus::ExitRequested);
        assert!(repo.trades().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_persist_is_retried() {
        let repo = Arc::new(FlakyRepository {
            inner: InMemoryPositionRepository::new(),
            healthy: AtomicBool::new(false),
        });
        let position = Position::open(&asset("tkn"), 1.0, 2.0, Utc::now(), 0.15, -0.10);
        repo.open_position(&position).await.unwrap();

        let queue = Arc::new(RetryQueue::new(RetryPolicy {
            max_attempts: 3,
            initial_backoff: std::time::Duration::ZERO,
            max_backoff: std::time::Duration::ZERO,
        }));
        let report = monitor(
            HashMap::from([("tkn".to_string(), 1.5)]),
            repo.clone(),
            Arc::new(DryRunExecutor::new()),
            queue.clone(),
        )
        .run_batch()
        .await
        .unwrap();

        // The order went out, so the decision still counts as an exit
        assert_eq!(report.exited, 1);
        assert_eq!(queue.len().await, 1);

        repo.healthy.store(true, Ordering::SeqCst);
        let retried = queue.process_due().await;

        assert_eq!(retried.succeeded, 1);
        assert!(queue.is_empty().await);
        let stored = repo.inner.get(position.id).await.unwrap();
        assert_eq!(stored.status, PositionStatus::Closed);
        assert_eq!(repo.inner.trades().await.len(), 1);
    }

    #[tokio::test]
    async fn test_repository_outage_aborts_batch() {
        struct DownRepository;

        #[async_trait]
        impl PositionRepository for DownRepository {
            async fn get_open_positions(&self) -> Result<Vec<Position>> {
                Err(EngineError::Repository("down".into()))
            }
            async fn open_position(&self, _p: &Position) -> Result<()> {
                Ok(())
            }
            async fn update_position(&self, _id: Uuid, _u: PositionUpdate) -> Result<()> {
                Ok(())
            }
            async fn record_trade(&self, _t: &Trade) -> Result<()> {
                Ok(())
            }
        }

        let result = monitor(
            HashMap::new(),
            Arc::new(DownRepository),
            Arc::new(DryRunExecutor::new()),
            Arc::new(RetryQueue::new(RetryPolicy::none())),
        )
        .run_batch()
        .await;

        assert!(matches!(result, Err(EngineError::Repository(_))));
    }

    #[tokio::test]
    async fn test_filled_exit_is_not_sold_again_while_persist_pending() {
        let repo = Arc::new(FlakyRepository {
            inner: InMemoryPositionRepository::new(),
            healthy: AtomicBool::new(false),
        });
        let position = Position::open(&asset("tkn"), 1.0, 2.0, Utc::now(), 0.15, -0.10);
        repo.open_position(&position).await.unwrap();

        let executor = Arc::new(CountingExecutor::default());
        let queue = Arc::new(RetryQueue::new(RetryPolicy {
            max_attempts: 1,
            initial_backoff: std::time::Duration::ZERO,
            max_backoff: std::time::Duration::ZERO,
        }));
        let exits = monitor(
            HashMap::from([("tkn".to_string(), 1.5)]),
            repo.clone(),
            executor.clone(),
            queue.clone(),
        );

        let first = exits.run_batch().await.unwrap();
        assert_eq!(first.exited, 1);
        assert_eq!(
            repo.inner.get(position.id).await.unwrap().status,
            PositionStatus::ExitRequested
        );

        // Repository is back, but the exit loop runs before the retry queue
        repo.healthy.store(true, Ordering::SeqCst);
        let second = exits.run_batch().await.unwrap();
        assert_eq!(second.evaluated, 0);
        assert_eq!(second.awaiting_persist, 1);

        let retried = queue.process_due().await;
        assert_eq!(retried.succeeded, 1);

        assert_eq!(executor.exits.load(Ordering::SeqCst), 1);
        let sells = repo
            .inner
            .trades()
            .await
            .into_iter()
            .filter(|t| t.side == TradeSide::Sell)
            .count();
        assert_eq!(sells, 1);
        assert_eq!(
            repo.inner.get(position.id).await.unwrap().status,
            PositionStatus::Closed
        );

        let third = exits.run_batch().await.unwrap();
        assert_eq!(third.evaluated, 0);
        assert_eq!(third.awaiting_persist, 0);
    }

    #[tokio::test]
    async fn test_failed_persist_survives_attempt_limit() {
        let repo = Arc::new(FlakyRepository {
            inner: InMemoryPositionRepository::new(),
            healthy: AtomicBool::new(false),
        });
        let position = Position::open(&asset("tkn"), 1.0, 2.0, Utc::now(), 0.15, -0.10);
        repo.open_position(&position).await.unwrap();

        let queue = Arc::new(RetryQueue::new(RetryPolicy {
            max_attempts: 2,
            initial_backoff: std::time::Duration::ZERO,
            max_backoff: std::time::Duration::ZERO,
        }));
        monitor(
            HashMap::from([("tkn".to_string(), 1.5)]),
            repo.clone(),
            Arc::new(DryRunExecutor::new()),
            queue.clone(),
        )
        .run_batch()
        .await
        .unwrap();

        for _ in 0..4 {
            assert_eq!(queue.process_due().await.dropped, 0);
        }
        assert!(queue.contains(&format!("persist_exit:{}", position.id)).await);
    }

    #[tokio::test]
    async fn test_repeated_list_failures_open_repository_breaker() {
        #[derive(Default)]
        struct CountingDownRepository {
            lists: AtomicUsize,
        }

        #[async_trait]
        impl PositionRepository for CountingDownRepository {
            async fn get_open_positions(&self) -> Result<Vec<Position>> {
                self.lists.fetch_add(1, Ordering::SeqCst);
                Err(EngineError::Repository("down".into()))
            }
            async fn open_position(&self, _p: &Position) -> Result<()> {
                Ok(())
            }
            async fn update_position(&self, _id: Uuid, _u: PositionUpdate) -> Result<()> {
                Ok(())
            }
            async fn record_trade(&self, _t: &Trade) -> Result<()> {
                Ok(())
            }
        }

        let repo = Arc::new(CountingDownRepository::default());
        let exits = monitor_with_threshold(
            2,
            HashMap::new(),
            repo.clone(),
            Arc::new(DryRunExecutor::new()),
            Arc::new(RetryQueue::new(RetryPolicy::none())),
        );

        for _ in 0..2 {
            let result = exits.run_batch().await;
            assert!(matches!(result, Err(EngineError::Repository(_))));
        }

        let result = exits.run_batch().await;
        assert!(matches!(result, Err(EngineError::CircuitOpen { ref key, .. }) if key == "repository"));
        assert_eq!(repo.lists.load(Ordering::SeqCst), 2);
    }
}
