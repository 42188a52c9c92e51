use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::db::PositionRepository;
use crate::execution::{ExitBatchReport, ExitMonitor, TradeExecutor};
use crate::models::{Opportunity, Position, Trade, TradeSide, TradeSignal};
use crate::resilience::{Resilience, RetryQueue, RetryQueueReport, TaskFuture};
use crate::strategy::SignalGenerator;
use crate::Result;

const REPOSITORY_KEY: &str = "repository";
const ENTRY_TASK_PREFIX: &str = "persist_entry:";

fn entry_task_name(asset_id: &str) -> String {
    format!("{}{}", ENTRY_TASK_PREFIX, asset_id)
}

/// Loop timing and entry parameters
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub entry_interval: Duration,
    pub exit_interval: Duration,
    pub max_concurrent_evaluations: usize,
    pub take_profit_threshold: f64,
    pub stop_loss_threshold: f64,
}

impl From<&EngineConfig> for EngineSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            entry_interval: Duration::from_secs(config.entry_interval_secs),
            exit_interval: Duration::from_secs(config.exit_interval_secs),
            max_concurrent_evaluations: config.max_concurrent_evaluations.max(1),
            take_profit_threshold: config.take_profit_threshold,
            stop_loss_threshold: config.stop_loss_threshold,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct EntryCycleReport {
    pub evaluated: usize,
    pub signals: usize,
    pub entered: usize,
    pub failed: usize,
}

/// Drives entry and exit decisions on independent intervals
pub struct TradingEngine {
    signals: Arc<SignalGenerator>,
    exits: ExitMonitor,
    repository: Arc<dyn PositionRepository>,
    executor: Arc<dyn TradeExecutor>,
    resilience: Resilience,
    retry_queue: Arc<RetryQueue>,
    candidates: mpsc::Receiver<Opportunity>,
    tracked: HashMap<String, Opportunity>,
    settings: EngineSettings,
}

impl TradingEngine {
    /// `resilience` guards repository calls; share it with the `ExitMonitor`
    /// so both loops see the same breaker.
    pub fn new(
        signals: Arc<SignalGenerator>,
        exits: ExitMonitor,
        repository: Arc<dyn PositionRepository>,
        executor: Arc<dyn TradeExecutor>,
        resilience: Resilience,
        retry_queue: Arc<RetryQueue>,
        candidates: mpsc::Receiver<Opportunity>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            signals,
            exits,
            repository,
            executor,
            resilience,
            retry_queue,
            candidates,
            tracked: HashMap::new(),
            settings,
        }
    }

    /// Pull everything discovery has sent since the last cycle
    fn drain_candidates(&mut self) -> usize {
        let mut received = 0;
        while let Ok(opportunity) = self.candidates.try_recv() {
            tracing::debug!(
                asset = %opportunity.asset().symbol,
                kind = opportunity.kind(),
                "Candidate received"
            );
            self.tracked
                .insert(opportunity.asset().id.clone(), opportunity);
            received += 1;
        }
        received
    }

    /// Evaluate every tracked asset without an open position and enter on signals
    pub async fn run_entry_cycle(&mut self) -> Result<EntryCycleReport> {
        let received = self.drain_candidates();
        if received > 0 {
            tracing::info!("Received {} new candidates ({} tracked)", received, self.tracked.len());
        }

        // Bought but not yet stored counts as held. Read the queue first so a
        // write finishing in between still shows up in the repository.
        let mut held: HashSet<String> = self
            .retry_queue
            .pending_names()
            .await
            .into_iter()
            .filter_map(|name| name.strip_prefix(ENTRY_TASK_PREFIX).map(str::to_string))
            .collect();
        let open = self
            .resilience
            .call(REPOSITORY_KEY, |_| self.repository.get_open_positions())
            .await?;
        held.extend(open.into_iter().map(|p| p.asset_id));

        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrent_evaluations));
        let mut tasks = JoinSet::new();

        for opportunity in self.tracked.values() {
            let asset = opportunity.asset().clone();
            if held.contains(&asset.id) {
                continue;
            }

            let signals = self.signals.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = signals.evaluate(&asset).await;
                (asset, result)
            });
        }

        let mut report = EntryCycleReport::default();

        while let Some(joined) = tasks.join_next().await {
            report.evaluated += 1;
            match joined {
                Ok((_, Ok(Some(signal)))) => {
                    report.signals += 1;
                    match self.enter(&signal).await {
                        Ok(()) => {
                            report.entered += 1;
                            self.tracked.remove(&signal.asset.id);
                        }
                        Err(e) => {
                            report.failed += 1;
                            tracing::warn!(asset = %signal.asset.symbol, "Entry failed: {}", e);
                        }
                    }
                }
                Ok((_, Ok(None))) => {}
                Ok((asset, Err(e))) => {
                    report.failed += 1;
                    tracing::warn!(asset = %asset.symbol, "Evaluation failed: {}", e);
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::error!("Evaluation task panicked: {}", e);
                }
            }
        }

        tracing::info!(
            evaluated = report.evaluated,
            signals = report.signals,
            entered = report.entered,
            failed = report.failed,
            "Entry cycle complete"
        );

        Ok(report)
    }

    pub async fn run_exit_cycle(&self) -> Result<ExitBatchReport> {
        self.exits.run_batch().await
    }

    async fn enter(&self, signal: &TradeSignal) -> Result<()> {
        let fill = self.executor.submit_entry(signal).await?;

        let position = Position::open(
            &signal.asset,
            fill.price,
            fill.amount,
            fill.timestamp,
            self.settings.take_profit_threshold,
            self.settings.stop_loss_threshold,
        );
        let trade = Trade {
            id: Uuid::new_v4(),
            position_id: position.id,
            asset_id: position.asset_id.clone(),
            side: TradeSide::Buy,
            price: fill.price,
            amount: fill.amount,
            timestamp: fill.timestamp,
            tx_signature: fill.tx_signature,
        };

        tracing::info!(
            position = %position.id,
            asset = %position.symbol,
            "✓ Opened position {:.4} @ ${:.4}",
            position.amount,
            position.entry_price
        );

        // The buy filled; its record is retried until it lands
        let repository = self.repository.clone();
        let result = self
            .resilience
            .call(REPOSITORY_KEY, |_| {
                write_entry(repository.clone(), position.clone(), trade.clone())
            })
            .await;
        if let Err(e) = result {
            tracing::warn!(position = %position.id, "Persisting entry failed, queued for retry: {}", e);
            self.retry_queue
                .enqueue_persistent(entry_task_name(&position.asset_id), move || {
                    write_entry(repository.clone(), position.clone(), trade.clone())
                })
                .await;
        }

        Ok(())
    }

    /// One entry cycle, one exit cycle and one retry pass
    pub async fn run_once(&mut self) -> Result<()> {
        self.run_entry_cycle().await?;
        self.run_exit_cycle().await?;
        self.retry_queue.process_due().await;
        Ok(())
    }

    /// Run both loops until `shutdown` resolves
    ///
    /// Exits run on their own task so a slow entry cycle never delays them.
    pub async fn run<S>(mut self, shutdown: S)
    where
        S: Future<Output = ()>,
    {
        let exits = self.exits.clone();
        let retry_queue = self.retry_queue.clone();
        let exit_every = self.settings.exit_interval;

        let exit_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(exit_every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = exits.run_batch().await {
                    tracing::error!("Exit cycle aborted: {}", e);
                }
                let retried = retry_queue.process_due().await;
                if retried != RetryQueueReport::default() {
                    tracing::info!(
                        succeeded = retried.succeeded,
                        rescheduled = retried.rescheduled,
                        dropped = retried.dropped,
                        "Processed deferred writes"
                    );
                }
            }
        });

        let mut entry_ticker = tokio::time::interval(self.settings.entry_interval);
        entry_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = entry_ticker.tick() => {
                    if let Err(e) = self.run_entry_cycle().await {
                        tracing::error!("Entry cycle aborted: {}", e);
                    }
                }
            }
        }

        exit_task.abort();
        tracing::info!("Engine stopped");
    }
}

fn write_entry(
    repository: Arc<dyn PositionRepository>,
    position: Position,
    trade: Trade,
) -> TaskFuture {
    Box::pin(async move {
        repository.open_position(&position).await?;
        repository.record_trade(&trade).await
    })
}
