// Candidate discovery feeding the entry loop
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::models::{AssetDescriptor, Opportunity};
use crate::Result;

/// Producer of candidate assets (trending lists, new listings, watchlists)
#[async_trait]
pub trait CandidateSource: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_candidates(&self) -> Result<Vec<Opportunity>>;
}

/// Fixed list of assets always considered
#[derive(Debug, Clone, Default)]
pub struct WatchlistSource {
    assets: Vec<AssetDescriptor>,
}

impl WatchlistSource {
    pub fn new(assets: Vec<AssetDescriptor>) -> Self {
        Self { assets }
    }
}

#[async_trait]
impl CandidateSource for WatchlistSource {
    fn name(&self) -> &str {
        "watchlist"
    }

    async fn fetch_candidates(&self) -> Result<Vec<Opportunity>> {
        Ok(self
            .assets
            .iter()
            .filter(|asset| asset.validate().is_ok())
            .cloned()
            .map(|asset| Opportunity::Watchlist { asset })
            .collect())
    }
}

/// Poll every source once and forward what they find
///
/// Returns the number of opportunities sent, or `None` once the receiver
/// has gone away.
pub async fn discover_once(
    sources: &[Arc<dyn CandidateSource>],
    tx: &mpsc::Sender<Opportunity>,
) -> Option<usize> {
    let mut sent = 0;

    for source in sources {
        let candidates = match source.fetch_candidates().await {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::warn!(source = source.name(), "Discovery failed: {}", e);
                continue;
            }
        };

        tracing::info!(
            source = source.name(),
            "🔍 Found {} candidates",
            candidates.len()
        );

        for opportunity in candidates {
            if tx.send(opportunity).await.is_err() {
                return None;
            }
            sent += 1;
        }
    }

    Some(sent)
}

/// Run discovery on a fixed interval until the engine drops its receiver
pub fn spawn_discovery(
    sources: Vec<Arc<dyn CandidateSource>>,
    tx: mpsc::Sender<Opportunity>,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if discover_once(&sources, &tx).await.is_none() {
                tracing::info!("Candidate channel closed, stopping discovery");
                return;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;

    struct FailingSource;

    #[async_trait]
    impl CandidateSource for FailingSource {
        fn name(&self) -> &str {
            "failing"
        }

        async fn fetch_candidates(&self) -> Result<Vec<Opportunity>> {
            Err(EngineError::provider("failing", "503"))
        }
    }

    #[tokio::test]
    async fn test_watchlist_skips_invalid_assets() {
        let source = WatchlistSource::new(vec![
            AssetDescriptor::new("So11111111111111111111111111111111111111112", "SOL"),
            AssetDescriptor::new("", "EMPTY"),
        ]);

        let candidates = source.fetch_candidates().await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].asset().symbol, "SOL");
        assert_eq!(candidates[0].kind(), "watchlist");
    }

    #[tokio::test]
    async fn test_failing_source_does_not_block_others() {
        let (tx, mut rx) = mpsc::channel(8);
        let sources: Vec<Arc<dyn CandidateSource>> = vec![
            Arc::new(FailingSource),
            Arc::new(WatchlistSource::new(vec![AssetDescriptor::new("mint", "TKN")])),
        ];

        let sent = discover_once(&sources, &tx).await;

        assert_eq!(sent, Some(1));
        assert_eq!(rx.recv().await.unwrap().asset().id, "mint");
    }

    #[tokio::test]
    async fn test_closed_channel_stops_discovery() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let handle = spawn_discovery(
            vec![Arc::new(WatchlistSource::new(vec![AssetDescriptor::new("mint", "TKN")]))],
            tx,
            Duration::from_millis(10),
        );

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("discovery should stop")
            .unwrap();
    }
}
