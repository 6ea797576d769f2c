//! Daemon lifecycle management for ghostpool.
//!
//! This module wires the pool together, owns task management and signal
//! handling, and shuts everything down gracefully.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::signal::unix::{self, SignalKind};
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::api::{self, AppState};
use crate::config::Config;
use crate::error::Result;
use crate::node::{self, NodeClient, RpcNodeClient};
use crate::pool::{BalanceStore, MemoryStore, RewardAllocator};
use crate::stratum::{EngineHandle, StratumEngine, StratumServer};
use crate::tracing::prelude::*;
use crate::treasury::HandledCoinbases;

/// Coinbase transactions remembered for duplicate detection.
const HANDLED_COINBASES: usize = 10_000;

/// What the daemon is serving on.
#[derive(Debug, Clone)]
pub struct Listening {
    pub stratum: SocketAddr,
    pub api: SocketAddr,
    pub engine: EngineHandle,
}

/// The main daemon.
pub struct Daemon {
    config: Arc<Config>,
    node: Arc<dyn NodeClient>,
    store: Arc<dyn BalanceStore>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    // The engine outlives everything that feeds it or drains it.
    engine_shutdown: CancellationToken,
    engine_tracker: TaskTracker,
}

impl Daemon {
    /// Create a daemon talking to the node configured in `config`.
    pub fn new(config: Config) -> Result<Self> {
        let node = RpcNodeClient::new(
            &config.node.url,
            &config.treasury.address,
            &config.node.extra_data,
            config.node.request_timeout(),
        )?;
        Ok(Self::with_node(config, Arc::new(node)))
    }

    /// Create a daemon with an explicit node client.
    pub fn with_node(config: Config, node: Arc<dyn NodeClient>) -> Self {
        Self {
            config: Arc::new(config),
            node,
            store: Arc::new(MemoryStore::new()),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            engine_shutdown: CancellationToken::new(),
            engine_tracker: TaskTracker::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Bind listeners and spawn every task.
    pub async fn start(&self) -> Result<Listening> {
        let engine_config = self.config.engine()?;
        let (template_tx, template_rx) = mpsc::channel(16);
        let (reward_tx, reward_rx) = mpsc::channel(64);

        // Node template feed
        self.tracker.spawn(node::poll_templates(
            self.node.clone(),
            self.config.node.poll_interval(),
            template_tx,
            self.shutdown.clone(),
        ));

        // Stratum engine and listener
        let (engine, handle) = StratumEngine::new(
            engine_config,
            self.node.clone(),
            template_rx,
            self.engine_shutdown.clone(),
        );
        let server =
            StratumServer::bind(self.config.stratum.listen, handle.clone(), self.shutdown.clone())
                .await?;
        let stratum = server.local_addr()?;
        self.engine_tracker.spawn(engine.run());
        self.tracker.spawn(server.run());

        // Reward allocation
        let allocator = RewardAllocator::new(
            Arc::new(handle.clone()),
            self.store.clone(),
            self.node.clone(),
            &self.config.treasury.address,
        );
        self.tracker.spawn(allocator.run(reward_rx, self.shutdown.clone()));

        // API server
        let listener = TcpListener::bind(self.config.api.listen).await?;
        let api = listener.local_addr()?;
        let state = AppState {
            config: self.config.clone(),
            engine: handle.clone(),
            store: self.store.clone(),
            rewards: reward_tx,
            handled: Arc::new(Mutex::new(HandledCoinbases::new(HANDLED_COINBASES))),
        };
        self.tracker.spawn({
            let shutdown = self.shutdown.clone();
            async move {
                if let Err(e) = api::serve(listener, state, shutdown).await {
                    error!(error = %e, "API server error");
                }
            }
        });

        self.tracker.close();
        self.engine_tracker.close();
        Ok(Listening {
            stratum,
            api,
            engine: handle,
        })
    }

    /// Stop the listeners and the node feed, let the allocator settle every
    /// queued reward, then stop the engine.
    pub async fn stop(self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;

        self.engine_shutdown.cancel();
        self.engine_tracker.close();
        self.engine_tracker.wait().await;
    }

    /// Run the daemon until SIGINT or SIGTERM.
    pub async fn run(self) -> anyhow::Result<()> {
        let listening = self.start().await?;
        info!(
            stratum = %listening.stratum,
            api = %listening.api,
            treasury = %self.config.treasury.address,
            "Started."
        );
        info!("For debugging, set RUST_LOG=ghostpool=debug or trace.");

        let mut sigint = unix::signal(SignalKind::interrupt())?;
        let mut sigterm = unix::signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT.");
            },
            _ = sigterm.recv() => {
                info!("Received SIGTERM.");
            },
            _ = self.shutdown.cancelled() => {},
        }

        self.stop().await;
        info!("Exiting.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::tests::{MAINNET_A, MAINNET_B};
    use crate::api_client::Client;
    use crate::error::Error;
    use crate::node::tests::FakeNode;
    use crate::node::{BlockInfo, SubmitReport};
    use crate::shares::Contribution;
    use crate::template::BlockTemplate;
    use crate::treasury::CoinbaseNotice;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::Notify;

    fn config() -> Config {
        let mut config = Config::default();
        config.treasury.address = MAINNET_A.into();
        config.stratum.listen = "127.0.0.1:0".parse().unwrap();
        config.api.listen = "127.0.0.1:0".parse().unwrap();
        config
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let daemon = Daemon::with_node(config(), Arc::new(FakeNode::default()));
        let listening = daemon.start().await.unwrap();
        assert_ne!(listening.stratum.port(), 0);
        assert_ne!(listening.api.port(), 0);

        tokio::net::TcpStream::connect(listening.stratum).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), daemon.stop())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_returns_when_cancelled() {
        let daemon = Daemon::with_node(config(), Arc::new(FakeNode::default()));
        let shutdown = daemon.shutdown_token();
        let running = tokio::spawn(daemon.run());
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_invalid_patterns_fail_start() {
        let mut config = config();
        config.stratum.asic_patterns = vec!["(".into()];
        let daemon = Daemon::with_node(config, Arc::new(FakeNode::default()));
        assert!(daemon.start().await.is_err());
    }

    /// Holds every block lookup until released.
    #[derive(Default)]
    struct GatedNode {
        entered: Notify,
        release: CancellationToken,
    }

    #[async_trait]
    impl NodeClient for GatedNode {
        async fn block_template(&self) -> Result<BlockTemplate> {
            Err(Error::Node("no template".into()))
        }

        async fn submit_block(&self, _block: &BlockTemplate) -> Result<SubmitReport> {
            Err(Error::Node("not mining".into()))
        }

        async fn block_info(&self, txn_id: &str) -> Result<BlockInfo> {
            self.entered.notify_one();
            self.release.cancelled().await;
            Err(Error::Node(format!("unknown transaction {txn_id}")))
        }
    }

    fn contribution(address: &str) -> Contribution {
        Contribution {
            address: address.into(),
            miner_id: "rig".into(),
            difficulty: 1.0,
            timestamp: 0,
        }
    }

    fn notice(txn_id: &str) -> CoinbaseNotice {
        CoinbaseNotice {
            reward: 1_000,
            txn_id: txn_id.into(),
            daa_score: 1,
        }
    }

    #[tokio::test]
    async fn test_stop_settles_queued_rewards() {
        let node = Arc::new(GatedNode::default());
        let daemon = Daemon::with_node(config(), node.clone());
        let store = daemon.store.clone();
        let shutdown = daemon.shutdown_token();
        let listening = daemon.start().await.unwrap();
        let client = Client::new(&format!("http://{}", listening.api)).unwrap();

        listening.engine.contribute(contribution(MAINNET_A)).await.unwrap();
        let first = client.post_coinbase(&notice("first")).await.unwrap();
        // The allocator has drained and is stuck on the block lookup
        node.entered.notified().await;

        listening.engine.contribute(contribution(MAINNET_B)).await.unwrap();
        let second = client.post_coinbase(&notice("second")).await.unwrap();

        let stopping = tokio::spawn(daemon.stop());
        shutdown.cancelled().await;
        node.release.cancel();
        tokio::time::timeout(Duration::from_secs(5), stopping)
            .await
            .unwrap()
            .unwrap();

        let balances = store.read_all().await.unwrap();
        let credited = |address: &str| {
            balances
                .iter()
                .find(|b| b.address == address && b.miner_id == "rig")
                .map(|b| b.balance)
        };
        assert_eq!(credited(MAINNET_A), Some(first.miner_reward));
        assert_eq!(credited(MAINNET_B), Some(second.miner_reward));
    }
}
