use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::engine::{Engine, EngineSettings};
use crate::gateway::{HttpGateway, InMemoryGateway, PaymentGateway};
use crate::http::{self, AppState};
use crate::identity::{DirectoryError, IdentityDirectory, StaticDirectory};
use crate::notify::NotifyHub;
use crate::settlement::SettlementHandler;
use crate::signature::SignatureVerifier;
use crate::sweeper::{TimeoutSweeper, run_compactor};

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("storage: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

/// External collaborators. Swapped out in tests.
pub struct Collaborators {
    pub clock: Arc<dyn Clock>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub directory: Arc<dyn IdentityDirectory>,
}

impl Collaborators {
    pub fn from_config(config: &Config) -> Result<Self, StartupError> {
        let gateway: Arc<dyn PaymentGateway> = match &config.gateway {
            Some(gw) => Arc::new(HttpGateway::new(&gw.url, &gw.key_id, &config.payment_secret)),
            None => {
                tracing::warn!("no gateway configured, using in-memory gateway");
                Arc::new(InMemoryGateway::new())
            }
        };
        let directory = match &config.directory {
            Some(path) => {
                let dir = StaticDirectory::load(path)?;
                info!("loaded {} providers from {}", dir.provider_count(), path.display());
                dir
            }
            None => StaticDirectory::new(),
        };
        Ok(Self {
            clock: Arc::new(SystemClock),
            gateway,
            directory: Arc::new(directory),
        })
    }
}

/// Engine, background loops and HTTP state, wired together.
pub struct App {
    state: AppState,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl App {
    /// Replay the WAL and start the sweeper and compactor.
    /// Must be called from within a tokio runtime.
    pub fn start(config: &Config, deps: Collaborators) -> Result<Self, StartupError> {
        std::fs::create_dir_all(&config.data_dir)?;
        let engine = Arc::new(Engine::open(
            config.wal_path(),
            Arc::new(NotifyHub::new()),
            deps.clock,
            EngineSettings {
                hold_duration: config.hold_duration,
                min_duration_minutes: config.min_duration_minutes,
            },
        )?);
        let verifier = SignatureVerifier::new(
            config.payment_secret.as_bytes(),
            config.webhook_secret.as_bytes(),
        );
        let settlement = Arc::new(SettlementHandler::new(engine.clone(), deps.gateway, verifier));

        let shutdown = CancellationToken::new();
        let sweeper = Arc::new(TimeoutSweeper::new(engine.clone(), config.sweep_interval));
        let tasks = vec![
            tokio::spawn(sweeper.run(shutdown.clone())),
            tokio::spawn(run_compactor(
                engine.clone(),
                config.compact_threshold,
                COMPACT_CHECK_INTERVAL,
                shutdown.clone(),
            )),
        ];

        Ok(Self {
            state: AppState {
                engine,
                settlement,
                directory: deps.directory,
            },
            shutdown,
            tasks,
        })
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.state.engine
    }

    pub fn router(&self) -> axum::Router {
        http::router(self.state.clone())
    }

    /// Serve until `signal` resolves, then stop the background loops.
    pub async fn serve(self, listener: TcpListener, signal: impl Future<Output = ()> + Send + 'static) -> io::Result<()> {
        axum::serve(listener, self.router())
            .with_graceful_shutdown(signal)
            .await?;
        self.stop().await;
        Ok(())
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        info!("background tasks stopped");
    }
}
