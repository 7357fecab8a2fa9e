use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum_server::Handle;
use hm_utils::{run_periodically, SharedClock, SystemClock};
use message_bus::{LocalBus, MessageBus};
use metrics::init_provider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use tokio::{signal, sync::watch};
use tracing::{error, info};

use crate::{
    catalog::Catalog,
    config::ServerConfig,
    desired_state::{DesiredStateStore, InMemoryDesiredStateStore},
    health_manager::{EngineSettings, HealthManager},
    placement::{pool::DeaPool, DispatchManager, PlacementSettings},
    routes::{create_routes, RouteState},
    subscriptions::subscribe_all,
};

#[derive(Clone)]
pub struct Service {
    pub config: ServerConfig,
    pub shutdown_tx: watch::Sender<()>,
    pub shutdown_rx: watch::Receiver<()>,
    pub clock: SharedClock,
    pub bus: Arc<dyn MessageBus>,
    pub desired_state: Arc<dyn DesiredStateStore>,
    pub catalog: Arc<Catalog>,
    pub pool: Arc<DeaPool>,
    pub health_manager: Arc<HealthManager>,
    pub dispatch: Arc<DispatchManager>,
    meter_provider: Option<SdkMeterProvider>,
}

impl Service {
    pub async fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        // instruments bind to the global provider when they are created
        let meter_provider = init_provider(
            config.telemetry.enable_metrics,
            config.telemetry.endpoint.as_deref(),
        )
        .context("error initializing metrics")?;

        let desired_state: Arc<dyn DesiredStateStore> = match &config.desired_state_path {
            Some(path) => Arc::new(
                InMemoryDesiredStateStore::from_yaml_file(path)
                    .context("error loading desired state")?,
            ),
            None => Arc::new(InMemoryDesiredStateStore::default()),
        };
        let bus = Arc::new(LocalBus::new(config.bus.clone()));
        let mut service = Self::new_with(config, Arc::new(SystemClock), bus, desired_state)?;
        service.meter_provider = Some(meter_provider);
        Ok(service)
    }

    /// Builds the service around the given collaborators without touching
    /// any global state.
    pub fn new_with(
        config: ServerConfig,
        clock: SharedClock,
        bus: Arc<dyn MessageBus>,
        desired_state: Arc<dyn DesiredStateStore>,
    ) -> Result<Self> {
        config.validate()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(());

        let catalog = Arc::new(Catalog::new(&config.catalog));
        let pool = Arc::new(DeaPool::new(
            clock.clone(),
            Duration::from_secs(config.placement.advertisement_expiry),
        ));
        let health_manager = Arc::new(HealthManager::new(
            EngineSettings::from_config(&config),
            clock.clone(),
            bus.clone(),
            desired_state.clone(),
            Arc::new(metrics::health_manager::Metrics::new()),
        ));
        let dispatch = Arc::new(DispatchManager::new(
            PlacementSettings::from_config(&config),
            clock.clone(),
            bus.clone(),
            desired_state.clone(),
            catalog.clone(),
            pool.clone(),
            Arc::new(metrics::placement::Metrics::new()),
        ));

        Ok(Self {
            config,
            shutdown_tx,
            shutdown_rx,
            clock,
            bus,
            desired_state,
            catalog,
            pool,
            health_manager,
            dispatch,
            meter_provider: None,
        })
    }

    pub fn route_state(&self) -> RouteState {
        RouteState {
            health_manager: self.health_manager.clone(),
            pool: self.pool.clone(),
            catalog: self.catalog.clone(),
        }
    }

    /// Subscribes the bus listeners and spawns the three timers: desired
    /// state scan, analysis and dequeue.
    pub async fn start_background_tasks(&self) -> Result<()> {
        subscribe_all(
            self.bus.clone(),
            self.health_manager.clone(),
            self.dispatch.clone(),
            self.pool.clone(),
            self.shutdown_rx.clone(),
        )
        .await?;

        if let Err(err) = self.health_manager.update_from_desired_state().await {
            error!("initial desired state scan failed: {:?}", err);
        }

        let intervals = &self.config.intervals;

        let hm = self.health_manager.clone();
        tokio::spawn(run_periodically(
            intervals.database_scan(),
            self.shutdown_rx.clone(),
            move || {
                let hm = hm.clone();
                async move {
                    if let Err(err) = hm.update_from_desired_state().await {
                        error!("desired state scan failed: {:?}", err);
                    }
                }
            },
        ));

        // give hosts one reporting window before anything is declared missing
        let startup_grace = intervals.droplet_lost();
        let analysis_period = intervals.droplets_analysis();
        let hm = self.health_manager.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(startup_grace) => {}
                _ = shutdown_rx.changed() => return,
            }
            run_periodically(analysis_period, shutdown_rx, move || {
                let hm = hm.clone();
                async move {
                    hm.analyze_all_apps().await;
                }
            })
            .await;
        });

        let hm = self.health_manager.clone();
        tokio::spawn(run_periodically(
            intervals.request_queue(),
            self.shutdown_rx.clone(),
            move || {
                let hm = hm.clone();
                async move {
                    if let Err(err) = hm.deque_a_batch_of_requests().await {
                        error!("failed to dequeue requests: {:?}", err);
                    }
                }
            },
        ));
        Ok(())
    }

    pub async fn start(&mut self) -> Result<()> {
        self.start_background_tasks().await?;

        let handle = Handle::new();
        let handle_sh = handle.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal(handle_sh, shutdown_tx).await;
            info!("graceful shutdown signal received, shutting down server gracefully");
        });

        let addr: SocketAddr = self.config.listen_addr.parse()?;
        info!(
            partition = %self.config.cc_partition,
            placement = ?self.config.placement.mode,
            "health manager listening on {}", self.config.listen_addr
        );
        let routes = create_routes(self.route_state());
        axum_server::bind(addr)
            .handle(handle)
            .serve(routes.into_make_service())
            .await?;

        if let Some(meter_provider) = &self.meter_provider {
            if let Err(err) = meter_provider.shutdown() {
                error!("Error shutting down meter provider: {:?}", err);
            }
        }
        Ok(())
    }
}

async fn shutdown_signal(handle: Handle, shutdown_tx: watch::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
        },
        _ = terminate => {
        },
    }
    handle.shutdown();
    if shutdown_tx.send(()).is_err() {
        info!("no background task left to notify");
    }
    info!("signal received, shutting down server gracefully");
}
