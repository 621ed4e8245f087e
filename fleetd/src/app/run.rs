//! Main application run loop

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::options::{AppOptions, LifecycleOptions};
use crate::app::state::AppState;
use crate::errors::FleetError;
use crate::reconcile::ReconcileEngine;
use crate::server::serve::serve;
use crate::server::state::ServerState;
use crate::workers::{health, reconciler, sweeper};

/// Run fleetd until `shutdown_signal` resolves
pub async fn run(
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), FleetError> {
    info!("Initializing fleetd...");

    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    if let Err(e) = init(&options, shutdown_tx.clone(), &mut shutdown_manager).await {
        error!("Failed to start fleetd: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

fn shutdown_future(mut rx: broadcast::Receiver<()>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        let _ = rx.recv().await;
    })
}

// =============================== INITIALIZATION ================================== //

async fn init(
    options: &AppOptions,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<Arc<AppState>, FleetError> {
    let (app_state, hub_handle) = AppState::init(
        options,
        AppState::process_runner(),
        shutdown_future(shutdown_tx.subscribe()),
    )
    .await?;
    let app_state = Arc::new(app_state);
    shutdown_manager.with_app_state(
        app_state.clone(),
        Box::pin(async move {
            let _ = hub_handle.await;
        }),
    )?;

    init_reconciler_worker(
        options.reconciler_worker.clone(),
        app_state.engine.clone(),
        shutdown_manager,
        shutdown_tx.subscribe(),
    )?;
    init_health_worker(
        options.health_worker.clone(),
        app_state.engine.clone(),
        shutdown_manager,
        shutdown_tx.subscribe(),
    )?;
    init_sweeper_worker(
        options.sweeper_worker.clone(),
        app_state.engine.clone(),
        shutdown_manager,
        shutdown_tx.subscribe(),
    )?;

    if options.enable_server {
        init_server(options, app_state.clone(), shutdown_manager, shutdown_tx.subscribe()).await?;
    }

    Ok(app_state)
}

fn init_reconciler_worker(
    options: reconciler::Options,
    engine: Arc<ReconcileEngine>,
    shutdown_manager: &mut ShutdownManager,
    shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), FleetError> {
    info!("Initializing reconciler worker...");

    let handle = tokio::spawn(async move {
        reconciler::run(&options, engine.as_ref(), tokio::time::sleep, shutdown_future(shutdown_rx)).await;
    });

    shutdown_manager.with_reconciler_worker_handle(handle)
}

fn init_health_worker(
    options: health::Options,
    engine: Arc<ReconcileEngine>,
    shutdown_manager: &mut ShutdownManager,
    shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), FleetError> {
    info!("Initializing health worker...");

    let handle = tokio::spawn(async move {
        health::run(&options, engine.as_ref(), tokio::time::sleep, shutdown_future(shutdown_rx)).await;
    });

    shutdown_manager.with_health_worker_handle(handle)
}

fn init_sweeper_worker(
    options: sweeper::Options,
    engine: Arc<ReconcileEngine>,
    shutdown_manager: &mut ShutdownManager,
    shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), FleetError> {
    info!("Initializing sweeper worker...");

    let handle = tokio::spawn(async move {
        sweeper::run(&options, engine.as_ref(), tokio::time::sleep, shutdown_future(shutdown_rx)).await;
    });

    shutdown_manager.with_sweeper_worker_handle(handle)
}

async fn init_server(
    options: &AppOptions,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), FleetError> {
    info!("Initializing HTTP server...");

    let server_state = ServerState::from_app(&app_state);
    let (_, server_handle) = serve(&options.server, Arc::new(server_state), shutdown_future(shutdown_rx)).await?;

    shutdown_manager.with_server_handle(server_handle)?;
    Ok(())
}

// ================================= SHUTDOWN ===================================== //

struct AppStateShutdownParams {
    state: Arc<AppState>,
    state_handle: Pin<Box<dyn Future<Output = ()> + Send>>,
}

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    app_state: Option<AppStateShutdownParams>,
    server_handle: Option<JoinHandle<Result<(), FleetError>>>,
    reconciler_worker_handle: Option<JoinHandle<()>>,
    health_worker_handle: Option<JoinHandle<()>>,
    sweeper_worker_handle: Option<JoinHandle<()>>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            app_state: None,
            server_handle: None,
            reconciler_worker_handle: None,
            health_worker_handle: None,
            sweeper_worker_handle: None,
        }
    }

    pub fn with_app_state(
        &mut self,
        state: Arc<AppState>,
        state_handle: Pin<Box<dyn Future<Output = ()> + Send>>,
    ) -> Result<(), FleetError> {
        if self.app_state.is_some() {
            return Err(FleetError::ShutdownError("app_state already set".to_string()));
        }
        self.app_state = Some(AppStateShutdownParams { state, state_handle });
        Ok(())
    }

    pub fn with_reconciler_worker_handle(&mut self, handle: JoinHandle<()>) -> Result<(), FleetError> {
        if self.reconciler_worker_handle.is_some() {
            return Err(FleetError::ShutdownError("reconciler_handle already set".to_string()));
        }
        self.reconciler_worker_handle = Some(handle);
        Ok(())
    }

    pub fn with_health_worker_handle(&mut self, handle: JoinHandle<()>) -> Result<(), FleetError> {
        if self.health_worker_handle.is_some() {
            return Err(FleetError::ShutdownError("health_handle already set".to_string()));
        }
        self.health_worker_handle = Some(handle);
        Ok(())
    }

    pub fn with_sweeper_worker_handle(&mut self, handle: JoinHandle<()>) -> Result<(), FleetError> {
        if self.sweeper_worker_handle.is_some() {
            return Err(FleetError::ShutdownError("sweeper_handle already set".to_string()));
        }
        self.sweeper_worker_handle = Some(handle);
        Ok(())
    }

    pub fn with_server_handle(&mut self, handle: JoinHandle<Result<(), FleetError>>) -> Result<(), FleetError> {
        if self.server_handle.is_some() {
            return Err(FleetError::ShutdownError("server_handle already set".to_string()));
        }
        self.server_handle = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), FleetError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(self.lifecycle_options.max_shutdown_delay, self.shutdown_impl()).await {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.lifecycle_options.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), FleetError> {
        info!("Shutting down fleetd...");

        // 1. Server, so no new requests reach the engine
        if let Some(handle) = self.server_handle.take() {
            handle.await.map_err(|e| FleetError::ShutdownError(e.to_string()))??;
        }

        // 2. Workers; an in-flight reconcile pass finishes first
        for handle in [
            self.reconciler_worker_handle.take(),
            self.health_worker_handle.take(),
            self.sweeper_worker_handle.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.await.map_err(|e| FleetError::ShutdownError(e.to_string()))?;
        }

        // 3. App state and the progress hub
        if let Some(app_state) = self.app_state.take() {
            app_state.state.shutdown().await?;
            app_state.state_handle.await;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
