//! Shared application state for the HTTP surface.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use mlx_fleet::{
    Dispatcher, FleetConfig, HealthProber, InstanceStore, PerformanceTuner, Supervisor,
};

/// Long-lived controller objects, injected into every route handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<FleetConfig>,
    pub store: Arc<InstanceStore>,
    pub supervisor: Arc<Supervisor>,
    pub dispatcher: Arc<Dispatcher>,
    pub prober: Arc<HealthProber>,
    pub tuner: Arc<PerformanceTuner>,
}

impl AppState {
    /// Build the controller from configuration: the pool layout comes from
    /// `mlx_servers`, and one shared HTTP client backs all outbound calls.
    pub fn new(config: Arc<FleetConfig>, cancel: CancellationToken) -> Arc<Self> {
        let store = Arc::new(InstanceStore::new(&config));
        Self::with_store(config, store, cancel)
    }

    /// Build the controller around an existing instance pool.
    pub fn with_store(
        config: Arc<FleetConfig>,
        store: Arc<InstanceStore>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let client = mlx_fleet::build_http_client();

        let supervisor = Arc::new(Supervisor::new(
            store.clone(),
            config.clone(),
            client.clone(),
            cancel.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            client.clone(),
            config.clone(),
            cancel,
        ));
        let prober = Arc::new(HealthProber::new(
            store.clone(),
            supervisor.clone(),
            client,
            &config,
        ));
        let tuner = Arc::new(PerformanceTuner::new(store.clone(), dispatcher.clone()));

        Arc::new(Self {
            config,
            store,
            supervisor,
            dispatcher,
            prober,
            tuner,
        })
    }
}
