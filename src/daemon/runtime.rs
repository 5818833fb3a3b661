//! Daemon runtime wiring.
//!
//! Assembles the store, provider, breaker, orchestrator, HTTP surface,
//! reconciler, and the scheduler tick loop, and runs until ctrl-c. The
//! tick loop never blocks on the provider: claimed requests are dispatched
//! to their own tasks and the loop moves on to the next channel.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use eyre::{Context, Result};
use log::{error, info, warn};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::http::{self, ApiState};
use crate::id::{generate_worker_id, now_ms, today};
use crate::moderation::ModerationGate;
use crate::orchestrator::{ArtifactHandoff, GenerationOrchestrator, OrchestratorConfig};
use crate::provider::{
    ArtifactStore, HttpArtifactRelay, HttpProviderClient, PassthroughArtifactStore, ProviderClient,
    ProviderHttpConfig,
};
use crate::reconciler;
use crate::resilience::CircuitBreaker;
use crate::scheduler::{SelectionConfig, priority, select};
use crate::store::Store;

use super::tick::{TickConfig, TickState};

/// The long-running daemon process.
pub struct Daemon {
    config: Config,
}

impl Daemon {
    /// Create a daemon from loaded configuration.
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run until ctrl-c.
    pub async fn run(self) -> Result<()> {
        let config = self.config;

        let store = Store::open_at(&config.storage.data_dir)
            .with_context(|| format!("Failed to open store at {}", config.storage.data_dir.display()))?;
        let store = Arc::new(Mutex::new(store));
        ensure_default_channel(&store)?;

        let provider: Arc<dyn ProviderClient> = Arc::new(HttpProviderClient::new(ProviderHttpConfig {
            base_url: config.provider.base_url.clone(),
            api_key: config.provider_api_key(),
            timeout: Duration::from_millis(config.provider.timeout_ms),
        })?);

        let artifacts: Arc<dyn ArtifactStore> = match &config.provider.storage_endpoint {
            Some(endpoint) => Arc::new(HttpArtifactRelay::new(endpoint.clone())?),
            None => Arc::new(PassthroughArtifactStore),
        };

        let breaker = Arc::new(Mutex::new(CircuitBreaker::new(config.breaker.clone())));
        let (handoff_tx, handoff_rx) = mpsc::channel(64);

        let orchestrator = Arc::new(GenerationOrchestrator::new(
            store.clone(),
            provider,
            artifacts,
            breaker.clone(),
            config.generation.retry.clone(),
            handoff_tx,
            OrchestratorConfig {
                callback_url: config.server.callback_url(),
                poll_grace_secs: config.generation.poll_grace_secs,
                poll_interval_secs: config.generation.poll_interval_secs,
                poll_ceiling_secs: config.reconciler.generation_timeout_secs,
            },
        ));
        let gate = Arc::new(ModerationGate::new(store.clone()));

        // Handoff consumer: forwards finished artifacts to the broadcast
        // collaborator (or just logs them when none is configured)
        tokio::spawn(run_handoff_consumer(
            handoff_rx,
            config.server.broadcast_endpoint.clone(),
        ));

        // API surface
        let router = http::router(ApiState {
            store: store.clone(),
            gate,
            orchestrator: orchestrator.clone(),
            admission: config.admission.clone(),
            reputation_min: config.reputation.min,
            reputation_max: config.reputation.max,
            webhook_secret: config.server.webhook_secret.clone(),
        });
        let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
            .await
            .with_context(|| format!("Failed to bind {}", config.server.bind_addr))?;
        info!("API listening on {}", config.server.bind_addr);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                error!("API server exited: {}", e);
            }
        });

        // Reconciler runs independently of the tick loop
        tokio::spawn(reconciler::run_reconciler(store.clone(), config.reconciler.clone()));

        let tick_config = TickConfig::new(
            Duration::from_millis(config.scheduler.tick_interval_ms),
            Duration::from_secs(config.scheduler.rescore_interval_secs),
        );

        run_scheduler_loop(
            store,
            orchestrator,
            breaker,
            config.scheduler.selection.clone(),
            tick_config,
        )
        .await
    }
}

/// The main scheduling loop: tick, rescore on cadence, exit on ctrl-c.
async fn run_scheduler_loop(
    store: Arc<Mutex<Store>>,
    orchestrator: Arc<GenerationOrchestrator>,
    breaker: Arc<Mutex<CircuitBreaker>>,
    selection: SelectionConfig,
    tick_config: TickConfig,
) -> Result<()> {
    let worker_id = generate_worker_id();
    let mut state = TickState::new();
    let mut last_rescore = Instant::now();

    info!("Scheduler worker {} started", worker_id);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                state.request_shutdown();
                info!(
                    "Shutting down after {} ticks, {} dispatched",
                    state.tick_count, state.total_dispatched
                );
                break;
            }
            _ = tokio::time::sleep(tick_config.tick_interval) => {}
        }

        state.tick();

        if last_rescore.elapsed() >= tick_config.rescore_interval {
            let mut store_guard = store.lock().unwrap();
            if let Err(e) = priority::rescore_all(&mut store_guard, now_ms(), &today()) {
                warn!("Rescore pass failed: {}", e);
            }
            drop(store_guard);
            last_rescore = Instant::now();
        }

        match scheduler_tick(&store, &orchestrator, &breaker, &selection, &worker_id) {
            Ok(dispatched) => state.dispatched(dispatched),
            Err(e) => error!("Scheduler tick failed: {}", e),
        }
    }

    Ok(())
}

/// One scheduling pass over all channels. Returns how many requests were
/// claimed and dispatched.
pub fn scheduler_tick(
    store: &Arc<Mutex<Store>>,
    orchestrator: &Arc<GenerationOrchestrator>,
    breaker: &Arc<Mutex<CircuitBreaker>>,
    selection: &SelectionConfig,
    worker_id: &str,
) -> Result<usize> {
    // A tripped breaker means no candidate can run; leave the queue alone
    // rather than claiming requests we cannot serve
    if !breaker.lock().unwrap().is_callable() {
        return Ok(0);
    }

    let channels = {
        let store = store.lock().unwrap();
        store.list_channels()?
    };

    let mut rng = rand::rng();
    let mut dispatched = 0;

    for channel in channels {
        let candidate = {
            let store = store.lock().unwrap();
            select::select_candidate(&store, &channel.id, selection, &mut rng)?
        };
        let Some(candidate) = candidate else {
            continue;
        };

        let claimed = {
            let mut store = store.lock().unwrap();
            store.claim_request(&candidate.id, worker_id, now_ms())?
        };
        if !claimed {
            // Another worker won the race; pick again next tick
            continue;
        }

        dispatch(orchestrator.clone(), store.clone(), candidate.id.clone());
        dispatched += 1;
    }

    Ok(dispatched)
}

/// Drive one claimed request on its own task. An orchestration error fails
/// the request loudly — a claimed request must never be silently dropped
/// in `generating` (the reconciler is a safety net, not the mechanism).
fn dispatch(orchestrator: Arc<GenerationOrchestrator>, store: Arc<Mutex<Store>>, request_id: String) {
    tokio::spawn(async move {
        if let Err(e) = orchestrator.generate(&request_id).await {
            error!("Orchestration error for {}: {}", request_id, e);
            let mut store = store.lock().unwrap();
            if let Err(e2) = store.fail_generating(&request_id, &format!("orchestration error: {}", e), now_ms()) {
                error!("Could not fail request {}: {}", request_id, e2);
            }
        }
    });
}

/// Forward artifact handoffs to the broadcast collaborator.
async fn run_handoff_consumer(mut rx: mpsc::Receiver<ArtifactHandoff>, endpoint: Option<String>) {
    let client = reqwest::Client::new();

    while let Some(handoff) = rx.recv().await {
        info!(
            "Artifact ready for broadcast: {} -> {}",
            handoff.request_id, handoff.artifact_handle
        );

        if let Some(endpoint) = &endpoint {
            match client.post(endpoint).json(&handoff).send().await {
                Ok(response) if response.status().is_success() => {}
                Ok(response) => warn!("Broadcast handoff returned {}", response.status()),
                Err(e) => warn!("Broadcast handoff failed: {}", e),
            }
        }
    }
}

/// Create the default channel on first boot so submissions have somewhere
/// to land.
fn ensure_default_channel(store: &Arc<Mutex<Store>>) -> Result<()> {
    let mut store = store.lock().unwrap();
    if store.list_channels()?.is_empty() {
        let channel = crate::domain::Channel::new("main", "Main");
        store.save_channel(&channel)?;
        info!("Created default channel 'main'");
    }
    Ok(())
}
