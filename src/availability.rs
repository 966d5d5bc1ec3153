//! Ollama reachability and model catalog cache.
//!
//! Failures never propagate: an unreachable server reads as unavailable and
//! a failed catalog fetch reads as no models. A failed probe keeps the last
//! known model list; treat it as advisory while `available` is false.

use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use crate::generator::{GeneratorClient, GeneratorModel};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AvailabilitySnapshot {
    pub available: bool,
    pub models: Vec<GeneratorModel>,
}

#[derive(Clone)]
pub struct AvailabilityMonitor {
    client: GeneratorClient,
    state: Arc<RwLock<AvailabilitySnapshot>>,
}

impl AvailabilityMonitor {
    pub fn new(client: GeneratorClient) -> Self {
        Self {
            client,
            state: Arc::new(RwLock::new(AvailabilitySnapshot::default())),
        }
    }

    pub fn snapshot(&self) -> AvailabilitySnapshot {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Probe the server; when it answers, refresh the model list too.
    pub async fn check_availability(&self, base_url: &str) -> bool {
        let available = self.client.probe_availability(base_url).await;
        let changed = {
            let mut state = self
                .state
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let changed = state.available != available;
            state.available = available;
            changed
        };
        if changed {
            info!(
                "Ollama at {base_url} is {}",
                if available { "available" } else { "unavailable" }
            );
        }

        if available {
            self.refresh_models(base_url).await;
        }
        available
    }

    /// Reload the model catalog. Any failure yields an empty list.
    pub async fn refresh_models(&self, base_url: &str) -> Vec<GeneratorModel> {
        let models = match self.client.list_models(base_url).await {
            Ok(models) => models,
            Err(e) => {
                debug!("Could not load Ollama models: {e}");
                Vec::new()
            }
        };
        debug!("Ollama reports {} models", models.len());
        self.state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .models = models.clone();
        models
    }
}
