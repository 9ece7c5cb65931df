//! Request gateway façade
//!
//! Owns one credential pool per provider, the shared quota tracker and the
//! upstream client. Each `send` runs its own orchestrator; the only state
//! shared between concurrent calls is the tracker and the pools' disabled
//! sets.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::Secret;
use key_pool::CredentialPool;
use provider::{HttpClient, PATTERN_TABLE_VERSION, ProviderClient};
use quota_tracker::{QuotaTracker, SystemClock, resolve_state_path};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{Config, TaskConfig};
use crate::error::{GatewayError, Result};
use crate::machine::{CallPolicy, Target};
use crate::metrics;
use crate::orchestrator::{Completion, Orchestrator};

/// Defaults applied when a call leaves an option unset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayDefaults {
    pub provider: String,
    pub model: String,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub fallback_enabled: bool,
    pub fallback: Option<Target>,
    /// Deadline for a single upstream attempt
    pub attempt_timeout: Duration,
    /// Named call profiles, from `[tasks]`
    pub tasks: HashMap<String, TaskConfig>,
}

impl GatewayDefaults {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            fallback_enabled: true,
            fallback: None,
            attempt_timeout: Duration::from_secs(60),
            tasks: HashMap::new(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            provider: config.gateway.provider.clone(),
            model: config.gateway.model.clone(),
            max_retries: config.gateway.max_retries,
            retry_delay: config.retry_delay(),
            fallback_enabled: config.gateway.fallback,
            fallback: config.fallback_target(),
            attempt_timeout: config.attempt_timeout(),
            tasks: config.tasks.clone(),
        }
    }
}

/// One call. Unset options take the gateway defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendRequest {
    pub prompt: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    /// Named profile whose provider and model apply where this request sets none
    pub task: Option<String>,
    pub max_retries: Option<u32>,
    pub retry_delay: Option<Duration>,
    pub fallback: Option<bool>,
}

impl SendRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn task(mut self, task: impl Into<String>) -> Self {
        self.task = Some(task.into());
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = Some(retry_delay);
        self
    }

    pub fn fallback(mut self, enabled: bool) -> Self {
        self.fallback = Some(enabled);
        self
    }
}

pub struct Gateway {
    tracker: Arc<QuotaTracker>,
    pools: HashMap<String, Arc<CredentialPool>>,
    /// Per-provider default model, from `[[providers]] model`
    models: HashMap<String, String>,
    client: Arc<dyn ProviderClient>,
    defaults: GatewayDefaults,
}

impl Gateway {
    pub fn new(
        tracker: Arc<QuotaTracker>,
        client: Arc<dyn ProviderClient>,
        defaults: GatewayDefaults,
    ) -> Self {
        Self {
            tracker,
            pools: HashMap::new(),
            models: HashMap::new(),
            client,
            defaults,
        }
    }

    /// Register a provider's pool, replacing any existing one for that id.
    pub fn with_pool(mut self, pool: CredentialPool, default_model: Option<String>) -> Self {
        let id = pool.provider_id().to_string();
        match default_model {
            Some(model) => {
                self.models.insert(id.clone(), model);
            }
            None => {
                self.models.remove(&id);
            }
        }
        self.pools.insert(id, Arc::new(pool));
        self
    }

    /// Assemble a gateway from configuration, reading keys from the
    /// environment and talking to providers over HTTP.
    pub async fn from_config(config: &Config) -> Result<Self> {
        Self::from_config_with(config, |name| std::env::var(name).ok()).await
    }

    /// Like [`Gateway::from_config`], resolving key references through `lookup`.
    pub async fn from_config_with(
        config: &Config,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let state_path = resolve_state_path(config.gateway.state_path.as_deref());
        let tracker = QuotaTracker::load(state_path, Arc::new(SystemClock)).await;

        let http = reqwest::Client::builder().build().map_err(|e| {
            common::Error::Config(format!("failed to build HTTP client: {e}"))
        })?;
        let client = HttpClient::new(http, config.attempt_timeout());

        let mut gateway = Gateway::new(
            Arc::new(tracker),
            Arc::new(client),
            GatewayDefaults::from_config(config),
        );

        for provider in &config.providers {
            let keys: Vec<(String, Secret<String>)> = provider.resolve_keys_with(&lookup);
            if keys.is_empty() {
                if provider.id == config.gateway.provider {
                    return Err(common::Error::Config(format!(
                        "no credentials resolved for default provider {}",
                        provider.id
                    ))
                    .into());
                }
                warn!(provider = %provider.id, "no credentials resolved, provider unavailable");
                continue;
            }
            let pool = CredentialPool::from_keys(Arc::new(provider.descriptor()?), keys)?;
            info!(
                provider = %provider.id,
                credentials = pool.credentials().len(),
                reset = %pool.descriptor().reset,
                "credential pool ready"
            );
            gateway = gateway.with_pool(pool, provider.model.clone());
        }

        Ok(gateway)
    }

    pub fn tracker(&self) -> &Arc<QuotaTracker> {
        &self.tracker
    }

    pub fn defaults(&self) -> &GatewayDefaults {
        &self.defaults
    }

    pub fn pool(&self, provider: &str) -> Option<&Arc<CredentialPool>> {
        self.pools.get(provider)
    }

    /// Send one prompt, retrying, rotating and falling back as needed.
    ///
    /// Provider resolution: the request's provider, then the task's, then the
    /// gateway default. Model resolution: the request's model, then the task's,
    /// then the provider's configured model, then the gateway default.
    pub async fn send(&self, request: SendRequest) -> Result<Completion> {
        let task = match &request.task {
            Some(name) => Some(
                self.defaults
                    .tasks
                    .get(name)
                    .ok_or_else(|| GatewayError::UnknownTask(name.clone()))?,
            ),
            None => None,
        };
        let provider = request
            .provider
            .or_else(|| task.and_then(|t| t.provider.clone()))
            .unwrap_or_else(|| self.defaults.provider.clone());
        if !self.pools.contains_key(&provider) {
            return Err(GatewayError::UnknownProvider(provider));
        }
        let model = request
            .model
            .or_else(|| task.and_then(|t| t.model.clone()))
            .or_else(|| self.models.get(&provider).cloned())
            .unwrap_or_else(|| self.defaults.model.clone());
        let target = Target::new(provider, model);

        let fallback_enabled = request.fallback.unwrap_or(self.defaults.fallback_enabled);
        let policy = CallPolicy {
            max_retries: request.max_retries.unwrap_or(self.defaults.max_retries),
            retry_delay: request.retry_delay.unwrap_or(self.defaults.retry_delay),
            fallback: self.defaults.fallback.clone().filter(|_| fallback_enabled),
        };

        let orchestrator = Orchestrator {
            tracker: &self.tracker,
            pools: &self.pools,
            client: self.client.as_ref(),
            attempt_timeout: self.defaults.attempt_timeout,
        };

        let started = Instant::now();
        debug!(call = %target, task = ?request.task, "dispatching call");
        let result = orchestrator.run(&request.prompt, target.clone(), &policy).await;
        let elapsed = started.elapsed().as_secs_f64();

        match &result {
            Ok(completion) => {
                metrics::record_call("success", elapsed);
                info!(
                    provider = %completion.provider,
                    model = %completion.model,
                    credential = %completion.credential,
                    used_fallback = completion.used_fallback,
                    failed_attempts = completion.failed_attempts.len(),
                    elapsed_ms = (elapsed * 1000.0) as u64,
                    "call succeeded"
                );
            }
            Err(e) => {
                let outcome = e.classification().map_or("error", |c| c.label());
                metrics::record_call(outcome, elapsed);
                warn!(
                    provider = %target.provider,
                    model = %target.model,
                    outcome,
                    attempts = e.attempts().len(),
                    elapsed_ms = (elapsed * 1000.0) as u64,
                    error = %e,
                    "call failed"
                );
            }
        }
        result
    }

    /// Clear recorded exhaustion for one provider, or all of them.
    pub async fn reset(&self, provider: Option<&str>) -> Result<usize> {
        if let Some(id) = provider
            && !self.pools.contains_key(id)
        {
            return Err(GatewayError::UnknownProvider(id.to_string()));
        }
        Ok(self.tracker.reset(provider).await?)
    }

    /// Per-provider pool status plus gateway-level settings.
    pub async fn status(&self) -> serde_json::Value {
        let mut ids: Vec<&String> = self.pools.keys().collect();
        ids.sort();

        let mut providers = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(pool) = self.pools.get(id) {
                providers.push(pool.status(&self.tracker).await);
            }
        }

        let fallback = self
            .defaults
            .fallback
            .as_ref()
            .filter(|_| self.defaults.fallback_enabled)
            .map(ToString::to_string);

        serde_json::json!({
            "default": Target::new(&self.defaults.provider, &self.defaults.model).to_string(),
            "fallback": fallback,
            "state_path": self.tracker.path().display().to_string(),
            "pattern_table_version": PATTERN_TABLE_VERSION,
            "providers": providers,
        })
    }

    /// Wait for pending quota state writes to reach disk.
    pub async fn flush(&self) -> Result<()> {
        Ok(self.tracker.flush().await?)
    }
}
