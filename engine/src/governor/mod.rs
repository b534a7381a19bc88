//! Call Governor
//!
//! Guards calls to a flaky external resource (the language-model service)
//! with, in order:
//!
//! - **Circuit breaker**: fail fast while the resource is known to be down
//! - **Token bucket**: sustained rate plus burst
//! - **Concurrency slots**: bounded in-flight calls per resource
//! - **Timeout**: every call is bounded; a timeout counts as a failure
//!
//! The governor never retries. Retry policy belongs to its callers.

mod bucket;
mod circuit;

pub use circuit::{CircuitState, CircuitStatus};

use sdk::errors::GovernorError;
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use bucket::TokenBucket;
use circuit::{Admission, CircuitBreaker};

use crate::config::GovernorConfig;

/// Resource id of the language-model service
pub const LLM_RESOURCE: &str = "llm";

/// Limits applied to each governed resource
#[derive(Debug, Clone, PartialEq)]
pub struct GovernorSettings {
    pub rate_per_sec: f64,
    pub burst: u32,
    pub max_concurrent: usize,
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub call_timeout: Duration,
    pub max_wait: Duration,
}

impl Default for GovernorSettings {
    fn default() -> Self {
        Self::from(&GovernorConfig::default())
    }
}

impl From<&GovernorConfig> for GovernorSettings {
    fn from(config: &GovernorConfig) -> Self {
        Self {
            rate_per_sec: config.rate_per_sec,
            burst: config.burst,
            max_concurrent: config.max_concurrent,
            failure_threshold: config.failure_threshold,
            cooldown: Duration::from_secs(config.cooldown_secs),
            call_timeout: Duration::from_secs(config.call_timeout_secs),
            max_wait: Duration::from_millis(config.max_wait_ms),
        }
    }
}

/// Per-call choices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvokeOptions {
    /// Wait (up to `max_wait`) for a rate token instead of failing fast
    pub wait_for_token: bool,
    /// Queue (up to `max_wait`) for a concurrency slot instead of rejecting
    pub queue_for_slot: bool,
    /// Overrides the configured wait bound
    pub max_wait: Option<Duration>,
    /// Overrides the configured call timeout
    pub timeout: Option<Duration>,
}

impl Default for InvokeOptions {
    fn default() -> Self {
        Self {
            wait_for_token: true,
            queue_for_slot: true,
            max_wait: None,
            timeout: None,
        }
    }
}

impl InvokeOptions {
    /// Reject instead of waiting for tokens or slots
    pub fn fail_fast() -> Self {
        Self {
            wait_for_token: false,
            queue_for_slot: false,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

struct Resource {
    bucket: Mutex<TokenBucket>,
    circuit: Mutex<CircuitBreaker>,
    slots: Semaphore,
}

// Critical sections never panic, so a poisoned lock still holds valid state
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Keeps the half-open probe slot accounted for if the call never completes
struct ProbeGuard<'a> {
    resource: &'a Resource,
    admission: Admission,
    settled: bool,
}

impl ProbeGuard<'_> {
    fn settle(&mut self) {
        self.settled = true;
    }
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if !self.settled && self.admission == Admission::Probe {
            lock(&self.resource.circuit).release_probe();
        }
    }
}

/// Rate, concurrency and circuit-breaking around external calls
pub struct CallGovernor {
    settings: GovernorSettings,
    resources: Mutex<HashMap<String, Arc<Resource>>>,
}

impl CallGovernor {
    /// Create a new governor applying `settings` to every resource
    pub fn new(settings: GovernorSettings) -> Self {
        Self {
            settings,
            resources: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &GovernorSettings {
        &self.settings
    }

    fn resource(&self, resource_id: &str) -> Arc<Resource> {
        let mut resources = lock(&self.resources);
        let entry = resources.entry(resource_id.to_string()).or_insert_with(|| {
            Arc::new(Resource {
                bucket: Mutex::new(TokenBucket::new(
                    self.settings.rate_per_sec,
                    self.settings.burst,
                )),
                circuit: Mutex::new(CircuitBreaker::new(
                    self.settings.failure_threshold,
                    self.settings.cooldown,
                )),
                slots: Semaphore::new(self.settings.max_concurrent.max(1)),
            })
        });
        Arc::clone(entry)
    }

    /// Run `call` under the resource's limits
    ///
    /// # Errors
    ///
    /// - `CircuitOpen` while the circuit is open or a probe is in flight
    /// - `RateLimited` when no token is available within the wait bound
    /// - `Saturated` when no concurrency slot is available
    /// - `Timeout` when the call exceeds its timeout
    /// - `UpstreamFailure` when the call itself fails
    pub async fn invoke<T, E, F, Fut>(
        &self,
        resource_id: &str,
        options: InvokeOptions,
        call: F,
    ) -> Result<T, GovernorError>
    where
        E: Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let resource = self.resource(resource_id);
        let max_wait = options.max_wait.unwrap_or(self.settings.max_wait);
        let deadline = Instant::now() + max_wait;

        let admission = lock(&resource.circuit)
            .admit(Instant::now())
            .map_err(|retry_after| {
                debug!(resource = %resource_id, "Circuit open, failing fast");
                GovernorError::CircuitOpen {
                    resource: resource_id.to_string(),
                    retry_after_ms: retry_after.as_millis() as u64,
                }
            })?;
        let mut guard = ProbeGuard {
            resource: &resource,
            admission,
            settled: false,
        };
        if admission == Admission::Probe {
            info!(resource = %resource_id, "Circuit half-open, sending probe");
        }

        self.take_token(&resource, resource_id, options.wait_for_token, deadline)
            .await?;
        let _slot = self
            .acquire_slot(&resource, resource_id, options.queue_for_slot, deadline)
            .await?;

        let timeout = options.timeout.unwrap_or(self.settings.call_timeout);
        let outcome = tokio::time::timeout(timeout, call()).await;
        guard.settle();

        match outcome {
            Ok(Ok(value)) => {
                if lock(&resource.circuit).on_success(admission) {
                    info!(resource = %resource_id, "Circuit closed after successful probe");
                }
                Ok(value)
            }
            Ok(Err(e)) => {
                let message = e.to_string();
                self.record_failure(&resource, resource_id, admission, &message);
                Err(GovernorError::UpstreamFailure {
                    resource: resource_id.to_string(),
                    message,
                })
            }
            Err(_) => {
                let timeout_ms = timeout.as_millis() as u64;
                self.record_failure(
                    &resource,
                    resource_id,
                    admission,
                    &format!("timed out after {} ms", timeout_ms),
                );
                Err(GovernorError::Timeout {
                    resource: resource_id.to_string(),
                    timeout_ms,
                })
            }
        }
    }

    async fn take_token(
        &self,
        resource: &Resource,
        resource_id: &str,
        wait: bool,
        deadline: Instant,
    ) -> Result<(), GovernorError> {
        loop {
            let now = Instant::now();
            let needed = match lock(&resource.bucket).try_take(now) {
                Ok(()) => return Ok(()),
                Err(needed) => needed,
            };
            if !wait || now + needed > deadline {
                warn!(resource = %resource_id, "Rate limit exceeded");
                return Err(GovernorError::RateLimited {
                    resource: resource_id.to_string(),
                });
            }
            tokio::time::sleep(needed).await;
        }
    }

    async fn acquire_slot<'a>(
        &self,
        resource: &'a Resource,
        resource_id: &str,
        queue: bool,
        deadline: Instant,
    ) -> Result<SemaphorePermit<'a>, GovernorError> {
        let saturated = || {
            warn!(resource = %resource_id, limit = self.settings.max_concurrent, "Concurrency limit reached");
            GovernorError::Saturated {
                resource: resource_id.to_string(),
                limit: self.settings.max_concurrent,
            }
        };

        if !queue {
            return resource.slots.try_acquire().map_err(|_| saturated());
        }
        match tokio::time::timeout_at(deadline, resource.slots.acquire()).await {
            Ok(Ok(permit)) => Ok(permit),
            _ => Err(saturated()),
        }
    }

    fn record_failure(
        &self,
        resource: &Resource,
        resource_id: &str,
        admission: Admission,
        message: &str,
    ) {
        let mut circuit = lock(&resource.circuit);
        if circuit.on_failure(admission, Instant::now()) {
            error!(
                resource = %resource_id,
                cooldown_secs = self.settings.cooldown.as_secs(),
                "Circuit breaker tripped for resource {}: {}",
                resource_id,
                message
            );
        } else {
            warn!(resource = %resource_id, error = %message, "Governed call failed");
        }
    }

    /// Snapshot of a resource's circuit. Unknown resources report closed.
    pub fn circuit_state(&self, resource_id: &str) -> CircuitState {
        let resources = lock(&self.resources);
        resources
            .get(resource_id)
            .map(|resource| lock(&resource.circuit).snapshot(Instant::now()))
            .unwrap_or_default()
    }

    /// Close the circuit and refill the bucket of a resource
    pub fn reset(&self, resource_id: &str) {
        let resource = lock(&self.resources).get(resource_id).map(Arc::clone);
        if let Some(resource) = resource {
            lock(&resource.circuit).close();
            lock(&resource.bucket).fill(Instant::now());
            info!(resource = %resource_id, "Governor state reset");
        }
    }
}
