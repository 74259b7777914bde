//! Deadlines, retry with backoff and jitter, circuit breaking and provider fallback.
//!
//! A [`Resilient`] wraps an ordered list of providers of one capability. Each call is tried
//! against the first provider whose breaker admits it; retriable failures are retried up to the
//! configured attempt count before falling through to the next provider.

use crate::config::{CircuitConfig, ProvidersConfig, RetryConfig};
use crate::error::ProviderError;
use crate::providers::{
    GenerationItem, GenerationRequest, Generator, ProviderStream, Synthesizer, Transcriber,
    TranscriberSession,
};
use crate::types::AudioFrame;

use rand::Rng;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

pub type ResilientTranscriber = Resilient<dyn Transcriber>;
pub type ResilientGenerator = Resilient<dyn Generator>;
pub type ResilientSynthesizer = Resilient<dyn Synthesizer>;

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(c: &RetryConfig) -> Self {
        Self {
            max_attempts: c.max_attempts.max(1),
            base_delay: Duration::from_millis(c.base_delay_ms),
            max_delay: Duration::from_millis(c.max_delay_ms),
            jitter: c.jitter.clamp(0.0, 1.0),
        }
    }
}

impl RetryPolicy {
    /// Exponential delay before retry number `attempt` (1-based), capped, plus random jitter.
    pub fn delay_for<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);
        if self.jitter == 0.0 {
            return base;
        }
        let extra = base.as_secs_f64() * self.jitter * rng.gen::<f64>();
        base + Duration::from_secs_f64(extra)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum CircuitState {
    Closed { failures: u32 },
    Open { until: Instant },
    HalfOpen,
}

/// Per-provider circuit breaker. The lock is only taken for bookkeeping, never across `.await`.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    cooldown: Duration,
    state: Mutex<CircuitState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: &CircuitConfig) -> Self {
        Self {
            name: name.into(),
            failure_threshold: config.failure_threshold.max(1),
            cooldown: Duration::from_millis(config.cooldown_ms),
            state: Mutex::new(CircuitState::Closed { failures: 0 }),
        }
    }

    /// Admit a call, or fail fast while open. After the cooldown one trial call is admitted.
    pub fn try_acquire(&self) -> Result<Permit<'_>, ProviderError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match *state {
            CircuitState::Closed { .. } => Ok(Permit {
                breaker: self,
                trial: false,
            }),
            CircuitState::Open { until } if Instant::now() >= until => {
                info!(provider=%self.name, "circuit half-open; admitting a trial call");
                *state = CircuitState::HalfOpen;
                Ok(Permit {
                    breaker: self,
                    trial: true,
                })
            }
            CircuitState::Open { .. } | CircuitState::HalfOpen => Err(ProviderError::CircuitOpen {
                provider: self.name.clone(),
            }),
        }
    }

    fn record_success(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !matches!(*state, CircuitState::Closed { failures: 0 }) {
            debug!(provider=%self.name, "circuit closed");
        }
        *state = CircuitState::Closed { failures: 0 };
    }

    /// Only retriable failures count against the provider; a terminal error still proves it
    /// answered.
    fn record_failure(&self, e: &ProviderError) {
        if !e.is_retriable() {
            self.record_success();
            return;
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let next = match *state {
            CircuitState::Closed { failures } if failures + 1 < self.failure_threshold => {
                CircuitState::Closed {
                    failures: failures + 1,
                }
            }
            _ => {
                warn!(provider=%self.name, cooldown_ms=%self.cooldown.as_millis(), "circuit opened");
                CircuitState::Open {
                    until: Instant::now() + self.cooldown,
                }
            }
        };
        *state = next;
    }

    /// The trial call went away without an outcome; wait out another cooldown.
    fn abandon_trial(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(*state, CircuitState::HalfOpen) {
            debug!(provider=%self.name, "trial call dropped; circuit reopened");
            *state = CircuitState::Open {
                until: Instant::now() + self.cooldown,
            };
        }
    }

    pub fn status(&self) -> CircuitStatus {
        match *self.state.lock().unwrap_or_else(PoisonError::into_inner) {
            CircuitState::Closed { .. } => CircuitStatus::Closed,
            CircuitState::Open { .. } => CircuitStatus::Open,
            CircuitState::HalfOpen => CircuitStatus::HalfOpen,
        }
    }
}

/// Admission granted by [`CircuitBreaker::try_acquire`]. Settle it with the call's outcome; a
/// half-open trial dropped unsettled reopens the circuit.
#[must_use]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
}

impl Permit<'_> {
    pub fn succeeded(mut self) {
        self.trial = false;
        self.breaker.record_success();
    }

    pub fn failed(mut self, e: &ProviderError) {
        self.trial = false;
        self.breaker.record_failure(e);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.trial {
            self.breaker.abandon_trial();
        }
    }
}

struct ProviderSlot<P: ?Sized> {
    name: String,
    provider: Arc<P>,
    breaker: CircuitBreaker,
}

pub struct Resilient<P: ?Sized> {
    capability: &'static str,
    slots: Vec<ProviderSlot<P>>,
    retry: RetryPolicy,
    deadline: Duration,
}

impl<P: ?Sized + Send + Sync> Resilient<P> {
    /// `providers` are in fallback order: the first is the primary.
    pub fn new(
        capability: &'static str,
        providers: Vec<(String, Arc<P>)>,
        config: &ProvidersConfig,
    ) -> Self {
        let slots = providers
            .into_iter()
            .map(|(name, provider)| ProviderSlot {
                breaker: CircuitBreaker::new(name.clone(), &config.circuit),
                name,
                provider,
            })
            .collect();
        Self {
            capability,
            slots,
            retry: RetryPolicy::from(&config.retry),
            deadline: Duration::from_millis(config.request_timeout_ms),
        }
    }

    pub fn breaker_status(&self) -> Vec<(String, CircuitStatus)> {
        self.slots
            .iter()
            .map(|s| (s.name.clone(), s.breaker.status()))
            .collect()
    }

    /// Run `op` under the deadline, retry and breaker policy, falling back through providers.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T, ProviderError>
    where
        F: Fn(Arc<P>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut last_err: Option<ProviderError> = None;
        for slot in &self.slots {
            for attempt in 1..=self.retry.max_attempts {
                let permit = match slot.breaker.try_acquire() {
                    Ok(permit) => permit,
                    Err(e) => {
                        debug!(capability=%self.capability, provider=%slot.name, "skipping open circuit");
                        last_err.get_or_insert(e);
                        break;
                    }
                };
                let res = match timeout(self.deadline, op(slot.provider.clone())).await {
                    Ok(res) => res,
                    Err(_) => Err(ProviderError::Timeout {
                        provider: slot.name.clone(),
                        after_ms: self.deadline.as_millis() as u64,
                    }),
                };
                match res {
                    Ok(v) => {
                        permit.succeeded();
                        return Ok(v);
                    }
                    Err(e) => {
                        permit.failed(&e);
                        if !e.is_retriable() {
                            warn!(capability=%self.capability, error=%e, "terminal provider error");
                            return Err(e);
                        }
                        warn!(capability=%self.capability, attempt=%attempt, error=%e, "retriable provider error");
                        last_err = Some(e);
                        if attempt < self.retry.max_attempts {
                            let delay = self.retry.delay_for(attempt, &mut rand::thread_rng());
                            sleep(delay).await;
                        }
                    }
                }
            }
        }
        Err(last_err.unwrap_or(ProviderError::NoProvider {
            capability: self.capability,
        }))
    }
}

impl Resilient<dyn Transcriber> {
    pub async fn start(&self) -> Result<TranscriberSession, ProviderError> {
        self.call(|p| async move { p.start().await }).await
    }
}

impl Resilient<dyn Generator> {
    pub async fn start(
        &self,
        request: &GenerationRequest,
    ) -> Result<ProviderStream<GenerationItem>, ProviderError> {
        self.call(|p| async move { p.start(request).await }).await
    }
}

impl Resilient<dyn Synthesizer> {
    pub async fn start(
        &self,
        text: &str,
        voice_id: &str,
    ) -> Result<ProviderStream<AudioFrame>, ProviderError> {
        self.call(|p| async move { p.start(text, voice_id).await })
            .await
    }
}
