//! Role resolution, retry and failover.
//!
//! The [`ProviderRegistry`] owns every configured [`Backend`] and a table of
//! [`RoleBinding`]s. Callers ask for a role (`chat`, `embedding`, ...), get
//! a [`ProviderHandle`] snapshot of the binding, and invoke it. The registry
//! then:
//!
//! 1. calls the primary target, retrying transient failures with bounded
//!    exponential backoff;
//! 2. fails over to each configured alternate in order once retries are
//!    exhausted;
//! 3. surfaces permanent failures (bad credentials, rejected requests)
//!    immediately without failover;
//! 4. records one [`UsageRecord`] per attempt.
//!
//! Role bindings are replaced only through [`ProviderRegistry::set_role`]
//! and [`ProviderRegistry::reload`]. Handles taken before a reload keep
//! the binding they were resolved with.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{
    build_backend, Backend, Capability, ChatMessage, ChatRequest, ChatResponse, EmbedRequest,
    GenerationOptions, ProviderRequest, ProviderResponse, Role, SpeechRequest, SpeechResponse,
    TranscribeRequest, TranscribeResponse,
};
use crate::config::{Config, RetryConfig};
use crate::error::ProviderError;

/// One provider + model pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelTarget {
    pub provider: String,
    pub model: String,
}

impl ModelTarget {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

/// What a role resolves to: a primary target, ordered alternates and the
/// generation options applied to chat requests.
#[derive(Debug, Clone, PartialEq)]
pub struct RoleBinding {
    pub primary: ModelTarget,
    pub fallbacks: Vec<ModelTarget>,
    pub options: GenerationOptions,
}

impl RoleBinding {
    pub fn new(primary: ModelTarget) -> Self {
        Self {
            primary,
            fallbacks: Vec::new(),
            options: GenerationOptions::default(),
        }
    }

    pub fn with_fallback(mut self, target: ModelTarget) -> Self {
        self.fallbacks.push(target);
        self
    }

    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }

    /// Primary first, then alternates in order.
    pub fn targets(&self) -> impl Iterator<Item = &ModelTarget> {
        std::iter::once(&self.primary).chain(self.fallbacks.iter())
    }
}

/// A resolved role, detached from later reconfiguration.
#[derive(Debug, Clone)]
pub struct ProviderHandle {
    pub role: Role,
    pub binding: RoleBinding,
}

impl ProviderHandle {
    /// The same handle with every target ahead of `provider`/`model`
    /// dropped, so later requests never go back to them.
    pub fn starting_at(&self, provider: &str, model: &str) -> Option<ProviderHandle> {
        let mut targets = self
            .binding
            .targets()
            .skip_while(|t| t.provider != provider || t.model != model)
            .cloned();
        let primary = targets.next()?;
        Some(ProviderHandle {
            role: self.role,
            binding: RoleBinding {
                primary,
                fallbacks: targets.collect(),
                options: self.binding.options,
            },
        })
    }
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Retries without sleeping; used by tests and scripted backends.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1-based): base, 2×base, 4×base
    /// and so on, doubling at most five times and capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32 << (attempt - 1).min(5);
        (self.base_delay * factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "lowercase")]
pub enum UsageOutcome {
    Success,
    Failure(String),
}

/// Accounting entry written for every provider attempt.
#[derive(Debug, Clone, Serialize)]
pub struct UsageRecord {
    pub role: Role,
    pub provider: String,
    pub model: String,
    pub capability: Capability,
    pub units: u64,
    pub latency_ms: u64,
    pub attempt: u32,
    pub outcome: UsageOutcome,
    pub at: DateTime<Utc>,
}

/// In-memory usage ledger. Each record is also emitted as a tracing event.
#[derive(Debug, Default)]
pub struct UsageLog {
    records: Mutex<Vec<UsageRecord>>,
}

impl UsageLog {
    pub fn record(&self, record: UsageRecord) {
        match &record.outcome {
            UsageOutcome::Success => debug!(
                provider = %record.provider,
                model = %record.model,
                capability = %record.capability,
                units = record.units,
                latency_ms = record.latency_ms,
                attempt = record.attempt,
                "provider call succeeded"
            ),
            UsageOutcome::Failure(reason) => warn!(
                provider = %record.provider,
                model = %record.model,
                capability = %record.capability,
                latency_ms = record.latency_ms,
                attempt = record.attempt,
                reason = %reason,
                "provider call failed"
            ),
        }
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(record);
    }

    pub fn snapshot(&self) -> Vec<UsageRecord> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Output of a successful invocation plus the target that produced it.
#[derive(Debug, Clone)]
pub struct Invocation<T> {
    pub provider: String,
    pub model: String,
    pub output: T,
}

pub struct ProviderRegistry {
    backends: HashMap<String, Arc<dyn Backend>>,
    roles: RwLock<HashMap<Role, RoleBinding>>,
    retry: RetryPolicy,
    usage: UsageLog,
}

impl ProviderRegistry {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            backends: HashMap::new(),
            roles: RwLock::new(HashMap::new()),
            retry,
            usage: UsageLog::default(),
        }
    }

    /// Build every `[providers.*]` backend and bind every `[roles.*]` table.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let mut registry = Self::new(RetryPolicy::from_config(&config.retry));
        for (name, provider) in &config.providers {
            registry.register_backend(build_backend(name, provider)?);
        }
        registry.reload(bindings_from_config(config)?)?;
        Ok(registry)
    }

    pub fn register_backend(&mut self, backend: Arc<dyn Backend>) {
        self.backends.insert(backend.name().to_string(), backend);
    }

    pub fn provider_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn usage(&self) -> &UsageLog {
        &self.usage
    }

    /// Bind (or rebind) one role after checking every target exists and
    /// serves the role's capability.
    pub fn set_role(&self, role: Role, binding: RoleBinding) -> Result<(), ProviderError> {
        self.check_binding(role, &binding)?;
        info!(role = %role, provider = %binding.primary.provider, model = %binding.primary.model, "role bound");
        self.roles
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(role, binding);
        Ok(())
    }

    /// Replace the whole role table. Nothing changes if any binding is
    /// invalid.
    pub fn reload(&self, bindings: HashMap<Role, RoleBinding>) -> Result<(), ProviderError> {
        for (role, binding) in &bindings {
            self.check_binding(*role, binding)?;
        }
        info!(roles = bindings.len(), "provider roles reloaded");
        *self
            .roles
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = bindings;
        Ok(())
    }

    pub fn binding(&self, role: Role) -> Option<RoleBinding> {
        self.roles
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&role)
            .cloned()
    }

    /// Current role table, ordered by role.
    pub fn bindings(&self) -> Vec<(Role, RoleBinding)> {
        let roles = self
            .roles
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut out: Vec<(Role, RoleBinding)> =
            roles.iter().map(|(r, b)| (*r, b.clone())).collect();
        out.sort_by_key(|(r, _)| *r);
        out
    }

    fn check_binding(&self, role: Role, binding: &RoleBinding) -> Result<(), ProviderError> {
        for target in binding.targets() {
            let backend = self
                .backends
                .get(&target.provider)
                .ok_or_else(|| ProviderError::UnknownProvider(target.provider.clone()))?;
            if !backend.supports(role.capability()) {
                return Err(ProviderError::UnsupportedCapability {
                    provider: target.provider.clone(),
                    capability: role.capability(),
                });
            }
        }
        Ok(())
    }

    /// Resolve a role to its current binding, following
    /// [`Role::fallback_role`] when it has none.
    pub fn resolve(&self, role: Role) -> Result<ProviderHandle, ProviderError> {
        let binding = self
            .binding(role)
            .or_else(|| role.fallback_role().and_then(|r| self.binding(r)))
            .ok_or(ProviderError::RoleNotConfigured(role))?;
        Ok(ProviderHandle { role, binding })
    }

    /// Run a request against a resolved handle with retry and failover.
    pub async fn invoke(
        &self,
        handle: &ProviderHandle,
        request: &ProviderRequest,
    ) -> Result<Invocation<ProviderResponse>, ProviderError> {
        let capability = request.capability();
        let mut last: Option<ProviderError> = None;

        for (index, target) in handle.binding.targets().enumerate() {
            let backend = self
                .backends
                .get(&target.provider)
                .ok_or_else(|| ProviderError::UnknownProvider(target.provider.clone()))?;
            if !backend.supports(capability) {
                return Err(ProviderError::UnsupportedCapability {
                    provider: target.provider.clone(),
                    capability,
                });
            }
            if index > 0 {
                warn!(
                    role = %handle.role,
                    provider = %target.provider,
                    model = %target.model,
                    "failing over to alternate provider"
                );
            }

            for attempt in 0..=self.retry.max_retries {
                if attempt > 0 {
                    tokio::time::sleep(self.retry.delay_for(attempt)).await;
                }

                let started = Instant::now();
                let result = backend.invoke(&target.model, request).await;
                let latency_ms = started.elapsed().as_millis() as u64;

                let result = result.and_then(|response| {
                    if response.capability() == capability {
                        Ok(response)
                    } else {
                        Err(ProviderError::malformed(
                            &target.provider,
                            format!("expected a {} response, got {}", capability, response.capability()),
                        ))
                    }
                });

                let outcome = match &result {
                    Ok(_) => UsageOutcome::Success,
                    Err(e) => UsageOutcome::Failure(e.to_string()),
                };
                self.usage.record(UsageRecord {
                    role: handle.role,
                    provider: target.provider.clone(),
                    model: target.model.clone(),
                    capability,
                    units: request.units(),
                    latency_ms,
                    attempt: attempt + 1,
                    outcome,
                    at: Utc::now(),
                });

                match result {
                    Ok(output) => {
                        return Ok(Invocation {
                            provider: target.provider.clone(),
                            model: target.model.clone(),
                            output,
                        })
                    }
                    Err(e) if e.is_transient() => last = Some(e),
                    Err(e) => return Err(e),
                }
            }
        }

        Err(ProviderError::ProviderUnavailable {
            role: handle.role,
            last: last.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    /// Generate text for `role` using the binding's generation options.
    pub async fn chat(
        &self,
        role: Role,
        messages: Vec<ChatMessage>,
    ) -> Result<Invocation<ChatResponse>, ProviderError> {
        let handle = self.resolve(role)?;
        let request = ProviderRequest::Chat(ChatRequest::new(messages, handle.binding.options));
        let Invocation {
            provider,
            model,
            output,
        } = self.invoke(&handle, &request).await?;
        match output {
            ProviderResponse::Chat(chat) => Ok(Invocation {
                provider,
                model,
                output: chat,
            }),
            other => Err(ProviderError::malformed(
                &provider,
                format!("expected chat response, got {}", other.capability()),
            )),
        }
    }

    /// Embed `inputs` with the embedding role. The returned model id is the
    /// one that actually produced the vectors.
    pub async fn embed(&self, inputs: Vec<String>) -> Result<Invocation<Vec<Vec<f32>>>, ProviderError> {
        let handle = self.resolve(Role::Embedding)?;
        self.embed_with(&handle, inputs).await
    }

    /// Embed `inputs` against an already resolved embedding handle.
    pub async fn embed_with(
        &self,
        handle: &ProviderHandle,
        inputs: Vec<String>,
    ) -> Result<Invocation<Vec<Vec<f32>>>, ProviderError> {
        let expected = inputs.len();
        let request = ProviderRequest::Embed(EmbedRequest { inputs });
        let invocation = self.invoke(handle, &request).await?;
        let Invocation {
            provider,
            model,
            output,
        } = invocation;
        match output {
            ProviderResponse::Embed(vectors) if vectors.len() == expected => Ok(Invocation {
                provider,
                model,
                output: vectors,
            }),
            ProviderResponse::Embed(vectors) => Err(ProviderError::malformed(
                &provider,
                format!("expected {} embeddings, got {}", expected, vectors.len()),
            )),
            other => Err(ProviderError::malformed(
                &provider,
                format!("expected embed response, got {}", other.capability()),
            )),
        }
    }

    pub async fn synthesize(
        &self,
        request: SpeechRequest,
    ) -> Result<Invocation<SpeechResponse>, ProviderError> {
        let handle = self.resolve(Role::Speech)?;
        let Invocation {
            provider,
            model,
            output,
        } = self
            .invoke(&handle, &ProviderRequest::Speech(request))
            .await?;
        match output {
            ProviderResponse::Speech(speech) => Ok(Invocation {
                provider,
                model,
                output: speech,
            }),
            other => Err(ProviderError::malformed(
                &provider,
                format!("expected speech response, got {}", other.capability()),
            )),
        }
    }

    pub async fn transcribe(
        &self,
        request: TranscribeRequest,
    ) -> Result<Invocation<TranscribeResponse>, ProviderError> {
        let handle = self.resolve(Role::Transcription)?;
        let Invocation {
            provider,
            model,
            output,
        } = self
            .invoke(&handle, &ProviderRequest::Transcribe(request))
            .await?;
        match output {
            ProviderResponse::Transcribe(t) => Ok(Invocation {
                provider,
                model,
                output: t,
            }),
            other => Err(ProviderError::malformed(
                &provider,
                format!("expected transcription, got {}", other.capability()),
            )),
        }
    }

    /// Known models grouped by configured provider.
    pub fn available_models(&self) -> BTreeMap<String, Vec<String>> {
        self.backends
            .iter()
            .map(|(name, backend)| (name.clone(), backend.known_models()))
            .collect()
    }
}

/// Translate the `[roles.*]` tables into bindings.
pub fn bindings_from_config(config: &Config) -> anyhow::Result<HashMap<Role, RoleBinding>> {
    let mut bindings = HashMap::new();
    for (name, role_cfg) in &config.roles {
        let role = Role::parse(name)
            .ok_or_else(|| anyhow::anyhow!("Unknown role '{}'", name))?;
        let mut binding = RoleBinding::new(ModelTarget::new(&role_cfg.provider, &role_cfg.model))
            .with_options(role_cfg.options.to_generation());
        for fallback in &role_cfg.fallbacks {
            binding = binding.with_fallback(ModelTarget::new(&fallback.provider, &fallback.model));
        }
        bindings.insert(role, binding);
    }
    Ok(bindings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Flaky {
        name: String,
        fail_first: usize,
        error: ProviderError,
        calls: AtomicUsize,
    }

    impl Flaky {
        fn new(name: &str, fail_first: usize, error: ProviderError) -> Self {
            Self {
                name: name.to_string(),
                fail_first,
                error,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Backend for Flaky {
        fn name(&self) -> &str {
            &self.name
        }

        fn capabilities(&self) -> &[Capability] {
            &[Capability::Chat]
        }

        async fn invoke(
            &self,
            model: &str,
            _request: &ProviderRequest,
        ) -> Result<ProviderResponse, ProviderError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(self.error.clone());
            }
            Ok(ProviderResponse::Chat(ChatResponse {
                text: format!("{}:{}", self.name, model),
                truncated: false,
            }))
        }
    }

    fn rate_limited(p: &str) -> ProviderError {
        ProviderError::RateLimited {
            provider: p.into(),
            message: "slow down".into(),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(9), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn transient_error_is_retried_on_same_target() {
        let mut registry = ProviderRegistry::new(RetryPolicy::immediate(3));
        registry.register_backend(Arc::new(Flaky::new("a", 2, rate_limited("a"))));
        registry
            .set_role(Role::Chat, RoleBinding::new(ModelTarget::new("a", "m1")))
            .unwrap();

        let out = registry
            .chat(Role::Chat, vec![ChatMessage::user("hi")])
            .await
            .unwrap();
        assert_eq!(out.output.text, "a:m1");
        assert_eq!(registry.usage().snapshot().len(), 3);
    }

    #[tokio::test]
    async fn permanent_error_skips_failover() {
        let mut registry = ProviderRegistry::new(RetryPolicy::immediate(3));
        let denied = ProviderError::InvalidCredential {
            provider: "a".into(),
            message: "bad key".into(),
        };
        registry.register_backend(Arc::new(Flaky::new("a", usize::MAX, denied)));
        registry.register_backend(Arc::new(Flaky::new("b", 0, rate_limited("b"))));
        registry
            .set_role(
                Role::Chat,
                RoleBinding::new(ModelTarget::new("a", "m"))
                    .with_fallback(ModelTarget::new("b", "m")),
            )
            .unwrap();

        let err = registry
            .chat(Role::Chat, vec![ChatMessage::user("hi")])
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidCredential { .. }));
        assert_eq!(registry.usage().snapshot().len(), 1);
    }

    #[tokio::test]
    async fn exhausted_targets_report_unavailable() {
        let mut registry = ProviderRegistry::new(RetryPolicy::immediate(1));
        registry.register_backend(Arc::new(Flaky::new("a", usize::MAX, rate_limited("a"))));
        registry
            .set_role(Role::Chat, RoleBinding::new(ModelTarget::new("a", "m")))
            .unwrap();

        let err = registry
            .chat(Role::Chat, vec![ChatMessage::user("hi")])
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::ProviderUnavailable { role: Role::Chat, .. }));
        assert!(err.is_transient());
    }

    #[test]
    fn unconfigured_role_errors_and_rewrite_uses_chat() {
        let mut registry = ProviderRegistry::new(RetryPolicy::immediate(0));
        registry.register_backend(Arc::new(Flaky::new("a", 0, rate_limited("a"))));
        assert!(matches!(
            registry.resolve(Role::Chat),
            Err(ProviderError::RoleNotConfigured(Role::Chat))
        ));

        registry
            .set_role(Role::Chat, RoleBinding::new(ModelTarget::new("a", "m")))
            .unwrap();
        let handle = registry.resolve(Role::QueryRewrite).unwrap();
        assert_eq!(handle.binding.primary.provider, "a");
        assert_eq!(handle.role, Role::QueryRewrite);
    }

    #[test]
    fn binding_checks_capability_and_provider() {
        let mut registry = ProviderRegistry::new(RetryPolicy::immediate(0));
        registry.register_backend(Arc::new(Flaky::new("a", 0, rate_limited("a"))));

        let err = registry
            .set_role(Role::Embedding, RoleBinding::new(ModelTarget::new("a", "m")))
            .unwrap_err();
        assert!(matches!(err, ProviderError::UnsupportedCapability { .. }));

        let err = registry
            .set_role(Role::Chat, RoleBinding::new(ModelTarget::new("zzz", "m")))
            .unwrap_err();
        assert!(matches!(err, ProviderError::UnknownProvider(_)));
    }

    #[test]
    fn reload_is_all_or_nothing() {
        let mut registry = ProviderRegistry::new(RetryPolicy::immediate(0));
        registry.register_backend(Arc::new(Flaky::new("a", 0, rate_limited("a"))));
        registry
            .set_role(Role::Chat, RoleBinding::new(ModelTarget::new("a", "m1")))
            .unwrap();

        let mut next = HashMap::new();
        next.insert(Role::Chat, RoleBinding::new(ModelTarget::new("a", "m2")));
        next.insert(Role::Embedding, RoleBinding::new(ModelTarget::new("a", "m2")));
        assert!(registry.reload(next).is_err());
        assert_eq!(registry.binding(Role::Chat).unwrap().primary.model, "m1");
    }

    #[test]
    fn handle_survives_reload() {
        let mut registry = ProviderRegistry::new(RetryPolicy::immediate(0));
        registry.register_backend(Arc::new(Flaky::new("a", 0, rate_limited("a"))));
        registry
            .set_role(Role::Chat, RoleBinding::new(ModelTarget::new("a", "m1")))
            .unwrap();
        let handle = registry.resolve(Role::Chat).unwrap();

        let mut next = HashMap::new();
        next.insert(Role::Chat, RoleBinding::new(ModelTarget::new("a", "m2")));
        registry.reload(next).unwrap();

        assert_eq!(handle.binding.primary.model, "m1");
        assert_eq!(registry.resolve(Role::Chat).unwrap().binding.primary.model, "m2");
    }

    #[test]
    fn starting_at_drops_earlier_targets() {
        let handle = ProviderHandle {
            role: Role::Embedding,
            binding: RoleBinding::new(ModelTarget::new("a", "m1"))
                .with_fallback(ModelTarget::new("b", "m2"))
                .with_fallback(ModelTarget::new("c", "m3")),
        };

        let pinned = handle.starting_at("b", "m2").unwrap();
        let targets: Vec<&str> = pinned.binding.targets().map(|t| t.provider.as_str()).collect();
        assert_eq!(targets, vec!["b", "c"]);
        assert_eq!(handle.starting_at("a", "m1").unwrap().binding, handle.binding);
        assert!(handle.starting_at("b", "m1").is_none());
    }
}
