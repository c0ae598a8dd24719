//! Wiring: one store, one provider registry, and the services built on them.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use crate::chunk::Chunker;
use crate::config::Config;
use crate::embedding::Embedder;
use crate::extract::Extractor;
use crate::ingest::IngestPipeline;
use crate::podcast::PodcastScripter;
use crate::providers::{bindings_from_config, ProviderRegistry, Role, RoleBinding};
use crate::retrieval::Orchestrator;
use crate::store::SqliteStore;

pub struct App {
    pub config: Config,
    pub store: Arc<SqliteStore>,
    pub registry: Arc<ProviderRegistry>,
    pub pipeline: IngestPipeline,
    pub orchestrator: Orchestrator,
    pub podcasts: PodcastScripter,
}

impl App {
    /// Open the database and build providers from `config`.
    pub async fn open(config: Config) -> Result<Self> {
        let store = SqliteStore::open(&config).await?;
        let registry = ProviderRegistry::from_config(&config)?;
        Self::assemble(config, store, registry).await
    }

    /// Build the services around an existing store and registry. Role
    /// bindings saved with [`App::set_role`] are layered over the ones
    /// already in the registry.
    pub async fn assemble(
        config: Config,
        store: SqliteStore,
        registry: ProviderRegistry,
    ) -> Result<Self> {
        let store = Arc::new(store);
        apply_stored_roles(&store, &registry).await?;
        let registry = Arc::new(registry);

        let extractor = Arc::new(Extractor::with_defaults(&config, Arc::clone(&registry))?);
        let embedder = Arc::new(Embedder::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            &config.embedding,
        ));
        let pipeline = IngestPipeline::new(
            Arc::clone(&store),
            extractor,
            Arc::clone(&embedder),
            Chunker::from_config(&config.chunking)?,
            config.ingest.max_concurrent,
            config.ingest.max_bytes,
        );
        let orchestrator = Orchestrator::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            embedder,
            config.retrieval.clone(),
        );
        let podcasts = PodcastScripter::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            config.podcast.clone(),
        );

        Ok(Self {
            config,
            store,
            registry,
            pipeline,
            orchestrator,
            podcasts,
        })
    }

    /// Rebind a role now and persist it for future starts.
    pub async fn set_role(&self, role: Role, binding: RoleBinding) -> Result<()> {
        self.registry.set_role(role, binding.clone())?;
        self.store.save_role(role, &binding).await?;
        Ok(())
    }

    /// Drop a persisted override and return to the configured binding.
    pub async fn reset_role(&self, role: Role) -> Result<()> {
        self.store.delete_role(role).await?;
        let mut bindings: HashMap<Role, RoleBinding> =
            self.registry.bindings().into_iter().collect();
        match bindings_from_config(&self.config)?.remove(&role) {
            Some(configured) => {
                bindings.insert(role, configured);
            }
            None => {
                bindings.remove(&role);
            }
        }
        self.registry.reload(bindings)?;
        Ok(())
    }
}

async fn apply_stored_roles(store: &SqliteStore, registry: &ProviderRegistry) -> Result<()> {
    let stored = store.load_roles().await?;
    if stored.is_empty() {
        return Ok(());
    }
    let known = registry.provider_names();
    let mut bindings: HashMap<Role, RoleBinding> = registry.bindings().into_iter().collect();
    for (role, binding) in stored {
        if let Some(missing) = binding.targets().find(|t| !known.contains(&t.provider)) {
            warn!(
                role = %role,
                provider = %missing.provider,
                "ignoring saved binding for a provider that is no longer configured"
            );
            continue;
        }
        bindings.insert(role, binding);
    }
    registry.reload(bindings)?;
    info!("saved provider roles applied");
    Ok(())
}
