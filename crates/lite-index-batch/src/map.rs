use crate::Result;
use crate::config::MapConfig;
use lite_index::{
    BuildConfig, DEFAULT_CHECKPOINT_FREQUENCY, IndexStore, LedgerSource, StoreConfig,
    build_indices, connect_source,
};
use lite_index_backend::{FlushConfig, StoreUrl};
use std::sync::Arc;

/// Store location of the shard written by map job `job`.
pub fn map_job_target(root: &str, job: u32) -> Result<StoreUrl> {
    Ok(StoreUrl::parse(root)?.join(&format!("job_{job}")))
}

/// Runs the map job described by `config` against its configured ledger source.
pub async fn map(config: &MapConfig) -> Result<()> {
    let source = connect_source(&config.txmeta_source)?;
    run_map(config, source).await
}

/// Builds the ledgers of one map job into its own shard.
pub async fn run_map(config: &MapConfig, source: Arc<dyn LedgerSource>) -> Result<()> {
    config.validate()?;

    let range = config.ledger_range()?;
    let target = map_job_target(&config.index_target, config.job_index)?;

    tracing::info!(
        job = config.job_index,
        low = range.low,
        high = range.high,
        ?target,
        "Running map job"
    );

    let backend = lite_index_backend::connect_to(target, FlushConfig::default()).await?;
    let store = Arc::new(IndexStore::new(backend, StoreConfig::default()));

    let build = BuildConfig {
        ledger_range: range,
        modules: config
            .modules
            .iter()
            .map(|module| module.trim().to_string())
            .filter(|module| !module.is_empty())
            .collect(),
        workers: config.worker_count,
        checkpoint_frequency: DEFAULT_CHECKPOINT_FREQUENCY,
    };
    let builder = build_indices(build, source, store).await?;

    tracing::info!(
        job = config.job_index,
        last_built_ledger = builder.last_built_ledger(),
        "Map job done"
    );

    Ok(())
}
