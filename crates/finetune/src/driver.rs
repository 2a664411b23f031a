//! Sweep over checkpoints and article counts

use crate::config::DriverConfig;
use crate::orchestrator::FineTuningOrchestrator;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;
use sumtune_core::data::load_table;
use sumtune_core::error::Result;
use sumtune_core::hub::{fine_tuned_repo_name, HubCredentials};

/// Fine-tune every configured checkpoint on every article count.
///
/// Runs are sequential. Returns the wall-clock seconds per published repository name.
pub fn run(config: &DriverConfig) -> Result<BTreeMap<String, f64>> {
    config.validate()?;
    let credentials = HubCredentials::from_env();

    let full_data = load_table(&config.data_path)?.drop_missing();
    tracing::info!("{} complete rows in {}", full_data.len(), config.data_path.display());

    let mut times = BTreeMap::new();
    for checkpoint in &config.models {
        for &article_count in &config.article_counts {
            let start = Instant::now();
            tracing::info!("Finetuning {} on {} articles", checkpoint, article_count);

            let mut data = full_data.tail(article_count);
            tracing::info!("Using {} rows", data.len());

            let options = config
                .orchestrator
                .clone()
                .with_token(credentials.read_token.clone());
            let mut orchestrator = FineTuningOrchestrator::with_options(checkpoint, options)?;
            let summary = orchestrator.perform_fine_tuning(&mut data, config.test_size)?;
            if let Some(metrics) = summary.final_eval_metrics() {
                tracing::info!("Final metrics: {:?}", metrics);
            }

            let repo_id = fine_tuned_repo_name(
                &config.organization,
                published_name(checkpoint),
                &config.version,
                article_count,
            )?;
            if let Some(store_dir) = &config.store_dir {
                orchestrator.store_fine_tuned_model(store_dir.join(repo_id.replace('/', "__")))?;
            }
            if config.publish {
                orchestrator.push_to_hub(&repo_id, credentials.require_write_token()?)?;
            }

            let elapsed = start.elapsed().as_secs_f64().round();
            times.insert(repo_id, elapsed);
            tracing::info!("{:?}", times);
        }
    }
    Ok(times)
}

/// Name a checkpoint is published under: the directory name for local
/// checkpoints, the hub id otherwise
pub fn published_name(checkpoint: &str) -> &str {
    let path = Path::new(checkpoint);
    if path.is_dir() {
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            return name;
        }
    }
    checkpoint
}

/// Render the elapsed-time table
pub fn format_times(times: &BTreeMap<String, f64>) -> String {
    let width = times.keys().map(String::len).max().unwrap_or(0);
    times
        .iter()
        .map(|(repo, secs)| format!("{:<width$}  {:>8.0}s", repo, secs, width = width))
        .collect::<Vec<_>>()
        .join("\n")
}
