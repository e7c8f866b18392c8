use std::env;
use std::path::PathBuf;

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::analysis::figure::build_figure;
use crate::config::FigureConfig;
use crate::helper_functions::{project_root, resolve_path};

mod analysis;
mod config;
mod data_handling;
mod helper_functions;
mod models;

/// Optional JSON figure description; defaults reproduce Figure 1
const CONFIG_ENV: &str = "FIGURE_CONFIG";

fn main() -> anyhow::Result<()> {
    // Setup logging and project configuration
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting the validation figure pipeline");

    let root = project_root();
    info!("Project root: {}", root.display());

    let config = match env::var_os(CONFIG_ENV) {
        Some(path) => {
            let path = resolve_path(&root, &PathBuf::from(path));
            FigureConfig::from_json(&path)
                .with_context(|| format!("reading figure configuration {}", path.display()))?
        }
        None => FigureConfig::default(),
    };

    let output = build_figure(&config, &root).map_err(|e| {
        error!("Figure generation failed: {}", e);
        e
    })?;

    info!("Done: {}", output.display());
    Ok(())
}
