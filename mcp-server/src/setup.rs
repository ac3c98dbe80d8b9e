use crate::config::Config;
use anyhow::{Context, Result};
use database::SqliteEntityStore;
use flow_core::flow::FlowConfig;
use std::path::Path;

/// Create the directory that will hold a file-backed database.
pub fn ensure_database_directory(database_url: &str) -> Result<()> {
    if database_url.contains(":memory:") {
        return Ok(());
    }
    let path = database_url.trim_start_matches("sqlite://");
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory {parent:?}"))?;
            tracing::info!(directory = ?parent, "created database directory");
        }
    }
    Ok(())
}

/// Load the flow configuration: an explicit document path, or the
/// built-in defaults. The document is fully validated here; an unknown
/// status anywhere fails startup.
pub fn load_flow_config(config: &Config) -> Result<FlowConfig> {
    match &config.flows.path {
        Some(path) => {
            let document = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read flow configuration from {path}"))?;
            let flows = FlowConfig::from_toml_str(&document)
                .with_context(|| format!("Invalid flow configuration in {path}"))?;
            tracing::info!(version = flows.version(), path = %path, "flow configuration loaded");
            Ok(flows)
        }
        None => {
            tracing::info!("using built-in flow configuration");
            Ok(FlowConfig::default())
        }
    }
}

/// Connect to the configured database and bring the schema up to date.
pub async fn initialize_store(config: &Config) -> Result<SqliteEntityStore> {
    let database_url = config.database_url();
    ensure_database_directory(&database_url)?;
    let store = SqliteEntityStore::new(&database_url)
        .await
        .context("Failed to connect to database")?;
    store.migrate().await.context("Failed to run migrations")?;
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_urls_need_no_directory() {
        assert!(ensure_database_directory(":memory:").is_ok());
    }

    #[test]
    fn nested_directories_are_created() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!(
            "sqlite://{}/nested/deeper/cadence.sqlite",
            dir.path().display()
        );
        ensure_database_directory(&url).unwrap();
        assert!(dir.path().join("nested/deeper").exists());
    }

    #[test]
    fn builtin_flows_load_without_a_path() {
        let config = Config::default();
        let flows = load_flow_config(&config).unwrap();
        assert_eq!(flows.version(), 1);
    }

    #[test]
    fn broken_flow_document_fails_startup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flows.toml");
        std::fs::write(&path, "this is not a flow document").unwrap();

        let mut config = Config::default();
        config.flows.path = Some(path.display().to_string());
        assert!(load_flow_config(&config).is_err());
    }
}
