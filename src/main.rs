use std::env;
use std::sync::Arc;

use spacekeeper_adapter::MockBrowserAdapter;
use spacekeeper_core::{Spaces, SpacesConfig};

/// Demo entry point: wires a `FileDurableStore` and the in-process mock
/// browser adapter behind the engine, runs one reconciliation pass, and
/// exits. A real embedding reads window/tab events off its own browser
/// adapter instead of `MockBrowserAdapter` and keeps the process alive.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    log::info!("Starting spacekeeper v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Reconciliation engine for persistent browser-window spaces");
    log::info!("Homepage: https://deepforkcyber.com");

    let data_dir = env::var("SPACEKEEPER_DATA_DIR").unwrap_or_else(|_| "./spacekeeper-data".into());
    let config = match env::var("SPACEKEEPER_CONFIG") {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path)?;
            SpacesConfig::from_toml_str(&raw)?
        }
        Err(_) => SpacesConfig::default(),
    };

    std::fs::create_dir_all(&data_dir)?;
    let state_path = std::path::Path::new(&data_dir).join("state.json");
    let store = Arc::new(spacekeeper_core::FileDurableStore::new(state_path));
    let adapter = Arc::new(MockBrowserAdapter::new());

    let spaces = Spaces::bootstrap(store, adapter.clone(), config).await?;
    log::info!("engine initialized against data dir {data_dir}");

    let window_id = adapter.spawn_window("demo-1", vec!["https://example.com".into()]).await;
    spaces.engine.handle_window_created(&window_id).await?;
    spaces.engine.synchronize_windows_and_spaces().await?;

    let (active, closed) = spaces.engine.get_all_spaces().await;
    log::info!("spaces: {} active, {} closed", active.len(), closed.len());

    spaces.engine.handle_shutdown().await?;
    Ok(())
}
