use crate::market_data::MarketDataSnapshot;
use anyhow::{anyhow, Result};
use log::info;
use std::path::{Path, PathBuf};
use tokio::fs;

pub async fn ensure_market_data_file(path: &Path) -> Result<()> {
    if fs::metadata(path).await.is_ok() {
        return Ok(());
    }

    Err(anyhow!(
        "Market data snapshot not found at {}. Create it with `import-closes` before running this command.",
        path.display()
    ))
}

pub async fn run(input_path: &Path, output_path: &Path) -> Result<()> {
    info!(
        "Importing close prices from {} into {}",
        input_path.display(),
        output_path.display()
    );

    let input: PathBuf = input_path.to_path_buf();
    let output: PathBuf = output_path.to_path_buf();
    let tickers = tokio::task::spawn_blocking(move || -> Result<usize> {
        let snapshot = MarketDataSnapshot::from_json_file(&input)?;
        snapshot.save_to_file(&output)?;
        Ok(snapshot.histories().len())
    })
    .await??;

    info!(
        "Market data snapshot with {} tickers written to {}",
        tickers,
        output_path.display()
    );
    Ok(())
}
