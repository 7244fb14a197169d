pub mod evaluate;
pub mod forecast_all;
pub mod import_closes;
pub mod predict;
pub mod train;

use crate::persistence::write_atomically;
use anyhow::{Context, Result};
use serde::Serialize;
use std::io::Write;
use std::path::Path;

pub(crate) fn write_json<T: Serialize>(output: Option<&Path>, value: &T) -> Result<()> {
    match output {
        Some(path) => write_atomically(path, |writer| {
            serde_json::to_writer_pretty(&mut *writer, value).context("Failed to encode JSON")?;
            writer.write_all(b"\n")?;
            Ok(())
        })
        .with_context(|| format!("Failed to write {}", path.display())),
        None => {
            let stdout = std::io::stdout();
            let mut handle = stdout.lock();
            serde_json::to_writer_pretty(&mut handle, value).context("Failed to encode JSON")?;
            handle.write_all(b"\n")?;
            Ok(())
        }
    }
}
