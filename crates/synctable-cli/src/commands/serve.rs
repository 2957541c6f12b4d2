//! Serve command handler

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use synctable_core::{serve_websocket, Config, MemoryBackend};

use crate::output::Output;

/// Run the changefeed server until Ctrl-C
pub async fn run(
    config: &Config,
    bind: Option<String>,
    seed: Option<PathBuf>,
    output: &Output,
) -> Result<()> {
    let backend = MemoryBackend::default();

    if let Some(path) = seed {
        let value = load_seed(&path)?;
        let count = seed_backend(&backend, &value)?;
        output.message(&format!("Seeded {} row(s)", count));
    }

    let bind = bind.unwrap_or_else(|| config.bind.clone());
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to listen on {}", bind))?;
    output.success(&format!("Serving on ws://{}", listener.local_addr()?));

    let shutdown = CancellationToken::new();
    let server = tokio::spawn(serve_websocket(
        backend.clone(),
        listener,
        config.write_buffer,
        shutdown.clone(),
    ));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");
    shutdown.cancel();
    server.await.context("Server task failed")??;

    output.message(&format!(
        "Stopped at version {} with {} live subscription(s)",
        backend.version(),
        backend.subscription_count()
    ));
    Ok(())
}

/// Read a JSON seed file
pub fn load_seed(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read seed file: {:?}", path))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse seed file: {:?}", path))
}

/// Load `{"table": [record, ...], ...}` into `backend`; returns the row count
pub fn seed_backend(backend: &MemoryBackend, seed: &Value) -> Result<usize> {
    let Some(tables) = seed.as_object() else {
        bail!("Seed must be an object mapping table names to arrays of records");
    };

    let mut count = 0;
    for (table, rows) in tables {
        let Some(rows) = rows.as_array() else {
            bail!("Seed table '{}' must be an array", table);
        };
        for row in rows {
            let Some(record) = row.as_object() else {
                bail!("Seed rows of '{}' must be objects", table);
            };
            backend
                .upsert(table, record.clone())
                .with_context(|| format!("Bad seed row in '{}'", table))?;
            count += 1;
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_seed_backend() {
        let backend = MemoryBackend::default();
        let seed = json!({
            "tasks": [{"id": "t1", "done": false}, {"id": "t2", "done": true}],
            "notes": [{"id": "n1", "body": "hi"}]
        });

        assert_eq!(seed_backend(&backend, &seed).unwrap(), 3);
        assert_eq!(backend.rows("tasks").len(), 2);
        assert_eq!(backend.rows("notes").len(), 1);
    }

    #[test]
    fn test_load_seed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seed.json");
        std::fs::write(&path, r#"{"tasks": [{"id": "t1", "title": "from disk"}]}"#).unwrap();

        let backend = MemoryBackend::default();
        assert_eq!(seed_backend(&backend, &load_seed(&path).unwrap()).unwrap(), 1);
        assert_eq!(backend.rows("tasks")[0]["title"], json!("from disk"));

        std::fs::write(&path, "{not json").unwrap();
        let err = load_seed(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse seed file"));
        assert!(load_seed(&dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_seed_rejects_bad_shapes() {
        let backend = MemoryBackend::default();
        assert!(seed_backend(&backend, &json!([1, 2])).is_err());
        assert!(seed_backend(&backend, &json!({"tasks": {"id": "t1"}})).is_err());
        assert!(seed_backend(&backend, &json!({"tasks": [{"title": "no key"}]})).is_err());
    }
}
