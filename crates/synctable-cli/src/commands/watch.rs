//! Watch command handler

use anyhow::{Context, Result};
use tokio::sync::broadcast::error::RecvError;

use synctable_core::{
    Config, MuxClient, Query, QueryOption, Schema, SyncState, TableCache, TableEvent,
};

use crate::output::Output;

/// Print a live table until Ctrl-C, or just its first snapshot with `once`
pub async fn run(
    config: &Config,
    query: &str,
    order_by: Option<String>,
    limit: Option<u64>,
    once: bool,
    output: &Output,
) -> Result<()> {
    let query = Query::parse(query).context("Invalid query")?;
    let options = query_options(order_by, limit);

    output.message(&format!("Connecting to {}...", config.url));
    let (client, link) = MuxClient::websocket(config.websocket_config());
    let cache = TableCache::new(Schema::new(), config.table_options());
    let table = cache
        .synctable(query, options, client)
        .await
        .context("Failed to open table")?;

    let mut events = table.subscribe();
    let mut state = table.watch_state();

    tokio::select! {
        synced = state.wait_for(|s| *s == SyncState::Synced) => {
            synced.context("Table closed before syncing")?;
        }
        _ = tokio::signal::ctrl_c() => {
            table.close().await;
            link.shutdown().await;
            return Ok(());
        }
    }
    output.print_rows(&table.get());

    if !once {
        let mut last_state = SyncState::Synced;
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let now = *state.borrow_and_update();
                    if now != last_state {
                        output.message(&format!("-- {} --", now.as_str()));
                        last_state = now;
                    }
                }
                event = events.recv() => match event {
                    Ok(TableEvent::Changed { keys, origin }) => {
                        let rows = table.get();
                        for key in &keys {
                            output.print_change(key, rows.get(key), origin);
                        }
                    }
                    Ok(TableEvent::Acknowledged { .. }) => {}
                    Ok(TableEvent::Rejected { id, message, .. }) => {
                        output.warning(&format!("Write {} rejected: {}", id, message));
                    }
                    Ok(TableEvent::Error(message)) => output.warning(&message),
                    Err(RecvError::Lagged(_)) => output.print_rows(&table.get()),
                    Err(RecvError::Closed) => break,
                },
            }
        }
    }

    table.close().await;
    link.shutdown().await;
    Ok(())
}

fn query_options(order_by: Option<String>, limit: Option<u64>) -> Vec<QueryOption> {
    let mut options = Vec::new();
    if let Some(column) = order_by {
        options.push(QueryOption::OrderBy(column));
    }
    if let Some(limit) = limit {
        options.push(QueryOption::Limit(limit));
    }
    options
}
