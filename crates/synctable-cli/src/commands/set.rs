//! Set command handler

use anyhow::{bail, Context, Result};
use serde_json::Value;

use synctable_core::{
    table, Config, Connectivity, MuxClient, Query, QueryOption, Record, Schema,
};

use crate::output::Output;

/// Write (or delete) one record and wait until the server acknowledges it
pub async fn run(
    config: &Config,
    table_name: &str,
    record: &str,
    delete: bool,
    output: &Output,
) -> Result<()> {
    let record = parse_record(record)?;
    let query = Query::new(table_name, template(&record));
    // Nothing to read back: only the write matters
    let options = vec![QueryOption::NoChangefeed, QueryOption::Limit(0)];

    let (client, link) = MuxClient::websocket(config.websocket_config());
    let mut connectivity = client.multiplexer().connectivity();
    let online = tokio::time::timeout(
        config.table_options().save_timeout,
        connectivity.wait_for(|c| *c == Connectivity::Online),
    )
    .await
    .is_ok_and(|changed| changed.is_ok());
    if !online {
        link.shutdown().await;
        bail!("Could not reach {}", config.url);
    }

    let result = async {
        let table = table::open(
            query,
            options,
            &Schema::new(),
            client.clone(),
            config.table_options(),
        )
        .await
        .context("Failed to open table")?;

        let key = if delete {
            table.delete(&record)?
        } else {
            table.set(record.clone())?
        };
        let saved = table.save().await;
        let row = table.get_one(&record);
        table.close().await;

        saved.with_context(|| format!("Write to {} not saved", key))?;
        output.print_record(&key, row.as_ref());
        Ok::<(), anyhow::Error>(())
    }
    .await;

    link.shutdown().await;
    result
}

fn parse_record(text: &str) -> Result<Record> {
    match serde_json::from_str(text).context("Record must be valid JSON")? {
        Value::Object(record) => Ok(record),
        _ => bail!("Record must be a JSON object"),
    }
}

/// Query template naming every field of `record`
fn template(record: &Record) -> Record {
    record.keys().map(|k| (k.clone(), Value::Null)).collect()
}
