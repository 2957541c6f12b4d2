#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use synctable_core::{
    Client, MemoryBackend, MuxClient, Multiplexer, Query, Record, SyncState, Table, TableOptions,
};

pub const DEADLINE: Duration = Duration::from_secs(5);

pub fn record(value: Value) -> Record {
    value.as_object().cloned().expect("record literal must be an object")
}

pub fn query(text: &str) -> Query {
    Query::parse(text).expect("valid query")
}

pub fn fast_options() -> TableOptions {
    TableOptions {
        flush_interval: Duration::from_millis(5),
        save_timeout: Duration::from_secs(5),
        reconnect_initial: Duration::from_millis(10),
        reconnect_max: Duration::from_millis(50),
        ..TableOptions::default()
    }
}

/// A client connected to `backend` over an in-memory link
pub struct Harness {
    pub backend: MemoryBackend,
    pub mux: Multiplexer,
    pub client: Arc<MuxClient>,
}

impl Harness {
    pub fn new(backend: &MemoryBackend) -> Self {
        let mux = Multiplexer::new();
        let client = Arc::new(MuxClient::new(mux.clone()));
        backend.connect(&mux, 64);
        Self {
            backend: backend.clone(),
            mux,
            client,
        }
    }

    pub fn client(&self) -> Arc<dyn Client> {
        self.client.clone()
    }

    /// Drop the physical link
    pub fn disconnect(&self) {
        self.mux.detach();
    }

    /// Attach a fresh physical link
    pub fn reconnect(&self) {
        self.backend.connect(&self.mux, 64);
    }
}

pub async fn wait_state(table: &dyn Table, wanted: SyncState) {
    let mut state = table.watch_state();
    tokio::time::timeout(DEADLINE, state.wait_for(|s| *s == wanted))
        .await
        .unwrap_or_else(|_| panic!("table never reached {:?}", wanted))
        .expect("state sender dropped");
}

/// Poll `condition` until it holds
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + DEADLINE;
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
