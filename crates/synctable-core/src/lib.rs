//! Synctable Core Library
//!
//! Live, versioned mirrors of query result sets shared between a client and
//! a server, with optimistic local writes, many tables multiplexed over one
//! physical connection, and transparent recovery from disconnects.
//!
//! # Architecture
//!
//! - **Channels**: named streams multiplexed over one websocket
//! - **Tables**: a driver task per query reconciles server snapshots, pushed
//!   updates and acknowledgements with local writes
//! - **Cache**: one live table per query key, reference counted
//!
//! # Quick Start
//!
//! ```text
//! let (client, link) = MuxClient::websocket(config.websocket_config());
//! let cache = TableCache::new(Schema::new(), config.table_options());
//!
//! let query = Query::parse(r#"{"tasks": [{"id": null, "done": null}]}"#)?;
//! let tasks = cache.synctable(query, vec![], client).await?;
//!
//! tasks.set(record)?;   // visible immediately
//! tasks.save().await?;  // acknowledged by the server
//! ```
//!
//! # Modules
//!
//! - `query`: queries, options, query keys and primary-key schema
//! - `record`: records, row keys and versioned changes
//! - `protocol`: wire frames
//! - `transport`: physical connections and the websocket bridge
//! - `channel`: the channel multiplexer
//! - `client`: what tables need from their host process
//! - `table`: the table variants and their shared state
//! - `cache`: the process-wide table cache
//! - `backend`: in-memory changefeed server
//! - `config`: application configuration

pub mod backend;
pub mod cache;
pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod query;
pub mod record;
pub mod table;
pub mod transport;

pub use backend::{serve_websocket, MemoryBackend, Validator};
pub use cache::{CachedTable, TableCache};
pub use channel::{Channel, ChannelEvent, Connectivity, Multiplexer, ReadyState};
pub use client::{
    Client, MuxClient, QueryRequest, WebsocketConfig, WebsocketHandle, WriteOutcome, WriteRequest,
};
pub use config::Config;
pub use error::{SyncError, SyncResult};
pub use protocol::{Frame, Payload};
pub use query::{Query, QueryKey, QueryOption, Schema};
pub use record::{Record, RowKey, VersionedChange};
pub use table::{
    ChangeOrigin, NoChangefeedTable, NoDatabaseTable, Rows, SyncState, SyncTable, Table,
    TableEvent, TableOptions, TableStore,
};
pub use transport::Transport;
