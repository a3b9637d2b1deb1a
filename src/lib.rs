//! # resql
//!
//! Rust client for resql, a clustered SQL service speaking a compact
//! length-prefixed binary protocol over TCP.
//!
//! ## Architecture
//!
//! - **Session**: the client connects under a stable name; the cluster
//!   remembers the session across reconnects and deduplicates re-sent
//!   writes by sequence number, so a mutating batch is applied exactly
//!   once even when the connection dies mid-call.
//! - **Failover**: the client rotates through a list of candidate
//!   endpoints and adopts fresher lists announced by the cluster, so it
//!   follows leader changes without reconfiguration.
//! - **Batching**: statements are queued locally with their parameter
//!   bindings and sent as one framed request; the response is decoded
//!   in place into one result set per statement.
//!
//! ## Example
//!
//! ```ignore
//! use resql::Client;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), resql::Error> {
//!     let mut client = Client::builder("my-cluster")
//!         .url("tcp://127.0.0.1:7600")
//!         .connect()
//!         .await?;
//!
//!     client.put("SELECT name, points FROM players WHERE points > ?")?;
//!     client.bind_index(0, 100i64)?;
//!
//!     let mut rs = client.execute(true).await?;
//!     while let Some(row) = rs.next_row()? {
//!         println!("{:?} {:?}", row.get("name")?, row.get("points")?);
//!     }
//!
//!     client.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod protocol;

mod client;
mod config;
mod error;
mod result;
mod value;

pub use client::{Client, PreparedStatement};
pub use config::{ClientBuilder, DEFAULT_TIMEOUT, MIN_TIMEOUT};
pub use error::{Error, Result};
pub use protocol::wire::ResponseCode;
pub use result::{ResultSet, Row};
pub use value::Value;
