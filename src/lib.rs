//! # wg-beanstalkd - beanstalkd Job Queue Client
//!
//! An async client for the [beanstalkd](https://beanstalkd.github.io/) work
//! queue, plus a blocking binding for scripting hosts.
//!
//! ## Features
//!
//! - **Producing jobs**: put jobs on a tube with priority, delay and time-to-run
//! - **Consuming jobs**: reserve from a set of watched tubes, with or without a timeout
//! - **Job lifecycle**: delete, release, bury, touch and kick
//! - **Inspection**: peek, stats and tube listings
//! - **Lazy tube sync**: `use`/`watch`/`ignore` are local until a command needs them
//! - **Cancellation**: close the connection from another task to end a blocked reserve
//!
//! ## Quick Start
//!
//! ### Producer
//!
//! ```rust,no_run
//! use wg_beanstalkd::Client;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> wg_beanstalkd::Result<()> {
//!     let mut client = Client::connect("127.0.0.1:11300").await?;
//!
//!     client.use_tube("emails")?;
//!     let id = client
//!         .put(b"hello", 10, Duration::ZERO, Duration::from_secs(60))
//!         .await?;
//!     println!("queued job {id}");
//!
//!     client.close().await
//! }
//! ```
//!
//! ### Consumer
//!
//! ```rust,no_run
//! use wg_beanstalkd::{Client, ClientConfig};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> wg_beanstalkd::Result<()> {
//!     let config = ClientConfig::builder()
//!         .addr("127.0.0.1:11300")
//!         .connect_timeout(Duration::from_secs(2))
//!         .build();
//!     let mut client = Client::new(config).await?;
//!
//!     client.watch("emails")?;
//!     client.ignore("default")?;
//!
//!     loop {
//!         match client.reserve(Some(Duration::from_secs(5))).await {
//!             Ok(job) => {
//!                 println!("got {}: {}", job.id, job.body_lossy());
//!                 client.delete(job.id).await?;
//!             }
//!             Err(e) if e.is_timeout() => continue,
//!             Err(e) => return Err(e),
//!         }
//!     }
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod host;
pub mod job;
pub mod proto;
pub mod transport;
pub mod tube;

// Re-export main types
pub use client::Client;
pub use config::{ClientConfig, ClientConfigBuilder};
pub use error::{Error, ErrorKind, ProtocolError, Result};
pub use host::{HostModule, HostObject, ModuleRegistry, ScriptClient, MODULE_ID};
pub use job::{Job, JobId, PutOptions, Stats};
pub use transport::{CloseHandle, TcpTransport, Transport};
pub use tube::{TubeRegistry, DEFAULT_TUBE};
