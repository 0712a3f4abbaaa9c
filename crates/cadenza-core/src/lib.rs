// src/lib.rs
//! Static file server on edge-triggered, one-shot epoll.
//!
//! A single reactor thread owns every socket; a fixed worker pool parses
//! requests and stages responses; file bodies go out straight from a
//! read-only memory mapping via scatter/gather `sendmsg`.
//!
//! ```rust,no_run
//! use cadenza_core::{Server, ServerConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig { doc_root: "./www".into(), ..ServerConfig::default() };
//!     Server::bind(config)?.serve()?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod conn;
pub mod error;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod parser;
pub mod pool;
pub mod reactor;
pub mod resolver;
pub mod response;
pub mod scanner;
pub mod server;
pub mod slab;
pub mod syscalls;

// Re-exports for users
pub use config::ServerConfig;
pub use error::{ServeError, ServeResult};
pub use http::{Method, Status};
pub use logging::LogFormat;
pub use metrics::{MetricsSnapshot, ServerMetrics};
pub use server::{Server, ShutdownHandle};
pub use syscalls::Interest;
