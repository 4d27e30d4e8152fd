//! # SmartShelf Configuration
//!
//! Type-safe configuration for the content pipeline: concurrency limits,
//! per-stage timeouts, retry/backoff policy, bottleneck and health thresholds.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use shelf_config::ConfigLoader;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ConfigLoader::load_from_file("shelf.toml").await?;
//!     println!("max concurrent: {}", config.max_concurrent_pipelines);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod config;
mod error;
mod loader;

pub use config::*;
pub use error::*;
pub use loader::*;
