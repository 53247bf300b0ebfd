//! # Explorer Engine: composable explorer state and search pipeline
//!
//! An explorer lets a user pick series out of a large set of tracked runs,
//! group them and look at them through a handful of visualizations. This
//! crate is the engine behind such an explorer: one observable state store
//! shared by a set of small sub-engines, plus a staged search pipeline that
//! caches every stage.
//!
//! ## Architecture
//!
//! - **Store**: a single copy-on-write [`ExplorerState`] with typed slices and
//!   change subscriptions ([`store`])
//! - **Sub-engines**: notifications, custom states, query, groupings,
//!   instructions, pipeline, visualizations, events and blob handles, each
//!   owning one slice ([`engine`])
//! - **Pipeline**: adapter → grouping → query → custom stages with chained
//!   cache keys ([`pipeline`])
//! - **Persistence**: query/grouping specs in the URL of an in-memory
//!   [`History`], navigation and visualization controls in a
//!   [`persistence::KeyValueStorage`]
//! - **Scripting**: Rhai-based custom stage ([`pipeline::ScriptProcessor`])
//!
//! ## Configuration
//!
//! An [`ExplorerConfig`] is loaded from TOML or JSON. Durable storage defaults
//! to the platform data directory under `dev.explorer-engine`:
//!
//! - **Linux**: `~/.local/share/dev.explorer-engine/`
//! - **macOS**: `~/Library/Application Support/dev.explorer-engine/`
//! - **Windows**: `%APPDATA%\dev.explorer-engine\`
//!
//! ## Example
//!
//! ```ignore
//! use explorer_engine::{
//!     engine::{ExplorerEngine, StaticInstructions},
//!     types::Instruction,
//!     ExplorerConfig,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> explorer_engine::Result<()> {
//!     let source = StaticInstructions::new(vec![Instruction::new("run-1", "loss")]);
//!     let engine = ExplorerEngine::new(ExplorerConfig::default(), Arc::new(source));
//!
//!     let teardown = engine.initialize().await?;
//!     println!("{:?}: {} records", engine.pipeline().status(), engine.pipeline().output().len());
//!     teardown.run();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod devtools;
pub mod engine;
pub mod error;
pub mod id;
pub mod navigation;
pub mod persistence;
pub mod pipeline;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use config::ExplorerConfig;
pub use engine::{EngineTeardown, ExplorerEngine, ExplorerEngineBuilder, SearchOutcome};
pub use error::{EngineError, Result, ResultExt};
pub use navigation::{History, Location};
pub use store::{ExplorerState, Store};
pub use types::{FlatRecord, Instruction, RecordSet, SequenceType};
