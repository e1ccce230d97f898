//! codectx: a local context engine for coding assistants.
//!
//! Combines a persistent memory store (SQLite or a file-backed vector store),
//! a per-language symbol index with optional language server support, and an
//! orchestrator that assembles both into context bundles for model queries.

pub mod config;
pub mod context;
pub mod embedding;
pub mod error;
pub mod indexer;
pub mod memory;

pub use config::{CodectxConfig, ConfigManager};
pub use context::{AgentResponse, ContextBundle, ContextOrchestrator, CursorPosition};
pub use error::{CodectxError, Result};
