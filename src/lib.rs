//! likeness-db: a persistent image-similarity index
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      HTTP API (axum)                        │
//! │     POST /api/upload, POST /api/find_similar, GET /health   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Coordinator                            │
//! │   Uninitialized → Ready · single writer · many readers      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │             likeness-core: index + snapshots                │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod coordinator;
pub mod server;

pub use config::ServiceConfig;
pub use coordinator::{
    Coordinator, CoordinatorError, CoordinatorState, InsertOutcome, Match, PersistenceWarning,
    StartupReport, StartupSource,
};
pub use likeness_core;
