//! # xray-panel
//!
//! Control-panel core for a local Xray proxy server.
//!
//! The panel keeps inbounds and their clients in SQLite, assembles a
//! complete Xray config from a template plus the stored inbounds, supervises
//! the Xray child process, and runs a periodic accounting loop that pulls
//! traffic counters over Xray's gRPC stats API, disables clients that ran out
//! of quota or time, and bans source IPs beyond a client's limit.
//!
//! ## Architecture
//!
//! ```text
//! Admin (HTTP)
//!     │
//!     ├── REST Handlers (api/)
//!     │
//!     ├── InboundService / DatabaseService (service/)
//!     ├── Reconciler ── Scheduler ── Accountant (service/)
//!     ├── EventBus, RestartSignal (domain/)
//!     │
//!     ├── Assembler, XraySupervisor, StatsClient, AccessLogWatcher (xray/)
//!     │
//!     └── SQLite Persistence (persistence/)
//! ```

pub mod api;
pub mod app_state;
pub mod config;
pub mod domain;
pub mod error;
pub mod persistence;
pub mod service;
pub mod xray;
