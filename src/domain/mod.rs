//! Domain layer: the panel's persisted model and its event system.
//!
//! This module contains inbounds and their embedded clients, traffic
//! counters, share-link rendering, the restart signal shared by writers and
//! the reconciler, and the event bus for broadcasting lifecycle decisions.

pub mod client;
pub mod event_bus;
pub mod host;
pub mod inbound;
pub mod panel_event;
pub mod restart_signal;
pub mod share_link;
pub mod traffic;

pub use client::{Client, InboundSettings};
pub use event_bus::EventBus;
pub use host::{Host, StaticHost};
pub use inbound::{Inbound, Protocol};
pub use panel_event::{DisableReason, PanelEvent};
pub use restart_signal::{RestartRequest, RestartSignal};
pub use share_link::{ShareLink, build_links};
pub use traffic::{ClientDelta, ClientTraffic, TagTraffic, TrafficSample};
