//! Everything that talks to or about the Xray core: the config document,
//! its assembly, the child process, the stats API and the access log.

pub mod access_log;
pub mod assembler;
pub mod ban_list;
pub mod config;
pub mod process;
pub mod stats;
pub mod template;

pub use access_log::AccessLogWatcher;
pub use assembler::assemble;
pub use ban_list::BanList;
pub use config::XrayConfig;
pub use process::{XrayControl, XrayState, XrayStatus, XraySupervisor};
pub use stats::{StatsClient, TrafficSource};
