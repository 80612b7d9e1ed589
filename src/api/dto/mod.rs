//! Data Transfer Objects for REST request/response serialization.
//!
//! Inbound JSON blobs are objects on the wire and text in the repository.

pub mod inbound_dto;
pub mod server_dto;

pub use inbound_dto::*;
pub use server_dto::*;
