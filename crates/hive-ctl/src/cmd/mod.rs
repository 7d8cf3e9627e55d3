//! CLI command modules.

pub mod batch;
pub mod http;
pub mod status;
