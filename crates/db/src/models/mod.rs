//! Row types for the registry tables and their conversions into core types.

pub mod lease;
pub mod server_node;
pub mod server_node_event;
