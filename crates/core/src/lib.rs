//! Domain logic for the leased node fleet.
//!
//! Everything here is storage-agnostic: persistence is reached through the
//! [`registry::NodeStore`] trait, and the script queue only touches the
//! filesystem beneath its configured working root.

pub mod criteria;
pub mod error;
pub mod expiration;
pub mod node;
pub mod registry;
pub mod scripting;
pub mod secrets;
pub mod types;
