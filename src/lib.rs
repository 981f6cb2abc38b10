//! Outreach engine — outbound dispatch and delivery feedback core.

pub mod channels;
pub mod config;
pub mod content;
pub mod dispatch;
pub mod error;
pub mod feedback;
pub mod gate;
pub mod operator;
pub mod policy;
pub mod store;
pub mod targets;

pub use error::{Error, Result};
