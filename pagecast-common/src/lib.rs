//! # Pagecast Common Library
//!
//! Shared code for the Pagecast narration service including:
//! - Error and result types
//! - Bootstrap configuration and root folder resolution
//! - Event types (PagecastEvent enum) and the EventBus
//! - SSE helpers
//! - Database initialization
//! - Clock abstraction and timestamp conversion

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod sse;
pub mod time;

pub use error::{Error, Result};
pub use time::{Clock, ManualClock, SystemClock};
