//! HTTP API handlers for pagecast-svc
//!
//! REST endpoints plus two SSE surfaces: the per-request upload stream and
//! the service-wide `/events` feed.

pub mod admin;
pub mod books;
pub mod events;
pub mod health;
pub mod upload;

pub use admin::admin_routes;
pub use books::book_routes;
pub use events::event_stream;
pub use health::health_routes;
pub use upload::upload_routes;
