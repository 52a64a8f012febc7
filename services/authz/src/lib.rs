//! Hivelink Authorization Backend
//!
//! HTTP hooks the broker calls to authorize device connections. Each hook is
//! scoped to a template by its path, `POST /auth/{templateId}/{hook}`, and
//! answers `allow` or `deny` from the device's directory record. There is no
//! decision cache: every request is evaluated against the directory.

pub mod api;
pub mod config;
pub mod decision;

pub use api::{create_router, start_api_server, AppState};
pub use config::Config;
pub use decision::{decide, AuthRequest, Decision, Permission, ResourceKind};
