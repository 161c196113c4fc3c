pub mod auth;
pub mod capture;
pub mod conf;
pub mod data;
pub mod docs;
pub mod error;
pub mod estimate;
pub mod idp;
pub mod jwt;
pub mod queue;
pub mod relay;
pub mod server;
pub mod tracing;
pub mod types;
