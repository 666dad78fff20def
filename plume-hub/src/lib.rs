pub mod api;
pub mod config;
pub mod coordinator;
pub mod credentials;
pub mod migration;
pub mod publisher;
pub mod store;
