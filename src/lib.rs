pub mod address;
pub mod arguments;
pub mod cluster;
pub mod config;
pub mod errors;
pub mod license;
pub mod listener;
pub mod logger;
pub mod service;
pub mod session;
pub mod subscriptions;
