pub mod config;
pub mod docker;
pub mod errors;
pub mod hosts;
pub mod lifecycle;
pub mod nginx;
pub mod remote;
pub mod schedule;
pub mod store;
pub mod terminal;
pub mod vault;
