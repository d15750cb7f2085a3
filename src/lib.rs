pub mod actions;
pub mod config;
pub mod error;
pub mod flow;
pub mod poller;
pub mod queue;
pub mod registry;
pub mod wait;
