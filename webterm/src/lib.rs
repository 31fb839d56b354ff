//! A server that gives each browser terminal its own shell over WebSocket.

pub mod cli;
pub mod config;
pub mod gateway;
pub mod log;
pub mod server;
