pub mod artifact;
pub mod bbox;
pub mod catalog;
pub mod config;
pub mod invoker;
pub mod panel;
pub mod server;
