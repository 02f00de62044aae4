pub mod access;
pub mod chat;
pub mod config;
pub mod context;
pub mod error;
pub mod identity;
pub mod llm;
pub mod server;
pub mod store;
