//! Binding core: engine entry points, storage backends, statements, functions
//! and change events

pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod events;
pub mod function;
#[cfg(feature = "async")]
pub mod sandbox;
pub mod statement;
pub mod uri;
pub mod value;
pub mod vfs;
