pub mod config;
pub mod context;
pub mod db;
pub mod debug_module;
pub mod dispatcher;
pub mod engine;
pub mod handlers;
pub mod learning;
pub mod notifier;
pub mod registry;
pub mod suite;
pub mod tracer;
pub mod types;

pub use types::*;
