//! Preview sandbox service: throwaway, network-reachable environments for
//! AI-generated projects, with a hard lifetime ceiling enforced by layered
//! cleanup.

pub mod config;
pub mod error;
pub mod gateway;
pub mod http_server;
pub mod lifetime;
pub mod limiter;
pub mod provisioner;
pub mod proxy;
pub mod reaper;
pub mod registry;
pub mod runtime;
pub mod state;
pub mod supervisor;
pub mod workspace;

pub use error::{AppError, Result};
