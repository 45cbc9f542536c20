pub mod agent;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod review;
pub mod scm;
pub mod server;
pub mod shutdown;
pub mod state;
pub mod webhook;
pub mod workflow;
pub mod worktree;
