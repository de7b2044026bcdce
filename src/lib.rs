//! SSH gateway that relays sessions to upstream SSH servers.
//!
//! Each configured flow owns a backend [`Repository`](backend::Repository)
//! that decides whether a principal may log in and builds a per-session
//! [`Proxy`](backend::Proxy). The `remote` backend opens a second SSH hop for
//! every shell, exec or sftp task and relays bytes in both directions.

pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod relay;
pub mod ssh;
pub mod template;
pub mod upstream;
