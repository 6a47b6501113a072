//! docroles: migrate free-text document access roles to organization role
//! records, with a per-document backup that makes the change reversible.

pub mod aliases;
pub mod build_info;
pub mod commands;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod output;
pub mod report;
pub mod resolver;
pub mod store;
pub mod validate;
