//! queue-schema - schema migrations for the Queues table.
//!
//! Migration steps mutate schema only through a [`repository::QueryInterface`]
//! handed to them by the [`repository::Migrator`], which owns connections,
//! transactions and the record of applied steps.

pub mod config;
pub mod migrations;
pub mod repository;
