//! # execq
//!
//! Durable work-queue execution engine.
//!
//! Records live in a store (Postgres, or in memory for tests and embedding)
//! and move through `queued → processing → completed | errored | failed`.
//! Workers claim records atomically, heartbeat them while a handler runs,
//! and report the outcome; a resetter returns records whose owner stopped
//! heartbeating. Out-of-process executors use the same contract through an
//! authenticated HTTP proxy.

pub mod client;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod handler;
pub mod model;
pub mod proxy;
pub mod store;
pub mod telemetry;
