//! Core library for the powerd controller.
//!
//! This library contains the device-control runtime: hardware access,
//! relay authority, sensor polling, rule engine, scheduler, configuration
//! and the command bus, plus the HTTP/WebSocket surface that fronts it.
//! The binary in `main.rs` assembles the components and runs them.

pub mod api;
pub mod bus;
pub mod config;
pub mod error;
pub mod hardware;
pub mod relay;
pub mod rules;
pub mod schedule;
pub mod sensor;
pub mod settings;
pub mod store;
pub mod stream;
pub mod system;
