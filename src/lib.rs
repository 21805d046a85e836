//! openTPT: in-vehicle motorsport telemetry appliance.
//!
//! Sensor handlers each own a worker thread and publish immutable snapshots
//! into depth-2 bounded queues; a single render loop pulls the latest
//! snapshot per source without blocking, drives the domain engines (lap
//! timing, pit timer, fuel tracking, CoPilot) and assembles the display
//! frame plus secondary outputs.

pub mod app;
pub mod config;
pub mod engines;
pub mod events;
pub mod geo;
pub mod handlers;
pub mod hw;
pub mod render;
pub mod runtime;
pub mod store;
pub mod utils;
