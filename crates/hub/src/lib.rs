//! Grow-room actuator control and safety-interlock engine.
//!
//! The [`Engine`] owns every relay channel and is the single place where
//! scheduled cycles, pH/EC dosing, CO2 enrichment, manual overrides and
//! safety shutoffs are turned into output writes. The binary wires it to a
//! relay board, SQLite and an MQTT broker.

pub mod budget;
pub mod channel;
pub mod climate;
pub mod clock;
pub mod config;
pub mod cycle;
pub mod db;
pub mod dosing;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod light;
pub mod manual;
pub mod mqtt;
pub mod scheduler;
pub mod transport;

pub use engine::{Engine, EngineSettings};
