pub mod catalog;
pub mod connection;
pub mod custom;
pub mod definitions;
pub mod drift;
pub mod engine;
pub mod events;
pub mod jobs;
pub mod ledger;
pub mod lock;
pub mod metrics;
pub mod orchestrator;
pub mod repair;
pub mod resolver;
pub mod snapshot;
pub mod store;
