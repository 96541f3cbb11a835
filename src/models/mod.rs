pub mod audit;
pub mod custom;
pub mod definition;
pub mod drift;
pub mod migration;
pub mod provisioning;
pub mod snapshot;
pub mod tenant;
