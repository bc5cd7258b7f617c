//! Data model of the fleet orchestrator: scale sets, instances, extensions,
//! identities, repair actions, events, and the files they are loaded from.

pub mod config;
pub mod desired;
pub mod duration;
pub mod error;
pub mod event;
pub mod extension;
pub mod identity;
pub mod instance;
pub mod repair;
pub mod scaleset;
pub mod validate;
