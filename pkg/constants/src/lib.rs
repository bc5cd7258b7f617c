//! Centralized constants for the fleet orchestrator.
//!
//! All project-wide default values live here.
//! Change a value in one place and it applies everywhere.

pub mod health;
pub mod paths;
pub mod repair;
pub mod rollout;
