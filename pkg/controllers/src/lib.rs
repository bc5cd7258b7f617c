pub mod events;
pub mod fleet;
pub mod health;
pub mod identity;
pub mod repair;
