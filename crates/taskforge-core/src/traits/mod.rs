//! Trait seams between the scheduler and its external collaborators.

pub mod capability;
pub mod notifier;

pub use capability::PhaseCapability;
pub use notifier::NotificationDispatcher;
