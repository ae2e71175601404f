pub mod accounts;
pub mod api;
pub mod envelope;
pub mod events;
pub mod metrics;

pub use envelope::{DeviceAddress, Envelope, EnvelopeKind};
