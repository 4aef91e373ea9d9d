//! Payment provider implementations

pub mod sandbox;

pub use sandbox::SandboxPaymentProvider;
