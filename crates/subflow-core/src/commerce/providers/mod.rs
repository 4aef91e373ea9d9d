//! Commerce provider implementations

pub mod sandbox;

pub use sandbox::SandboxCommerceProvider;
