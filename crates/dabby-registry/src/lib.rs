//! dabby-registry — the instance registry.
//!
//! Holds the set of backend instance descriptors and their live health and
//! load state. The registry is the single owner of all per-instance mutable
//! state; the load balancer reads it and adjusts connection counts through
//! it, the health monitor drives circuit transitions through it, and the
//! dispatcher records request outcomes into it.
//!
//! All mutation is fine-grained per instance (an atomic counter plus one
//! short mutex per slot), so traffic to unrelated instances never contends
//! on a shared lock.

pub mod events;
pub mod registry;

pub use events::RegistryEvent;
pub use registry::{BeginRequest, InstanceSnapshot, Registry, RegistryConfig, RegistryStats};
