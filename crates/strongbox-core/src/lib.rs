//! Core abstractions for strongbox: the `Service` key/value contract for secret
//! material, envelope encryption over any store, and the multi-store aggregate.

pub mod envelope;
pub mod keys;
pub mod memory;
pub mod multi;
pub mod service;

pub use envelope::{EnvelopeService, KeyManagement, KeyManagementError};
pub use memory::MemoryService;
pub use multi::MultiService;
pub use service::{MemberFailure, Operation, Service, ServiceError};
