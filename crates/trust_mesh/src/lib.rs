//! Trust Mesh
//!
//! Originator trust for mesh telemetry: a registry of (originator, key
//! version) → ed25519 verification keys with validity status, and a
//! reloadable store that verifies signatures against it.
//!
//! The store never signs anything. It only answers whether a reading's
//! signature is attributable to a currently trusted originator.

pub mod error;
pub mod registry;
pub mod store;

pub use error::{TrustLoadError, TrustResult};
pub use registry::{KeyStatus, TrustEntry, TrustRegistry};
pub use store::TrustStore;
