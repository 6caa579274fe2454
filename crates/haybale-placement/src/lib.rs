//! Store selection for Haybale
//!
//! Decides which stores receive new replicas and which excess replica to
//! drop. Pure functions over store descriptors; the directory and the
//! replication manager both go through this crate so their decisions agree.

pub mod policy;

pub use policy::{choose_evict, choose_stores, PlacementInput};
