//! Domain layer - Port definitions
//!
//! This module defines the traits (ports) the storage drivers implement and
//! consume, following hexagonal architecture principles.

pub mod ports;

pub use ports::*;
