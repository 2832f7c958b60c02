#![forbid(unsafe_code)]

//! Contracts shared across keydrive.
//!
//! The core state machines only ever talk to the host through these traits,
//! so they can be driven by the real disk-encryption toolchain or by an
//! in-memory double without changing orchestration code.

pub mod quirk;
pub mod toolchain;

pub use quirk::{InitQuirkProbe, NoQuirk};
pub use toolchain::VolumeToolchain;
