//! Ring-buffer staging pool and streaming upload scheduler.
//!
//! This crate moves CPU-resident scene data into device-local memory:
//! - a growable pool of reusable host-visible staging regions
//! - strict per-destination upload ordering via semaphore chains
//! - frame-indexed occupancy so regions recycle once their frame retires
//! - a scheduler wrapping claim/write/submit for typed payloads

pub mod ledger;
pub mod ordering;
pub mod scheduler;
pub mod staging;

pub use ledger::{ClaimOutcome, Occupancy, RegionLedger, MAX_STAGING_REGIONS};
pub use ordering::OrderingChain;
pub use scheduler::{
    build_indirect_commands, light_list_size, serialize_light_list, MeshCounts, Uploader,
    MAX_LIGHT_COUNT,
};
pub use staging::{StagingClaim, StagingPool, UploadTarget};
