//! Vulkan device and memory layer for the Parhelion renderer.
//!
//! This crate provides:
//! - Vulkan instance and device bootstrap
//! - Device memory allocation via gpu-allocator
//! - Command recording contexts
//! - Fence/semaphore primitives and frame retirement tracking

pub mod command;
pub mod device;
pub mod error;
pub mod instance;
pub mod memory;
pub mod sync;

pub use command::{execute_single_time, submit, CommandContext};
pub use device::{RenderDevice, RenderDeviceBuilder};
pub use error::{GpuError, Result};
pub use memory::{DeviceAllocator, GpuBuffer, GpuImage, GpuVolume};
pub use sync::{create_fence, create_semaphore, FrameTracker};
