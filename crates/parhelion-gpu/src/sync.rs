//! Synchronization primitives and frame retirement tracking.

use crate::error::Result;
use ash::vk;

/// Create a semaphore.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_semaphore(device: &ash::Device) -> Result<vk::Semaphore> {
    let create_info = vk::SemaphoreCreateInfo::default();
    let semaphore = device.create_semaphore(&create_info, None)?;
    Ok(semaphore)
}

/// Create a fence.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_fence(device: &ash::Device, signaled: bool) -> Result<vk::Fence> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };

    let create_info = vk::FenceCreateInfo::default().flags(flags);
    let fence = device.create_fence(&create_info, None)?;
    Ok(fence)
}

/// Wait for a fence to be signaled.
///
/// # Safety
/// The device and fence must be valid.
pub unsafe fn wait_for_fence(
    device: &ash::Device,
    fence: vk::Fence,
    timeout_ns: u64,
) -> Result<()> {
    device.wait_for_fences(&[fence], true, timeout_ns)?;
    Ok(())
}

/// Reset a fence to unsignaled state.
///
/// # Safety
/// The device and fence must be valid.
pub unsafe fn reset_fence(device: &ash::Device, fence: vk::Fence) -> Result<()> {
    device.reset_fences(&[fence])?;
    Ok(())
}

/// Tracks frame retirement across the frames-in-flight rotation.
///
/// Each frame slot carries a fence signaled by that frame's final queue
/// submission. When the rotation comes back around to a slot, waiting on its
/// fence proves every piece of GPU work from that slot's previous use has
/// retired; the slot index is then the frame identifier whose staging regions
/// may be recycled.
pub struct FrameTracker {
    fences: Vec<vk::Fence>,
    current: usize,
}

impl FrameTracker {
    /// Create a tracker for the given number of frames in flight.
    ///
    /// Fences start signaled so the first rotation does not block.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: &ash::Device, frames_in_flight: usize) -> Result<Self> {
        let mut fences = Vec::with_capacity(frames_in_flight);
        for _ in 0..frames_in_flight {
            fences.push(create_fence(device, true)?);
        }

        Ok(Self { fences, current: 0 })
    }

    /// The current frame slot index (the frame identifier).
    pub fn current_frame(&self) -> u64 {
        self.current as u64
    }

    /// Number of frames in flight.
    pub fn frames_in_flight(&self) -> usize {
        self.fences.len()
    }

    /// The fence the current frame's final submission must signal.
    pub fn fence(&self) -> vk::Fence {
        self.fences[self.current]
    }

    /// Wait until the current slot's previous use has retired, then re-arm
    /// its fence. After this returns the slot's frame identifier is safe to
    /// recycle.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn wait_retired(&self, device: &ash::Device) -> Result<()> {
        wait_for_fence(device, self.fences[self.current], u64::MAX)?;
        reset_fence(device, self.fences[self.current])?;
        Ok(())
    }

    /// Advance to the next frame slot.
    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.fences.len();
    }

    /// Destroy all fences.
    ///
    /// # Safety
    /// The device must be valid and no fence may be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        for &fence in &self.fences {
            device.destroy_fence(fence, None);
        }
    }
}
