//! Command recording and submission.

use crate::error::Result;
use ash::vk;

/// A command pool with a single primary command buffer.
///
/// One of these backs every staging region and every one-shot build, so the
/// recorded work of one owner never aliases another's pool.
pub struct CommandContext {
    pool: vk::CommandPool,
    buffer: vk::CommandBuffer,
}

impl CommandContext {
    /// Create a command pool and allocate its command buffer.
    ///
    /// # Safety
    /// The device must be valid and the queue family must exist.
    pub unsafe fn new(device: &ash::Device, queue_family: u32) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);

        let pool = device.create_command_pool(&pool_info, None)?;

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffers = device.allocate_command_buffers(&alloc_info)?;

        Ok(Self {
            pool,
            buffer: buffers[0],
        })
    }

    /// Get the command buffer handle.
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.buffer
    }

    /// Reset the pool and begin a one-time-submit recording.
    ///
    /// # Safety
    /// The device must be valid and the previous recording must have retired.
    pub unsafe fn begin_one_time(&self, device: &ash::Device) -> Result<()> {
        device.reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())?;

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        device.begin_command_buffer(self.buffer, &begin_info)?;
        Ok(())
    }

    /// End the current recording.
    ///
    /// # Safety
    /// The device must be valid and the command buffer must be recording.
    pub unsafe fn end(&self, device: &ash::Device) -> Result<()> {
        device.end_command_buffer(self.buffer)?;
        Ok(())
    }

    /// Destroy the pool (and with it the command buffer).
    ///
    /// # Safety
    /// The device must be valid and the pool must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_command_pool(self.pool, None);
    }
}

/// Submit a command buffer to a queue.
///
/// # Safety
/// All handles must be valid.
pub unsafe fn submit(
    device: &ash::Device,
    queue: vk::Queue,
    command_buffer: vk::CommandBuffer,
    wait_semaphores: &[vk::Semaphore],
    wait_stages: &[vk::PipelineStageFlags],
    signal_semaphores: &[vk::Semaphore],
    fence: vk::Fence,
) -> Result<()> {
    let command_buffers = [command_buffer];
    let submit_info = vk::SubmitInfo::default()
        .command_buffers(&command_buffers)
        .wait_semaphores(wait_semaphores)
        .wait_dst_stage_mask(wait_stages)
        .signal_semaphores(signal_semaphores);

    device.queue_submit(queue, &[submit_info], fence)?;
    Ok(())
}

/// Record and execute a command buffer, waiting for the queue to go idle.
///
/// Only used for startup-time one-shot transfers and acceleration structure
/// builds, before the render loop begins.
///
/// # Safety
/// All handles must be valid.
pub unsafe fn execute_single_time<F>(
    device: &ash::Device,
    ctx: &CommandContext,
    queue: vk::Queue,
    f: F,
) -> Result<()>
where
    F: FnOnce(vk::CommandBuffer) -> Result<()>,
{
    ctx.begin_one_time(device)?;
    f(ctx.command_buffer())?;
    ctx.end(device)?;

    submit(
        device,
        queue,
        ctx.command_buffer(),
        &[],
        &[],
        &[],
        vk::Fence::null(),
    )?;
    device.queue_wait_idle(queue)?;

    Ok(())
}
