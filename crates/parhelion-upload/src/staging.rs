//! Ring-buffer staging pool.
//!
//! A growable pool of reusable host-visible staging regions. Each region
//! owns its buffer, a dedicated command recording context, and a completion
//! semaphore. Regions are created lazily when no free region is large
//! enough, recycled by frame occupancy, and destroyed only at teardown.

use crate::ledger::{ClaimOutcome, RegionLedger};
use crate::ordering::OrderingChain;
use ash::vk;
use ash::vk::Handle;
use gpu_allocator::MemoryLocation;
use parhelion_gpu::{
    command, create_semaphore, CommandContext, GpuBuffer, GpuError, RenderDevice, Result,
};

/// One staging region: host-visible scratch memory plus the command context
/// and semaphore that move its contents to the destination.
struct StagingRegion {
    buffer: GpuBuffer,
    commands: CommandContext,
    complete: vk::Semaphore,
}

/// Token returned by [`StagingPool::claim`] and consumed by
/// [`StagingPool::submit`].
///
/// Holding the claim is what makes the region's mapped memory writable;
/// submit consumes it, after which the caller must not touch the memory.
pub struct StagingClaim {
    region: usize,
    size: u64,
}

impl StagingClaim {
    /// Index of the claimed region within the pool.
    pub fn region(&self) -> usize {
        self.region
    }

    /// Number of bytes claimed (the copy size at submit).
    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Destination of a staged upload.
pub enum UploadTarget<'a> {
    /// Copy into a device buffer at the given byte offset.
    Buffer { buffer: &'a GpuBuffer, offset: u64 },
    /// Copy into an image (2D or 3D), transitioning it to `final_layout`.
    Image {
        image: vk::Image,
        extent: vk::Extent3D,
        final_layout: vk::ImageLayout,
    },
}

/// Growable pool of reusable staging regions.
pub struct StagingPool {
    regions: Vec<StagingRegion>,
    ledger: RegionLedger,
    buffer_chain: OrderingChain,
    image_chain: OrderingChain,
    queue_family: u32,
}

impl StagingPool {
    /// Create an empty pool recording for the given queue family.
    pub fn new(queue_family: u32) -> Self {
        Self {
            regions: Vec::new(),
            ledger: RegionLedger::new(),
            buffer_chain: OrderingChain::new(),
            image_chain: OrderingChain::new(),
            queue_family,
        }
    }

    /// Number of regions the pool has created.
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// Completion semaphore of the region at `index`, signaled when its last
    /// submitted copy finishes. Consumed by outer frame synchronization.
    pub fn completion_semaphore(&self, index: usize) -> vk::Semaphore {
        self.regions[index].complete
    }

    /// Claim a staging region able to hold `size` bytes for frame `frame`.
    ///
    /// Returns a claim token; write the payload through
    /// [`Self::mapped_slice`], then pass the token to [`Self::submit`].
    /// Claim and submit must be paired by the same caller with no other
    /// claim of the same region in between.
    pub fn claim(&mut self, device: &RenderDevice, frame: u64, size: u64) -> Result<StagingClaim> {
        match self.ledger.claim(size, frame) {
            ClaimOutcome::Reuse(index) => Ok(StagingClaim {
                region: index,
                size,
            }),
            ClaimOutcome::Grow { index, capacity } => {
                tracing::debug!(
                    "staging pool grew to {} regions (new capacity {capacity})",
                    index + 1
                );

                let buffer = device.allocator().lock().create_buffer(
                    capacity,
                    vk::BufferUsageFlags::TRANSFER_SRC,
                    MemoryLocation::CpuToGpu,
                    "staging_region",
                )?;
                let commands = unsafe { CommandContext::new(device.device(), self.queue_family) }?;
                let complete = unsafe { create_semaphore(device.device()) }?;

                self.regions.push(StagingRegion {
                    buffer,
                    commands,
                    complete,
                });
                debug_assert_eq!(self.regions.len(), self.ledger.len());

                Ok(StagingClaim {
                    region: index,
                    size,
                })
            }
        }
    }

    /// The claimed region's mapped memory, sized to the claim.
    ///
    /// Only valid between claim and submit; the byte layout is caller
    /// defined and must match what the destination expects.
    pub fn mapped_slice(&mut self, claim: &StagingClaim) -> Result<&mut [u8]> {
        let region = &self.regions[claim.region];
        let ptr = region
            .buffer
            .mapped_ptr()
            .ok_or_else(|| GpuError::InvalidState("Staging region not mapped".to_string()))?;

        // gpu-allocator maps CpuToGpu memory persistently; the claim token
        // bounds when writes are allowed.
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr, claim.size as usize) })
    }

    /// Submit the claimed region's contents to `target`.
    ///
    /// Records a one-time command buffer (a plain copy for buffers; layout
    /// barriers around the copy for images), waits on the destination's
    /// ordering semaphore when this is not the first upload to it, and
    /// signals both that semaphore and the region's completion semaphore.
    pub fn submit(
        &mut self,
        device: &RenderDevice,
        queue: vk::Queue,
        claim: StagingClaim,
        target: UploadTarget<'_>,
    ) -> Result<()> {
        let region = &self.regions[claim.region];
        let dev = device.device();

        unsafe {
            region.commands.begin_one_time(dev)?;

            let cmd = region.commands.command_buffer();
            match &target {
                UploadTarget::Buffer { buffer, offset } => {
                    let copy = vk::BufferCopy {
                        src_offset: 0,
                        dst_offset: *offset,
                        size: claim.size,
                    };
                    dev.cmd_copy_buffer(cmd, region.buffer.buffer, buffer.buffer, &[copy]);
                }
                UploadTarget::Image {
                    image,
                    extent,
                    final_layout,
                } => {
                    record_image_upload(
                        dev,
                        cmd,
                        region.buffer.buffer,
                        *image,
                        *extent,
                        *final_layout,
                    );
                }
            }

            region.commands.end(dev)?;
        }

        let (chain, dest) = match &target {
            UploadTarget::Buffer { buffer, .. } => {
                (&mut self.buffer_chain, buffer.buffer.as_raw())
            }
            UploadTarget::Image { image, .. } => (&mut self.image_chain, image.as_raw()),
        };
        let (wait, ordering) = chain.acquire(dest, || unsafe {
            create_semaphore(device.device())
        })?;

        let wait_semaphores: Vec<vk::Semaphore> = wait.into_iter().collect();
        let wait_stages = vec![vk::PipelineStageFlags::TRANSFER; wait_semaphores.len()];
        let signal_semaphores = [ordering, region.complete];

        unsafe {
            command::submit(
                dev,
                queue,
                region.commands.command_buffer(),
                &wait_semaphores,
                &wait_stages,
                &signal_semaphores,
                vk::Fence::null(),
            )?;
        }

        Ok(())
    }

    /// Recycle every region stamped with `frame`.
    ///
    /// Driven by external frame synchronization once that frame slot is
    /// known retired (one full frames-in-flight rotation later).
    pub fn release_frame(&mut self, frame: u64) {
        self.ledger.release_frame(frame);
    }

    /// Destroy all regions and ordering semaphores.
    ///
    /// Waits for the device to go idle first; regions are never freed
    /// individually during a run.
    pub fn destroy(&mut self, device: &RenderDevice) -> Result<()> {
        device.wait_idle()?;

        let dev = device.device();
        let mut allocator = device.allocator().lock();
        for region in &mut self.regions {
            allocator.free_buffer(&mut region.buffer)?;
            unsafe {
                region.commands.destroy(dev);
                dev.destroy_semaphore(region.complete, None);
            }
        }
        self.regions.clear();

        for semaphore in self
            .buffer_chain
            .drain()
            .into_iter()
            .chain(self.image_chain.drain())
        {
            unsafe {
                dev.destroy_semaphore(semaphore, None);
            }
        }

        Ok(())
    }
}

/// Record barriers and the copy for a buffer-to-image upload.
///
/// # Safety
/// The command buffer must be recording; all handles must be valid.
unsafe fn record_image_upload(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    src: vk::Buffer,
    image: vk::Image,
    extent: vk::Extent3D,
    final_layout: vk::ImageLayout,
) {
    let subresource_range = vk::ImageSubresourceRange::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .base_mip_level(0)
        .level_count(1)
        .base_array_layer(0)
        .layer_count(1);

    // To transfer destination
    let to_transfer = vk::ImageMemoryBarrier2::default()
        .src_stage_mask(vk::PipelineStageFlags2::NONE)
        .src_access_mask(vk::AccessFlags2::NONE)
        .dst_stage_mask(vk::PipelineStageFlags2::COPY)
        .dst_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
        .old_layout(vk::ImageLayout::UNDEFINED)
        .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .image(image)
        .subresource_range(subresource_range);

    let dependency =
        vk::DependencyInfo::default().image_memory_barriers(std::slice::from_ref(&to_transfer));
    device.cmd_pipeline_barrier2(cmd, &dependency);

    let subresource = vk::ImageSubresourceLayers::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .mip_level(0)
        .base_array_layer(0)
        .layer_count(1);

    let copy = vk::BufferImageCopy::default()
        .buffer_offset(0)
        .buffer_row_length(0)
        .buffer_image_height(0)
        .image_subresource(subresource)
        .image_offset(vk::Offset3D::default())
        .image_extent(extent);

    device.cmd_copy_buffer_to_image(
        cmd,
        src,
        image,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        &[copy],
    );

    // To the caller-specified final layout
    let to_final = vk::ImageMemoryBarrier2::default()
        .src_stage_mask(vk::PipelineStageFlags2::COPY)
        .src_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
        .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
        .dst_access_mask(vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE)
        .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .new_layout(final_layout)
        .image(image)
        .subresource_range(subresource_range);

    let dependency =
        vk::DependencyInfo::default().image_memory_barriers(std::slice::from_ref(&to_final));
    device.cmd_pipeline_barrier2(cmd, &dependency);
}
