//! Scene resource builder.
//!
//! Consumes the loaded mesh/texture/voxel set, computes the aggregate
//! buffer layout, allocates the scene-wide device buffers, and drives the
//! upload scheduler to populate them, finishing with acceleration structure
//! builds. Any change to the object/mesh/light set goes through the full
//! recompute-and-reupload path; there is no partial update.

use ash::vk;
use gpu_allocator::MemoryLocation;
use parhelion_gpu::{CommandContext, GpuBuffer, GpuImage, GpuVolume, RenderDevice, Result};
use parhelion_upload::{build_indirect_commands, StagingPool, UploadTarget, Uploader};

use crate::acceleration::{build_barrier, Blas, SceneTlas, TlasInstanceDesc};
use crate::data::SceneDescription;
use crate::layout::{gather_object_descs, gather_transforms, SceneLayout};

/// Hit group selectors in the shader binding table.
const SBT_TRIANGLE_HIT_GROUP: u32 = 0;
const SBT_PROCEDURAL_HIT_GROUP: u32 = 1;

/// Device-resident scene: aggregate buffers, textures, volumes, and
/// acceleration structures.
pub struct SceneResources {
    pub layout: SceneLayout,

    pub vertex_buffer: GpuBuffer,
    pub index_buffer: GpuBuffer,
    pub transform_buffer: GpuBuffer,
    pub indirect_buffer: GpuBuffer,
    pub light_buffer: GpuBuffer,
    pub object_buffer: GpuBuffer,

    pub textures: Vec<GpuImage>,
    pub volumes: Vec<GpuVolume>,

    /// Mesh BLAS in mesh order, then volume BLAS in volume order.
    pub blas: Vec<Blas>,
    pub tlas: Option<SceneTlas>,
}

impl SceneResources {
    /// Build the full device-resident scene.
    ///
    /// Uploads are staged through `pool` against `frame`; acceleration
    /// structures are built one-shot with a queue wait, so this is a
    /// load-time operation, not a per-frame one.
    pub fn build(
        device: &RenderDevice,
        pool: &mut StagingPool,
        frame: u64,
        scene: &SceneDescription,
    ) -> Result<Self> {
        let layout = SceneLayout::compute(scene);
        tracing::info!(
            "building scene: {} meshes, {} volumes, {} objects, {} lights ({} vertices, {} indices)",
            scene.meshes.len(),
            scene.volumes.len(),
            scene.object_count(),
            scene.lights.len(),
            layout.total_vertices,
            layout.total_indices,
        );

        let (
            vertex_buffer,
            index_buffer,
            transform_buffer,
            indirect_buffer,
            light_buffer,
            object_buffer,
        ) = create_aggregate_buffers(device, &layout)?;

        let textures = create_textures(device, scene)?;
        let volumes = create_volumes(device, scene)?;

        // Populate everything through the staging pool
        {
            let mut uploader = Uploader::new(device, pool, device.graphics_queue(), frame);

            if layout.vertex_buffer_size > 0 {
                uploader.upload_with(
                    layout.vertex_buffer_size,
                    UploadTarget::Buffer {
                        buffer: &vertex_buffer,
                        offset: 0,
                    },
                    |staging| {
                        for (mesh_id, mesh) in scene.meshes.iter().enumerate() {
                            let offset = layout.vertex_byte_offset(mesh_id) as usize;
                            let bytes: &[u8] = bytemuck::cast_slice(&mesh.vertices);
                            staging[offset..offset + bytes.len()].copy_from_slice(bytes);
                        }
                    },
                )?;
            }

            if layout.index_buffer_size > 0 {
                uploader.upload_with(
                    layout.index_buffer_size,
                    UploadTarget::Buffer {
                        buffer: &index_buffer,
                        offset: 0,
                    },
                    |staging| {
                        for (mesh_id, mesh) in scene.meshes.iter().enumerate() {
                            let offset = layout.index_byte_offset(mesh_id) as usize;
                            let bytes: &[u8] = bytemuck::cast_slice(&mesh.indices);
                            staging[offset..offset + bytes.len()].copy_from_slice(bytes);
                        }
                    },
                )?;
            }

            let transforms = gather_transforms(scene);
            if !transforms.is_empty() {
                uploader.upload_slice(&transform_buffer, 0, &transforms)?;
            }

            let commands = build_indirect_commands(&layout.mesh_counts());
            if !commands.is_empty() {
                uploader.upload_indirect_commands(&indirect_buffer, &commands)?;
            }

            uploader.upload_light_list(&light_buffer, &scene.lights)?;

            let descs = gather_object_descs(scene, &layout);
            if !descs.is_empty() {
                uploader.upload_slice(&object_buffer, 0, &descs)?;
            }

            for (texture, data) in textures.iter().zip(&scene.textures) {
                uploader.upload_image(
                    texture,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    &data.pixels,
                )?;
            }

            for (volume, data) in volumes.iter().zip(&scene.volumes) {
                uploader.upload_volume(volume, vk::ImageLayout::GENERAL, &data.voxels)?;
            }
        }

        // Acceleration structure inputs read the aggregate buffers, so the
        // uploads must have landed first. Load-time boundary wait.
        device.wait_idle()?;

        let (blas, tlas) = if device.accel_loader().is_ok() && scene.object_count() > 0 {
            build_acceleration_structures(device, scene, &layout, &vertex_buffer, &index_buffer)?
        } else {
            (Vec::new(), None)
        };

        Ok(Self {
            layout,
            vertex_buffer,
            index_buffer,
            transform_buffer,
            indirect_buffer,
            light_buffer,
            object_buffer,
            textures,
            volumes,
            blas,
            tlas,
        })
    }

    /// Tear down and rebuild from the (changed) scene description.
    pub fn rebuild(
        self,
        device: &RenderDevice,
        pool: &mut StagingPool,
        frame: u64,
        scene: &SceneDescription,
    ) -> Result<Self> {
        self.destroy(device)?;
        Self::build(device, pool, frame, scene)
    }

    /// Destroy every buffer, image, and acceleration structure.
    pub fn destroy(mut self, device: &RenderDevice) -> Result<()> {
        device.wait_idle()?;

        unsafe {
            if let Some(tlas) = self.tlas.take() {
                tlas.destroy(device)?;
            }
            for blas in self.blas.drain(..) {
                blas.destroy(device)?;
            }
        }

        let mut allocator = device.allocator().lock();
        allocator.free_buffer(&mut self.vertex_buffer)?;
        allocator.free_buffer(&mut self.index_buffer)?;
        allocator.free_buffer(&mut self.transform_buffer)?;
        allocator.free_buffer(&mut self.indirect_buffer)?;
        allocator.free_buffer(&mut self.light_buffer)?;
        allocator.free_buffer(&mut self.object_buffer)?;
        for texture in &mut self.textures {
            allocator.free_image(texture)?;
        }
        for volume in &mut self.volumes {
            allocator.free_volume(volume)?;
        }

        Ok(())
    }
}

#[allow(clippy::type_complexity)]
fn create_aggregate_buffers(
    device: &RenderDevice,
    layout: &SceneLayout,
) -> Result<(GpuBuffer, GpuBuffer, GpuBuffer, GpuBuffer, GpuBuffer, GpuBuffer)> {
    let mut allocator = device.allocator().lock();

    // Vulkan forbids zero-size buffers; empty sets still get a stub
    let clamp = |size: u64| size.max(4);

    let geometry_usage = vk::BufferUsageFlags::STORAGE_BUFFER
        | vk::BufferUsageFlags::TRANSFER_DST
        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
        | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;

    let vertex_buffer = allocator.create_buffer(
        clamp(layout.vertex_buffer_size),
        vk::BufferUsageFlags::VERTEX_BUFFER | geometry_usage,
        MemoryLocation::GpuOnly,
        "scene_vertices",
    )?;
    let index_buffer = allocator.create_buffer(
        clamp(layout.index_buffer_size),
        vk::BufferUsageFlags::INDEX_BUFFER | geometry_usage,
        MemoryLocation::GpuOnly,
        "scene_indices",
    )?;
    let transform_buffer = allocator.create_buffer(
        clamp(layout.transform_buffer_size),
        vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
        MemoryLocation::GpuOnly,
        "scene_transforms",
    )?;
    let indirect_buffer = allocator.create_buffer(
        clamp(layout.indirect_buffer_size),
        vk::BufferUsageFlags::INDIRECT_BUFFER
            | vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::TRANSFER_DST,
        MemoryLocation::GpuOnly,
        "scene_indirect",
    )?;
    let light_buffer = allocator.create_buffer(
        clamp(layout.light_buffer_size),
        vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
        MemoryLocation::GpuOnly,
        "scene_lights",
    )?;
    let object_buffer = allocator.create_buffer(
        clamp(layout.object_buffer_size),
        vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
        MemoryLocation::GpuOnly,
        "scene_objects",
    )?;

    Ok((
        vertex_buffer,
        index_buffer,
        transform_buffer,
        indirect_buffer,
        light_buffer,
        object_buffer,
    ))
}

fn create_textures(device: &RenderDevice, scene: &SceneDescription) -> Result<Vec<GpuImage>> {
    let mut allocator = device.allocator().lock();
    let mut textures = Vec::with_capacity(scene.textures.len());

    for data in &scene.textures {
        let create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(vk::Format::R8G8B8A8_UNORM)
            .extent(vk::Extent3D {
                width: data.width,
                height: data.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        textures.push(allocator.create_image(
            &create_info,
            MemoryLocation::GpuOnly,
            "scene_texture",
        )?);
    }

    Ok(textures)
}

fn create_volumes(device: &RenderDevice, scene: &SceneDescription) -> Result<Vec<GpuVolume>> {
    let mut allocator = device.allocator().lock();
    let mut volumes = Vec::with_capacity(scene.volumes.len());

    for data in &scene.volumes {
        volumes.push(allocator.create_volume(
            vk::Extent3D {
                width: data.extent[0],
                height: data.extent[1],
                depth: data.extent[2],
            },
            vk::Format::R8_UINT,
            vk::ImageUsageFlags::STORAGE
                | vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
            "scene_volume",
        )?);
    }

    Ok(volumes)
}

/// One BLAS per mesh and per volume, then a TLAS instance per placed
/// object, all recorded into a single one-shot command buffer.
fn build_acceleration_structures(
    device: &RenderDevice,
    scene: &SceneDescription,
    layout: &SceneLayout,
    vertex_buffer: &GpuBuffer,
    index_buffer: &GpuBuffer,
) -> Result<(Vec<Blas>, Option<SceneTlas>)> {
    let vertex_address = vertex_buffer.device_address(device.device());
    let index_address = index_buffer.device_address(device.device());

    let mut blas = Vec::with_capacity(scene.meshes.len() + scene.volumes.len());
    for (mesh_id, slot) in layout.meshes.iter().enumerate() {
        blas.push(unsafe {
            Blas::new_triangles(
                device,
                *slot,
                vertex_address,
                index_address,
                &format!("blas_mesh_{mesh_id}"),
            )
        }?);
    }
    for (volume_id, data) in scene.volumes.iter().enumerate() {
        blas.push(unsafe {
            Blas::new_aabbs(device, data.extent, &format!("blas_volume_{volume_id}"))
        }?);
    }

    // Instance order matches the object descriptor buffer: mesh instances
    // grouped by mesh, then volume instances.
    let mut instances = Vec::with_capacity(scene.object_count());
    let mut custom_index = 0u32;
    for mesh_id in 0..scene.meshes.len() {
        for instance in &scene.mesh_instances {
            if instance.mesh == mesh_id {
                instances.push(TlasInstanceDesc {
                    transform: instance.transform,
                    blas_address: blas[mesh_id].device_address,
                    custom_index,
                    sbt_offset: SBT_TRIANGLE_HIT_GROUP,
                });
                custom_index += 1;
            }
        }
    }
    for instance in &scene.volume_instances {
        instances.push(TlasInstanceDesc {
            transform: instance.transform,
            blas_address: blas[scene.meshes.len() + instance.volume].device_address,
            custom_index,
            sbt_offset: SBT_PROCEDURAL_HIT_GROUP,
        });
        custom_index += 1;
    }

    let tlas = unsafe { SceneTlas::new(device, &instances) }?;

    // Shared scratch sized to the largest build; builds are serialized with
    // barriers because they reuse it
    let scratch_size = blas
        .iter()
        .map(Blas::scratch_size)
        .chain(std::iter::once(tlas.scratch_size()))
        .max()
        .unwrap_or(4);

    let mut scratch = device.allocator().lock().create_buffer(
        scratch_size,
        vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        MemoryLocation::GpuOnly,
        "as_scratch",
    )?;

    let commands = unsafe { CommandContext::new(device.device(), device.graphics_queue_family()) }?;

    unsafe {
        parhelion_gpu::execute_single_time(
            device.device(),
            &commands,
            device.graphics_queue(),
            |cmd| {
                for structure in &blas {
                    structure.record_build(device, cmd, &scratch)?;
                    build_barrier(device.device(), cmd);
                }
                tlas.record_build(device, cmd, &scratch)
            },
        )?;

        commands.destroy(device.device());
    }

    device.allocator().lock().free_buffer(&mut scratch)?;

    tracing::debug!(
        "built {} bottom-level structures and a {}-instance top-level structure",
        blas.len(),
        instances.len(),
    );

    Ok((blas, Some(tlas)))
}
