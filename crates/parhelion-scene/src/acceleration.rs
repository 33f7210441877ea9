//! Acceleration structure construction.
//!
//! One bottom-level structure per distinct mesh (triangle geometry inside
//! the shared vertex/index buffers) or voxel volume (a single procedural
//! AABB), and one top-level structure with an instance per placed object.
//! Structures are built once after the aggregate buffers are populated;
//! they are flagged updatable but only (re)build is implemented.

use ash::vk;
use glam::Mat4;
use gpu_allocator::MemoryLocation;
use parhelion_gpu::{GpuBuffer, RenderDevice, Result};

use crate::data::Vertex;
use crate::layout::MeshSlot;

/// AABB positions for procedural geometry (24 bytes).
#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct AabbPositions {
    pub min_x: f32,
    pub min_y: f32,
    pub min_z: f32,
    pub max_x: f32,
    pub max_y: f32,
    pub max_z: f32,
}

impl AabbPositions {
    /// AABB spanning the origin to the given extent.
    pub fn from_extent(extent: [u32; 3]) -> Self {
        Self {
            min_x: 0.0,
            min_y: 0.0,
            min_z: 0.0,
            max_x: extent[0] as f32,
            max_y: extent[1] as f32,
            max_z: extent[2] as f32,
        }
    }
}

/// Convert a column-major `Mat4` to Vulkan's row-major 3x4 instance
/// transform.
pub fn transform_rows(m: &Mat4) -> vk::TransformMatrixKHR {
    let r0 = m.row(0);
    let r1 = m.row(1);
    let r2 = m.row(2);
    vk::TransformMatrixKHR {
        matrix: [
            r0.x, r0.y, r0.z, r0.w, //
            r1.x, r1.y, r1.z, r1.w, //
            r2.x, r2.y, r2.z, r2.w,
        ],
    }
}

/// Geometry source for a bottom-level structure.
enum BlasGeometry {
    Triangles {
        vertex_address: vk::DeviceAddress,
        index_address: vk::DeviceAddress,
        slot: MeshSlot,
    },
    Aabbs {
        aabb_address: vk::DeviceAddress,
    },
}

impl BlasGeometry {
    fn geometry(&self) -> (vk::AccelerationStructureGeometryKHR<'static>, u32) {
        match self {
            Self::Triangles {
                vertex_address,
                index_address,
                slot,
            } => {
                let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
                    .vertex_format(vk::Format::R32G32B32_SFLOAT)
                    .vertex_data(vk::DeviceOrHostAddressConstKHR {
                        device_address: *vertex_address,
                    })
                    .vertex_stride(std::mem::size_of::<Vertex>() as u64)
                    .max_vertex(slot.vertex_offset + slot.vertex_count.saturating_sub(1))
                    .index_type(vk::IndexType::UINT32)
                    .index_data(vk::DeviceOrHostAddressConstKHR {
                        device_address: *index_address,
                    });

                let geometry = vk::AccelerationStructureGeometryKHR::default()
                    .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                    .flags(vk::GeometryFlagsKHR::OPAQUE)
                    .geometry(vk::AccelerationStructureGeometryDataKHR { triangles });

                (geometry, slot.index_count / 3)
            }
            Self::Aabbs { aabb_address } => {
                let geometry = vk::AccelerationStructureGeometryKHR::default()
                    .geometry_type(vk::GeometryTypeKHR::AABBS)
                    .flags(vk::GeometryFlagsKHR::OPAQUE)
                    .geometry(vk::AccelerationStructureGeometryDataKHR {
                        aabbs: vk::AccelerationStructureGeometryAabbsDataKHR::default()
                            .data(vk::DeviceOrHostAddressConstKHR {
                                device_address: *aabb_address,
                            })
                            .stride(std::mem::size_of::<AabbPositions>() as u64),
                    });

                (geometry, 1)
            }
        }
    }

    fn build_range(&self) -> vk::AccelerationStructureBuildRangeInfoKHR {
        match self {
            // Indices are mesh-local; first_vertex rebases them onto the
            // mesh's range in the shared vertex buffer.
            Self::Triangles { slot, .. } => vk::AccelerationStructureBuildRangeInfoKHR::default()
                .primitive_count(slot.index_count / 3)
                .primitive_offset(slot.index_offset * std::mem::size_of::<u32>() as u32)
                .first_vertex(slot.vertex_offset)
                .transform_offset(0),
            Self::Aabbs { .. } => vk::AccelerationStructureBuildRangeInfoKHR::default()
                .primitive_count(1)
                .primitive_offset(0)
                .first_vertex(0)
                .transform_offset(0),
        }
    }
}

/// Structures are flagged updatable for a future in-place refit path; only
/// full (re)builds are recorded today.
fn build_flags() -> vk::BuildAccelerationStructureFlagsKHR {
    vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
        | vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE
}

/// Bottom-level acceleration structure.
pub struct Blas {
    pub acceleration_structure: vk::AccelerationStructureKHR,
    pub buffer: GpuBuffer,
    /// Procedural AABB source buffer; `None` for triangle geometry.
    pub aabb_buffer: Option<GpuBuffer>,
    pub device_address: vk::DeviceAddress,
    scratch_size: u64,
    geometry: BlasGeometry,
}

impl Blas {
    /// Create a BLAS over a mesh's triangle range within the shared
    /// vertex/index buffers.
    ///
    /// # Safety
    /// Device must be valid and built with ray tracing.
    pub unsafe fn new_triangles(
        device: &RenderDevice,
        slot: MeshSlot,
        vertex_address: vk::DeviceAddress,
        index_address: vk::DeviceAddress,
        name: &str,
    ) -> Result<Self> {
        let geometry = BlasGeometry::Triangles {
            vertex_address,
            index_address,
            slot,
        };
        Self::create(device, geometry, None, name)
    }

    /// Create a BLAS with a single procedural AABB for a voxel volume.
    ///
    /// # Safety
    /// Device must be valid and built with ray tracing.
    pub unsafe fn new_aabbs(
        device: &RenderDevice,
        extent: [u32; 3],
        name: &str,
    ) -> Result<Self> {
        let aabb = AabbPositions::from_extent(extent);
        let aabb_buffer = device.allocator().lock().create_buffer(
            std::mem::size_of::<AabbPositions>() as u64,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::CpuToGpu,
            "blas_aabb",
        )?;
        aabb_buffer.write(&[aabb])?;

        let geometry = BlasGeometry::Aabbs {
            aabb_address: aabb_buffer.device_address(device.device()),
        };
        Self::create(device, geometry, Some(aabb_buffer), name)
    }

    unsafe fn create(
        device: &RenderDevice,
        geometry: BlasGeometry,
        aabb_buffer: Option<GpuBuffer>,
        name: &str,
    ) -> Result<Self> {
        let accel = device.accel_loader()?;
        let (geometry_info, primitive_count) = geometry.geometry();

        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
            .flags(build_flags())
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(std::slice::from_ref(&geometry_info));

        let mut build_sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        accel.get_acceleration_structure_build_sizes(
            vk::AccelerationStructureBuildTypeKHR::DEVICE,
            &build_info,
            &[primitive_count],
            &mut build_sizes,
        );

        let buffer = device.allocator().lock().create_buffer(
            build_sizes.acceleration_structure_size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
            name,
        )?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(buffer.buffer)
            .offset(0)
            .size(build_sizes.acceleration_structure_size)
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL);

        let acceleration_structure = accel.create_acceleration_structure(&create_info, None)?;

        let address_info = vk::AccelerationStructureDeviceAddressInfoKHR::default()
            .acceleration_structure(acceleration_structure);
        let device_address = accel.get_acceleration_structure_device_address(&address_info);

        Ok(Self {
            acceleration_structure,
            buffer,
            aabb_buffer,
            device_address,
            scratch_size: build_sizes.build_scratch_size,
            geometry,
        })
    }

    /// Scratch bytes needed to build this BLAS.
    pub fn scratch_size(&self) -> u64 {
        self.scratch_size
    }

    /// Record build commands.
    ///
    /// # Safety
    /// The command buffer must be recording; scratch must be large enough.
    pub unsafe fn record_build(
        &self,
        device: &RenderDevice,
        cmd: vk::CommandBuffer,
        scratch: &GpuBuffer,
    ) -> Result<()> {
        let accel = device.accel_loader()?;
        let (geometry_info, _) = self.geometry.geometry();

        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
            .flags(build_flags())
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .dst_acceleration_structure(self.acceleration_structure)
            .geometries(std::slice::from_ref(&geometry_info))
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch.device_address(device.device()),
            });

        let build_range = self.geometry.build_range();

        accel.cmd_build_acceleration_structures(
            cmd,
            &[build_info],
            &[std::slice::from_ref(&build_range)],
        );

        Ok(())
    }

    /// Destroy the BLAS and free its buffers.
    ///
    /// # Safety
    /// The structure must not be in use.
    pub unsafe fn destroy(mut self, device: &RenderDevice) -> Result<()> {
        device
            .accel_loader()?
            .destroy_acceleration_structure(self.acceleration_structure, None);

        let mut allocator = device.allocator().lock();
        allocator.free_buffer(&mut self.buffer)?;
        if let Some(mut aabb_buffer) = self.aabb_buffer.take() {
            allocator.free_buffer(&mut aabb_buffer)?;
        }
        Ok(())
    }
}

/// One placed object feeding the top-level structure.
#[derive(Clone, Copy, Debug)]
pub struct TlasInstanceDesc {
    pub transform: Mat4,
    pub blas_address: vk::DeviceAddress,
    /// Value surfaced as `gl_InstanceCustomIndexEXT`; indexes the object
    /// descriptor buffer.
    pub custom_index: u32,
    /// Shader binding table record offset (hit group selector).
    pub sbt_offset: u32,
}

/// Top-level acceleration structure over every placed object.
pub struct SceneTlas {
    pub acceleration_structure: vk::AccelerationStructureKHR,
    pub buffer: GpuBuffer,
    pub instance_buffer: GpuBuffer,
    pub device_address: vk::DeviceAddress,
    instance_count: u32,
    scratch_size: u64,
}

impl SceneTlas {
    /// Create the TLAS and write its instance buffer.
    ///
    /// # Safety
    /// Device must be valid and built with ray tracing; every referenced
    /// BLAS must exist (though not yet built).
    pub unsafe fn new(device: &RenderDevice, instances: &[TlasInstanceDesc]) -> Result<Self> {
        let accel = device.accel_loader()?;

        let records: Vec<vk::AccelerationStructureInstanceKHR> = instances
            .iter()
            .map(|desc| vk::AccelerationStructureInstanceKHR {
                transform: transform_rows(&desc.transform),
                instance_custom_index_and_mask: vk::Packed24_8::new(desc.custom_index, 0xFF),
                instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
                    desc.sbt_offset,
                    vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw() as u8,
                ),
                acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
                    device_handle: desc.blas_address,
                },
            })
            .collect();

        let instance_buffer_size = (records.len()
            * std::mem::size_of::<vk::AccelerationStructureInstanceKHR>())
            as u64;
        let instance_buffer = device.allocator().lock().create_buffer(
            instance_buffer_size.max(1),
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::CpuToGpu,
            "tlas_instances",
        )?;

        let bytes = std::slice::from_raw_parts(
            records.as_ptr().cast::<u8>(),
            instance_buffer_size as usize,
        );
        instance_buffer.write_bytes(0, bytes)?;

        let geometry = Self::geometry(instance_buffer.device_address(device.device()));

        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags(build_flags())
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(std::slice::from_ref(&geometry));

        let instance_count = records.len() as u32;
        let mut build_sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        accel.get_acceleration_structure_build_sizes(
            vk::AccelerationStructureBuildTypeKHR::DEVICE,
            &build_info,
            &[instance_count],
            &mut build_sizes,
        );

        let buffer = device.allocator().lock().create_buffer(
            build_sizes.acceleration_structure_size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
            "tlas",
        )?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(buffer.buffer)
            .offset(0)
            .size(build_sizes.acceleration_structure_size)
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL);

        let acceleration_structure = accel.create_acceleration_structure(&create_info, None)?;

        let address_info = vk::AccelerationStructureDeviceAddressInfoKHR::default()
            .acceleration_structure(acceleration_structure);
        let device_address = accel.get_acceleration_structure_device_address(&address_info);

        Ok(Self {
            acceleration_structure,
            buffer,
            instance_buffer,
            device_address,
            instance_count,
            scratch_size: build_sizes.build_scratch_size,
        })
    }

    fn geometry(
        instance_address: vk::DeviceAddress,
    ) -> vk::AccelerationStructureGeometryKHR<'static> {
        vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::INSTANCES)
            .flags(vk::GeometryFlagsKHR::OPAQUE)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                instances: vk::AccelerationStructureGeometryInstancesDataKHR::default()
                    .array_of_pointers(false)
                    .data(vk::DeviceOrHostAddressConstKHR {
                        device_address: instance_address,
                    }),
            })
    }

    /// Scratch bytes needed to build this TLAS.
    pub fn scratch_size(&self) -> u64 {
        self.scratch_size
    }

    /// Record build commands. Every referenced BLAS must have been built
    /// (with a barrier) before this executes.
    ///
    /// # Safety
    /// The command buffer must be recording; scratch must be large enough.
    pub unsafe fn record_build(
        &self,
        device: &RenderDevice,
        cmd: vk::CommandBuffer,
        scratch: &GpuBuffer,
    ) -> Result<()> {
        let accel = device.accel_loader()?;
        let geometry = Self::geometry(self.instance_buffer.device_address(device.device()));

        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags(build_flags())
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .dst_acceleration_structure(self.acceleration_structure)
            .geometries(std::slice::from_ref(&geometry))
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch.device_address(device.device()),
            });

        let build_range = vk::AccelerationStructureBuildRangeInfoKHR::default()
            .primitive_count(self.instance_count)
            .primitive_offset(0)
            .first_vertex(0)
            .transform_offset(0);

        accel.cmd_build_acceleration_structures(
            cmd,
            &[build_info],
            &[std::slice::from_ref(&build_range)],
        );

        Ok(())
    }

    /// Destroy the TLAS and free its buffers.
    ///
    /// # Safety
    /// The structure must not be in use.
    pub unsafe fn destroy(mut self, device: &RenderDevice) -> Result<()> {
        device
            .accel_loader()?
            .destroy_acceleration_structure(self.acceleration_structure, None);

        let mut allocator = device.allocator().lock();
        allocator.free_buffer(&mut self.buffer)?;
        allocator.free_buffer(&mut self.instance_buffer)?;
        Ok(())
    }
}

/// Barrier between acceleration structure builds sharing scratch memory.
///
/// # Safety
/// The command buffer must be recording.
pub unsafe fn build_barrier(device: &ash::Device, cmd: vk::CommandBuffer) {
    let barrier = vk::MemoryBarrier2::default()
        .src_stage_mask(vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR)
        .src_access_mask(vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR)
        .dst_stage_mask(vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR)
        .dst_access_mask(
            vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR
                | vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
        );

    let dependency_info =
        vk::DependencyInfo::default().memory_barriers(std::slice::from_ref(&barrier));

    device.cmd_pipeline_barrier2(cmd, &dependency_info);
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn aabb_size() {
        assert_eq!(std::mem::size_of::<AabbPositions>(), 24);
    }

    #[test]
    fn aabb_from_extent() {
        let aabb = AabbPositions::from_extent([32, 16, 8]);
        assert_eq!(aabb.min_x, 0.0);
        assert_eq!(aabb.max_x, 32.0);
        assert_eq!(aabb.max_y, 16.0);
        assert_eq!(aabb.max_z, 8.0);
    }

    #[test]
    fn transform_rows_are_row_major() {
        let m = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0));
        let rows = transform_rows(&m);
        // Translation lands in the last column of each row
        assert_eq!(rows.matrix[3], 1.0);
        assert_eq!(rows.matrix[7], 2.0);
        assert_eq!(rows.matrix[11], 3.0);
        // Diagonal stays identity
        assert_eq!(rows.matrix[0], 1.0);
        assert_eq!(rows.matrix[5], 1.0);
        assert_eq!(rows.matrix[10], 1.0);
    }
}
