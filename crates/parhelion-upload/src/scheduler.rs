//! Upload scheduler.
//!
//! Wraps claim/write/submit pairs on the staging pool for the typed payloads
//! the scene layer moves: raw bytes, Pod slices, matrix arrays, synthesized
//! indirect draw commands, the light list, and image/volume texels.

use crate::staging::{StagingPool, UploadTarget};
use ash::vk;
use bytemuck::Pod;
use parhelion_gpu::{GpuBuffer, GpuImage, GpuVolume, RenderDevice, Result};

/// Fixed cap on the light list. Exceeding it is a scene-authoring error,
/// not a runtime condition, and is fatal.
pub const MAX_LIGHT_COUNT: usize = 128;

/// Per-mesh counts feeding indirect draw command synthesis.
#[derive(Clone, Copy, Debug, Default)]
pub struct MeshCounts {
    pub vertex_count: u32,
    pub index_count: u32,
    pub instance_count: u32,
}

/// Synthesize one indexed indirect draw command per mesh.
///
/// `first_index`, `vertex_offset`, and `first_instance` are running sums
/// accumulated in mesh order, matching the aggregate buffer layout.
pub fn build_indirect_commands(meshes: &[MeshCounts]) -> Vec<vk::DrawIndexedIndirectCommand> {
    let mut commands = Vec::with_capacity(meshes.len());
    let mut first_index = 0u32;
    let mut vertex_offset = 0i32;
    let mut first_instance = 0u32;

    for mesh in meshes {
        commands.push(vk::DrawIndexedIndirectCommand {
            index_count: mesh.index_count,
            instance_count: mesh.instance_count,
            first_index,
            vertex_offset,
            first_instance,
        });

        first_index += mesh.index_count;
        vertex_offset += mesh.vertex_count as i32;
        first_instance += mesh.instance_count;
    }

    commands
}

/// Serialize the light list: a `u32` count header followed by the packed
/// records.
///
/// # Panics
/// If the light count exceeds [`MAX_LIGHT_COUNT`].
pub fn serialize_light_list<L: Pod>(lights: &[L]) -> Vec<u8> {
    assert!(
        lights.len() <= MAX_LIGHT_COUNT,
        "light count {} exceeds the cap of {MAX_LIGHT_COUNT}",
        lights.len(),
    );

    let mut bytes = Vec::with_capacity(4 + std::mem::size_of_val(lights));
    bytes.extend_from_slice(&(lights.len() as u32).to_le_bytes());
    bytes.extend_from_slice(bytemuck::cast_slice(lights));
    bytes
}

/// Byte size of a serialized light list with `count` records of type `L`.
pub fn light_list_size<L: Pod>(count: usize) -> u64 {
    4 + (count * std::mem::size_of::<L>()) as u64
}

/// Drives staged uploads for a single frame on a single queue.
pub struct Uploader<'a> {
    device: &'a RenderDevice,
    pool: &'a mut StagingPool,
    queue: vk::Queue,
    frame: u64,
}

impl<'a> Uploader<'a> {
    /// Create an uploader claiming against `frame`.
    pub fn new(
        device: &'a RenderDevice,
        pool: &'a mut StagingPool,
        queue: vk::Queue,
        frame: u64,
    ) -> Self {
        Self {
            device,
            pool,
            queue,
            frame,
        }
    }

    /// Claim staging space, let `fill` write the payload, and submit the
    /// copy to `target`.
    pub fn upload_with(
        &mut self,
        size: u64,
        target: UploadTarget<'_>,
        fill: impl FnOnce(&mut [u8]),
    ) -> Result<()> {
        let claim = self.pool.claim(self.device, self.frame, size)?;
        fill(self.pool.mapped_slice(&claim)?);
        self.pool.submit(self.device, self.queue, claim, target)
    }

    /// Upload raw bytes into a device buffer at `offset`.
    pub fn upload_bytes(&mut self, dst: &GpuBuffer, offset: u64, bytes: &[u8]) -> Result<()> {
        self.upload_with(
            bytes.len() as u64,
            UploadTarget::Buffer {
                buffer: dst,
                offset,
            },
            |staging| staging.copy_from_slice(bytes),
        )
    }

    /// Upload a Pod slice (vertex arrays, matrices, object descriptors)
    /// into a device buffer at `offset`.
    pub fn upload_slice<T: Pod>(&mut self, dst: &GpuBuffer, offset: u64, data: &[T]) -> Result<()> {
        self.upload_bytes(dst, offset, bytemuck::cast_slice(data))
    }

    /// Upload synthesized indirect draw commands.
    pub fn upload_indirect_commands(
        &mut self,
        dst: &GpuBuffer,
        commands: &[vk::DrawIndexedIndirectCommand],
    ) -> Result<()> {
        // vk structs are repr(C) plain data but carry no Pod impl
        let bytes = unsafe {
            std::slice::from_raw_parts(
                commands.as_ptr().cast::<u8>(),
                std::mem::size_of_val(commands),
            )
        };
        self.upload_bytes(dst, 0, bytes)
    }

    /// Upload the light list with its count header.
    ///
    /// # Panics
    /// If the light count exceeds [`MAX_LIGHT_COUNT`].
    pub fn upload_light_list<L: Pod>(&mut self, dst: &GpuBuffer, lights: &[L]) -> Result<()> {
        let bytes = serialize_light_list(lights);
        self.upload_bytes(dst, 0, &bytes)
    }

    /// Upload texel data into a 2D image, leaving it in `final_layout`.
    pub fn upload_image(
        &mut self,
        image: &GpuImage,
        final_layout: vk::ImageLayout,
        texels: &[u8],
    ) -> Result<()> {
        self.upload_with(
            texels.len() as u64,
            UploadTarget::Image {
                image: image.image,
                extent: image.extent,
                final_layout,
            },
            |staging| staging.copy_from_slice(texels),
        )
    }

    /// Upload voxel data into a 3D volume, leaving it in `final_layout`.
    pub fn upload_volume(
        &mut self,
        volume: &GpuVolume,
        final_layout: vk::ImageLayout,
        voxels: &[u8],
    ) -> Result<()> {
        self.upload_with(
            voxels.len() as u64,
            UploadTarget::Image {
                image: volume.image,
                extent: volume.extent,
                final_layout,
            },
            |staging| staging.copy_from_slice(voxels),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_mesh_single_instance() {
        let commands = build_indirect_commands(&[MeshCounts {
            vertex_count: 100,
            index_count: 300,
            instance_count: 1,
        }]);

        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].index_count, 300);
        assert_eq!(commands[0].instance_count, 1);
        assert_eq!(commands[0].first_index, 0);
        assert_eq!(commands[0].vertex_offset, 0);
        assert_eq!(commands[0].first_instance, 0);
    }

    #[test]
    fn running_offsets_accumulate_in_mesh_order() {
        let commands = build_indirect_commands(&[
            MeshCounts {
                vertex_count: 100,
                index_count: 300,
                instance_count: 2,
            },
            MeshCounts {
                vertex_count: 8,
                index_count: 36,
                instance_count: 5,
            },
            MeshCounts {
                vertex_count: 4,
                index_count: 6,
                instance_count: 1,
            },
        ]);

        assert_eq!(commands[1].first_index, 300);
        assert_eq!(commands[1].vertex_offset, 100);
        assert_eq!(commands[1].first_instance, 2);

        assert_eq!(commands[2].first_index, 336);
        assert_eq!(commands[2].vertex_offset, 108);
        assert_eq!(commands[2].first_instance, 7);
    }

    #[test]
    fn light_list_has_count_header() {
        #[repr(C)]
        #[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
        struct TestLight {
            position: [f32; 3],
            intensity: f32,
        }

        let lights = [
            TestLight {
                position: [1.0, 2.0, 3.0],
                intensity: 4.0,
            },
            TestLight {
                position: [5.0, 6.0, 7.0],
                intensity: 8.0,
            },
        ];

        let bytes = serialize_light_list(&lights);
        assert_eq!(bytes.len() as u64, light_list_size::<TestLight>(2));
        assert_eq!(u32::from_le_bytes(bytes[0..4].try_into().unwrap()), 2);
        assert_eq!(
            f32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            1.0
        );
    }

    #[test]
    fn light_serialization_is_deterministic() {
        #[repr(C)]
        #[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
        struct TestLight {
            position: [f32; 4],
        }

        let lights = [TestLight {
            position: [0.5, 0.25, 0.125, 1.0],
        }];
        assert_eq!(serialize_light_list(&lights), serialize_light_list(&lights));
    }

    #[test]
    #[should_panic(expected = "exceeds the cap")]
    fn exceeding_light_cap_is_fatal() {
        let lights = vec![[0.0f32; 4]; MAX_LIGHT_COUNT + 1];
        serialize_light_list(&lights);
    }
}
