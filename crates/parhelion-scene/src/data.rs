//! Scene data as delivered by external loaders.
//!
//! Model, texture, and voxel decoding happen upstream; everything here is
//! fully decoded geometry arrays and raw byte buffers of known size.

use glam::{Mat4, Vec2, Vec3};

/// Interleaved vertex as stored in the aggregate vertex buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Vertex {
    pub position: Vec3,
    pub normal: Vec3,
    pub uv: Vec2,
}

/// Decoded triangle mesh.
#[derive(Clone, Debug, Default)]
pub struct MeshData {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

/// Decoded 2D texture pixels.
#[derive(Clone, Debug)]
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    /// Raw pixel bytes, `width * height * 4` for RGBA8.
    pub pixels: Vec<u8>,
}

/// Decoded voxel volume.
#[derive(Clone, Debug)]
pub struct VolumeData {
    pub extent: [u32; 3],
    /// Raw voxel bytes, one byte per voxel.
    pub voxels: Vec<u8>,
}

/// A placed instance of a mesh.
#[derive(Clone, Copy, Debug)]
pub struct MeshInstance {
    /// Index into the scene's mesh list.
    pub mesh: usize,
    pub transform: Mat4,
}

/// A placed instance of a voxel volume.
#[derive(Clone, Copy, Debug)]
pub struct VolumeInstance {
    /// Index into the scene's volume list.
    pub volume: usize,
    pub transform: Mat4,
}

/// Packed light record as uploaded to the light buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Light {
    pub position: Vec3,
    pub radius: f32,
    pub color: Vec3,
    pub intensity: f32,
}

/// Per-object metadata the ray tracing shaders index by instance id.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ObjectDesc {
    /// First vertex of the object's mesh in the aggregate vertex buffer.
    pub vertex_offset: u32,
    /// First index of the object's mesh in the aggregate index buffer.
    pub index_offset: u32,
    pub index_count: u32,
    /// Texture slot, or `u32::MAX` for untextured objects.
    pub texture: u32,
}

/// The full set of loaded assets and placed objects.
#[derive(Clone, Debug, Default)]
pub struct SceneDescription {
    pub meshes: Vec<MeshData>,
    pub textures: Vec<TextureData>,
    pub volumes: Vec<VolumeData>,
    pub mesh_instances: Vec<MeshInstance>,
    pub volume_instances: Vec<VolumeInstance>,
    pub lights: Vec<Light>,
}

impl SceneDescription {
    /// Total number of placed objects (mesh and volume instances).
    pub fn object_count(&self) -> usize {
        self.mesh_instances.len() + self.volume_instances.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout() {
        assert_eq!(std::mem::size_of::<Vertex>(), 32);
        assert_eq!(std::mem::offset_of!(Vertex, normal), 12);
        assert_eq!(std::mem::offset_of!(Vertex, uv), 24);
    }

    #[test]
    fn light_record_is_32_bytes() {
        assert_eq!(std::mem::size_of::<Light>(), 32);
    }
}
