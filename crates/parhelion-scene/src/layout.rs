//! Aggregate buffer layout computation.
//!
//! Every scene-wide buffer is a single concatenation laid out from per-mesh
//! counts. Offsets and totals are always re-derived together from the full
//! mesh/instance/light set; there is no partial update path.

use crate::data::{ObjectDesc, SceneDescription, Vertex};
use glam::Mat4;
use parhelion_upload::{light_list_size, MeshCounts};

/// Per-mesh placement within the aggregate buffers (element offsets).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MeshSlot {
    pub vertex_offset: u32,
    pub vertex_count: u32,
    pub index_offset: u32,
    pub index_count: u32,
    /// Instances of this mesh, contiguous in the transform buffer.
    pub first_instance: u32,
    pub instance_count: u32,
}

/// Derived sizes and offsets for every aggregate buffer.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SceneLayout {
    pub meshes: Vec<MeshSlot>,
    pub total_vertices: u32,
    pub total_indices: u32,
    /// Mesh instances only; volume instances do not rasterize.
    pub total_mesh_instances: u32,

    pub vertex_buffer_size: u64,
    pub index_buffer_size: u64,
    pub transform_buffer_size: u64,
    pub indirect_buffer_size: u64,
    pub light_buffer_size: u64,
    pub object_buffer_size: u64,
}

impl SceneLayout {
    /// Compute the layout for the given scene.
    ///
    /// Deterministic: the same scene always yields the same layout.
    pub fn compute(scene: &SceneDescription) -> Self {
        let mut meshes = Vec::with_capacity(scene.meshes.len());
        let mut vertex_offset = 0u32;
        let mut index_offset = 0u32;
        let mut first_instance = 0u32;

        for (mesh_id, mesh) in scene.meshes.iter().enumerate() {
            let instance_count = scene
                .mesh_instances
                .iter()
                .filter(|i| i.mesh == mesh_id)
                .count() as u32;

            meshes.push(MeshSlot {
                vertex_offset,
                vertex_count: mesh.vertices.len() as u32,
                index_offset,
                index_count: mesh.indices.len() as u32,
                first_instance,
                instance_count,
            });

            vertex_offset += mesh.vertices.len() as u32;
            index_offset += mesh.indices.len() as u32;
            first_instance += instance_count;
        }

        let total_vertices = vertex_offset;
        let total_indices = index_offset;
        let total_mesh_instances = first_instance;
        let object_count = scene.object_count() as u64;

        Self {
            meshes,
            total_vertices,
            total_indices,
            total_mesh_instances,
            vertex_buffer_size: u64::from(total_vertices) * std::mem::size_of::<Vertex>() as u64,
            index_buffer_size: u64::from(total_indices) * std::mem::size_of::<u32>() as u64,
            transform_buffer_size: u64::from(total_mesh_instances)
                * std::mem::size_of::<Mat4>() as u64,
            indirect_buffer_size: scene.meshes.len() as u64
                * std::mem::size_of::<ash::vk::DrawIndexedIndirectCommand>() as u64,
            light_buffer_size: light_list_size::<crate::data::Light>(scene.lights.len()),
            object_buffer_size: object_count * std::mem::size_of::<ObjectDesc>() as u64,
        }
    }

    /// Per-mesh counts in mesh order, feeding indirect command synthesis.
    pub fn mesh_counts(&self) -> Vec<MeshCounts> {
        self.meshes
            .iter()
            .map(|slot| MeshCounts {
                vertex_count: slot.vertex_count,
                index_count: slot.index_count,
                instance_count: slot.instance_count,
            })
            .collect()
    }

    /// Byte offset of a mesh's vertices in the aggregate vertex buffer.
    pub fn vertex_byte_offset(&self, mesh: usize) -> u64 {
        u64::from(self.meshes[mesh].vertex_offset) * std::mem::size_of::<Vertex>() as u64
    }

    /// Byte offset of a mesh's indices in the aggregate index buffer.
    pub fn index_byte_offset(&self, mesh: usize) -> u64 {
        u64::from(self.meshes[mesh].index_offset) * std::mem::size_of::<u32>() as u64
    }
}

/// Instance transforms gathered contiguously per mesh, in mesh order.
///
/// Matches the `first_instance` offsets recorded in the layout.
pub fn gather_transforms(scene: &SceneDescription) -> Vec<Mat4> {
    let mut transforms = Vec::with_capacity(scene.mesh_instances.len());
    for mesh_id in 0..scene.meshes.len() {
        for instance in &scene.mesh_instances {
            if instance.mesh == mesh_id {
                transforms.push(instance.transform);
            }
        }
    }
    transforms
}

/// Object descriptors in TLAS instance order: mesh instances grouped by
/// mesh, then volume instances.
pub fn gather_object_descs(scene: &SceneDescription, layout: &SceneLayout) -> Vec<ObjectDesc> {
    let mut descs = Vec::with_capacity(scene.object_count());

    for mesh_id in 0..scene.meshes.len() {
        let slot = &layout.meshes[mesh_id];
        for instance in &scene.mesh_instances {
            if instance.mesh == mesh_id {
                descs.push(ObjectDesc {
                    vertex_offset: slot.vertex_offset,
                    index_offset: slot.index_offset,
                    index_count: slot.index_count,
                    texture: u32::MAX,
                });
            }
        }
    }

    for _ in &scene.volume_instances {
        descs.push(ObjectDesc {
            vertex_offset: 0,
            index_offset: 0,
            index_count: 0,
            texture: u32::MAX,
        });
    }

    descs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{MeshData, MeshInstance, Vertex};
    use glam::{Vec2, Vec3};

    fn flat_vertex() -> Vertex {
        Vertex {
            position: Vec3::ZERO,
            normal: Vec3::Z,
            uv: Vec2::ZERO,
        }
    }

    fn mesh_of(vertices: usize, indices: usize) -> MeshData {
        MeshData {
            vertices: vec![flat_vertex(); vertices],
            indices: (0..indices as u32).collect(),
        }
    }

    #[test]
    fn single_mesh_scene() {
        let scene = SceneDescription {
            meshes: vec![mesh_of(100, 300)],
            mesh_instances: vec![MeshInstance {
                mesh: 0,
                transform: Mat4::IDENTITY,
            }],
            ..Default::default()
        };

        let layout = SceneLayout::compute(&scene);
        assert_eq!(layout.vertex_buffer_size, 100 * 32);
        assert_eq!(layout.index_buffer_size, 300 * 4);
        assert_eq!(layout.meshes[0].first_instance, 0);
        assert_eq!(layout.meshes[0].instance_count, 1);

        let commands = parhelion_upload::build_indirect_commands(&layout.mesh_counts());
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].index_count, 300);
        assert_eq!(commands[0].instance_count, 1);
        assert_eq!(commands[0].first_index, 0);
        assert_eq!(commands[0].vertex_offset, 0);
        assert_eq!(commands[0].first_instance, 0);
    }

    #[test]
    fn offsets_concatenate_in_mesh_order() {
        let scene = SceneDescription {
            meshes: vec![mesh_of(10, 30), mesh_of(20, 60)],
            mesh_instances: vec![
                MeshInstance {
                    mesh: 1,
                    transform: Mat4::IDENTITY,
                },
                MeshInstance {
                    mesh: 0,
                    transform: Mat4::IDENTITY,
                },
                MeshInstance {
                    mesh: 1,
                    transform: Mat4::IDENTITY,
                },
            ],
            ..Default::default()
        };

        let layout = SceneLayout::compute(&scene);
        assert_eq!(layout.meshes[1].vertex_offset, 10);
        assert_eq!(layout.meshes[1].index_offset, 30);
        // Instances group by mesh: mesh 0 first, then both of mesh 1
        assert_eq!(layout.meshes[0].first_instance, 0);
        assert_eq!(layout.meshes[0].instance_count, 1);
        assert_eq!(layout.meshes[1].first_instance, 1);
        assert_eq!(layout.meshes[1].instance_count, 2);
        assert_eq!(layout.total_mesh_instances, 3);
    }

    #[test]
    fn recompute_is_idempotent() {
        let scene = SceneDescription {
            meshes: vec![mesh_of(7, 21), mesh_of(3, 9)],
            mesh_instances: vec![MeshInstance {
                mesh: 0,
                transform: Mat4::from_translation(Vec3::X),
            }],
            ..Default::default()
        };

        let first = SceneLayout::compute(&scene);
        let second = SceneLayout::compute(&scene);
        assert_eq!(first, second);

        // And the serialized transform payload is byte-identical too
        let a: Vec<u8> = bytemuck::cast_slice(&gather_transforms(&scene)).to_vec();
        let b: Vec<u8> = bytemuck::cast_slice(&gather_transforms(&scene)).to_vec();
        assert_eq!(a, b);
    }

    #[test]
    fn transforms_follow_first_instance_order() {
        let scene = SceneDescription {
            meshes: vec![mesh_of(3, 3), mesh_of(3, 3)],
            mesh_instances: vec![
                MeshInstance {
                    mesh: 1,
                    transform: Mat4::from_translation(Vec3::Y),
                },
                MeshInstance {
                    mesh: 0,
                    transform: Mat4::from_translation(Vec3::X),
                },
            ],
            ..Default::default()
        };

        let transforms = gather_transforms(&scene);
        assert_eq!(transforms[0], Mat4::from_translation(Vec3::X));
        assert_eq!(transforms[1], Mat4::from_translation(Vec3::Y));
    }
}
