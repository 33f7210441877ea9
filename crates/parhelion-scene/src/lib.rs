//! Scene aggregate buffers and acceleration structures for the Parhelion
//! renderer.
//!
//! Consumes fully-decoded meshes, textures, and voxel volumes from external
//! loaders, lays them out into scene-wide concatenated device buffers, and
//! drives the streaming upload layer to populate them, together with the
//! bottom/top-level acceleration structures ray tracing consumes.

pub mod acceleration;
pub mod builder;
pub mod data;
pub mod layout;

pub use acceleration::{transform_rows, AabbPositions, Blas, SceneTlas, TlasInstanceDesc};
pub use builder::SceneResources;
pub use data::{
    Light, MeshData, MeshInstance, ObjectDesc, SceneDescription, TextureData, Vertex, VolumeData,
    VolumeInstance,
};
pub use layout::{gather_object_descs, gather_transforms, MeshSlot, SceneLayout};
