use std::mem;

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec3};

use crate::scene::TextureId;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub color: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
    pub joint_indices: [i32; 4],
    pub joint_weights: [f32; 4],
}

impl Vertex {
    pub const STRIDE: u64 = mem::size_of::<Vertex>() as u64;

    pub fn new(position: Vec3, normal: Vec3, uv: Vec2) -> Self {
        Vertex {
            position: position.to_array(),
            color: [1.0; 3],
            normal: normal.to_array(),
            uv: uv.to_array(),
            ..Default::default()
        }
    }

    pub fn with_joints(mut self, indices: [i32; 4], weights: [f32; 4]) -> Self {
        self.joint_indices = indices;
        self.joint_weights = weights;
        self
    }
}

/// Geometry of one mesh as handed over by the asset layer.
#[derive(Clone, Debug, Default)]
pub struct MeshData {
    pub name: String,
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    /// Mesh-local transform applied before the owner's model matrix.
    pub matrix: Mat4,
    pub texture: Option<TextureId>,
}

impl MeshData {
    pub fn new(name: impl Into<String>, vertices: Vec<Vertex>, indices: Vec<u32>) -> Self {
        MeshData {
            name: name.into(),
            vertices,
            indices,
            matrix: Mat4::IDENTITY,
            texture: None,
        }
    }

    pub fn with_texture(mut self, texture: TextureId) -> Self {
        self.texture = Some(texture);
        self
    }

    pub fn with_matrix(mut self, matrix: Mat4) -> Self {
        self.matrix = matrix;
        self
    }

    /// A mesh still loading has no indices or no vertices yet.
    pub fn is_drawable(&self) -> bool {
        !self.indices.is_empty() && !self.vertices.is_empty()
    }

    pub fn vertex_bytes(&self) -> u64 {
        self.vertices.len() as u64 * Vertex::STRIDE
    }

    pub fn index_bytes(&self) -> u64 {
        (self.indices.len() * mem::size_of::<u32>()) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout() {
        assert_eq!(Vertex::STRIDE, 76);
        assert_eq!(mem::align_of::<Vertex>(), 4);
    }

    #[test]
    fn drawable_needs_indices_and_vertices() {
        let v = Vertex::default();
        assert!(MeshData::new("tri", vec![v; 3], vec![0, 1, 2]).is_drawable());
        assert!(!MeshData::new("loading", vec![v; 3], vec![]).is_drawable());
        assert!(!MeshData::new("empty", vec![], vec![0]).is_drawable());
    }

    #[test]
    fn byte_sizes() {
        let mesh = MeshData::new("quad", vec![Vertex::default(); 4], vec![0, 1, 2, 2, 3, 0]);
        assert_eq!(mesh.vertex_bytes(), 4 * 76);
        assert_eq!(mesh.index_bytes(), 24);
    }
}
