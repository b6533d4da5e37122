//! Per-object records and joint matrices read by the vertex shaders.
//!
//! Every flattened node owns one [`ObjectRecord`] slot. Static nodes take
//! slots `[0, n)` and skinned nodes `[n, n + m)` in flattened order, which
//! is exactly the `first_instance` their draw commands carry. Skinned nodes
//! also own a contiguous range of the joint block.

use std::collections::HashMap;

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};
use log::debug;
use strata_backend::{GPUBufferUsage, GpuDevice};

use crate::{
    error::RenderError,
    flatten::{FlatNodes, StreamKind},
    growable::GrowableBuffer,
    scene::{Material, MeshId, MeshNode, NodeId, OwnerId, SceneSource, SkinId, TextureId},
};

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct ObjectRecord {
    pub model: Mat4,
    pub normal: Mat4,
    pub mesh_matrix: Mat4,
    /// `x` is the first joint of the node in the joint block.
    pub joints_offset: Vec4,
    /// `w` is 1.0 when the node is filtered in the shader.
    pub color: Vec4,
    /// `w` is the texture index.
    pub ambient: Vec4,
    /// `w` is the texture index.
    pub diffuse: Vec4,
    /// `w` is the shininess.
    pub specular: Vec4,
}

impl ObjectRecord {
    pub const SIZE: usize = std::mem::size_of::<ObjectRecord>();

    fn set_material(&mut self, material: &Material, texture_index: u32, filter_in_shader: bool) {
        let texture = texture_index as f32;
        self.color = material.color.extend(if filter_in_shader { 1.0 } else { 0.0 });
        self.ambient = material.ambient.extend(texture);
        self.diffuse = material.diffuse.extend(texture);
        self.specular = material.specular.extend(material.shininess);
    }
}

#[derive(Clone, Copy, Debug)]
struct SlotEntry {
    node: NodeId,
    owner: OwnerId,
    mesh: Option<MeshId>,
    skin: Option<SkinId>,
    joint_offset: u32,
    joint_count: u32,
}

pub struct ObjectDataWriter<D: GpuDevice> {
    records: Vec<ObjectRecord>,
    joints: Vec<Mat4>,
    entries: Vec<SlotEntry>,
    slots: HashMap<NodeId, u32>,
    tex_index_cache: HashMap<TextureId, u32>,
    object_buffers: Vec<GrowableBuffer<D>>,
    joint_buffers: Vec<GrowableBuffer<D>>,
}

impl<D: GpuDevice> ObjectDataWriter<D> {
    pub fn new(frames_in_flight: usize) -> Self {
        let frames = frames_in_flight.max(1);
        ObjectDataWriter {
            records: Vec::new(),
            joints: Vec::new(),
            entries: Vec::new(),
            slots: HashMap::new(),
            tex_index_cache: HashMap::new(),
            object_buffers: (0..frames)
                .map(|i| {
                    GrowableBuffer::new(format!("objects({i})"), GPUBufferUsage::STORAGE_BUFFER)
                })
                .collect(),
            joint_buffers: (0..frames)
                .map(|i| {
                    GrowableBuffer::new(format!("joints({i})"), GPUBufferUsage::STORAGE_BUFFER)
                })
                .collect(),
        }
    }

    /// Lays out slots and joint ranges for `flat` and fills the fields that
    /// only change on rebuild: material, texture index, filter flag and
    /// joint offset.
    pub fn rebuild(&mut self, flat: &FlatNodes, source: &impl SceneSource, max_joints: usize) {
        self.records.clear();
        self.joints.clear();
        self.entries.clear();
        self.slots.clear();
        self.tex_index_cache.clear();

        let mut joint_total = 0u32;
        for kind in StreamKind::ALL {
            for node in flat.nodes(kind) {
                let joint_count = node.skin.map_or(0, |skin| {
                    let available = source.joint_matrices(skin).len();
                    if available > max_joints {
                        debug!(
                            "node '{}' has {} joints, clamping to {}",
                            node.name, available, max_joints
                        );
                    }
                    available.min(max_joints) as u32
                });

                let slot = self.records.len() as u32;
                self.slots.insert(node.id, slot);
                self.entries.push(SlotEntry {
                    node: node.id,
                    owner: node.owner,
                    mesh: node.mesh,
                    skin: node.skin,
                    joint_offset: joint_total,
                    joint_count,
                });

                let mut record = ObjectRecord {
                    joints_offset: Vec4::new(joint_total as f32, 0.0, 0.0, 0.0),
                    ..Default::default()
                };
                let texture_index = self.texture_index(node, source);
                record.set_material(
                    &source.owner_material(node.owner),
                    texture_index,
                    node.filter_in_shader,
                );
                self.records.push(record);

                joint_total += joint_count;
            }
        }

        self.joints.resize(joint_total as usize, Mat4::IDENTITY);
        self.update(source);
    }

    fn texture_index(&mut self, node: &MeshNode, source: &impl SceneSource) -> u32 {
        let texture = node
            .mesh
            .and_then(|mesh| source.mesh(mesh))
            .and_then(|mesh| mesh.texture);
        let Some(texture) = texture else {
            return 0;
        };
        *self
            .tex_index_cache
            .entry(texture)
            .or_insert_with(|| source.resolve_texture_index(texture))
    }

    /// Refreshes matrices and joints of every slot whose owner is not
    /// disposed.
    pub fn update(&mut self, source: &impl SceneSource) {
        for (entry, record) in self.entries.iter().zip(self.records.iter_mut()) {
            if source.owner_state(entry.owner).disposed {
                continue;
            }

            let transform = source.owner_transform(entry.owner);
            record.model = transform.model;
            record.normal = transform.normal;
            record.mesh_matrix = entry
                .mesh
                .and_then(|mesh| source.mesh(mesh))
                .map_or(Mat4::IDENTITY, |mesh| mesh.matrix);

            if let Some(skin) = entry.skin {
                let current = source.joint_matrices(skin);
                let count = current.len().min(entry.joint_count as usize);
                let start = entry.joint_offset as usize;
                self.joints[start..start + count].copy_from_slice(&current[..count]);
            }
        }
    }

    /// Writes the records and the joint block into this frame's buffers.
    pub fn upload(&mut self, device: &D, frame_index: usize) -> Result<(), RenderError> {
        let frame = frame_index % self.object_buffers.len();
        self.object_buffers[frame].write(device, bytemuck::cast_slice(&self.records))?;
        self.joint_buffers[frame].write(device, bytemuck::cast_slice(&self.joints))?;
        Ok(())
    }

    pub fn slot_of(&self, node: NodeId) -> Option<u32> {
        self.slots.get(&node).copied()
    }

    pub fn joint_offset(&self, node: NodeId) -> Option<u32> {
        let slot = self.slot_of(node)?;
        self.entries
            .get(slot as usize)
            .filter(|entry| entry.skin.is_some())
            .map(|entry| entry.joint_offset)
    }

    pub fn records(&self) -> &[ObjectRecord] {
        &self.records
    }

    pub fn joints(&self) -> &[Mat4] {
        &self.joints
    }

    pub fn object_buffer(&self, frame_index: usize) -> Option<&D::Buffer> {
        self.object_buffers[frame_index % self.object_buffers.len()].buffer()
    }

    pub fn joint_buffer(&self, frame_index: usize) -> Option<&D::Buffer> {
        self.joint_buffers[frame_index % self.joint_buffers.len()].buffer()
    }

    /// Node ids in slot order.
    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.entries.iter().map(|entry| entry.node)
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.joints.clear();
        self.entries.clear();
        self.slots.clear();
        self.tex_index_cache.clear();
        self.object_buffers.iter_mut().for_each(GrowableBuffer::clear);
        self.joint_buffers.iter_mut().for_each(GrowableBuffer::clear);
    }
}
