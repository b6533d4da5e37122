//! What the renderer reads from the scene layer.
//!
//! Nodes refer to their owner, mesh, skin and textures by id. Everything
//! behind an id is looked up through [`SceneSource`], so the renderer never
//! holds references into the scene graph.

use std::{collections::HashMap, sync::Arc};

use glam::{Mat4, Vec3};

use crate::mesh::MeshData;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeshId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SkinId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(pub u32);

/// A drawable unit of the scene. Read only to the renderer.
#[derive(Clone, Debug, PartialEq)]
pub struct MeshNode {
    pub id: NodeId,
    /// Sort key; keeps page and slot assignment stable across rebuilds.
    pub name: String,
    pub owner: OwnerId,
    pub mesh: Option<MeshId>,
    pub skin: Option<SkinId>,
    pub enabled: bool,
    /// Exposed to shaders through the object record color's w component.
    pub filter_in_shader: bool,
}

impl MeshNode {
    pub fn new(id: NodeId, name: impl Into<String>, owner: OwnerId) -> Self {
        MeshNode {
            id,
            name: name.into(),
            owner,
            mesh: None,
            skin: None,
            enabled: true,
            filter_in_shader: false,
        }
    }

    pub fn with_mesh(mut self, mesh: MeshId) -> Self {
        self.mesh = Some(mesh);
        self
    }

    pub fn with_skin(mut self, skin: SkinId) -> Self {
        self.skin = Some(skin);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_filter(mut self, filter_in_shader: bool) -> Self {
        self.filter_in_shader = filter_in_shader;
        self
    }

    pub fn has_skin(&self) -> bool {
        self.skin.is_some()
    }
}

/// A renderable element: an owner and the mesh nodes it draws.
///
/// Elements are shared as `Arc`s. The renderer compares the incoming set
/// against the previous one by pointer, so the scene layer builds a new
/// element whenever its node list changes.
#[derive(Debug)]
pub struct RenderElement {
    pub owner: OwnerId,
    pub nodes: Vec<MeshNode>,
}

pub type Renderable = Arc<RenderElement>;

impl RenderElement {
    pub fn new(owner: OwnerId, nodes: Vec<MeshNode>) -> Renderable {
        Arc::new(RenderElement { owner, nodes })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OwnerState {
    pub active: bool,
    pub disposed: bool,
}

impl OwnerState {
    pub const LIVE: OwnerState = OwnerState {
        active: true,
        disposed: false,
    };

    pub fn is_drawable(&self) -> bool {
        self.active && !self.disposed
    }
}

impl Default for OwnerState {
    fn default() -> Self {
        OwnerState::LIVE
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OwnerTransform {
    pub model: Mat4,
    pub normal: Mat4,
}

impl OwnerTransform {
    pub fn from_model(model: Mat4) -> Self {
        OwnerTransform {
            model,
            normal: model.inverse().transpose(),
        }
    }
}

impl Default for OwnerTransform {
    fn default() -> Self {
        OwnerTransform {
            model: Mat4::IDENTITY,
            normal: Mat4::IDENTITY,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Material {
    pub color: Vec3,
    pub ambient: Vec3,
    pub diffuse: Vec3,
    pub specular: Vec3,
    pub shininess: f32,
}

impl Default for Material {
    fn default() -> Self {
        Material {
            color: Vec3::ONE,
            ambient: Vec3::ONE,
            diffuse: Vec3::splat(0.5),
            specular: Vec3::ONE,
            shininess: 0.001,
        }
    }
}

/// Lookups the renderer needs from the scene and asset layers.
pub trait SceneSource {
    fn mesh(&self, id: MeshId) -> Option<&MeshData>;

    fn owner_state(&self, owner: OwnerId) -> OwnerState;

    fn owner_transform(&self, owner: OwnerId) -> OwnerTransform;

    fn owner_material(&self, owner: OwnerId) -> Material;

    fn resolve_texture_index(&self, texture: TextureId) -> u32;

    /// Current output joint matrices of a skin, empty when unknown.
    fn joint_matrices(&self, skin: SkinId) -> &[Mat4];
}

#[derive(Clone, Debug, Default)]
struct OwnerEntry {
    state: OwnerState,
    transform: OwnerTransform,
    material: Material,
}

/// In-memory side tables implementing [`SceneSource`].
///
/// Unknown owners read as live with identity transform and default
/// material; unknown textures resolve to index 0.
#[derive(Clone, Debug, Default)]
pub struct SceneTables {
    meshes: HashMap<MeshId, MeshData>,
    owners: HashMap<OwnerId, OwnerEntry>,
    skins: HashMap<SkinId, Vec<Mat4>>,
    textures: HashMap<TextureId, u32>,
}

impl SceneTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_mesh(&mut self, id: MeshId, mesh: MeshData) {
        self.meshes.insert(id, mesh);
    }

    pub fn mesh_mut(&mut self, id: MeshId) -> Option<&mut MeshData> {
        self.meshes.get_mut(&id)
    }

    pub fn insert_owner(&mut self, owner: OwnerId, transform: OwnerTransform, material: Material) {
        self.owners.insert(
            owner,
            OwnerEntry {
                state: OwnerState::LIVE,
                transform,
                material,
            },
        );
    }

    pub fn set_owner_state(&mut self, owner: OwnerId, state: OwnerState) {
        self.owners.entry(owner).or_default().state = state;
    }

    pub fn set_owner_transform(&mut self, owner: OwnerId, transform: OwnerTransform) {
        self.owners.entry(owner).or_default().transform = transform;
    }

    pub fn set_owner_material(&mut self, owner: OwnerId, material: Material) {
        self.owners.entry(owner).or_default().material = material;
    }

    pub fn set_joints(&mut self, skin: SkinId, joints: Vec<Mat4>) {
        self.skins.insert(skin, joints);
    }

    pub fn insert_texture(&mut self, texture: TextureId, index: u32) {
        self.textures.insert(texture, index);
    }
}

impl SceneSource for SceneTables {
    fn mesh(&self, id: MeshId) -> Option<&MeshData> {
        self.meshes.get(&id)
    }

    fn owner_state(&self, owner: OwnerId) -> OwnerState {
        self.owners
            .get(&owner)
            .map(|entry| entry.state)
            .unwrap_or_default()
    }

    fn owner_transform(&self, owner: OwnerId) -> OwnerTransform {
        self.owners
            .get(&owner)
            .map(|entry| entry.transform)
            .unwrap_or_default()
    }

    fn owner_material(&self, owner: OwnerId) -> Material {
        self.owners
            .get(&owner)
            .map(|entry| entry.material)
            .unwrap_or_default()
    }

    fn resolve_texture_index(&self, texture: TextureId) -> u32 {
        self.textures.get(&texture).copied().unwrap_or(0)
    }

    fn joint_matrices(&self, skin: SkinId) -> &[Mat4] {
        self.skins.get(&skin).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_ids_fall_back_to_defaults() {
        let tables = SceneTables::new();
        assert_eq!(tables.owner_state(OwnerId(3)), OwnerState::LIVE);
        assert_eq!(tables.owner_transform(OwnerId(3)), OwnerTransform::default());
        assert_eq!(tables.resolve_texture_index(TextureId(9)), 0);
        assert!(tables.joint_matrices(SkinId(1)).is_empty());
        assert!(tables.mesh(MeshId(0)).is_none());
    }

    #[test]
    fn owner_state_updates_keep_transform() {
        let mut tables = SceneTables::new();
        let model = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0));
        tables.insert_owner(OwnerId(1), OwnerTransform::from_model(model), Material::default());
        tables.set_owner_state(
            OwnerId(1),
            OwnerState {
                active: false,
                disposed: false,
            },
        );

        assert!(!tables.owner_state(OwnerId(1)).is_drawable());
        assert_eq!(tables.owner_transform(OwnerId(1)).model, model);
    }

    #[test]
    fn normal_matrix_of_uniform_scale() {
        let transform = OwnerTransform::from_model(Mat4::from_scale(Vec3::splat(2.0)));
        let expected = Mat4::from_scale(Vec3::splat(0.5));
        assert!(transform.normal.abs_diff_eq(expected, 1e-6));
    }
}
