//! Paged geometry buffers and indirect draws for mesh rendering.
//!
//! Mesh nodes are flattened into a static and a skinned stream, packed into
//! fixed capacity vertex/index pages and given one indexed draw command
//! each. Every frame the visible commands are compacted into one indirect
//! buffer per page (or issued one by one on devices without multi draw
//! indirect), and per-object records plus joint matrices are uploaded
//! for the shaders.

pub mod buffer_pool;
pub mod config;
pub mod culling;
pub mod error;
pub mod flatten;
mod growable;
pub mod indirect;
pub mod mesh;
pub mod object_data;
pub mod renderer;
pub mod scene;
pub mod stream;

pub use glam as math;
pub use strata_backend as backend;

pub use config::{DrawMode, IndexAddressing, RendererConfig};
pub use culling::{AllVisible, VisibilityPredicate};
pub use error::RenderError;
pub use flatten::StreamKind;
pub use mesh::{MeshData, Vertex};
pub use object_data::ObjectRecord;
pub use renderer::{FrameContext, MeshRenderer, RenderStats, SizingHint, StreamStats};
pub use scene::{
    Material, MeshId, MeshNode, NodeId, OwnerId, OwnerState, OwnerTransform, RenderElement,
    Renderable, SceneSource, SceneTables, SkinId, TextureId,
};
