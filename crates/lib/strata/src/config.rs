use std::mem;

use crate::{error::RenderError, mesh::Vertex};

/// How packed indices address the page's vertex buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexAddressing {
    /// Indices are rebiased by the vertices already in the page when they
    /// are packed; commands carry a zero vertex offset.
    PageRebased,
    /// Indices are stored as authored; commands carry the node's first
    /// vertex as their vertex offset.
    CommandOffset,
}

/// How the visible commands of a frame are issued.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrawMode {
    /// One indirect draw per page over its compacted commands.
    Indirect,
    /// One indexed draw per visible command, for devices without
    /// multi draw indirect.
    Direct,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RendererConfig {
    /// Byte capacity of one page's vertex buffer.
    pub page_vertex_bytes: u64,
    /// Byte capacity of one page's index buffer.
    pub page_index_bytes: u64,
    pub frames_in_flight: usize,
    pub max_joints_per_skin: usize,
    pub index_addressing: IndexAddressing,
    pub draw_mode: DrawMode,
}

impl RendererConfig {
    pub const DEFAULT_PAGE_VERTEX_BYTES: u64 = 64 * 1024 * 1024;
    pub const DEFAULT_PAGE_INDEX_BYTES: u64 = 16 * 1024 * 1024;
    pub const FRAME_MAX_COUNT: usize = 2;
    pub const MAX_NUM_JOINTS: usize = 128;

    pub fn with_page_size(mut self, vertex_bytes: u64, index_bytes: u64) -> Self {
        self.page_vertex_bytes = vertex_bytes;
        self.page_index_bytes = index_bytes;
        self
    }

    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames;
        self
    }

    pub fn with_index_addressing(mut self, addressing: IndexAddressing) -> Self {
        self.index_addressing = addressing;
        self
    }

    pub fn with_draw_mode(mut self, mode: DrawMode) -> Self {
        self.draw_mode = mode;
        self
    }

    pub fn with_max_joints_per_skin(mut self, joints: usize) -> Self {
        self.max_joints_per_skin = joints;
        self
    }

    pub fn validate(&self) -> Result<(), RenderError> {
        let invalid = |reason: &str| {
            Err(RenderError::InvalidConfig {
                reason: reason.into(),
            })
        };

        if self.page_vertex_bytes < Vertex::STRIDE {
            return invalid("a vertex page must hold at least one vertex");
        }
        if self.page_index_bytes < mem::size_of::<u32>() as u64 {
            return invalid("an index page must hold at least one index");
        }
        if self.frames_in_flight == 0 {
            return invalid("at least one frame must be in flight");
        }
        Ok(())
    }
}

impl Default for RendererConfig {
    fn default() -> Self {
        RendererConfig {
            page_vertex_bytes: Self::DEFAULT_PAGE_VERTEX_BYTES,
            page_index_bytes: Self::DEFAULT_PAGE_INDEX_BYTES,
            frames_in_flight: Self::FRAME_MAX_COUNT,
            max_joints_per_skin: Self::MAX_NUM_JOINTS,
            index_addressing: IndexAddressing::PageRebased,
            draw_mode: DrawMode::Indirect,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        let config = RendererConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.index_addressing, IndexAddressing::PageRebased);
        assert_eq!(config.draw_mode, DrawMode::Indirect);
        assert_eq!(config.max_joints_per_skin, 128);
    }

    #[test]
    fn rejects_pages_smaller_than_one_element() {
        let config = RendererConfig::default().with_page_size(Vertex::STRIDE - 1, 1024);
        assert!(matches!(
            config.validate(),
            Err(RenderError::InvalidConfig { .. })
        ));

        let config = RendererConfig::default().with_page_size(1024, 3);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_frames() {
        let config = RendererConfig::default().with_frames_in_flight(0);
        assert!(config.validate().is_err());
    }
}
