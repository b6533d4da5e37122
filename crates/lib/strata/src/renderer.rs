use std::rc::Rc;

use log::{debug, info, trace, warn};
use strata_backend::{Cmd, GpuDevice};

use crate::{
    config::{DrawMode, RendererConfig},
    culling::VisibilityPredicate,
    error::RenderError,
    flatten::{flatten, FlatNodes, RenderableCache, StreamKind},
    object_data::ObjectDataWriter,
    scene::{NodeId, Renderable, SceneSource},
    stream::GeometryStream,
};

/// What the frame driver hands the renderer each frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameContext {
    /// Monotonic frame number; selects the per-frame buffers.
    pub frame_index: usize,
    pub cmd: Cmd,
}

/// Counts recorded by [`MeshRenderer::setup`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SizingHint {
    pub elements: usize,
    pub nodes: usize,
    pub skinned_nodes: usize,
}

impl SizingHint {
    fn of(renderables: &[Renderable], flat: &FlatNodes) -> Self {
        SizingHint {
            elements: renderables.len(),
            nodes: flat.len(),
            skinned_nodes: flat.skinned_nodes.len(),
        }
    }

    fn covers(&self, other: &SizingHint) -> bool {
        other.elements <= self.elements
            && other.nodes <= self.nodes
            && other.skinned_nodes <= self.skinned_nodes
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub nodes: usize,
    pub pages: usize,
    pub deferred: usize,
    pub visible: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenderStats {
    pub rebuilds: u64,
    pub last_visible: u32,
    pub static_stream: StreamStats,
    pub skinned_stream: StreamStats,
}

/// Packs the renderable set into paged geometry and draws the visible part
/// of it with one indirect draw per page.
///
/// Per frame the driver calls [`update`](Self::update) and then
/// [`render`](Self::render). A rebuild only happens when the renderable set
/// changed or a node that was waiting for geometry got some.
pub struct MeshRenderer<D: GpuDevice> {
    config: RendererConfig,
    cache: RenderableCache,
    static_stream: GeometryStream<D>,
    skinned_stream: GeometryStream<D>,
    object_data: ObjectDataWriter<D>,
    hint: Option<SizingHint>,
    rebuilds: u64,
    last_visible: u32,
    // dropped last, after every buffer created from it
    device: Rc<D>,
}

impl<D: GpuDevice> MeshRenderer<D> {
    pub fn new(device: Rc<D>, config: RendererConfig) -> Result<Self, RenderError> {
        config.validate()?;
        info!(
            "mesh renderer: {} byte vertex pages, {} byte index pages, {} frames in flight",
            config.page_vertex_bytes, config.page_index_bytes, config.frames_in_flight
        );

        Ok(MeshRenderer {
            static_stream: GeometryStream::new(StreamKind::Static, &config),
            skinned_stream: GeometryStream::new(StreamKind::Skinned, &config),
            object_data: ObjectDataWriter::new(config.frames_in_flight),
            cache: RenderableCache::default(),
            hint: None,
            rebuilds: 0,
            last_visible: 0,
            config,
            device,
        })
    }

    /// Records how large the renderable set is expected to be.
    pub fn setup(&mut self, renderables: &[Renderable]) {
        let hint = SizingHint::of(renderables, &flatten(renderables));
        if hint.nodes == 0 {
            warn!("setup called without any drawable nodes");
        }
        info!(
            "setup: {} elements, {} nodes ({} skinned)",
            hint.elements, hint.nodes, hint.skinned_nodes
        );
        self.hint = Some(hint);
    }

    pub fn sizing_hint(&self) -> Option<SizingHint> {
        self.hint
    }

    /// True when `renderables` stays within the counts given to `setup`.
    pub fn fits_hint(&self, renderables: &[Renderable]) -> bool {
        let wanted = SizingHint::of(renderables, &flatten(renderables));
        self.hint.map_or(false, |hint| hint.covers(&wanted))
    }

    /// Refreshes per-object matrices and joints and uploads them into the
    /// frame's buffers.
    pub fn update(
        &mut self,
        frame: &FrameContext,
        source: &impl SceneSource,
    ) -> Result<(), RenderError> {
        self.object_data.update(source);
        self.object_data.upload(&self.device, frame.frame_index)
    }

    /// Rebuilds if needed, refills the visible commands and records the
    /// draws. Returns the number of visible commands.
    ///
    /// Nothing is recorded when no command is visible.
    pub fn render<P: VisibilityPredicate + ?Sized>(
        &mut self,
        renderables: &[Renderable],
        source: &impl SceneSource,
        frame: &FrameContext,
        predicate: &mut P,
    ) -> Result<u32, RenderError> {
        let visible = self.prepare(renderables, source, frame, predicate)?;
        if visible == 0 {
            trace!("frame {}: nothing visible", frame.frame_index);
            return Ok(0);
        }

        let draws = self.record(frame.cmd);
        trace!(
            "frame {}: {} visible commands in {} {:?} draws",
            frame.frame_index,
            visible,
            draws,
            self.config.draw_mode
        );
        Ok(visible)
    }

    /// The first half of [`render`](Self::render): rebuilds if needed and
    /// refills the visible commands and indirect buffers, without recording
    /// any draw.
    pub fn prepare<P: VisibilityPredicate + ?Sized>(
        &mut self,
        renderables: &[Renderable],
        source: &impl SceneSource,
        frame: &FrameContext,
        predicate: &mut P,
    ) -> Result<u32, RenderError> {
        let changed = !self.cache.matches(renderables);
        let late = !changed
            && (self.static_stream.has_ready_deferred(source)
                || self.skinned_stream.has_ready_deferred(source));
        if changed || late {
            if late {
                debug!("geometry arrived for a waiting node, rebuilding");
            }
            if let Err(err) = self.rebuild(renderables, source) {
                self.clear_built();
                return Err(err);
            }
            self.update(frame, source)?;
        }

        let visible = self
            .static_stream
            .refill_visible(&self.device, &mut *predicate, source)?
            + self
                .skinned_stream
                .refill_visible(&self.device, &mut *predicate, source)?;
        self.last_visible = visible;
        Ok(visible)
    }

    /// Records the draws for the commands gathered by the last
    /// [`prepare`](Self::prepare), in the configured [`DrawMode`]. Returns
    /// the number of draw calls.
    pub fn record(&self, cmd: Cmd) -> usize {
        if self.last_visible == 0 {
            return 0;
        }
        match self.config.draw_mode {
            DrawMode::Indirect => {
                self.static_stream.draw(&self.device, cmd)
                    + self.skinned_stream.draw(&self.device, cmd)
            }
            DrawMode::Direct => {
                self.static_stream.draw_direct(&self.device, cmd)
                    + self.skinned_stream.draw_direct(&self.device, cmd)
            }
        }
    }

    fn rebuild(
        &mut self,
        renderables: &[Renderable],
        source: &impl SceneSource,
    ) -> Result<(), RenderError> {
        let flat = flatten(renderables);
        if let Some(hint) = self.hint {
            if !hint.covers(&SizingHint::of(renderables, &flat)) {
                debug!("renderable set outgrew the setup hint");
            }
        }

        let addressing = self.config.index_addressing;
        let skinned_base =
            u32::try_from(flat.static_nodes.len()).map_err(|_| RenderError::InvalidConfig {
                reason: "too many static nodes for 32 bit instance indices".into(),
            })?;
        self.static_stream
            .rebuild(&self.device, &flat.static_nodes, 0, source, addressing)?;
        self.skinned_stream
            .rebuild(&self.device, &flat.skinned_nodes, skinned_base, source, addressing)?;
        self.object_data
            .rebuild(&flat, source, self.config.max_joints_per_skin);

        self.cache.store(renderables);
        self.rebuilds += 1;
        info!(
            "rebuild #{}: {} static and {} skinned nodes",
            self.rebuilds,
            flat.static_nodes.len(),
            flat.skinned_nodes.len()
        );
        Ok(())
    }

    fn clear_built(&mut self) {
        self.static_stream.clear();
        self.skinned_stream.clear();
        self.object_data.clear();
        self.cache.clear();
        self.last_visible = 0;
    }

    /// Waits for the device, then drops every page, buffer and cached map.
    pub fn dispose(&mut self) -> Result<(), RenderError> {
        self.device.wait_for_gpu()?;
        self.clear_built();
        self.hint = None;
        self.rebuilds = 0;
        info!("mesh renderer disposed");
        Ok(())
    }

    pub fn stream(&self, kind: StreamKind) -> &GeometryStream<D> {
        match kind {
            StreamKind::Static => &self.static_stream,
            StreamKind::Skinned => &self.skinned_stream,
        }
    }

    pub fn object_data(&self) -> &ObjectDataWriter<D> {
        &self.object_data
    }

    /// Skinned nodes drawn by the last `render`, for the animation system.
    pub fn visible_skinned_nodes(&self) -> &[NodeId] {
        self.skinned_stream.drawn()
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn device(&self) -> &Rc<D> {
        &self.device
    }

    pub fn stats(&self) -> RenderStats {
        let stream_stats = |stream: &GeometryStream<D>| StreamStats {
            nodes: stream.nodes().len(),
            pages: stream.pool().page_count(),
            deferred: stream.deferred().len(),
            visible: stream.visible_count(),
        };
        RenderStats {
            rebuilds: self.rebuilds,
            last_visible: self.last_visible,
            static_stream: stream_stats(&self.static_stream),
            skinned_stream: stream_stats(&self.skinned_stream),
        }
    }
}
