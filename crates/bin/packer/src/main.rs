use std::{f32::consts::TAU, process, rc::Rc, time::Instant};

use clap::Parser;
use env_logger::Env;
use log::{error, info};
use strata::{
    backend::{
        host::HostDevice,
        vulkan::{self, DeviceDesc},
        Cmd, GpuDevice,
    },
    math::{Mat4, Quat, Vec2, Vec3},
    DrawMode, FrameContext, IndexAddressing, Material, MeshData, MeshId, MeshNode, MeshRenderer,
    NodeId, OwnerId, OwnerTransform, RenderElement, RenderError, Renderable, RendererConfig,
    SceneTables, SkinId, StreamKind, TextureId, Vertex,
};

#[derive(Parser, Debug)]
#[clap(author, version, about = "pack a procedural scene into geometry pages", long_about = None)]
struct Args {
    /// Static mesh nodes in the scene.
    #[clap(short = 'm', long, default_value_t = 64)]
    meshes: u32,

    /// Skinned mesh nodes in the scene.
    #[clap(short = 's', long, default_value_t = 8)]
    skinned: u32,

    #[clap(short = 'f', long, default_value_t = 4)]
    frames: usize,

    /// Vertex page size in KiB.
    #[clap(long, default_value_t = 64)]
    vertex_page_kib: u64,

    /// Index page size in KiB.
    #[clap(long, default_value_t = 16)]
    index_page_kib: u64,

    #[clap(long, default_value_t = 32)]
    joints: usize,

    /// Store raw indices and address vertices through the command offset.
    #[clap(long)]
    command_offset: bool,

    /// Issue one indexed draw per visible command instead of indirect draws.
    #[clap(long)]
    direct: bool,

    /// Upload pages and indirect buffers through a headless vulkan device.
    #[clap(long)]
    vulkan: bool,

    /// Static meshes whose geometry only arrives on the second frame.
    #[clap(long, default_value_t = 0)]
    late: u32,
}

/// A flat disc: one center vertex and `segments` rim vertices.
fn disc(name: &str, segments: u32, skinned: bool) -> MeshData {
    let mut vertices = vec![Vertex::new(Vec3::ZERO, Vec3::Y, Vec2::splat(0.5))];
    for i in 0..segments {
        let angle = TAU * i as f32 / segments as f32;
        let (sin, cos) = angle.sin_cos();
        let mut vertex = Vertex::new(
            Vec3::new(cos, 0.0, sin),
            Vec3::Y,
            Vec2::new(cos * 0.5 + 0.5, sin * 0.5 + 0.5),
        );
        if skinned {
            vertex = vertex.with_joints([(i % 4) as i32, 0, 0, 0], [1.0, 0.0, 0.0, 0.0]);
        }
        vertices.push(vertex);
    }

    let indices = (0..segments)
        .flat_map(|i| [0, 1 + i, 1 + (i + 1) % segments])
        .collect();
    MeshData::new(name, vertices, indices)
}

struct Scene {
    tables: SceneTables,
    renderables: Vec<Renderable>,
    late: Vec<(MeshId, MeshData)>,
}

fn build_scene(args: &Args) -> Scene {
    let mut tables = SceneTables::new();
    tables.insert_texture(TextureId(0), 1);

    let mut nodes = Vec::new();
    let mut late = Vec::new();
    for i in 0..args.meshes {
        let mesh = disc(&format!("disc{i}"), 8 + (i % 5) * 8, false).with_texture(TextureId(0));
        if i < args.late {
            late.push((MeshId(i), mesh.clone()));
            tables.insert_mesh(MeshId(i), MeshData::new(mesh.name.clone(), Vec::new(), Vec::new()));
        } else {
            tables.insert_mesh(MeshId(i), mesh);
        }
        nodes.push(
            MeshNode::new(NodeId(i as u64), format!("static{i:04}"), OwnerId(0))
                .with_mesh(MeshId(i)),
        );
    }
    let statics = RenderElement::new(OwnerId(0), nodes);

    let mut characters = Vec::new();
    for i in 0..args.skinned {
        let id = args.meshes + i;
        tables.insert_mesh(MeshId(id), disc(&format!("body{i}"), 32, true));
        tables.set_joints(SkinId(i), vec![Mat4::IDENTITY; args.joints]);
        characters.push(
            MeshNode::new(NodeId(id as u64), format!("skinned{i:04}"), OwnerId(1 + i))
                .with_mesh(MeshId(id))
                .with_skin(SkinId(i))
                .with_filter(i % 2 == 0),
        );
    }
    let mut renderables = vec![statics];
    renderables.extend(
        characters
            .into_iter()
            .map(|node| RenderElement::new(node.owner, vec![node])),
    );

    for owner in 0..=args.skinned {
        let offset = Vec3::new(owner as f32 * 3.0, 0.0, 0.0);
        tables.insert_owner(
            OwnerId(owner),
            OwnerTransform::from_model(Mat4::from_translation(offset)),
            Material::default(),
        );
    }

    Scene {
        tables,
        renderables,
        late,
    }
}

fn animate(scene: &mut Scene, args: &Args, frame: usize) {
    let spin = Quat::from_rotation_y(frame as f32 * 0.1);
    for owner in 0..=args.skinned {
        let offset = Vec3::new(owner as f32 * 3.0, 0.0, 0.0);
        scene.tables.set_owner_transform(
            OwnerId(owner),
            OwnerTransform::from_model(Mat4::from_rotation_translation(spin, offset)),
        );
    }
    for skin in 0..args.skinned {
        let pose = Mat4::from_rotation_x(frame as f32 * 0.05);
        scene.tables.set_joints(SkinId(skin), vec![pose; args.joints]);
    }
}

/// Frame plumbing that differs between the devices packer can drive.
trait FrameDevice: GpuDevice {
    /// False when the device has nothing to draw into, in which case frames
    /// are only prepared.
    const RECORDS_DRAWS: bool;

    fn begin_frame(&self, frame: usize, frames_in_flight: usize) -> Result<Cmd, RenderError>;

    /// Finishes the frame and returns how many draw calls it held.
    fn end_frame(&self) -> Result<usize, RenderError>;

    fn report(&self);
}

impl FrameDevice for HostDevice {
    const RECORDS_DRAWS: bool = true;

    fn begin_frame(&self, frame: usize, frames_in_flight: usize) -> Result<Cmd, RenderError> {
        Ok(Cmd(frame % frames_in_flight))
    }

    fn end_frame(&self) -> Result<usize, RenderError> {
        Ok(self.take_draws().len() + self.take_direct_draws().len())
    }

    fn report(&self) {
        let host = self.stats();
        info!(
            "{} buffers, {} staged bytes in {} flushes, {} mapped bytes",
            host.buffers_created, host.staged_bytes, host.flushes, host.mapped_bytes
        );
    }
}

// the headless device has no render pass or pipeline to draw with
impl FrameDevice for vulkan::Device {
    const RECORDS_DRAWS: bool = false;

    fn begin_frame(&self, _frame: usize, _frames_in_flight: usize) -> Result<Cmd, RenderError> {
        Ok(self.begin_command_buffer()?)
    }

    fn end_frame(&self) -> Result<usize, RenderError> {
        self.end_command_buffers()?;
        Ok(0)
    }

    fn report(&self) {
        info!("uploads went through '{}'", self.device_name());
    }
}

fn config(args: &Args) -> RendererConfig {
    RendererConfig::default()
        .with_page_size(args.vertex_page_kib * 1024, args.index_page_kib * 1024)
        .with_max_joints_per_skin(args.joints)
        .with_index_addressing(if args.command_offset {
            IndexAddressing::CommandOffset
        } else {
            IndexAddressing::PageRebased
        })
        .with_draw_mode(if args.direct {
            DrawMode::Direct
        } else {
            DrawMode::Indirect
        })
}

fn run<D: FrameDevice>(args: &Args, device: Rc<D>) -> Result<(), RenderError> {
    let mut renderer = MeshRenderer::new(device.clone(), config(args))?;
    let mut scene = build_scene(args);
    renderer.setup(&scene.renderables);

    for frame in 0..args.frames {
        let start = Instant::now();
        if frame == 1 {
            for (id, mesh) in scene.late.drain(..) {
                scene.tables.insert_mesh(id, mesh);
            }
        }
        animate(&mut scene, args, frame);

        let context = FrameContext {
            frame_index: frame,
            cmd: device.begin_frame(frame, renderer.config().frames_in_flight)?,
        };
        // every other node is culled on odd frames
        let mut cull = |node: &MeshNode| frame % 2 == 0 || node.id.0 % 2 == 0;

        renderer.update(&context, &scene.tables)?;
        let visible = if D::RECORDS_DRAWS {
            renderer.render(&scene.renderables, &scene.tables, &context, &mut cull)?
        } else {
            renderer.prepare(&scene.renderables, &scene.tables, &context, &mut cull)?
        };
        let draws = device.end_frame()?;

        info!(
            "frame {}: {} visible commands, {} draw calls, {} animated nodes, took {:?}",
            frame,
            visible,
            draws,
            renderer.visible_skinned_nodes().len(),
            start.elapsed()
        );
    }

    let stats = renderer.stats();
    for kind in StreamKind::ALL {
        let stream = renderer.stream(kind);
        let stream_stats = match kind {
            StreamKind::Static => stats.static_stream,
            StreamKind::Skinned => stats.skinned_stream,
        };
        info!(
            "{} stream: {} nodes, {} pages, {} deferred",
            kind, stream_stats.nodes, stream_stats.pages, stream_stats.deferred
        );
        for (i, page) in stream.pool().pages().iter().enumerate() {
            info!(
                "  page {}: {}/{} vertex bytes, {}/{} index bytes, {} commands",
                i,
                page.vertex.used(),
                page.vertex.capacity(),
                page.index.used(),
                page.index.capacity(),
                stream.command_sets()[i].len()
            );
        }
    }

    info!(
        "{} rebuilds, {} object records, {} joint matrices",
        stats.rebuilds,
        renderer.object_data().records().len(),
        renderer.object_data().joints().len()
    );
    device.report();

    renderer.dispose()
}

fn start(args: &Args) -> Result<(), RenderError> {
    if args.vulkan {
        let device = vulkan::Device::new(&DeviceDesc::default())?;
        run(args, Rc::new(device))
    } else {
        run(args, Rc::new(HostDevice::new()))
    }
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if let Err(err) = start(&args) {
        error!("{}", err);
        process::exit(1);
    }
}
