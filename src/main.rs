//! PVGPU Winsys Demo
//!
//! Drives the winsys against the loopback device:
//! 1. Creates a screen and a rendering context
//! 2. Creates surfaces, buffers, shaders and a query object
//! 3. Records and commits a frame of draws per iteration
//! 4. Periodically evicts everything to exercise the rebind path
//! 5. Waits on each frame's fence and reports statistics on exit

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{Context as _, Result};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use pvgpu_winsys::protocol::PVGPU_VERSION;
use pvgpu_winsys::{
    BufferDesc, BufferUsage, Config, Context, Descriptor, Format, LoopbackDevice, MapFlags,
    MapOutcome, PrimitiveInfo, QueryBindFlags, QueryDesc, RelocFlags, ResourceHandle, Screen,
    ShaderDesc, ShaderStage, SurfaceDesc, SurfaceUsage, Timeout, Topology,
};

const QUERY_TYPE_OCCLUSION: u32 = 1;
const INDEX_FORMAT_R16_UINT: u32 = 57;

struct FrameResources {
    render_target: ResourceHandle,
    depth: ResourceHandle,
    vertices: ResourceHandle,
    indices: ResourceHandle,
    vertex_shader: ResourceHandle,
    pixel_shader: ResourceHandle,
    query: ResourceHandle,
}

impl FrameResources {
    fn create(screen: &Screen) -> Result<Self> {
        let surface = |format, usage| {
            screen.create_resource(&Descriptor::Surface(
                SurfaceDesc::texture_2d(format, 640, 480).with_usage(usage),
            ))
        };
        let buffer = |size, usage| {
            screen.create_resource(&Descriptor::Buffer(BufferDesc {
                size,
                alignment: 16,
                usage,
            }))
        };
        let shader = |stage| {
            screen.create_resource(&Descriptor::Shader(ShaderDesc {
                stage,
                bytecode: vec![0x4342_5844; 16],
            }))
        };

        Ok(Self {
            render_target: surface(
                Format::B8G8R8A8Unorm,
                SurfaceUsage::RENDER_TARGET | SurfaceUsage::SCANOUT,
            )?,
            depth: surface(Format::D24UnormS8Uint, SurfaceUsage::DEPTH_STENCIL)?,
            vertices: buffer(64 * 1024, BufferUsage::VERTEX)?,
            indices: buffer(16 * 1024, BufferUsage::INDEX)?,
            vertex_shader: shader(ShaderStage::Vertex)?,
            pixel_shader: shader(ShaderStage::Pixel)?,
            query: screen.create_resource(&Descriptor::Query(QueryDesc { len: 64 }))?,
        })
    }

    fn all(&self) -> [ResourceHandle; 7] {
        [
            self.render_target,
            self.depth,
            self.vertices,
            self.indices,
            self.vertex_shader,
            self.pixel_shader,
            self.query,
        ]
    }

    fn destroy(&self, screen: &Screen) {
        for handle in self.all() {
            if let Err(e) = screen.destroy_resource(handle) {
                warn!("Failed to destroy {:?}: {}", handle, e);
            }
        }
    }
}

/// Demo service state
struct DemoService {
    config: Config,
    device: Arc<LoopbackDevice>,
    screen: Arc<Screen>,
    shutdown: Arc<AtomicBool>,
    worker_handle: Option<thread::JoinHandle<()>>,
}

impl DemoService {
    fn new(config: Config, shutdown: Arc<AtomicBool>) -> Self {
        let device = Arc::new(LoopbackDevice::new(config.device_caps()));
        let screen = Screen::new(device.clone(), config.screen_options());
        Self {
            config,
            device,
            screen,
            shutdown,
            worker_handle: None,
        }
    }

    /// Start the thread that retires submitted work.
    fn start_completion_worker(&mut self) -> Result<()> {
        let device = self.device.clone();
        let shutdown = self.shutdown.clone();
        let latency = self.config.completion_latency();
        let handle = thread::Builder::new()
            .name("loopback-completion".into())
            .spawn(move || device.run_completion_worker(latency, &shutdown))
            .context("spawning completion worker")?;
        self.worker_handle = Some(handle);
        Ok(())
    }

    /// Upload vertex data through a discarding map.
    fn upload_vertices(&self, ctx: &mut Context, buffer: ResourceHandle, frame: u32) -> Result<()> {
        let flags = MapFlags::WRITE | MapFlags::DISCARD_WHOLE_RESOURCE;
        let mapping = match ctx.map(buffer, flags)? {
            MapOutcome::Mapped(mapping) => mapping,
            MapOutcome::Retry => {
                debug!("Map of {:?} needs a fresh buffer, committing", buffer);
                ctx.commit()?;
                ctx.map(buffer, flags)?
                    .mapped()
                    .ok_or_else(|| anyhow::anyhow!("map of {:?} retried twice", buffer))?
            }
        };
        mapping.write(0, &frame.to_le_bytes())?;
        if ctx.unmap(mapping) {
            ctx.rebind(buffer, RelocFlags::WRITE)?;
        }
        Ok(())
    }

    fn record_frame(&self, ctx: &mut Context, res: &FrameResources, frame: u32) -> Result<()> {
        ctx.annotate(&format!("frame {frame}"))?;
        self.upload_vertices(ctx, res.vertices, frame)?;
        ctx.set_render_targets(&[res.render_target], Some(res.depth))?;
        ctx.set_shader(ShaderStage::Vertex, res.vertex_shader, None)?;
        ctx.set_shader(ShaderStage::Pixel, res.pixel_shader, None)?;
        ctx.set_vertex_buffer(0, res.vertices, 32, 0)?;
        ctx.set_index_buffer(res.indices, INDEX_FORMAT_R16_UINT, 0)?;

        ctx.query_bind(res.query, QueryBindFlags::SET)?;
        ctx.begin_query(res.query, 0, QUERY_TYPE_OCCLUSION)?;
        for i in 0..64 {
            let info = PrimitiveInfo::indices(Topology::TriangleList, 36).instanced(1 + i % 4, 0);
            ctx.draw(&info)?;
        }
        ctx.end_query(res.query, 0, QUERY_TYPE_OCCLUSION)?;
        Ok(())
    }

    fn evict_all(&self, res: &FrameResources) {
        for handle in res.all() {
            let Some(id) = self.screen.device_id(handle) else {
                continue;
            };
            let kind = match self.screen.registry().lookup(handle) {
                Ok(entry) => entry.kind(),
                Err(_) => continue,
            };
            self.device.evict(kind, id);
        }
    }

    /// Main frame loop
    fn run_loop(&mut self) -> Result<()> {
        let resources = FrameResources::create(&self.screen)?;
        let mut ctx = self.screen.create_context();
        let mut frame = 0u32;
        let mut slow_frames = 0u32;

        info!("Entering frame loop");
        while !self.shutdown.load(Ordering::Relaxed) {
            if self.config.demo_frames != 0 && frame >= self.config.demo_frames {
                break;
            }
            if self.config.evict_interval != 0 && frame > 0 && frame % self.config.evict_interval == 0 {
                info!("Frame {}: evicting all resources", frame);
                self.evict_all(&resources);
            }

            if let Err(e) = self.record_frame(&mut ctx, &resources, frame) {
                error!("Frame {} failed: {}", frame, e);
                break;
            }
            let fence = ctx.commit()?;
            if !self.screen.wait(&fence, Timeout::Relative(self.config.completion_latency() * 50)) {
                slow_frames += 1;
                warn!("Frame {} fence {} not signalled in time", frame, fence.seqno());
            }
            frame += 1;
        }

        info!(
            "Rendered {} frames in {} submissions ({} slow)",
            frame,
            ctx.submissions(),
            slow_frames
        );
        drop(ctx);
        resources.destroy(&self.screen);
        Ok(())
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker_handle.take() {
            if handle.join().is_err() {
                error!("Completion worker panicked");
            }
        }
        self.device.complete_all();
        let reaped = self.screen.reap();
        info!(
            "Shutdown: reaped {} resources, {} device objects live, {} buffers submitted",
            reaped,
            self.device.live_objects(),
            self.device.submissions().len()
        );
    }
}

fn load_config() -> Result<Config> {
    match std::env::args().nth(1) {
        Some(path) => Config::load(&path),
        None => Ok(Config::default()),
    }
}

fn main() -> Result<()> {
    let config = load_config()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_filter.as_str()));
    fmt().with_env_filter(filter).with_target(true).init();

    info!("PVGPU Winsys v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Protocol version: {}.{}",
        PVGPU_VERSION >> 16,
        PVGPU_VERSION & 0xFFFF
    );
    info!("Configuration: {:?}", config);

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        shutdown_clone.store(true, Ordering::SeqCst);
    })?;

    let mut service = DemoService::new(config, shutdown);
    service.start_completion_worker()?;
    let result = service.run_loop();
    service.stop();

    if let Err(e) = &result {
        error!("Demo failed: {:#}", e);
    }
    info!("Demo complete");
    result
}
