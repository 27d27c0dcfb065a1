// =============================================================================
// FRAMELOOP DEMO - clear-screen frame loop with hazard tracking
// =============================================================================
//
// Drives the library end to end: a winit window, a Vulkan device, and a
// FrameSynchronizer recording one command buffer per frame. The image
// barriers around the clear are derived by the HazardTracker from the
// declared accesses rather than written by hand, and registered
// pipelines are rebuilt when the hot-reload watcher reports changed
// shader binaries.
//
// FRAME FLOW:
// 1. begin_frame: wait for this slot's previous use, acquire an image
// 2. Declare accesses, record the clear (barriers inserted as needed)
// 3. end_frame: submit and present, flip the frame parity
// 4. Drain the hot-reload change set

use anyhow::{Context, Result};
use ash::vk;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Window, WindowAttributes},
};

use frameloop::backend::barrier::{Access, HazardTracker, TrackedImage};
use frameloop::backend::pipeline::{self, PipelineDesc};
use frameloop::backend::swapchain;
use frameloop::backend::{FrameSynchronizer, SwapchainManager, VulkanDevice};
use frameloop::config::{Config, HotReloadConfig};
use frameloop::hot_reload::{PipelineHotReloader, ShaderStage, StageBinary};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() {
    let config = Config::load();
    init_logging();
    log::info!("Starting frameloop demo");
    log::info!(
        "Window: {}x{}, present mode: {}",
        config.window.width,
        config.window.height,
        config.graphics.present_mode
    );

    // Setup and fatal runtime failures both end up here; staleness and
    // hot-reload failures never do.
    if let Err(e) = run(config) {
        log::error!("Fatal: {:#}", e);
        std::process::exit(1);
    }
}

fn init_logging() {
    use env_logger::Builder;
    use log::LevelFilter;

    let mut builder = Builder::from_default_env();
    builder.filter_level(LevelFilter::Info);
    builder.init();
}

fn run(config: Config) -> Result<()> {
    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    match app.fatal.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Everything the demo owns. Drop order is handled explicitly in
/// `Drop::drop`; the synchronizer goes first since it waits the device
/// idle and flushes the deferred-deletion queue.
struct App {
    config: Config,

    window: Option<Arc<Window>>,
    surface: Option<vk::SurfaceKHR>,
    surface_loader: Option<ash::extensions::khr::Surface>,

    device: Option<Arc<VulkanDevice>>,
    render_pass: Option<vk::RenderPass>,
    frames: Option<FrameSynchronizer>,

    // Hazard tracking for the swapchain images. Rebuilt whenever the
    // synchronizer reports a new swapchain generation.
    tracker: HazardTracker,
    tracked_images: Vec<TrackedImage>,
    tracked_generation: Option<u64>,

    hot_reload: Option<PipelineHotReloader>,
    pipeline_layout: Option<vk::PipelineLayout>,

    /// First error from the frame loop; reported once by `run`.
    fatal: Option<anyhow::Error>,

    // FPS tracking
    frame_count: u32,
    last_fps_update: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        Self {
            config,
            window: None,
            surface: None,
            surface_loader: None,
            device: None,
            render_pass: None,
            frames: None,
            tracker: HazardTracker::new(),
            tracked_images: Vec::new(),
            tracked_generation: None,
            hot_reload: None,
            pipeline_layout: None,
            fatal: None,
            frame_count: 0,
            last_fps_update: Instant::now(),
        }
    }

    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    fn init_vulkan(&mut self, window: &Window) -> Result<()> {
        log::info!("Initializing Vulkan...");

        let enable_validation = cfg!(debug_assertions) && self.config.debug.validation_layers;
        let display_handle = window.raw_display_handle();
        let window_handle = window.raw_window_handle();

        let device =
            VulkanDevice::new(&self.config.window.title, enable_validation, display_handle)?;

        let surface_loader = ash::extensions::khr::Surface::new(&device.entry, &device.instance);
        let surface = unsafe {
            ash_window::create_surface(
                &device.entry,
                &device.instance,
                display_handle,
                window_handle,
                None,
            )
        }
        .context("Failed to create window surface")?;

        device.verify_present_support(&surface_loader, surface)?;

        self.device = Some(device.clone());
        self.surface = Some(surface);
        self.surface_loader = Some(surface_loader.clone());

        // The render pass only depends on the surface format, so it
        // outlives every swapchain recreation.
        let formats = unsafe {
            surface_loader.get_physical_device_surface_formats(device.physical_device, surface)
        }?;
        let surface_format =
            swapchain::choose_surface_format(&formats).context("No surface format")?;
        let render_pass = pipeline::create_render_pass(&device, surface_format.format)?;
        self.render_pass = Some(render_pass);

        let size = window.inner_size();
        let manager = SwapchainManager::new(
            device.clone(),
            surface,
            surface_loader,
            Some(render_pass),
            self.config.get_present_mode(),
            (size.width, size.height),
        )?;
        self.frames = Some(FrameSynchronizer::new(device.clone(), manager)?);

        if self.config.hot_reload.enabled {
            self.init_hot_reload(
                &device,
                render_pass,
                vk::Extent2D {
                    width: size.width,
                    height: size.height,
                },
            )?;
        }

        log::info!("Vulkan initialized");
        Ok(())
    }

    /// Starts the watcher threads and registers one pipeline per
    /// vert/frag binary pair found in the configured output directory.
    /// A missing directory or unreadable binary only disables the
    /// feature, it never fails startup.
    fn init_hot_reload(
        &mut self,
        device: &VulkanDevice,
        render_pass: vk::RenderPass,
        extent: vk::Extent2D,
    ) -> Result<()> {
        let mut reloader = match PipelineHotReloader::new(&self.config.hot_reload) {
            Ok(reloader) => reloader,
            Err(e) => {
                log::warn!("Hot reload disabled: {:#}", e);
                return Ok(());
            }
        };

        let layout = pipeline::create_pipeline_layout(device, &PipelineDesc::default())?;
        match register_demo_pipelines(
            device,
            render_pass,
            extent,
            layout,
            &self.config.hot_reload,
            &mut reloader,
        ) {
            Ok(count) => log::info!("{} pipeline(s) registered for hot reload", count),
            Err(e) => log::warn!("Pipeline registration skipped: {:#}", e),
        }

        self.pipeline_layout = Some(layout);
        self.hot_reload = Some(reloader);
        Ok(())
    }

    // =========================================================================
    // RENDER LOOP
    // =========================================================================

    /// Records and submits one frame. Returns false when the frame was
    /// skipped (minimized window or a just-recreated swapchain).
    fn render_frame(&mut self) -> Result<bool> {
        let Some(window) = self.window.as_ref() else {
            return Ok(false);
        };
        let Some(device) = self.device.as_ref() else {
            return Ok(false);
        };
        let Some(frames) = self.frames.as_mut() else {
            return Ok(false);
        };

        let size = window.inner_size();
        let Some(frame) = frames.begin_frame((size.width, size.height))? else {
            return Ok(false);
        };

        // The fence wait inside begin_frame observed all of this slot's
        // prior GPU work complete, so the first touch of every tracked
        // resource this frame starts from a clean scope.
        self.tracker.assume_work_finished();

        // Swapchain recreation replaced the image set; rebind.
        if self.tracked_generation != Some(frames.generation()) {
            self.tracker = HazardTracker::new();
            self.tracked_images.clear();
            for &image in frames.swapchain().images()? {
                self.tracked_images.push(self.tracker.bind_image(
                    image,
                    vk::ImageLayout::UNDEFINED,
                    1,
                )?);
            }
            self.tracked_generation = Some(frames.generation());
        }

        let target = self.tracked_images[frame.image_index as usize];
        let raw_image = frames.swapchain().images()?[frame.image_index as usize];
        let clear_color = vk::ClearColorValue {
            float32: self.config.graphics.clear_color,
        };
        let subresource_range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };

        // Declared write: the tracker emits UNDEFINED/PRESENT_SRC ->
        // TRANSFER_DST before the clear runs.
        self.tracker.action(
            &device.device,
            frame.cmd,
            &[Access::image(
                target,
                vk::PipelineStageFlags::TRANSFER,
                vk::AccessFlags::TRANSFER_WRITE,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            )],
            |d, cmd| unsafe {
                d.cmd_clear_color_image(
                    cmd,
                    raw_image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &clear_color,
                    &[subresource_range],
                );
            },
        );

        // Hand the image to present.
        self.tracker.transition(
            &device.device,
            frame.cmd,
            &[Access::image(
                target,
                vk::PipelineStageFlags::empty(),
                vk::AccessFlags::empty(),
                vk::ImageLayout::PRESENT_SRC_KHR,
            )],
        );

        frames.end_frame()?;

        self.drain_hot_reload()?;
        Ok(true)
    }

    /// Once-per-frame hot-reload drain. Replaced pipelines go onto the
    /// deferred-deletion queue, never straight to destruction.
    fn drain_hot_reload(&mut self) -> Result<()> {
        let (Some(reloader), Some(layout), Some(render_pass)) = (
            self.hot_reload.as_mut(),
            self.pipeline_layout,
            self.render_pass,
        ) else {
            return Ok(());
        };
        let Some(device) = self.device.as_ref() else {
            return Ok(());
        };
        let Some(frames) = self.frames.as_mut() else {
            return Ok(());
        };

        let extent = frames.swapchain().extent()?;
        let mut rebuild = |desc: &PipelineDesc, stages: &[StageBinary]| {
            pipeline::create_graphics_pipeline(
                device,
                render_pass,
                extent,
                layout,
                desc,
                stage_spirv(stages, ShaderStage::Vertex)?,
                stage_spirv(stages, ShaderStage::Fragment)?,
            )
        };

        let reloaded = reloader.drain_and_reload(&mut rebuild, frames.deletion_mut());
        if reloaded > 0 {
            log::info!("Hot reloaded {} pipeline(s)", reloaded);
        }
        Ok(())
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        self.frame_count += 1;
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;
            if let Some(ref window) = self.window {
                window.set_title(&format!("{} - {:.0} FPS", self.config.window.title, fps));
            }
            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        let window = match event_loop.create_window(window_attributes) {
            Ok(window) => Arc::new(window),
            Err(e) => {
                self.fatal = Some(anyhow::Error::new(e).context("Failed to create window"));
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_vulkan(&window) {
            self.fatal = Some(e.context("Engine initialization failed"));
            event_loop.exit();
            return;
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                // Recreation happens at the next frame boundary; a zero
                // extent parks the swapchain until the window is back.
                if let Some(frames) = self.frames.as_mut() {
                    frames.request_recreate();
                }
            }

            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(rendered) => {
                    if rendered {
                        self.update_fps();
                    }
                }
                Err(e) => {
                    // Not one of the recognized staleness conditions:
                    // the GPU state can no longer be trusted.
                    self.fatal = Some(e.context("Frame loop failed"));
                    event_loop.exit();
                }
            },

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(KeyCode::Escape) = event.physical_key {
                        log::info!("ESC pressed, exiting...");
                        event_loop.exit();
                    }
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

// =============================================================================
// CLEANUP
// =============================================================================

impl Drop for App {
    fn drop(&mut self) {
        let Some(device) = self.device.take() else {
            return;
        };
        log::info!("Cleaning up...");

        // Stop the watcher threads; the registry's live pipelines are
        // ours to destroy once the device is idle.
        let registered: Vec<vk::Pipeline> = self
            .hot_reload
            .take()
            .map(|reloader| reloader.registry().registered_pipelines().collect())
            .unwrap_or_default();

        // Waits for the device to go idle, then releases the frame
        // slots, command pool, swapchain, and every deferred handle.
        self.frames = None;

        unsafe {
            for pipeline in registered {
                device.device.destroy_pipeline(pipeline, None);
            }
            if let Some(layout) = self.pipeline_layout.take() {
                device.device.destroy_pipeline_layout(layout, None);
            }
            if let Some(render_pass) = self.render_pass.take() {
                device.device.destroy_render_pass(render_pass, None);
            }
            if let (Some(surface), Some(ref loader)) =
                (self.surface.take(), self.surface_loader.take())
            {
                loader.destroy_surface(surface, None);
            }
        }

        drop(device);
        log::info!("Cleanup complete");
    }
}

// =============================================================================
// HOT-RELOAD WIRING
// =============================================================================

fn stage_spirv(stages: &[StageBinary], stage: ShaderStage) -> Result<&[u8]> {
    stages
        .iter()
        .find(|binary| binary.stage == stage)
        .map(|binary| binary.spirv.as_slice())
        .with_context(|| format!("Registered pipeline is missing a {:?} stage", stage))
}

/// `name.vert.spv` with a `name.frag.spv` sibling forms one pipeline.
fn shader_pairs(binary_dir: &Path) -> Result<Vec<(String, PathBuf, PathBuf)>> {
    let mut pairs = Vec::new();
    for entry in std::fs::read_dir(binary_dir)
        .with_context(|| format!("Cannot read shader binary dir {:?}", binary_dir))?
    {
        let vert_path = entry?.path();
        let Some(name) = vert_path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_suffix(".vert.spv"))
        else {
            continue;
        };
        let name = name.to_string();
        let frag_path = vert_path.with_file_name(format!("{}.frag.spv", name));
        if frag_path.is_file() {
            pairs.push((name, vert_path, frag_path));
        }
    }
    pairs.sort();
    Ok(pairs)
}

/// Builds a pipeline per discovered binary pair and registers it for
/// hot reload. Per-pipeline failures are logged and skipped.
fn register_demo_pipelines(
    device: &VulkanDevice,
    render_pass: vk::RenderPass,
    extent: vk::Extent2D,
    layout: vk::PipelineLayout,
    config: &HotReloadConfig,
    reloader: &mut PipelineHotReloader,
) -> Result<usize> {
    let source_dir = Path::new(&config.source_dir);
    let desc = PipelineDesc::default();
    let mut registered = 0;

    for (name, vert_path, frag_path) in shader_pairs(Path::new(&config.binary_dir))? {
        let vert_spv =
            std::fs::read(&vert_path).with_context(|| format!("Cannot read {:?}", vert_path))?;
        let frag_spv =
            std::fs::read(&frag_path).with_context(|| format!("Cannot read {:?}", frag_path))?;

        let pipeline = match pipeline::create_graphics_pipeline(
            device,
            render_pass,
            extent,
            layout,
            &desc,
            &vert_spv,
            &frag_spv,
        ) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                log::warn!("Skipping pipeline '{}': {:#}", name, e);
                continue;
            }
        };

        reloader.register(
            pipeline,
            desc.clone(),
            vec![
                StageBinary {
                    stage: ShaderStage::Vertex,
                    source_path: source_dir.join(format!("{}.vert", name)),
                    spirv: vert_spv,
                },
                StageBinary {
                    stage: ShaderStage::Fragment,
                    source_path: source_dir.join(format!("{}.frag", name)),
                    spirv: frag_spv,
                },
            ],
        );
        log::info!("Watching pipeline '{}'", name);
        registered += 1;
    }

    Ok(registered)
}
