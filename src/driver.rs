//! The frame driver: one orchestrator instance owning every buffer, counter
//! and program handle, with the strictly ordered per-frame sequence.
//!
//! Per tick: camera deltas have already been applied through the notify
//! entry points; the oracle is polled and the shading program synchronized;
//! the tile scheduler runs over the full grid; the accumulator blends; the
//! preview is presented. Any stage failure abandons the frame before the
//! frame clock commits, so persistent state never sees a partial frame.

use rand::{rngs::StdRng, SeedableRng};
use thiserror::Error;

use pathtracer_shared::{Camera, PostPush, RaytracerConfig};

use crate::accum::FrameClock;
use crate::compute::TileRenderer;
use crate::kernels::{CompileError, FixedPipelines, KernelLayouts};
use crate::oracle::{IntersectionOracle, OracleError};
use crate::renderer::{InitError, PerformanceState, RenderState};
use crate::scene::{SceneState, SceneTables};
use crate::sync::{clamp_depth, ProgramState, SyncTracker};
use crate::targets::{FrameResources, ResourceError};

/// Frame-fatal failures. None of them mutate the frame counter or the
/// preview target; the next tick starts clean.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("oracle error: {0}")]
    Oracle(#[from] OracleError),
    #[error("program synchronization failed: {0}")]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error("surface error: {0}")]
    Surface(#[from] wgpu::SurfaceError),
}

pub struct PathTracer {
    pub renderer: RenderState,
    layouts: KernelLayouts,
    pipelines: FixedPipelines,
    resources: FrameResources,
    tables: SceneTables,
    scene_bind_group: wgpu::BindGroup,

    tracker: SyncTracker,
    program: Option<ProgramState>,
    clock: FrameClock,
    performance: PerformanceState,

    oracle: Box<dyn IntersectionOracle>,
    pub camera: Camera,

    interacting: bool,
    view_mode: u32,
    exposure: f32,
    rng: StdRng,
}

impl PathTracer {
    pub async fn new(
        window: &winit::window::Window,
        scene: SceneState,
        mut oracle: Box<dyn IntersectionOracle>,
    ) -> Result<Self, InitError> {
        let renderer = RenderState::new(window).await?;
        let layouts = KernelLayouts::new(&renderer.device);
        let pipelines = FixedPipelines::new(&renderer.device, &layouts, renderer.config.format);

        scene.populate_oracle(oracle.as_mut())?;

        let extent = (renderer.config.width, renderer.config.height);
        let resources = FrameResources::new(&renderer.device, &layouts, oracle.as_ref(), extent)?;
        let tables = SceneTables::new(&renderer.device, &renderer.queue, &scene);
        let scene_bind_group = tables.bind_group(&renderer.device, &layouts, &resources.frame_uniforms);

        Ok(Self {
            renderer,
            layouts,
            pipelines,
            resources,
            scene_bind_group,
            tracker: SyncTracker::new(),
            program: None,
            clock: FrameClock::new(),
            performance: PerformanceState::new(),
            camera: scene.camera,
            oracle,
            tables,
            interacting: false,
            view_mode: 0,
            exposure: 1.0,
            rng: StdRng::from_entropy(),
        })
    }

    /// Camera pose changed: restart accumulation before the next ray is
    /// generated.
    pub fn notify_camera_moved(&mut self) {
        self.clock.invalidate();
    }

    /// Scene topology or materials changed through the oracle.
    pub fn notify_scene_changed(&mut self) {
        self.clock.invalidate();
    }

    /// While interacting the bounce loop runs at the reduced move depth;
    /// both edges of the transition restart accumulation.
    pub fn set_interacting(&mut self, interacting: bool) {
        if self.interacting != interacting {
            self.interacting = interacting;
            self.clock.invalidate();
        }
    }

    pub fn accumulation_enabled(&self) -> bool {
        self.clock.accumulation_enabled()
    }

    pub fn toggle_accumulation(&mut self) {
        let enabled = self.clock.accumulation_enabled();
        self.clock.set_accumulation(!enabled);
        log::info!(
            "progressive accumulation {}",
            if !enabled { "enabled" } else { "disabled" }
        );
    }

    pub fn cycle_view_mode(&mut self) {
        self.view_mode = (self.view_mode + 1) % 4;
    }

    pub fn frame_counter(&self) -> u32 {
        self.clock.frame_counter()
    }

    /// Direct access for scene edits; call [`notify_scene_changed`] after
    /// mutating.
    ///
    /// [`notify_scene_changed`]: Self::notify_scene_changed
    pub fn oracle_mut(&mut self) -> &mut dyn IntersectionOracle {
        self.oracle.as_mut()
    }

    pub fn resize(&mut self, new_size: winit::dpi::PhysicalSize<u32>) -> Result<(), ResourceError> {
        if new_size.width == 0 || new_size.height == 0 {
            return Ok(());
        }
        self.renderer.resize(new_size);
        let reallocated = self.resources.resize(
            &self.renderer.device,
            &self.layouts,
            (new_size.width, new_size.height),
        )?;
        if reallocated {
            self.clock.invalidate();
        }
        Ok(())
    }

    fn bounce_depth(&self) -> u32 {
        clamp_depth(if self.interacting {
            RaytracerConfig::MOVE_DEPTH
        } else {
            RaytracerConfig::REST_DEPTH
        })
    }

    /// Renders and presents one frame.
    pub fn render_tick(&mut self) -> Result<(), FrameError> {
        let frame_start = std::time::Instant::now();

        // Program synchronization comes first; rendering is skipped
        // entirely while the program is stale.
        let flags = self
            .oracle
            .update(&self.renderer.device, &self.renderer.queue)?;
        if self.tracker.needs_rebuild(flags) {
            self.tracker.mark_stale();
            self.program = None;
            let bindings = self.oracle.resource_bindings();
            let program = ProgramState::build(
                &self.renderer.device,
                &self.layouts,
                self.oracle.scene_accessor_source(),
                &bindings,
            )?;
            self.program = Some(program);
            self.tracker.mark_built();
        }
        let program = match &self.program {
            Some(program) => program,
            None => return Ok(()),
        };

        // Invalidations are consumed here, before ray generation.
        let sample = self.clock.begin_frame();
        let uniforms = self.camera.frame_uniforms(
            self.resources.extent(),
            sample.index,
            self.tables.light_count,
        );
        self.renderer.queue.write_buffer(
            &self.resources.frame_uniforms,
            0,
            bytemuck::bytes_of(&uniforms),
        );

        let mut encoder =
            self.renderer
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("Frame Encoder"),
                });
        // A query failure drops the encoder unsubmitted: the preview target
        // and the clock keep their pre-frame state.
        TileRenderer::record_frame(
            &self.renderer.device,
            &mut encoder,
            &self.resources,
            &self.pipelines,
            program,
            &self.scene_bind_group,
            self.oracle.as_ref(),
            self.bounce_depth(),
            sample.weight,
            &mut self.rng,
        )?;
        self.renderer.queue.submit(std::iter::once(encoder.finish()));
        self.clock.commit(sample);

        self.performance.last_frame_time = frame_start.elapsed();
        self.performance.update_frame_count();

        self.renderer.present(
            &self.resources,
            &self.pipelines,
            PostPush {
                view_mode: self.view_mode,
                exposure: self.exposure,
            },
        )?;
        Ok(())
    }
}
