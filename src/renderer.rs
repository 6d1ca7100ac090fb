//! Host graphics state: surface, device, queue and the present pass.

use thiserror::Error;

use pathtracer_shared::{PostPush, RaytracerConfig};

use crate::kernels::FixedPipelines;
use crate::targets::{FrameResources, ResourceError};

#[derive(Debug, Error)]
pub enum InitError {
    #[error("failed to create rendering surface: {0}")]
    Surface(#[from] wgpu::CreateSurfaceError),
    #[error("no compatible GPU adapter found")]
    NoAdapter,
    #[error("failed to acquire device: {0}")]
    Device(#[from] wgpu::RequestDeviceError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Oracle(#[from] crate::oracle::OracleError),
    #[error(transparent)]
    Compile(#[from] crate::kernels::CompileError),
}

/// GPU context plus the swapchain-facing present pipeline
pub struct RenderState {
    pub surface: wgpu::Surface,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub config: wgpu::SurfaceConfiguration,
    pub size: winit::dpi::PhysicalSize<u32>,
}

impl RenderState {
    pub async fn new(window: &winit::window::Window) -> Result<Self, InitError> {
        let size = window.inner_size();

        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let surface = unsafe { instance.create_surface(&window) }?;

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: Some(&surface),
                force_fallback_adapter: false,
            })
            .await
            .ok_or(InitError::NoAdapter)?;
        log::info!("using adapter: {}", adapter.get_info().name);

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: None,
                    features: wgpu::Features::PUSH_CONSTANTS,
                    limits: wgpu::Limits {
                        max_push_constant_size: RaytracerConfig::MAX_PUSH_CONSTANT_SIZE,
                        // The shading kernel writes the next ray-state set
                        // and three G-buffer aux targets in one pass.
                        max_storage_textures_per_shader_stage: 8,
                        ..Default::default()
                    },
                },
                None,
            )
            .await?;

        let surface_caps = surface.get_capabilities(&adapter);
        let surface_format = surface_caps
            .formats
            .iter()
            .copied()
            .find(|f| f.is_srgb())
            .unwrap_or(surface_caps.formats[0]);

        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: surface_caps.present_modes[0],
            alpha_mode: surface_caps.alpha_modes[0],
            view_formats: vec![],
        };
        surface.configure(&device, &config);

        Ok(Self {
            surface,
            device,
            queue,
            config,
            size,
        })
    }

    pub fn resize(&mut self, new_size: winit::dpi::PhysicalSize<u32>) {
        if new_size.width > 0 && new_size.height > 0 {
            self.size = new_size;
            self.config.width = new_size.width;
            self.config.height = new_size.height;
            self.surface.configure(&self.device, &self.config);
        }
    }

    /// Draws the preview target (or a G-buffer AOV) to the surface.
    pub fn present(
        &self,
        resources: &FrameResources,
        pipelines: &FixedPipelines,
        post: PostPush,
    ) -> Result<(), wgpu::SurfaceError> {
        let output = self.surface.get_current_texture()?;
        let view = output
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Present Encoder"),
            });

        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Present Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: true,
                    },
                })],
                depth_stencil_attachment: None,
            });

            pass.set_pipeline(&pipelines.post);
            pass.set_bind_group(0, &resources.post_bind_group, &[]);
            pass.set_push_constants(
                wgpu::ShaderStages::FRAGMENT,
                0,
                bytemuck::cast_slice(&[post]),
            );
            pass.draw(0..3, 0..1);
        }

        self.queue.submit(std::iter::once(encoder.finish()));
        output.present();

        Ok(())
    }
}

/// Frame-rate bookkeeping
pub struct PerformanceState {
    pub start_time: std::time::Instant,
    pub last_frame_time: std::time::Duration,
    pub frame_count: u64,
}

impl PerformanceState {
    pub fn new() -> Self {
        Self {
            start_time: std::time::Instant::now(),
            last_frame_time: std::time::Duration::ZERO,
            frame_count: 0,
        }
    }

    pub fn update_frame_count(&mut self) {
        self.frame_count += 1;

        if self.frame_count % RaytracerConfig::PERFORMANCE_STATS_INTERVAL == 0 {
            let elapsed = self.start_time.elapsed().as_secs_f32();
            let fps = self.frame_count as f32 / elapsed;
            log::info!(
                "fps: {:.1}, last frame: {:.2}ms",
                fps,
                self.last_frame_time.as_secs_f32() * 1000.0
            );
        }
    }
}

impl Default for PerformanceState {
    fn default() -> Self {
        Self::new()
    }
}
