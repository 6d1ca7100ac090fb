//! Ownership and lifetime of every render target the pipeline touches: the
//! two tile-sized ray-state sets, the oracle result buffers, and the
//! full-resolution final/preview/G-buffer targets.
//!
//! Resolution-dependent targets are replaced together, atomically, before the
//! next frame begins; the `generation` counter lets dependent state detect
//! that its views went stale.

use thiserror::Error;

use pathtracer_shared::RaytracerConfig;

use crate::kernels::{
    KernelLayouts, INTERSECTION_FORMAT, OCCLUSION_FORMAT, PREVIEW_FORMAT, RAY_STATE_FORMAT,
    TARGET_FORMAT,
};
use crate::oracle::IntersectionOracle;

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error(
        "oracle requires {required:?} for the {buffer} buffer, \
         but the shading kernels expect {expected:?}"
    )]
    FormatMismatch {
        buffer: &'static str,
        required: wgpu::TextureFormat,
        expected: wgpu::TextureFormat,
    },
    #[error("cannot allocate a zero-sized framebuffer ({0}x{1})")]
    EmptyExtent(u32, u32),
}

pub struct TargetTexture {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
}

fn create_target(
    device: &wgpu::Device,
    label: &str,
    (width, height): (u32, u32),
    format: wgpu::TextureFormat,
    usage: wgpu::TextureUsages,
) -> TargetTexture {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format,
        usage,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    TargetTexture { texture, view }
}

/// One of the two ray-state buffer sets: origin, direction, accumulated
/// radiance and payload per tile pixel.
pub struct RayStateSet {
    pub origins: TargetTexture,
    pub directions: TargetTexture,
    pub radiance: TargetTexture,
    pub payload: TargetTexture,
}

impl RayStateSet {
    fn new(device: &wgpu::Device, index: usize, dims: (u32, u32)) -> Self {
        let usage = wgpu::TextureUsages::STORAGE_BINDING | wgpu::TextureUsages::TEXTURE_BINDING;
        Self {
            origins: create_target(
                device,
                &format!("Ray Origins {index}"),
                dims,
                RAY_STATE_FORMAT,
                usage,
            ),
            directions: create_target(
                device,
                &format!("Ray Directions {index}"),
                dims,
                RAY_STATE_FORMAT,
                usage,
            ),
            // The radiance plane is the compositor's copy source.
            radiance: create_target(
                device,
                &format!("Ray Radiance {index}"),
                dims,
                RAY_STATE_FORMAT,
                usage | wgpu::TextureUsages::COPY_SRC,
            ),
            payload: create_target(
                device,
                &format!("Ray Payload {index}"),
                dims,
                RAY_STATE_FORMAT,
                usage,
            ),
        }
    }
}

pub struct FrameResources {
    pub tile_size: u32,
    extent: (u32, u32),
    generation: u64,

    pub frame_uniforms: wgpu::Buffer,

    pub ray_sets: [RayStateSet; 2],
    pub intersections: TargetTexture,
    pub occlusion: TargetTexture,

    pub final_target: TargetTexture,
    pub preview_target: TargetTexture,
    pub gbuffer_position: TargetTexture,
    pub gbuffer_normal: TargetTexture,
    pub gbuffer_albedo: TargetTexture,

    pub raygen_bind_group: wgpu::BindGroup,
    /// Indexed by the read set of the bounce step; writes target the other
    /// set.
    pub shade_bind_groups: [wgpu::BindGroup; 2],
    pub accum_bind_group: wgpu::BindGroup,
    pub post_bind_group: wgpu::BindGroup,
}

impl FrameResources {
    pub fn new(
        device: &wgpu::Device,
        layouts: &KernelLayouts,
        oracle: &dyn IntersectionOracle,
        extent: (u32, u32),
    ) -> Result<Self, ResourceError> {
        if extent.0 == 0 || extent.1 == 0 {
            return Err(ResourceError::EmptyExtent(extent.0, extent.1));
        }
        let tile_size = RaytracerConfig::TILE_SIZE;
        let tile_dims = (tile_size, tile_size);

        let ray_req = oracle.ray_buffer_requirements(tile_dims);
        if ray_req.format != RAY_STATE_FORMAT {
            return Err(ResourceError::FormatMismatch {
                buffer: "ray",
                required: ray_req.format,
                expected: RAY_STATE_FORMAT,
            });
        }
        let isect_req = oracle.intersection_buffer_requirements(tile_dims);
        if isect_req.format != INTERSECTION_FORMAT {
            return Err(ResourceError::FormatMismatch {
                buffer: "intersection",
                required: isect_req.format,
                expected: INTERSECTION_FORMAT,
            });
        }
        let occlusion_req = oracle.occlusion_buffer_requirements(tile_dims);
        if occlusion_req.format != OCCLUSION_FORMAT {
            return Err(ResourceError::FormatMismatch {
                buffer: "occlusion",
                required: occlusion_req.format,
                expected: OCCLUSION_FORMAT,
            });
        }

        let ray_dims = (ray_req.width, ray_req.height);
        let ray_sets = [
            RayStateSet::new(device, 0, ray_dims),
            RayStateSet::new(device, 1, ray_dims),
        ];
        let result_usage =
            wgpu::TextureUsages::STORAGE_BINDING | wgpu::TextureUsages::TEXTURE_BINDING;
        let intersections = create_target(
            device,
            "Intersection Results",
            (isect_req.width, isect_req.height),
            INTERSECTION_FORMAT,
            result_usage,
        );
        let occlusion = create_target(
            device,
            "Occlusion Results",
            (occlusion_req.width, occlusion_req.height),
            OCCLUSION_FORMAT,
            result_usage,
        );

        let frame_uniforms = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Frame Uniforms"),
            size: std::mem::size_of::<pathtracer_shared::FrameUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let full = FullResTargets::new(device, extent);
        let bind_groups = build_bind_groups(device, layouts, &ray_sets, &intersections, &full);

        Ok(Self {
            tile_size,
            extent,
            generation: 0,
            frame_uniforms,
            ray_sets,
            intersections,
            occlusion,
            final_target: full.final_target,
            preview_target: full.preview_target,
            gbuffer_position: full.gbuffer_position,
            gbuffer_normal: full.gbuffer_normal,
            gbuffer_albedo: full.gbuffer_albedo,
            raygen_bind_group: bind_groups.raygen,
            shade_bind_groups: bind_groups.shade,
            accum_bind_group: bind_groups.accum,
            post_bind_group: bind_groups.post,
        })
    }

    pub fn extent(&self) -> (u32, u32) {
        self.extent
    }

    /// Bumped every time resolution-dependent targets are replaced.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Replaces every resolution-dependent target. A resize to the current
    /// extent is a no-op and keeps buffer identities; returns whether a
    /// reallocation happened.
    pub fn resize(
        &mut self,
        device: &wgpu::Device,
        layouts: &KernelLayouts,
        extent: (u32, u32),
    ) -> Result<bool, ResourceError> {
        if extent.0 == 0 || extent.1 == 0 {
            return Err(ResourceError::EmptyExtent(extent.0, extent.1));
        }
        if !needs_realloc(self.extent, extent) {
            return Ok(false);
        }

        let full = FullResTargets::new(device, extent);
        let bind_groups = build_bind_groups(device, layouts, &self.ray_sets, &self.intersections, &full);

        self.extent = extent;
        self.generation += 1;
        self.final_target = full.final_target;
        self.preview_target = full.preview_target;
        self.gbuffer_position = full.gbuffer_position;
        self.gbuffer_normal = full.gbuffer_normal;
        self.gbuffer_albedo = full.gbuffer_albedo;
        self.raygen_bind_group = bind_groups.raygen;
        self.shade_bind_groups = bind_groups.shade;
        self.accum_bind_group = bind_groups.accum;
        self.post_bind_group = bind_groups.post;
        log::debug!("reallocated frame targets at {}x{}", extent.0, extent.1);
        Ok(true)
    }
}

/// The resolution-dependent half of the pool, built in one shot so a resize
/// swaps all of it or none of it.
struct FullResTargets {
    final_target: TargetTexture,
    preview_target: TargetTexture,
    gbuffer_position: TargetTexture,
    gbuffer_normal: TargetTexture,
    gbuffer_albedo: TargetTexture,
}

impl FullResTargets {
    fn new(device: &wgpu::Device, extent: (u32, u32)) -> Self {
        let gbuffer_usage =
            wgpu::TextureUsages::STORAGE_BINDING | wgpu::TextureUsages::TEXTURE_BINDING;
        Self {
            final_target: create_target(
                device,
                "Final Target",
                extent,
                TARGET_FORMAT,
                wgpu::TextureUsages::COPY_DST | wgpu::TextureUsages::TEXTURE_BINDING,
            ),
            preview_target: create_target(
                device,
                "Preview Target",
                extent,
                PREVIEW_FORMAT,
                wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
            ),
            gbuffer_position: create_target(
                device,
                "GBuffer Positions",
                extent,
                TARGET_FORMAT,
                gbuffer_usage,
            ),
            gbuffer_normal: create_target(
                device,
                "GBuffer Normals",
                extent,
                TARGET_FORMAT,
                gbuffer_usage,
            ),
            gbuffer_albedo: create_target(
                device,
                "GBuffer Albedo",
                extent,
                TARGET_FORMAT,
                gbuffer_usage,
            ),
        }
    }
}

struct BindGroups {
    raygen: wgpu::BindGroup,
    shade: [wgpu::BindGroup; 2],
    accum: wgpu::BindGroup,
    post: wgpu::BindGroup,
}

fn texture_entry(binding: u32, view: &wgpu::TextureView) -> wgpu::BindGroupEntry<'_> {
    wgpu::BindGroupEntry {
        binding,
        resource: wgpu::BindingResource::TextureView(view),
    }
}

fn build_bind_groups(
    device: &wgpu::Device,
    layouts: &KernelLayouts,
    ray_sets: &[RayStateSet; 2],
    intersections: &TargetTexture,
    full: &FullResTargets,
) -> BindGroups {
    let raygen = device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("Raygen Bind Group"),
        layout: &layouts.raygen_rays,
        entries: &[
            texture_entry(0, &ray_sets[0].origins.view),
            texture_entry(1, &ray_sets[0].directions.view),
            texture_entry(2, &ray_sets[0].radiance.view),
            texture_entry(3, &ray_sets[0].payload.view),
        ],
    });

    let shade = [0usize, 1].map(|read| {
        let write = read ^ 1;
        device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&format!("Shade Bind Group (read {read})")),
            layout: &layouts.shade_rays,
            entries: &[
                texture_entry(0, &ray_sets[read].origins.view),
                texture_entry(1, &ray_sets[read].directions.view),
                texture_entry(2, &ray_sets[read].radiance.view),
                texture_entry(3, &ray_sets[read].payload.view),
                texture_entry(4, &intersections.view),
                texture_entry(5, &ray_sets[write].origins.view),
                texture_entry(6, &ray_sets[write].directions.view),
                texture_entry(7, &ray_sets[write].radiance.view),
                texture_entry(8, &ray_sets[write].payload.view),
                texture_entry(9, &full.gbuffer_position.view),
                texture_entry(10, &full.gbuffer_normal.view),
                texture_entry(11, &full.gbuffer_albedo.view),
            ],
        })
    });

    let accum = device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("Accumulate Bind Group"),
        layout: &layouts.accum_input,
        entries: &[texture_entry(0, &full.final_target.view)],
    });

    let post = device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("Post Bind Group"),
        layout: &layouts.post_input,
        entries: &[
            texture_entry(0, &full.preview_target.view),
            texture_entry(1, &full.gbuffer_position.view),
            texture_entry(2, &full.gbuffer_normal.view),
            texture_entry(3, &full.gbuffer_albedo.view),
        ],
    });

    BindGroups {
        raygen,
        shade,
        accum,
        post,
    }
}

/// A resize to the current extent must keep buffer identity; only a real
/// change replaces the pool.
fn needs_realloc(current: (u32, u32), requested: (u32, u32)) -> bool {
    requested != current
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_extent_resize_is_a_no_op() {
        assert!(!needs_realloc((1280, 720), (1280, 720)));
        assert!(needs_realloc((1280, 720), (1280, 721)));
        assert!(needs_realloc((1280, 720), (640, 360)));
    }
}
