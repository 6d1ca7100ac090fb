//! Per-frame command recording: the tile scheduler, the ping-pong bounce
//! loop, the tile compositor and the accumulate blend.
//!
//! Everything here records into one command encoder owned by the frame
//! driver. If the oracle rejects a query mid-frame the encoder is dropped
//! unsubmitted, so an aborted frame can never composite partial results into
//! the preview target.

use rand::Rng;

use pathtracer_shared::{BounceBuffers, Tile, TileGrid, TilePush};

use crate::kernels::{dispatch_extent, FixedPipelines};
use crate::oracle::{IntersectionOracle, OracleError, RayQuery};
use crate::sync::ProgramState;
use crate::targets::FrameResources;

pub struct TileRenderer;

impl TileRenderer {
    /// Records the full frame: every tile in row-major order, then the
    /// accumulate pass. Tiles are strictly sequential because they all reuse
    /// the same pair of ray-state sets.
    #[allow(clippy::too_many_arguments)]
    pub fn record_frame<R: Rng>(
        device: &wgpu::Device,
        encoder: &mut wgpu::CommandEncoder,
        resources: &FrameResources,
        pipelines: &FixedPipelines,
        program: &ProgramState,
        scene_bind_group: &wgpu::BindGroup,
        oracle: &dyn IntersectionOracle,
        bounces: u32,
        weight: f32,
        rng: &mut R,
    ) -> Result<(), OracleError> {
        debug_assert!(bounces > 0);
        let (width, height) = resources.extent();
        let grid = TileGrid::new(width, height, resources.tile_size, resources.tile_size);

        for tile in grid {
            Self::generate_rays(
                encoder,
                resources,
                pipelines,
                scene_bind_group,
                &tile,
                rng,
                bounces,
            );

            for depth in 0..bounces {
                let buffers = BounceBuffers::at_depth(depth);
                let read_set = &resources.ray_sets[buffers.read];
                oracle.query_intersection(
                    device,
                    encoder,
                    RayQuery {
                        origins: &read_set.origins.view,
                        directions: &read_set.directions.view,
                        output: &resources.intersections.view,
                        dims: (tile.width, tile.height),
                    },
                )?;
                Self::shade(
                    encoder,
                    resources,
                    program,
                    scene_bind_group,
                    &tile,
                    buffers,
                    depth,
                    bounces,
                    rng,
                );
            }

            Self::composite_tile(encoder, resources, &tile, bounces);
        }

        Self::accumulate(encoder, resources, pipelines, weight);
        Ok(())
    }

    fn generate_rays<R: Rng>(
        encoder: &mut wgpu::CommandEncoder,
        resources: &FrameResources,
        pipelines: &FixedPipelines,
        scene_bind_group: &wgpu::BindGroup,
        tile: &Tile,
        rng: &mut R,
        bounces: u32,
    ) {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("Generate Pass"),
        });
        pass.set_pipeline(&pipelines.generate);
        pass.set_bind_group(0, &resources.raygen_bind_group, &[]);
        pass.set_bind_group(1, scene_bind_group, &[]);
        let push = TilePush::new(tile, [rng.gen(), rng.gen()], 0, bounces);
        pass.set_push_constants(0, bytemuck::cast_slice(&[push]));
        pass.dispatch_workgroups(dispatch_extent(tile.width), dispatch_extent(tile.height), 1);
    }

    #[allow(clippy::too_many_arguments)]
    fn shade<R: Rng>(
        encoder: &mut wgpu::CommandEncoder,
        resources: &FrameResources,
        program: &ProgramState,
        scene_bind_group: &wgpu::BindGroup,
        tile: &Tile,
        buffers: BounceBuffers,
        depth: u32,
        bounces: u32,
        rng: &mut R,
    ) {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("Shade Pass"),
        });
        pass.set_pipeline(&program.pipeline);
        pass.set_bind_group(0, &resources.shade_bind_groups[buffers.read], &[]);
        pass.set_bind_group(1, scene_bind_group, &[]);
        pass.set_bind_group(2, &program.oracle_bind_group, &[]);
        let push = TilePush::new(tile, [rng.gen(), rng.gen()], depth, bounces);
        pass.set_push_constants(0, bytemuck::cast_slice(&[push]));
        pass.dispatch_workgroups(dispatch_extent(tile.width), dispatch_extent(tile.height), 1);
    }

    /// Copies the last bounce's radiance plane into the final target at the
    /// tile's pixel offset. A pure blit, clipped to the tile's extent.
    fn composite_tile(
        encoder: &mut wgpu::CommandEncoder,
        resources: &FrameResources,
        tile: &Tile,
        bounces: u32,
    ) {
        let final_set = BounceBuffers::final_set(bounces);
        encoder.copy_texture_to_texture(
            wgpu::ImageCopyTexture {
                texture: &resources.ray_sets[final_set].radiance.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyTexture {
                texture: &resources.final_target.texture,
                mip_level: 0,
                origin: wgpu::Origin3d {
                    x: tile.offset_x,
                    y: tile.offset_y,
                    z: 0,
                },
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::Extent3d {
                width: tile.width,
                height: tile.height,
                depth_or_array_layers: 1,
            },
        );
    }

    /// Blends the composited final target into the preview target with the
    /// frame's accumulation weight as the blend constant.
    fn accumulate(
        encoder: &mut wgpu::CommandEncoder,
        resources: &FrameResources,
        pipelines: &FixedPipelines,
        weight: f32,
    ) {
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Accumulate Pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &resources.preview_target.view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Load,
                    store: true,
                },
            })],
            depth_stencil_attachment: None,
        });
        pass.set_pipeline(&pipelines.accumulate);
        pass.set_bind_group(0, &resources.accum_bind_group, &[]);
        pass.set_blend_constant(wgpu::Color {
            r: weight as f64,
            g: weight as f64,
            b: weight as f64,
            a: weight as f64,
        });
        pass.draw(0..3, 0..1);
    }
}
