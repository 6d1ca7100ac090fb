//! The shading-program hot-reload protocol.
//!
//! Once per frame the oracle's update flags are polled. Any set bit means
//! scene-derived shader code or bindings changed, so the shading pipeline is
//! reassembled from the accessor fragment and the oracle's resources are
//! rebound. A build failure leaves the tracker Stale and the frame driver
//! skips rendering until a later build succeeds; a Stale program is never
//! dispatched.

use pathtracer_shared::{RaytracerConfig, TilePush, UpdateFlags};

use crate::kernels::{compile_module, CompileError, KernelBuilder, KernelLayouts};
use crate::oracle::{BindingResource, ResourceBinding};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SyncState {
    Stale,
    Valid,
}

/// Pure decision half of the synchronizer, kept separate from the GPU work
/// so the rebuild policy is testable.
#[derive(Debug)]
pub struct SyncTracker {
    state: SyncState,
}

impl SyncTracker {
    pub fn new() -> Self {
        Self {
            state: SyncState::Stale,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.state == SyncState::Valid
    }

    /// Whether this frame must rebuild the shading program. True on the
    /// first frame regardless of flags, and on any frame reporting a change.
    pub fn needs_rebuild(&self, flags: UpdateFlags) -> bool {
        self.state == SyncState::Stale || !flags.is_empty()
    }

    pub fn mark_stale(&mut self) {
        self.state = SyncState::Stale;
    }

    pub fn mark_built(&mut self) {
        self.state = SyncState::Valid;
    }
}

impl Default for SyncTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// The currently linked shading pipeline plus the oracle resources bound to
/// it. Replaced wholesale on every rebuild; never partially mutated.
pub struct ProgramState {
    pub pipeline: wgpu::ComputePipeline,
    pub oracle_bind_group: wgpu::BindGroup,
}

impl ProgramState {
    /// Assembles, validates, compiles and links the shading program, then
    /// binds the oracle's reported resources to it.
    pub fn build(
        device: &wgpu::Device,
        layouts: &KernelLayouts,
        accessor_source: &str,
        bindings: &[ResourceBinding<'_>],
    ) -> Result<Self, CompileError> {
        let source = KernelBuilder::new(accessor_source).build()?;
        let module = compile_module(device, "Shade Module", &source)?;

        let oracle_layout = oracle_bind_group_layout(device, bindings);
        let oracle_bind_group = oracle_bind_group(device, &oracle_layout, bindings);

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Shade Pipeline Layout"),
            bind_group_layouts: &[&layouts.shade_rays, &layouts.scene, &oracle_layout],
            push_constant_ranges: &[wgpu::PushConstantRange {
                stages: wgpu::ShaderStages::COMPUTE,
                range: 0..std::mem::size_of::<TilePush>() as u32,
            }],
        });

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("Shade Pipeline"),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: "main_cs",
        });
        if let Some(error) = pollster::block_on(device.pop_error_scope()) {
            return Err(CompileError::Pipeline(error.to_string()));
        }

        log::debug!(
            "rebuilt shading program ({} oracle bindings, {} bytes of accessor source)",
            bindings.len(),
            accessor_source.len()
        );
        Ok(Self {
            pipeline,
            oracle_bind_group,
        })
    }
}

fn oracle_bind_group_layout(
    device: &wgpu::Device,
    bindings: &[ResourceBinding<'_>],
) -> wgpu::BindGroupLayout {
    let entries: Vec<wgpu::BindGroupLayoutEntry> = bindings
        .iter()
        .enumerate()
        .map(|(index, binding)| wgpu::BindGroupLayoutEntry {
            binding: index as u32,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: match &binding.resource {
                BindingResource::UniformBuffer(_) => wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                BindingResource::Texture2d { sample_type, .. } => wgpu::BindingType::Texture {
                    multisampled: false,
                    view_dimension: wgpu::TextureViewDimension::D2,
                    sample_type: *sample_type,
                },
                BindingResource::TextureArray2d { sample_type, .. } => wgpu::BindingType::Texture {
                    multisampled: false,
                    view_dimension: wgpu::TextureViewDimension::D2Array,
                    sample_type: *sample_type,
                },
            },
            count: None,
        })
        .collect();

    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("Oracle Bind Group Layout"),
        entries: &entries,
    })
}

fn oracle_bind_group(
    device: &wgpu::Device,
    layout: &wgpu::BindGroupLayout,
    bindings: &[ResourceBinding<'_>],
) -> wgpu::BindGroup {
    let entries: Vec<wgpu::BindGroupEntry> = bindings
        .iter()
        .enumerate()
        .map(|(index, binding)| wgpu::BindGroupEntry {
            binding: index as u32,
            resource: match &binding.resource {
                BindingResource::UniformBuffer(buffer) => buffer.as_entire_binding(),
                BindingResource::Texture2d { view, .. }
                | BindingResource::TextureArray2d { view, .. } => {
                    wgpu::BindingResource::TextureView(view)
                }
            },
        })
        .collect();

    device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("Oracle Bind Group"),
        layout,
        entries: &entries,
    })
}

/// Sanity bound used by the driver when picking bounce depth for a frame.
pub fn clamp_depth(depth: u32) -> u32 {
    depth.clamp(1, RaytracerConfig::REST_DEPTH.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drives the tracker the way the frame driver does and counts rebuilds.
    fn drive(tracker: &mut SyncTracker, frames: &[(UpdateFlags, bool)]) -> u32 {
        let mut rebuilds = 0;
        for &(flags, build_succeeds) in frames {
            if tracker.needs_rebuild(flags) {
                tracker.mark_stale();
                rebuilds += 1;
                if build_succeeds {
                    tracker.mark_built();
                }
            }
        }
        rebuilds
    }

    #[test]
    fn first_frame_builds_even_without_updates() {
        let mut tracker = SyncTracker::new();
        assert!(!tracker.is_valid());
        let rebuilds = drive(&mut tracker, &[(UpdateFlags::NO_UPDATE, true)]);
        assert_eq!(rebuilds, 1);
        assert!(tracker.is_valid());
    }

    #[test]
    fn no_update_frames_never_rebuild() {
        let mut tracker = SyncTracker::new();
        drive(&mut tracker, &[(UpdateFlags::NO_UPDATE, true)]);
        let rebuilds = drive(
            &mut tracker,
            &[
                (UpdateFlags::NO_UPDATE, true),
                (UpdateFlags::NO_UPDATE, true),
                (UpdateFlags::NO_UPDATE, true),
            ],
        );
        assert_eq!(rebuilds, 0);
    }

    #[test]
    fn flagged_frames_rebuild_exactly_once() {
        let mut tracker = SyncTracker::new();
        drive(&mut tracker, &[(UpdateFlags::NO_UPDATE, true)]);
        let rebuilds = drive(
            &mut tracker,
            &[
                (UpdateFlags::ACCESSOR_CODE, true),
                (UpdateFlags::NO_UPDATE, true),
                (UpdateFlags::ACCESSOR_BINDINGS | UpdateFlags::INSTANCE_UPDATE, true),
                (UpdateFlags::NO_UPDATE, true),
            ],
        );
        assert_eq!(rebuilds, 2);
    }

    #[test]
    fn failed_build_stays_stale_and_retries() {
        let mut tracker = SyncTracker::new();
        let rebuilds = drive(
            &mut tracker,
            &[
                (UpdateFlags::ACCESSOR_CODE, false),
                // No new flags, but the program is still stale
                (UpdateFlags::NO_UPDATE, true),
            ],
        );
        assert_eq!(rebuilds, 2);
        assert!(tracker.is_valid());
    }

    #[test]
    fn depth_is_clamped_to_at_least_one_bounce() {
        assert_eq!(clamp_depth(0), 1);
        assert_eq!(clamp_depth(3), 3);
    }
}
