//! The pass graph used by the engine's built-in features.

use crate::error::Result;
use crate::pass::{LayoutTracker, PassAttachment, RenderPassDesc};
use crate::pipeline_system::RenderPipelineSystem;
use crate::targets::{RenderTargetSystem, StandardTargets};
use ash::vk;
use seaglass_core::constants::SHADOW_CASCADE_COUNT;
use seaglass_core::{RenderPassId, RenderTargetId};
use seaglass_gpu::ClearValue;

const COLOR: vk::ImageLayout = vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL;
const DEPTH: vk::ImageLayout = vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL;
const READ: vk::ImageLayout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
const GENERAL: vk::ImageLayout = vk::ImageLayout::GENERAL;

/// Well-known passes, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandardPasses {
    pub depth_normal: RenderPassId,
    pub shadows: [RenderPassId; SHADOW_CASCADE_COUNT],
    pub opaque_color: RenderPassId,
    pub sky: RenderPassId,
    pub depth_copy: RenderPassId,
    pub color_copy: RenderPassId,
    pub transparent_depth: RenderPassId,
    pub transparent_color: RenderPassId,
    pub brightness: RenderPassId,
    pub luminance: RenderPassId,
    pub bloom_downsample: RenderPassId,
    pub bloom_upsample: RenderPassId,
    pub tonemap: RenderPassId,
    pub fxaa: RenderPassId,
    pub ui: RenderPassId,
}

impl StandardPasses {
    pub const COUNT: usize = 14 + SHADOW_CASCADE_COUNT;

    /// Create the graph on `t`. Layouts are tracked across passes so each
    /// one carries the transitions its inputs and attachments need.
    pub fn create(
        pipelines: &mut RenderPipelineSystem,
        targets: &RenderTargetSystem,
        t: &StandardTargets,
    ) -> Result<Self> {
        let mut layouts = LayoutTracker::new();
        let mut pass = |desc: RenderPassDesc, changes: &[(RenderTargetId, vk::ImageLayout)]| {
            let transitions = layouts.transitions(changes.iter().copied());
            pipelines.create_render_pass(targets, desc.with_transitions(transitions))
        };

        let depth_normal = pass(
            RenderPassDesc::new("depth_normal")
                .with_attachment(PassAttachment::clear(t.depth, ClearValue::DEPTH_ZERO))
                .with_attachment(PassAttachment::clear(t.normal, ClearValue::TRANSPARENT)),
            &[(t.depth, DEPTH), (t.normal, COLOR)],
        )?;

        let mut shadows = [RenderPassId(0); SHADOW_CASCADE_COUNT];
        let mut previous = None;
        for (cascade, id) in shadows.iter_mut().enumerate() {
            let mut desc = RenderPassDesc::new(format!("shadow_{cascade}")).with_attachment(
                PassAttachment::clear(t.shadow_map, ClearValue::DEPTH_ONE).with_layer(cascade as u32),
            );
            if let Some(previous) = previous {
                desc = desc.depends_on(previous);
            }
            *id = pass(desc, &[(t.shadow_map, DEPTH)])?;
            previous = Some(*id);
        }
        let last_shadow = shadows[SHADOW_CASCADE_COUNT - 1];

        let opaque_color = pass(
            RenderPassDesc::new("opaque_color")
                .with_dependencies([depth_normal, last_shadow])
                .with_attachment(PassAttachment::clear(t.hdr_color, ClearValue::BLACK))
                .with_attachment(PassAttachment::load(t.depth)),
            &[(t.hdr_color, COLOR), (t.normal, READ), (t.shadow_map, READ)],
        )?;

        let sky = pass(
            RenderPassDesc::new("sky")
                .depends_on(opaque_color)
                .with_attachment(PassAttachment::load(t.hdr_color))
                .with_attachment(PassAttachment::load(t.depth)),
            &[],
        )?;

        let depth_copy = pass(
            RenderPassDesc::new("depth_copy")
                .depends_on(sky)
                .with_attachment(PassAttachment::load(t.depth_copy)),
            &[(t.depth, READ), (t.depth_copy, COLOR)],
        )?;

        let color_copy = pass(
            RenderPassDesc::new("color_copy")
                .depends_on(sky)
                .with_attachment(PassAttachment::load(t.color_copy)),
            &[(t.hdr_color, READ), (t.color_copy, COLOR)],
        )?;

        let transparent_depth = pass(
            RenderPassDesc::new("transparent_depth")
                .with_dependencies([depth_copy, color_copy])
                .with_attachment(PassAttachment::load(t.depth)),
            &[(t.depth, DEPTH), (t.depth_copy, READ)],
        )?;

        let transparent_color = pass(
            RenderPassDesc::new("transparent_color")
                .depends_on(transparent_depth)
                .with_attachment(PassAttachment::load(t.hdr_color))
                .with_attachment(PassAttachment::load(t.depth)),
            &[(t.hdr_color, COLOR), (t.color_copy, READ)],
        )?;

        let brightness = pass(
            RenderPassDesc::new("brightness")
                .depends_on(transparent_color)
                .with_attachment(PassAttachment::clear(t.brightness, ClearValue::BLACK)),
            &[(t.hdr_color, READ), (t.brightness, COLOR)],
        )?;

        let luminance = pass(
            RenderPassDesc::new("luminance").depends_on(transparent_color),
            &[(t.hdr_color, READ)],
        )?;

        let bloom_downsample = pass(
            RenderPassDesc::new("bloom_downsample").depends_on(brightness),
            &[(t.brightness, READ), (t.bloom, GENERAL)],
        )?;

        let bloom_upsample = pass(
            RenderPassDesc::new("bloom_upsample").depends_on(bloom_downsample),
            &[],
        )?;

        let tonemap = pass(
            RenderPassDesc::new("tonemap")
                .with_dependencies([bloom_upsample, luminance])
                .with_attachment(PassAttachment::load(t.ldr_color)),
            &[(t.bloom, READ), (t.ldr_color, COLOR)],
        )?;

        let fxaa = pass(
            RenderPassDesc::new("fxaa")
                .depends_on(tonemap)
                .with_attachment(PassAttachment::load(t.output)),
            &[(t.ldr_color, READ), (t.output, COLOR)],
        )?;

        let ui = pass(
            RenderPassDesc::new("ui")
                .depends_on(fxaa)
                .with_attachment(PassAttachment::load(t.output)),
            &[],
        )?;

        tracing::info!(passes = Self::COUNT, "Created standard render passes");
        Ok(Self {
            depth_normal,
            shadows,
            opaque_color,
            sky,
            depth_copy,
            color_copy,
            transparent_depth,
            transparent_color,
            brightness,
            luminance,
            bloom_downsample,
            bloom_upsample,
            tonemap,
            fxaa,
            ui,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RenderConfig;
    use crate::pass::PassTransition;
    use crate::render_system::RenderSystem;
    use crate::targets::OutputTarget;
    use seaglass_gpu::{RecordedCommand, RecordingDevice};
    use std::sync::Arc;

    struct Graph {
        device: Arc<RecordingDevice>,
        render: RenderSystem,
        targets: RenderTargetSystem,
        pipelines: RenderPipelineSystem,
        standard: StandardTargets,
        passes: StandardPasses,
    }

    fn graph() -> Graph {
        let device = Arc::new(RecordingDevice::new());
        let render = RenderSystem::new(
            device.clone(),
            RenderConfig::new().with_temp_buffer_size(256),
        )
        .unwrap();
        let mut targets = RenderTargetSystem::new();
        let standard = StandardTargets::create(
            &mut targets,
            &render,
            vk::Extent2D {
                width: 320,
                height: 180,
            },
            OutputTarget::Owned(vk::Format::B8G8R8A8_UNORM),
        )
        .unwrap();
        let mut pipelines = RenderPipelineSystem::new();
        let passes = StandardPasses::create(&mut pipelines, &targets, &standard).unwrap();
        Graph {
            device,
            render,
            targets,
            pipelines,
            standard,
            passes,
        }
    }

    #[test]
    fn graph_runs_in_creation_order() {
        let mut g = graph();
        assert_eq!(g.pipelines.pass_count(), StandardPasses::COUNT);

        g.render.begin_frame().unwrap();
        g.pipelines.flush(&mut g.render, &g.targets).unwrap();
        g.render.wait_idle().unwrap();

        let labels: Vec<String> = g
            .device
            .commands()
            .into_iter()
            .filter_map(|c| match c {
                RecordedCommand::BeginLabel { name, .. } if name != "uploads" => Some(name),
                _ => None,
            })
            .collect();
        assert_eq!(
            labels,
            [
                "depth_normal",
                "shadow_0",
                "shadow_1",
                "shadow_2",
                "shadow_3",
                "opaque_color",
                "sky",
                "depth_copy",
                "color_copy",
                "transparent_depth",
                "transparent_color",
                "brightness",
                "luminance",
                "bloom_downsample",
                "bloom_upsample",
                "tonemap",
                "fxaa",
                "ui",
            ]
        );
    }

    #[test]
    fn shadow_cascades_render_one_layer_each() {
        let g = graph();
        for (cascade, &pass) in g.passes.shadows.iter().enumerate() {
            let attachments = g.pipelines.get_attachments(pass).unwrap();
            assert_eq!(attachments.len(), 1);
            assert_eq!(attachments[0].layer, Some(cascade as u32));
            let transitions = g.pipelines.get_transitions(pass).unwrap();
            assert_eq!(transitions.len(), usize::from(cascade == 0));
        }
    }

    #[test]
    fn inputs_are_readable_before_use() {
        let g = graph();
        let t = &g.standard;
        let opaque = g.pipelines.get_transitions(g.passes.opaque_color).unwrap();
        assert!(opaque.contains(&PassTransition {
            target: t.shadow_map,
            old_layout: DEPTH,
            new_layout: READ,
        }));

        let downsample = g.pipelines.get_transitions(g.passes.bloom_downsample).unwrap();
        assert!(downsample.contains(&PassTransition {
            target: t.bloom,
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: GENERAL,
        }));

        let tonemap = g.pipelines.get_transitions(g.passes.tonemap).unwrap();
        assert!(tonemap.contains(&PassTransition {
            target: t.bloom,
            old_layout: GENERAL,
            new_layout: READ,
        }));
        assert!(g.pipelines.get_transitions(g.passes.ui).unwrap().is_empty());
    }

    #[test]
    fn compute_passes_have_no_attachments() {
        let g = graph();
        for pass in [
            g.passes.luminance,
            g.passes.bloom_downsample,
            g.passes.bloom_upsample,
        ] {
            assert!(g.pipelines.get_attachments(pass).unwrap().is_empty());
        }
        let (colors, depth) = g
            .pipelines
            .attachment_formats(g.passes.depth_normal, &g.targets)
            .unwrap();
        assert_eq!(colors, vec![StandardTargets::NORMAL_FORMAT]);
        assert_eq!(depth, Some(StandardTargets::DEPTH_FORMAT));
    }
}
