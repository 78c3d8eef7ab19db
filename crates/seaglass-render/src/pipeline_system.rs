//! The render pipeline system: the pass graph and its draw/dispatch contexts.

use crate::batch::{
    downcast_queue, BatchQueue, ContextQueue, DispatchBatch, DispatchContextDesc,
    DispatchContextId, DrawBatch, DrawContextDesc, DrawContextId,
};
use crate::error::{RenderError, Result};
use crate::frame::PassSubmission;
use crate::pass::{sort_passes, PassAttachment, PassTransition, RenderPassDesc};
use crate::render_system::RenderSystem;
use crate::targets::RenderTargetSystem;
use ash::vk;
use seaglass_core::constants::{MAX_ATTACHMENTS, MAX_RENDER_PASS_DEPS, MAX_RENDER_PASS_TRANSITIONS};
use seaglass_core::{RenderPassId, RenderTargetId};
use seaglass_gpu::memory::is_depth_format;
use seaglass_gpu::{ImageBarrier, RenderingAttachment, RenderingDesc};

fn invalid(name: &str, reason: impl Into<String>) -> RenderError {
    RenderError::InvalidPass {
        name: name.to_owned(),
        reason: reason.into(),
    }
}

/// Owns the passes and routes batches to them.
#[derive(Default)]
pub struct RenderPipelineSystem {
    passes: Vec<RenderPassDesc>,
    order: Vec<RenderPassId>,
    draw_contexts: Vec<Box<dyn BatchQueue>>,
    dispatch_contexts: Vec<Box<dyn BatchQueue>>,
}

impl RenderPipelineSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pass. Dependencies must name existing passes.
    pub fn create_render_pass(
        &mut self,
        targets: &RenderTargetSystem,
        desc: RenderPassDesc,
    ) -> Result<RenderPassId> {
        self.validate(targets, &desc)?;

        let id = RenderPassId(self.passes.len() as u32);
        tracing::debug!(
            name = %desc.name,
            deps = desc.dependencies.len(),
            attachments = desc.attachments.len(),
            "Created render pass {id}"
        );
        self.passes.push(desc);
        self.reorder()?;
        Ok(id)
    }

    /// Make `pass` wait on `dependency`, which may have been created later.
    pub fn add_dependency(&mut self, pass: RenderPassId, dependency: RenderPassId) -> Result<()> {
        self.pass(dependency)?;
        let desc = self
            .passes
            .get_mut(pass.index())
            .ok_or(RenderError::UnknownPass(pass))?;
        if pass == dependency || desc.dependencies.contains(&dependency) {
            return Err(invalid(&desc.name, format!("duplicate dependency on {dependency}")));
        }
        if desc.dependencies.len() >= MAX_RENDER_PASS_DEPS {
            return Err(invalid(&desc.name, "too many dependencies"));
        }

        desc.dependencies.push(dependency);
        if let Err(e) = self.reorder() {
            self.passes[pass.index()].dependencies.pop();
            return Err(e);
        }
        Ok(())
    }

    fn validate(&self, targets: &RenderTargetSystem, desc: &RenderPassDesc) -> Result<()> {
        let name = desc.name.as_str();
        if desc.attachments.len() > MAX_ATTACHMENTS {
            return Err(invalid(name, format!("more than {MAX_ATTACHMENTS} attachments")));
        }
        if desc.dependencies.len() > MAX_RENDER_PASS_DEPS {
            return Err(invalid(name, format!("more than {MAX_RENDER_PASS_DEPS} dependencies")));
        }
        if desc.transitions.len() > MAX_RENDER_PASS_TRANSITIONS {
            return Err(invalid(
                name,
                format!("more than {MAX_RENDER_PASS_TRANSITIONS} transitions"),
            ));
        }

        for (i, dep) in desc.dependencies.iter().enumerate() {
            if dep.index() >= self.passes.len() {
                return Err(RenderError::UnknownPass(*dep));
            }
            if desc.dependencies[..i].contains(dep) {
                return Err(invalid(name, format!("duplicate dependency on {dep}")));
            }
        }

        for transition in &desc.transitions {
            if !targets.contains(transition.target) {
                return Err(RenderError::UnknownRenderTarget(transition.target));
            }
        }

        let mut area: Option<vk::Extent3D> = None;
        let mut depth_count = 0;
        for attachment in &desc.attachments {
            let target = attachment.target;
            if attachment.mip >= targets.mip_count(target)? {
                return Err(invalid(name, format!("{target} has no mip {}", attachment.mip)));
            }
            if let Some(layer) = attachment.layer {
                if layer >= targets.layer_count(target)? {
                    return Err(invalid(name, format!("{target} has no layer {layer}")));
                }
            }
            if is_depth_format(targets.format(target)?) {
                depth_count += 1;
            }

            let extent = targets.mip_extent(target, attachment.mip)?;
            match area {
                Some(a) if (a.width, a.height) != (extent.width, extent.height) => {
                    return Err(invalid(name, "attachments differ in size"));
                }
                _ => area = Some(extent),
            }
        }
        if depth_count > 1 {
            return Err(invalid(name, "more than one depth attachment"));
        }
        Ok(())
    }

    fn reorder(&mut self) -> Result<()> {
        let deps: Vec<&[RenderPassId]> = self
            .passes
            .iter()
            .map(|p| p.dependencies.as_slice())
            .collect();
        self.order = sort_passes(&deps).ok_or_else(|| {
            let name = self.passes.last().map_or("", |p| p.name.as_str());
            invalid(name, "dependency cycle")
        })?;
        Ok(())
    }

    fn pass(&self, id: RenderPassId) -> Result<&RenderPassDesc> {
        self.passes
            .get(id.index())
            .ok_or(RenderError::UnknownPass(id))
    }

    /// Register a context recording `T`-payload draw batches into `desc.pass`.
    pub fn register_draw_context<T: Send + 'static>(
        &mut self,
        desc: DrawContextDesc<T>,
    ) -> Result<DrawContextId<T>> {
        let pass = self.pass(desc.pass)?;
        if pass.is_compute() {
            return Err(RenderError::ContextPassMismatch {
                context: desc.name,
                pass: pass.name.clone(),
                reason: "draw contexts need a pass with attachments",
            });
        }

        let index = self.draw_contexts.len() as u32;
        tracing::debug!(
            context = %desc.name,
            pass = %pass.name,
            batch_size = std::mem::size_of::<T>(),
            "Registered draw context"
        );
        self.draw_contexts.push(Box::new(ContextQueue::<DrawBatch<T>>::new(
            desc.name,
            desc.pass,
            std::mem::size_of::<T>(),
            desc.draw_fn,
        )));
        Ok(DrawContextId::from_index(index))
    }

    /// Register a context recording `T`-payload dispatch batches into `desc.pass`.
    pub fn register_dispatch_context<T: Send + 'static>(
        &mut self,
        desc: DispatchContextDesc<T>,
    ) -> Result<DispatchContextId<T>> {
        let pass = self.pass(desc.pass)?;
        if !pass.is_compute() {
            return Err(RenderError::ContextPassMismatch {
                context: desc.name,
                pass: pass.name.clone(),
                reason: "dispatch contexts need a pass without attachments",
            });
        }

        let index = self.dispatch_contexts.len() as u32;
        tracing::debug!(
            context = %desc.name,
            pass = %pass.name,
            batch_size = std::mem::size_of::<T>(),
            "Registered dispatch context"
        );
        self.dispatch_contexts
            .push(Box::new(ContextQueue::<DispatchBatch<T>>::new(
                desc.name,
                desc.pass,
                std::mem::size_of::<T>(),
                desc.dispatch_fn,
            )));
        Ok(DispatchContextId::from_index(index))
    }

    /// Queue draw batches for this tick, after any already queued.
    pub fn issue_draw_batch<T: Send + 'static>(
        &mut self,
        ctx: DrawContextId<T>,
        batches: impl IntoIterator<Item = DrawBatch<T>>,
    ) -> Result<()> {
        let queue = self
            .draw_contexts
            .get_mut(ctx.index() as usize)
            .ok_or(RenderError::UnknownContext(ctx.index()))?;
        downcast_queue::<DrawBatch<T>>(queue.as_mut())?.push(batches);
        Ok(())
    }

    /// Queue dispatch batches for this tick. Nothing is queued if any batch is invalid.
    pub fn issue_dispatch_batch<T: Send + 'static>(
        &mut self,
        ctx: DispatchContextId<T>,
        batches: impl IntoIterator<Item = DispatchBatch<T>>,
    ) -> Result<()> {
        let queue = self
            .dispatch_contexts
            .get_mut(ctx.index() as usize)
            .ok_or(RenderError::UnknownContext(ctx.index()))?;
        let queue = downcast_queue::<DispatchBatch<T>>(queue.as_mut())?;

        let batches: Vec<_> = batches.into_iter().collect();
        for batch in &batches {
            batch.validate(queue.name())?;
        }
        queue.push(batches);
        Ok(())
    }

    /// Batches queued on a draw context this tick.
    pub fn pending_draw_batches<T>(&self, ctx: DrawContextId<T>) -> usize {
        self.draw_contexts
            .get(ctx.index() as usize)
            .map_or(0, |q| q.pending())
    }

    pub fn pending_dispatch_batches<T>(&self, ctx: DispatchContextId<T>) -> usize {
        self.dispatch_contexts
            .get(ctx.index() as usize)
            .map_or(0, |q| q.pending())
    }

    pub fn get_attachments(&self, pass: RenderPassId) -> Result<&[PassAttachment]> {
        Ok(&self.pass(pass)?.attachments)
    }

    pub fn get_transitions(&self, pass: RenderPassId) -> Result<&[PassTransition]> {
        Ok(&self.pass(pass)?.transitions)
    }

    /// Color formats and depth format of a pass, for pipeline creation.
    pub fn attachment_formats(
        &self,
        pass: RenderPassId,
        targets: &RenderTargetSystem,
    ) -> Result<(Vec<vk::Format>, Option<vk::Format>)> {
        let mut colors = Vec::new();
        let mut depth = None;
        for attachment in self.get_attachments(pass)? {
            let format = targets.format(attachment.target)?;
            if is_depth_format(format) {
                depth = Some(format);
            } else {
                colors.push(format);
            }
        }
        Ok((colors, depth))
    }

    /// Passes in execution order.
    pub fn pass_order(&self) -> &[RenderPassId] {
        &self.order
    }

    pub fn pass_name(&self, pass: RenderPassId) -> Option<&str> {
        self.passes.get(pass.index()).map(|p| p.name.as_str())
    }

    pub fn find_pass(&self, name: &str) -> Option<RenderPassId> {
        self.passes
            .iter()
            .position(|p| p.name == name)
            .map(|i| RenderPassId(i as u32))
    }

    pub fn pass_count(&self) -> usize {
        self.passes.len()
    }

    /// Resolve every pass for the current slot, move all queued batches into
    /// the frame and submit it.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn flush(&mut self, render: &mut RenderSystem, targets: &RenderTargetSystem) -> Result<()> {
        let slot = render.frame_idx();

        let mut passes = Vec::with_capacity(self.order.len());
        for &id in &self.order {
            let desc = &self.passes[id.index()];
            let transitions = desc
                .transitions
                .iter()
                .map(|t| -> Result<ImageBarrier> {
                    Ok(ImageBarrier::layout_transition(
                        targets.image(slot, t.target)?,
                        targets.full_range(t.target)?,
                        t.old_layout,
                        t.new_layout,
                    ))
                })
                .collect::<Result<Vec<_>>>()?;
            let rendering = if desc.is_compute() {
                None
            } else {
                Some(resolve_rendering(&desc.attachments, targets, slot)?)
            };
            passes.push(PassSubmission {
                id,
                name: desc.name.clone(),
                transitions,
                rendering,
                work: Vec::new(),
            });
        }

        // Everything resolved; batches can now leave their contexts
        for pass in &mut passes {
            let contexts = if pass.rendering.is_some() {
                &mut self.draw_contexts
            } else {
                &mut self.dispatch_contexts
            };
            pass.work = contexts
                .iter_mut()
                .filter(|c| c.pass() == pass.id)
                .filter_map(|c| c.take_work())
                .collect();
        }

        render.submit_passes(passes)
    }

    /// Rebind the output to new swapchain images. Waits for the GPU and drops
    /// every queued batch, since they may reference the old images.
    pub fn on_swapchain_resize(
        &mut self,
        render: &mut RenderSystem,
        targets: &mut RenderTargetSystem,
        output: RenderTargetId,
        images: &[vk::Image],
        extent: vk::Extent2D,
    ) -> Result<()> {
        render.wait_idle()?;
        targets.reimport_render_target(render, output, extent, images)?;
        self.clear_batches();
        tracing::info!(width = extent.width, height = extent.height, "Swapchain resized");
        Ok(())
    }

    /// Drop every queued batch.
    pub fn clear_batches(&mut self) {
        for queue in self
            .draw_contexts
            .iter_mut()
            .chain(self.dispatch_contexts.iter_mut())
        {
            queue.clear();
        }
    }
}

fn resolve_rendering(
    attachments: &[PassAttachment],
    targets: &RenderTargetSystem,
    slot: usize,
) -> Result<RenderingDesc> {
    let mut colors = Vec::with_capacity(attachments.len());
    let mut depth = None;
    let mut area = vk::Extent2D::default();
    let mut layer_count = 1;

    for (i, attachment) in attachments.iter().enumerate() {
        let target = attachment.target;
        let view = match (attachment.layer, attachment.mip) {
            (Some(layer), mip) => targets.sub_view(slot, target, mip, layer)?,
            (None, 0) => {
                layer_count = layer_count.max(targets.layer_count(target)?);
                targets.view(slot, target)?
            }
            (None, mip) => targets.sub_view(slot, target, mip, 0)?,
        };
        if i == 0 {
            let extent = targets.mip_extent(target, attachment.mip)?;
            area = vk::Extent2D {
                width: extent.width,
                height: extent.height,
            };
        }

        if is_depth_format(targets.format(target)?) {
            depth = Some(RenderingAttachment {
                view,
                layout: vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
                clear: attachment.clear,
            });
        } else {
            colors.push(RenderingAttachment {
                view,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                clear: attachment.clear,
            });
        }
    }

    Ok(RenderingDesc {
        area: vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent: area,
        },
        layer_count,
        colors,
        depth,
    })
}
