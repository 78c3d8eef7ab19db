//! Draw and dispatch batches, typed context handles and the pass recorder.
//!
//! A context pairs a render pass with a recording callback. Feature systems
//! issue batches against a context during the tick; at flush the batches are
//! moved into the frame submission and the callback receives all of them at
//! once on the render thread.

use crate::error::{RenderError, Result};
use ash::vk;
use glam::UVec3;
use seaglass_core::constants::MAX_DISPATCH_GROUPS;
use seaglass_core::RenderPassId;
use seaglass_gpu::CommandEncoder;
use std::any::{type_name, Any};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

/// One unit of draw work.
#[derive(Debug, Clone)]
pub struct DrawBatch<T> {
    pub layout: vk::PipelineLayout,
    pub pipeline: vk::Pipeline,
    pub viewport: vk::Viewport,
    pub scissor: vk::Rect2D,
    pub payload: T,
}

impl<T> DrawBatch<T> {
    pub const fn new(
        layout: vk::PipelineLayout,
        pipeline: vk::Pipeline,
        viewport: vk::Viewport,
        scissor: vk::Rect2D,
        payload: T,
    ) -> Self {
        Self {
            layout,
            pipeline,
            viewport,
            scissor,
            payload,
        }
    }

    /// A batch whose viewport and scissor cover `extent`.
    pub fn covering(
        layout: vk::PipelineLayout,
        pipeline: vk::Pipeline,
        extent: vk::Extent2D,
        payload: T,
    ) -> Self {
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent,
        };
        Self::new(layout, pipeline, viewport, scissor, payload)
    }
}

/// One unit of compute work. Each entry of `groups` is dispatched in order.
#[derive(Debug, Clone)]
pub struct DispatchBatch<T> {
    pub layout: vk::PipelineLayout,
    pub pipeline: vk::Pipeline,
    pub groups: Vec<UVec3>,
    pub payload: T,
}

impl<T> DispatchBatch<T> {
    pub const fn new(layout: vk::PipelineLayout, pipeline: vk::Pipeline, payload: T) -> Self {
        Self {
            layout,
            pipeline,
            groups: Vec::new(),
            payload,
        }
    }

    #[must_use]
    pub fn with_group(mut self, groups: UVec3) -> Self {
        self.groups.push(groups);
        self
    }

    #[must_use]
    pub fn with_groups(mut self, groups: impl IntoIterator<Item = UVec3>) -> Self {
        self.groups.extend(groups);
        self
    }

    pub(crate) fn validate(&self, context: &str) -> Result<()> {
        if self.groups.len() > MAX_DISPATCH_GROUPS {
            return Err(RenderError::TooManyDispatchGroups {
                context: context.to_owned(),
                count: self.groups.len(),
                max: MAX_DISPATCH_GROUPS,
            });
        }
        Ok(())
    }
}

/// What a pass callback records with.
///
/// Wraps the command encoder and the graphics command buffer of the frame
/// being recorded, plus the pass being recorded.
pub struct PassRecorder<'a> {
    encoder: &'a dyn CommandEncoder,
    cmd: vk::CommandBuffer,
    pass: RenderPassId,
    pass_name: &'a str,
    slot: usize,
    frame_number: u64,
    extent: Option<vk::Extent2D>,
}

impl<'a> PassRecorder<'a> {
    pub(crate) fn new(
        encoder: &'a dyn CommandEncoder,
        cmd: vk::CommandBuffer,
        pass: RenderPassId,
        pass_name: &'a str,
        slot: usize,
        frame_number: u64,
        extent: Option<vk::Extent2D>,
    ) -> Self {
        Self {
            encoder,
            cmd,
            pass,
            pass_name,
            slot,
            frame_number,
            extent,
        }
    }

    pub fn encoder(&self) -> &'a dyn CommandEncoder {
        self.encoder
    }

    pub const fn cmd(&self) -> vk::CommandBuffer {
        self.cmd
    }

    pub const fn pass(&self) -> RenderPassId {
        self.pass
    }

    pub const fn pass_name(&self) -> &str {
        self.pass_name
    }

    /// Frame slot being recorded.
    pub const fn slot(&self) -> usize {
        self.slot
    }

    pub const fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Render area of the pass. `None` for compute passes.
    pub const fn extent(&self) -> Option<vk::Extent2D> {
        self.extent
    }

    /// Bind the batch's pipeline and set its viewport and scissor.
    pub fn bind_draw_state<T>(&self, batch: &DrawBatch<T>) {
        self.encoder
            .cmd_bind_pipeline(self.cmd, vk::PipelineBindPoint::GRAPHICS, batch.pipeline);
        self.encoder.cmd_set_viewport(self.cmd, batch.viewport);
        self.encoder.cmd_set_scissor(self.cmd, batch.scissor);
    }

    pub fn bind_descriptor_sets(
        &self,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        self.encoder
            .cmd_bind_descriptor_sets(self.cmd, bind_point, layout, first_set, sets, &[]);
    }

    pub fn push_constants<P: bytemuck::Pod>(
        &self,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        value: &P,
    ) {
        self.encoder
            .cmd_push_constants(self.cmd, layout, stages, 0, bytemuck::bytes_of(value));
    }

    pub fn draw(&self, vertex_count: u32, instance_count: u32) {
        self.encoder
            .cmd_draw(self.cmd, vertex_count, instance_count, 0, 0);
    }

    pub fn draw_indexed(
        &self,
        index_buffer: vk::Buffer,
        index_offset: u64,
        index_type: vk::IndexType,
        index_count: u32,
        instance_count: u32,
    ) {
        self.encoder
            .cmd_bind_index_buffer(self.cmd, index_buffer, index_offset, index_type);
        self.encoder
            .cmd_draw_indexed(self.cmd, index_count, instance_count, 0, 0, 0);
    }

    /// Bind the batch's compute pipeline and dispatch every group count.
    pub fn dispatch_batch<T>(&self, batch: &DispatchBatch<T>) {
        self.encoder
            .cmd_bind_pipeline(self.cmd, vk::PipelineBindPoint::COMPUTE, batch.pipeline);
        for groups in &batch.groups {
            self.encoder
                .cmd_dispatch(self.cmd, groups.x, groups.y, groups.z);
        }
    }
}

/// Records every batch of one context in one call.
pub type DrawFn<T> = Arc<dyn Fn(&PassRecorder<'_>, &[DrawBatch<T>]) + Send + Sync>;

/// Records every dispatch batch of one context in one call.
pub type DispatchFn<T> = Arc<dyn Fn(&PassRecorder<'_>, &[DispatchBatch<T>]) + Send + Sync>;

/// Registration parameters of a draw context.
pub struct DrawContextDesc<T> {
    pub name: String,
    pub pass: RenderPassId,
    pub draw_fn: DrawFn<T>,
}

impl<T> DrawContextDesc<T> {
    pub fn new<F>(name: impl Into<String>, pass: RenderPassId, draw_fn: F) -> Self
    where
        F: Fn(&PassRecorder<'_>, &[DrawBatch<T>]) + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            pass,
            draw_fn: Arc::new(draw_fn),
        }
    }
}

/// Registration parameters of a dispatch context.
pub struct DispatchContextDesc<T> {
    pub name: String,
    pub pass: RenderPassId,
    pub dispatch_fn: DispatchFn<T>,
}

impl<T> DispatchContextDesc<T> {
    pub fn new<F>(name: impl Into<String>, pass: RenderPassId, dispatch_fn: F) -> Self
    where
        F: Fn(&PassRecorder<'_>, &[DispatchBatch<T>]) + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            pass,
            dispatch_fn: Arc::new(dispatch_fn),
        }
    }
}

macro_rules! context_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        pub struct $name<T> {
            index: u32,
            _batch: PhantomData<fn() -> T>,
        }

        impl<T> $name<T> {
            /// Rebuild a handle from its raw index. The batch type is checked
            /// again when batches are issued.
            pub const fn from_index(index: u32) -> Self {
                Self {
                    index,
                    _batch: PhantomData,
                }
            }

            pub const fn index(self) -> u32 {
                self.index
            }
        }

        impl<T> Clone for $name<T> {
            fn clone(&self) -> Self {
                *self
            }
        }

        impl<T> Copy for $name<T> {}

        impl<T> PartialEq for $name<T> {
            fn eq(&self, other: &Self) -> bool {
                self.index == other.index
            }
        }

        impl<T> Eq for $name<T> {}

        impl<T> Hash for $name<T> {
            fn hash<H: Hasher>(&self, state: &mut H) {
                self.index.hash(state);
            }
        }

        impl<T> fmt::Debug for $name<T> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}<{}>({})", stringify!($name), type_name::<T>(), self.index)
            }
        }
    };
}

context_id!(
    /// Handle to a draw context whose batches carry a `T` payload.
    DrawContextId
);
context_id!(
    /// Handle to a dispatch context whose batches carry a `T` payload.
    DispatchContextId
);

/// Batches of one context, moved out of the pipeline system at flush.
pub(crate) trait PassWork: Send {
    fn context_name(&self) -> &str;
    fn batch_count(&self) -> usize;
    fn record(&self, recorder: &PassRecorder<'_>);
}

type RecordFn<B> = Arc<dyn Fn(&PassRecorder<'_>, &[B]) + Send + Sync>;

struct ContextWork<B> {
    name: String,
    record_fn: RecordFn<B>,
    batches: Vec<B>,
}

impl<B: Send + 'static> PassWork for ContextWork<B> {
    fn context_name(&self) -> &str {
        &self.name
    }

    fn batch_count(&self) -> usize {
        self.batches.len()
    }

    fn record(&self, recorder: &PassRecorder<'_>) {
        (self.record_fn)(recorder, &self.batches);
    }
}

/// Type-erased storage of a registered context.
pub(crate) trait BatchQueue: Send {
    fn name(&self) -> &str;
    fn pass(&self) -> RenderPassId;
    /// Type name of the batches this context accepts.
    fn batch_type(&self) -> &'static str;
    /// Payload size in bytes.
    fn batch_size(&self) -> usize;
    fn pending(&self) -> usize;
    fn clear(&mut self);
    /// Move the accumulated batches out, or `None` when there are none.
    fn take_work(&mut self) -> Option<Box<dyn PassWork>>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

pub(crate) struct ContextQueue<B> {
    name: String,
    pass: RenderPassId,
    batch_size: usize,
    record_fn: RecordFn<B>,
    batches: Vec<B>,
}

impl<B> ContextQueue<B> {
    pub fn new(name: String, pass: RenderPassId, batch_size: usize, record_fn: RecordFn<B>) -> Self {
        Self {
            name,
            pass,
            batch_size,
            record_fn,
            batches: Vec::new(),
        }
    }

    pub fn push(&mut self, batches: impl IntoIterator<Item = B>) {
        self.batches.extend(batches);
    }
}

impl<B: Send + 'static> BatchQueue for ContextQueue<B> {
    fn name(&self) -> &str {
        &self.name
    }

    fn pass(&self) -> RenderPassId {
        self.pass
    }

    fn batch_type(&self) -> &'static str {
        type_name::<B>()
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn pending(&self) -> usize {
        self.batches.len()
    }

    fn clear(&mut self) {
        self.batches.clear();
    }

    fn take_work(&mut self) -> Option<Box<dyn PassWork>> {
        if self.batches.is_empty() {
            return None;
        }
        Some(Box::new(ContextWork {
            name: self.name.clone(),
            record_fn: Arc::clone(&self.record_fn),
            batches: std::mem::take(&mut self.batches),
        }))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Recover the typed queue behind a context, rejecting batches of another type.
pub(crate) fn downcast_queue<B: Send + 'static>(
    queue: &mut dyn BatchQueue,
) -> Result<&mut ContextQueue<B>> {
    if !queue.as_any().is::<ContextQueue<B>>() {
        return Err(RenderError::BatchTypeMismatch {
            context: queue.name().to_owned(),
            expected: queue.batch_type(),
            found: type_name::<B>(),
        });
    }
    queue
        .as_any_mut()
        .downcast_mut::<ContextQueue<B>>()
        .ok_or_else(|| RenderError::InvalidState("Context queue changed type".to_string()))
}
