//! Render pass descriptions, ordering and layout tracking.

use ash::vk;
use hashbrown::HashMap;
use seaglass_core::{RenderPassId, RenderTargetId};
use seaglass_gpu::ClearValue;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// A render target bound for dynamic rendering.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PassAttachment {
    pub target: RenderTargetId,
    /// `None` loads the previous contents.
    pub clear: Option<ClearValue>,
    pub mip: u32,
    /// Single layer to render into; `None` binds every layer.
    pub layer: Option<u32>,
}

impl PassAttachment {
    pub const fn load(target: RenderTargetId) -> Self {
        Self {
            target,
            clear: None,
            mip: 0,
            layer: None,
        }
    }

    pub const fn clear(target: RenderTargetId, value: ClearValue) -> Self {
        Self {
            target,
            clear: Some(value),
            mip: 0,
            layer: None,
        }
    }

    #[must_use]
    pub const fn with_mip(mut self, mip: u32) -> Self {
        self.mip = mip;
        self
    }

    #[must_use]
    pub const fn with_layer(mut self, layer: u32) -> Self {
        self.layer = Some(layer);
        self
    }
}

/// A whole-image layout change recorded before the pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassTransition {
    pub target: RenderTargetId,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
}

/// Parameters of [`crate::RenderPipelineSystem::create_render_pass`].
///
/// A pass with attachments records draw contexts inside a dynamic rendering
/// scope; a pass without records dispatch contexts.
#[derive(Debug, Clone, Default)]
pub struct RenderPassDesc {
    pub name: String,
    pub dependencies: Vec<RenderPassId>,
    pub attachments: Vec<PassAttachment>,
    pub transitions: Vec<PassTransition>,
}

impl RenderPassDesc {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn depends_on(mut self, pass: RenderPassId) -> Self {
        self.dependencies.push(pass);
        self
    }

    #[must_use]
    pub fn with_dependencies(mut self, passes: impl IntoIterator<Item = RenderPassId>) -> Self {
        self.dependencies.extend(passes);
        self
    }

    #[must_use]
    pub fn with_attachment(mut self, attachment: PassAttachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    #[must_use]
    pub fn with_transitions(mut self, transitions: impl IntoIterator<Item = PassTransition>) -> Self {
        self.transitions.extend(transitions);
        self
    }

    pub fn is_compute(&self) -> bool {
        self.attachments.is_empty()
    }
}

/// Topological order of passes, ties broken by creation order.
///
/// `dependencies[i]` lists the passes pass `i` waits on. Returns `None` when
/// the dependencies form a cycle.
pub(crate) fn sort_passes(dependencies: &[&[RenderPassId]]) -> Option<Vec<RenderPassId>> {
    let count = dependencies.len();
    let mut waiting_on = vec![0usize; count];
    let mut dependents = vec![Vec::new(); count];
    for (pass, deps) in dependencies.iter().enumerate() {
        for dep in *deps {
            waiting_on[pass] += 1;
            dependents[dep.index()].push(pass);
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = (0..count)
        .filter(|&pass| waiting_on[pass] == 0)
        .map(Reverse)
        .collect();
    let mut order = Vec::with_capacity(count);
    while let Some(Reverse(pass)) = ready.pop() {
        order.push(RenderPassId(pass as u32));
        for &next in &dependents[pass] {
            waiting_on[next] -= 1;
            if waiting_on[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }

    (order.len() == count).then_some(order)
}

/// Follows the layout of each target through a sequence of passes.
///
/// Every target starts a frame as `UNDEFINED`, so its first use discards
/// whatever the previous frame left behind.
#[derive(Debug, Clone, Default)]
pub struct LayoutTracker {
    layouts: HashMap<RenderTargetId, vk::ImageLayout>,
}

impl LayoutTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn layout(&self, target: RenderTargetId) -> vk::ImageLayout {
        self.layouts
            .get(&target)
            .copied()
            .unwrap_or(vk::ImageLayout::UNDEFINED)
    }

    /// Move `target` to `layout`, returning the transition unless it is already there.
    pub fn transition(&mut self, target: RenderTargetId, layout: vk::ImageLayout) -> Option<PassTransition> {
        let old_layout = self.layouts.insert(target, layout).unwrap_or(vk::ImageLayout::UNDEFINED);
        (old_layout != layout).then_some(PassTransition {
            target,
            old_layout,
            new_layout: layout,
        })
    }

    pub fn transitions(
        &mut self,
        changes: impl IntoIterator<Item = (RenderTargetId, vk::ImageLayout)>,
    ) -> Vec<PassTransition> {
        changes
            .into_iter()
            .filter_map(|(target, layout)| self.transition(target, layout))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[u32]) -> Vec<RenderPassId> {
        raw.iter().copied().map(RenderPassId).collect()
    }

    #[test]
    fn backward_dependencies_keep_creation_order() {
        let deps = [ids(&[]), ids(&[0]), ids(&[]), ids(&[1, 2])];
        let deps: Vec<&[RenderPassId]> = deps.iter().map(Vec::as_slice).collect();
        assert_eq!(sort_passes(&deps), Some(ids(&[0, 1, 2, 3])));
    }

    #[test]
    fn forward_dependency_moves_pass_later() {
        // Pass 0 waits on pass 2
        let deps = [ids(&[2]), ids(&[]), ids(&[])];
        let deps: Vec<&[RenderPassId]> = deps.iter().map(Vec::as_slice).collect();
        assert_eq!(sort_passes(&deps), Some(ids(&[1, 2, 0])));
    }

    #[test]
    fn diamond_resolves_ties_by_creation() {
        let deps = [ids(&[]), ids(&[0]), ids(&[0]), ids(&[2, 1])];
        let deps: Vec<&[RenderPassId]> = deps.iter().map(Vec::as_slice).collect();
        assert_eq!(sort_passes(&deps), Some(ids(&[0, 1, 2, 3])));
    }

    #[test]
    fn cycle_has_no_order() {
        let deps = [ids(&[1]), ids(&[0]), ids(&[])];
        let deps: Vec<&[RenderPassId]> = deps.iter().map(Vec::as_slice).collect();
        assert_eq!(sort_passes(&deps), None);
        assert_eq!(sort_passes(&[]), Some(Vec::new()));
    }

    #[test]
    fn tracker_emits_only_changes() {
        let mut tracker = LayoutTracker::new();
        let depth = RenderTargetId(0);
        let color = RenderTargetId(1);

        let first = tracker.transitions([
            (depth, vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL),
            (color, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
        ]);
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].old_layout, vk::ImageLayout::UNDEFINED);

        assert_eq!(tracker.transition(depth, vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL), None);
        assert_eq!(
            tracker.transition(depth, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
            Some(PassTransition {
                target: depth,
                old_layout: vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
                new_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            })
        );
        assert_eq!(tracker.layout(color), vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
    }

    #[test]
    fn attachment_builders() {
        let a = PassAttachment::clear(RenderTargetId(2), ClearValue::DEPTH_ONE).with_layer(3);
        assert_eq!(a.layer, Some(3));
        assert_eq!(a.mip, 0);
        assert!(PassAttachment::load(RenderTargetId(2)).clear.is_none());
        assert!(RenderPassDesc::new("luminance").is_compute());
    }
}
