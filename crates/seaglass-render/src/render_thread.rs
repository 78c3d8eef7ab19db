//! The thread that records and submits frames.
//!
//! The main thread hands over one [`FrameSubmission`] per tick. Completion of
//! each slot comes back on that slot's own channel, so waiting on a slot only
//! ever blocks on the submission that last used it.

use crate::batch::PassRecorder;
use crate::error::{RenderError, Result};
use crate::frame::{FrameSubmission, PassSubmission};
use ash::vk;
use crossbeam::channel::{self, Receiver, Sender};
use hashbrown::HashSet;
use seaglass_gpu::{CommandEncoder, GpuDevice, ImageBarrier};
use std::sync::Arc;
use std::thread::JoinHandle;

pub(crate) struct RenderThread {
    sender: Option<Sender<FrameSubmission>>,
    completions: Vec<Receiver<Result<()>>>,
    in_flight: Vec<bool>,
    handle: Option<JoinHandle<()>>,
}

impl RenderThread {
    pub fn spawn(device: Arc<dyn GpuDevice>, name: &str, slots: usize) -> Result<Self> {
        let (sender, receiver) = channel::bounded::<FrameSubmission>(slots);
        let (done_tx, completions): (Vec<_>, Vec<_>) =
            (0..slots).map(|_| channel::bounded(1)).unzip();

        let handle = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || run(device.as_ref(), &receiver, &done_tx))
            .map_err(|e| RenderError::RenderThread(format!("Failed to spawn '{name}': {e}")))?;

        tracing::debug!(name, slots, "Render thread started");
        Ok(Self {
            sender: Some(sender),
            completions,
            in_flight: vec![false; slots],
            handle: Some(handle),
        })
    }

    /// Hand a frame to the thread. The slot must not have a frame in flight.
    pub fn submit(&mut self, frame: FrameSubmission) -> Result<()> {
        let slot = frame.slot;
        if self.in_flight[slot] {
            return Err(RenderError::InvalidState(format!(
                "Slot {slot} submitted twice without waiting"
            )));
        }
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| RenderError::RenderThread("Render thread stopped".to_string()))?;
        sender
            .send(frame)
            .map_err(|_| RenderError::RenderThread("Render thread disconnected".to_string()))?;
        self.in_flight[slot] = true;
        Ok(())
    }

    /// Block until the last frame submitted on `slot` has been recorded and
    /// submitted, returning its outcome.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn wait(&mut self, slot: usize) -> Result<()> {
        if !self.in_flight[slot] {
            return Ok(());
        }
        self.in_flight[slot] = false;
        self.completions[slot].recv().map_err(|_| {
            RenderError::RenderThread(format!("Render thread exited before finishing slot {slot}"))
        })?
    }

    /// Wait for every slot. Reports the first failure after all slots drained.
    pub fn wait_all(&mut self) -> Result<()> {
        let mut first_err = None;
        for slot in 0..self.in_flight.len() {
            if let Err(e) = self.wait(slot) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    pub fn is_in_flight(&self, slot: usize) -> bool {
        self.in_flight[slot]
    }

    /// Drain outstanding frames and join the thread.
    pub fn stop(&mut self) -> Result<()> {
        let drained = self.wait_all();
        self.sender = None;
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| RenderError::RenderThread("Render thread panicked".to_string()))?;
            tracing::debug!("Render thread stopped");
        }
        drained
    }
}

impl Drop for RenderThread {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::error!("Render thread shutdown: {e}");
        }
    }
}

fn run(device: &dyn GpuDevice, frames: &Receiver<FrameSubmission>, done: &[Sender<Result<()>>]) {
    for frame in frames {
        let slot = frame.slot;
        let result = execute(device, frame);
        if let Err(e) = &result {
            tracing::error!(slot, "Frame failed: {e}");
        }
        if done[slot].send(result).is_err() {
            break;
        }
    }
}

#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
fn execute(device: &dyn GpuDevice, frame: FrameSubmission) -> Result<()> {
    let _span = tracing::trace_span!("render_frame", slot = frame.slot, frame = frame.frame_number)
        .entered();

    let cmds = device.begin_frame(frame.slot)?;
    if !frame.descriptor_writes.is_empty() {
        device.update_descriptor_sets(&frame.descriptor_writes);
    }

    let encoder = device.as_encoder();
    record_uploads(encoder, cmds.upload, &frame);
    for pass in &frame.passes {
        record_pass(encoder, cmds.graphics, &frame, pass);
    }

    device.submit_frame(frame.slot, cmds)?;
    Ok(())
}

fn record_uploads(encoder: &dyn CommandEncoder, cmd: vk::CommandBuffer, frame: &FrameSubmission) {
    if !frame.has_uploads() {
        return;
    }
    encoder.cmd_begin_label(cmd, "uploads");

    for upload in &frame.buffer_uploads {
        encoder.cmd_copy_buffer(cmd, upload.src, upload.dst, &[upload.region()]);
    }

    if !frame.image_uploads.is_empty() {
        // One transition per image, however many uploads target it
        let transitions = |old: vk::ImageLayout, new: vk::ImageLayout| -> Vec<ImageBarrier> {
            let mut seen = HashSet::new();
            frame
                .image_uploads
                .iter()
                .filter(|u| seen.insert(u.dst))
                .map(|u| ImageBarrier::layout_transition(u.dst, u.range, old, new))
                .collect()
        };

        encoder.cmd_image_barriers(
            cmd,
            &transitions(
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            ),
        );
        for upload in &frame.image_uploads {
            encoder.cmd_copy_buffer_to_image(
                cmd,
                upload.src,
                upload.dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &upload.regions,
            );
        }
        encoder.cmd_image_barriers(
            cmd,
            &transitions(
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ),
        );
    }

    // Uploaded data becomes visible to every later command of the frame
    encoder.cmd_memory_barrier(
        cmd,
        (
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_WRITE,
        ),
        (
            vk::PipelineStageFlags2::ALL_COMMANDS,
            vk::AccessFlags2::MEMORY_READ,
        ),
    );
    encoder.cmd_end_label(cmd);
}

fn record_pass(
    encoder: &dyn CommandEncoder,
    cmd: vk::CommandBuffer,
    frame: &FrameSubmission,
    pass: &PassSubmission,
) {
    encoder.cmd_begin_label(cmd, &pass.name);
    if !pass.transitions.is_empty() {
        encoder.cmd_image_barriers(cmd, &pass.transitions);
    }

    let recorder = PassRecorder::new(
        encoder,
        cmd,
        pass.id,
        &pass.name,
        frame.slot,
        frame.frame_number,
        pass.rendering.as_ref().map(|r| r.area.extent),
    );

    if let Some(rendering) = &pass.rendering {
        encoder.cmd_begin_rendering(cmd, rendering);
        for work in &pass.work {
            work.record(&recorder);
        }
        encoder.cmd_end_rendering(cmd);
    } else {
        for work in &pass.work {
            work.record(&recorder);
        }
    }

    encoder.cmd_end_label(cmd);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{BufferUpload, ImageUpload};
    use ash::vk::Handle;
    use seaglass_core::RenderPassId;
    use seaglass_gpu::{RecordedCommand, RecordingDevice};

    fn submission(slot: usize) -> FrameSubmission {
        FrameSubmission {
            slot,
            frame_number: slot as u64,
            descriptor_writes: Vec::new(),
            buffer_uploads: Vec::new(),
            image_uploads: Vec::new(),
            passes: Vec::new(),
        }
    }

    #[test]
    fn frames_complete_per_slot() {
        let device = Arc::new(RecordingDevice::new());
        let mut thread = RenderThread::spawn(device.clone(), "test-render", 2).unwrap();

        thread.submit(submission(0)).unwrap();
        thread.submit(submission(1)).unwrap();
        assert!(thread.submit(submission(0)).is_err());

        thread.wait(0).unwrap();
        assert!(!thread.is_in_flight(0));
        assert!(thread.is_in_flight(1));
        thread.wait_all().unwrap();

        let submits: Vec<_> = device
            .commands()
            .into_iter()
            .filter(|c| matches!(c, RecordedCommand::SubmitFrame { .. }))
            .collect();
        assert_eq!(
            submits,
            vec![
                RecordedCommand::SubmitFrame { slot: 0 },
                RecordedCommand::SubmitFrame { slot: 1 }
            ]
        );
        thread.stop().unwrap();
    }

    #[test]
    fn uploads_are_wrapped_in_transitions() {
        let device = Arc::new(RecordingDevice::new());
        let mut thread = RenderThread::spawn(device.clone(), "test-render", 1).unwrap();

        let src = vk::Buffer::from_raw(0x10);
        let image = vk::Image::from_raw(0x20);
        let mut frame = submission(0);
        frame.buffer_uploads.push(BufferUpload {
            src,
            dst: vk::Buffer::from_raw(0x11),
            src_offset: 0,
            dst_offset: 0,
            size: 0,
        });
        frame.image_uploads.push(ImageUpload {
            src,
            dst: image,
            range: vk::ImageSubresourceRange::default(),
            regions: vec![vk::BufferImageCopy::default().buffer_offset(256)],
        });
        frame.passes.push(PassSubmission {
            id: RenderPassId(0),
            name: "compute".to_string(),
            transitions: Vec::new(),
            rendering: None,
            work: Vec::new(),
        });
        thread.submit(frame).unwrap();
        thread.wait(0).unwrap();

        let upload = vk::CommandBuffer::from_raw(0xC000);
        let commands = device.commands();
        let image_events: Vec<_> = commands
            .iter()
            .filter_map(|c| match c {
                RecordedCommand::ImageBarrier {
                    cmd,
                    old_layout,
                    new_layout,
                    ..
                } => Some((*cmd, *old_layout, *new_layout)),
                RecordedCommand::CopyBufferToImage {
                    cmd,
                    buffer_offsets,
                    ..
                } => {
                    assert_eq!(buffer_offsets, &vec![256u64]);
                    Some((*cmd, vk::ImageLayout::UNDEFINED, vk::ImageLayout::UNDEFINED))
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            image_events,
            vec![
                (
                    upload,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL
                ),
                (upload, vk::ImageLayout::UNDEFINED, vk::ImageLayout::UNDEFINED),
                (
                    upload,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
                ),
            ]
        );
        assert!(commands.contains(&RecordedCommand::BeginLabel {
            cmd: vk::CommandBuffer::from_raw(0xC001),
            name: "compute".to_string(),
        }));
    }

    #[test]
    fn repeated_uploads_share_one_transition_pair() {
        let device = Arc::new(RecordingDevice::new());
        let mut thread = RenderThread::spawn(device.clone(), "test-render", 1).unwrap();

        let src = vk::Buffer::from_raw(0x10);
        let atlas = vk::Image::from_raw(0x20);
        let icon = vk::Image::from_raw(0x21);
        let mut frame = submission(0);
        for (dst, offset) in [(atlas, 0), (icon, 64), (atlas, 128)] {
            frame.image_uploads.push(ImageUpload {
                src,
                dst,
                range: vk::ImageSubresourceRange::default(),
                regions: vec![vk::BufferImageCopy::default().buffer_offset(offset)],
            });
        }
        thread.submit(frame).unwrap();
        thread.wait(0).unwrap();

        let commands = device.commands();
        let barriers = |target: vk::Image| -> Vec<_> {
            commands
                .iter()
                .filter_map(|c| match c {
                    RecordedCommand::ImageBarrier {
                        image,
                        old_layout,
                        new_layout,
                        ..
                    } if *image == target => Some((*old_layout, *new_layout)),
                    _ => None,
                })
                .collect()
        };
        let expected = vec![
            (
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            ),
            (
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ),
        ];
        assert_eq!(barriers(atlas), expected);
        assert_eq!(barriers(icon), expected);
        let copies = commands
            .iter()
            .filter(|c| matches!(c, RecordedCommand::CopyBufferToImage { .. }))
            .count();
        assert_eq!(copies, 3);
    }

    #[test]
    fn stop_drains_and_rejects_new_frames() {
        let device = Arc::new(RecordingDevice::new());
        let mut thread = RenderThread::spawn(device.clone(), "test-render", 1).unwrap();
        thread.submit(submission(0)).unwrap();
        thread.stop().unwrap();

        assert!(device.commands().contains(&RecordedCommand::SubmitFrame { slot: 0 }));
        assert!(matches!(
            thread.submit(submission(0)),
            Err(RenderError::RenderThread(_))
        ));
    }
}
