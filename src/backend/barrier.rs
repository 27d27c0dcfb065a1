// Hazard tracking for recorded commands
//
// Keeps the last-known {pipeline stage, access kind, image layout} for a
// small registered set of buffers and images, and derives the pipeline
// barriers a declared set of accesses needs before its action may run.
// Read-after-read at an unchanged layout never emits a barrier; any
// write, or any image layout change, emits exactly one.

use anyhow::{bail, Result};
use ash::vk;

/// Upper bound on registered buffers. Checked at registration.
pub const MAX_TRACKED_BUFFERS: usize = 16;
/// Upper bound on registered images. Checked at registration.
pub const MAX_TRACKED_IMAGES: usize = 16;

/// Access kinds that classify a hazard as write-involved.
const WRITE_ACCESS_BITS: vk::AccessFlags = vk::AccessFlags::from_raw(
    vk::AccessFlags::SHADER_WRITE.as_raw()
        | vk::AccessFlags::COLOR_ATTACHMENT_WRITE.as_raw()
        | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw()
        | vk::AccessFlags::TRANSFER_WRITE.as_raw()
        | vk::AccessFlags::HOST_WRITE.as_raw()
        | vk::AccessFlags::MEMORY_WRITE.as_raw(),
);

/// True unless `prev` -> `next` is a read-after-read pair.
const fn is_hazard(prev: vk::AccessFlags, next: vk::AccessFlags) -> bool {
    prev.as_raw() & WRITE_ACCESS_BITS.as_raw() != 0
        || next.as_raw() & WRITE_ACCESS_BITS.as_raw() != 0
}

/// Handle of a registered buffer. Obtained from [`HazardTracker::bind_buffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedBuffer(usize);

/// Handle of a registered image. Obtained from [`HazardTracker::bind_image`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedImage(usize);

/// One declared access, submitted immediately before the action that
/// performs it.
#[derive(Debug, Clone, Copy)]
pub enum Access {
    Buffer {
        target: TrackedBuffer,
        stage: vk::PipelineStageFlags,
        access: vk::AccessFlags,
    },
    Image {
        target: TrackedImage,
        stage: vk::PipelineStageFlags,
        access: vk::AccessFlags,
        layout: vk::ImageLayout,
    },
}

impl Access {
    pub fn buffer(
        target: TrackedBuffer,
        stage: vk::PipelineStageFlags,
        access: vk::AccessFlags,
    ) -> Self {
        Self::Buffer {
            target,
            stage,
            access,
        }
    }

    pub fn image(
        target: TrackedImage,
        stage: vk::PipelineStageFlags,
        access: vk::AccessFlags,
        layout: vk::ImageLayout,
    ) -> Self {
        Self::Image {
            target,
            stage,
            access,
            layout,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct BufferState {
    buffer: vk::Buffer,
    last_stage: vk::PipelineStageFlags,
    last_access: vk::AccessFlags,
}

#[derive(Debug, Clone, Copy)]
struct ImageState {
    image: vk::Image,
    last_stage: vk::PipelineStageFlags,
    last_access: vk::AccessFlags,
    layout: vk::ImageLayout,
    layer_count: u32,
}

/// The barriers one declared access list requires, merged into a single
/// batch. Empty batches must not be issued.
pub struct BarrierBatch<'a> {
    pub src_stage_mask: vk::PipelineStageFlags,
    pub dst_stage_mask: vk::PipelineStageFlags,
    pub buffer_barriers: &'a [vk::BufferMemoryBarrier],
    pub image_barriers: &'a [vk::ImageMemoryBarrier],
}

impl BarrierBatch<'_> {
    pub fn is_empty(&self) -> bool {
        self.buffer_barriers.is_empty() && self.image_barriers.is_empty()
    }
}

/// Tracks hazards on a bounded set of registered resources.
///
/// State lives in flat arrays indexed by handle; every check is O(1).
/// All tracked resources are assumed to be touched from a single queue.
pub struct HazardTracker {
    buffers: Vec<BufferState>,
    images: Vec<ImageState>,
    // Scratch reused across compose calls.
    buffer_barriers: Vec<vk::BufferMemoryBarrier>,
    image_barriers: Vec<vk::ImageMemoryBarrier>,
}

impl HazardTracker {
    pub fn new() -> Self {
        Self {
            buffers: Vec::new(),
            images: Vec::new(),
            buffer_barriers: Vec::new(),
            image_barriers: Vec::new(),
        }
    }

    /// Registers a buffer for tracking, starting with no prior access.
    pub fn bind_buffer(&mut self, buffer: vk::Buffer) -> Result<TrackedBuffer> {
        if self.buffers.len() >= MAX_TRACKED_BUFFERS {
            bail!("Tracked buffer limit ({}) reached", MAX_TRACKED_BUFFERS);
        }
        self.buffers.push(BufferState {
            buffer,
            last_stage: vk::PipelineStageFlags::empty(),
            last_access: vk::AccessFlags::empty(),
        });
        Ok(TrackedBuffer(self.buffers.len() - 1))
    }

    /// Registers an image for tracking in the given layout.
    pub fn bind_image(
        &mut self,
        image: vk::Image,
        layout: vk::ImageLayout,
        layer_count: u32,
    ) -> Result<TrackedImage> {
        if self.images.len() >= MAX_TRACKED_IMAGES {
            bail!("Tracked image limit ({}) reached", MAX_TRACKED_IMAGES);
        }
        self.images.push(ImageState {
            image,
            last_stage: vk::PipelineStageFlags::empty(),
            last_access: vk::AccessFlags::empty(),
            layout,
            layer_count,
        });
        Ok(TrackedImage(self.images.len() - 1))
    }

    /// Binds a new concrete buffer to an existing handle, resetting its
    /// tracked state.
    pub fn rebind_buffer(&mut self, target: TrackedBuffer, buffer: vk::Buffer) {
        self.buffers[target.0] = BufferState {
            buffer,
            last_stage: vk::PipelineStageFlags::empty(),
            last_access: vk::AccessFlags::empty(),
        };
    }

    /// Binds a new concrete image to an existing handle, resetting its
    /// tracked state. Used when a swapchain recreation replaces images.
    pub fn rebind_image(
        &mut self,
        target: TrackedImage,
        image: vk::Image,
        layout: vk::ImageLayout,
        layer_count: u32,
    ) {
        self.images[target.0] = ImageState {
            image,
            last_stage: vk::PipelineStageFlags::empty(),
            last_access: vk::AccessFlags::empty(),
            layout,
            layer_count,
        };
    }

    /// Clears every tracked stage/access, keeping layouts.
    ///
    /// Called once per frame right after the in-flight fence wait, when
    /// all previously recorded GPU work is known to have completed, so
    /// the frame's first touch does not pay for a stale barrier.
    pub fn assume_work_finished(&mut self) {
        for state in &mut self.buffers {
            state.last_stage = vk::PipelineStageFlags::empty();
            state.last_access = vk::AccessFlags::empty();
        }
        for state in &mut self.images {
            state.last_stage = vk::PipelineStageFlags::empty();
            state.last_access = vk::AccessFlags::empty();
        }
    }

    /// Folds `accesses` into the tracked state and returns the merged
    /// barrier batch the next action needs. Separated from emission so
    /// the decision is checkable without a device.
    pub fn compose_barriers(&mut self, accesses: &[Access]) -> BarrierBatch<'_> {
        self.buffer_barriers.clear();
        self.image_barriers.clear();
        let mut src_stage_mask = vk::PipelineStageFlags::empty();
        let mut dst_stage_mask = vk::PipelineStageFlags::empty();

        for declared in accesses {
            match *declared {
                Access::Buffer {
                    target,
                    stage,
                    access,
                } => {
                    let state = &mut self.buffers[target.0];
                    if is_hazard(state.last_access, access) {
                        src_stage_mask |= effective_src_stage(state.last_stage);
                        dst_stage_mask |= effective_dst_stage(stage);
                        self.buffer_barriers.push(
                            vk::BufferMemoryBarrier::builder()
                                .src_access_mask(state.last_access)
                                .dst_access_mask(access)
                                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                                .buffer(state.buffer)
                                .offset(0)
                                .size(vk::WHOLE_SIZE)
                                .build(),
                        );
                        state.last_stage = stage;
                        state.last_access = access;
                    } else {
                        // Read-after-read: widen the scope so a later
                        // write waits on all prior readers.
                        state.last_stage |= stage;
                        state.last_access |= access;
                    }
                }
                Access::Image {
                    target,
                    stage,
                    access,
                    layout,
                } => {
                    let state = &mut self.images[target.0];
                    if is_hazard(state.last_access, access) || state.layout != layout {
                        src_stage_mask |= effective_src_stage(state.last_stage);
                        dst_stage_mask |= effective_dst_stage(stage);
                        self.image_barriers.push(
                            vk::ImageMemoryBarrier::builder()
                                .src_access_mask(state.last_access)
                                .dst_access_mask(access)
                                .old_layout(state.layout)
                                .new_layout(layout)
                                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                                .image(state.image)
                                .subresource_range(vk::ImageSubresourceRange {
                                    aspect_mask: vk::ImageAspectFlags::COLOR,
                                    base_mip_level: 0,
                                    level_count: 1,
                                    base_array_layer: 0,
                                    layer_count: state.layer_count,
                                })
                                .build(),
                        );
                        state.last_stage = stage;
                        state.last_access = access;
                        state.layout = layout;
                    } else {
                        state.last_stage |= stage;
                        state.last_access |= access;
                    }
                }
            }
        }

        BarrierBatch {
            src_stage_mask,
            dst_stage_mask,
            buffer_barriers: &self.buffer_barriers,
            image_barriers: &self.image_barriers,
        }
    }

    /// Performs `action` on the command buffer, preceded by a single
    /// batched pipeline barrier when the declared accesses require one.
    pub fn action<F>(
        &mut self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        accesses: &[Access],
        action: F,
    ) where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let batch = self.compose_barriers(accesses);
        if !batch.is_empty() {
            unsafe {
                device.cmd_pipeline_barrier(
                    cmd,
                    batch.src_stage_mask,
                    batch.dst_stage_mask,
                    vk::DependencyFlags::empty(),
                    &[],
                    batch.buffer_barriers,
                    batch.image_barriers,
                );
            }
        }
        action(device, cmd);
    }

    /// Emits only the barriers for `accesses`, with no action attached.
    /// Used for terminal transitions such as handing an image to present.
    pub fn transition(
        &mut self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        accesses: &[Access],
    ) {
        self.action(device, cmd, accesses, |_, _| {});
    }
}

impl Default for HazardTracker {
    fn default() -> Self {
        Self::new()
    }
}

// A resource that was never touched (or was cleared by
// assume_work_finished) has an empty stage mask, which
// vkCmdPipelineBarrier does not accept.
fn effective_src_stage(stage: vk::PipelineStageFlags) -> vk::PipelineStageFlags {
    if stage.is_empty() {
        vk::PipelineStageFlags::TOP_OF_PIPE
    } else {
        stage
    }
}

fn effective_dst_stage(stage: vk::PipelineStageFlags) -> vk::PipelineStageFlags {
    if stage.is_empty() {
        vk::PipelineStageFlags::BOTTOM_OF_PIPE
    } else {
        stage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn tracker_with_buffer() -> (HazardTracker, TrackedBuffer) {
        let mut tracker = HazardTracker::new();
        let handle = tracker.bind_buffer(vk::Buffer::from_raw(1)).unwrap();
        (tracker, handle)
    }

    fn tracker_with_image(layout: vk::ImageLayout) -> (HazardTracker, TrackedImage) {
        let mut tracker = HazardTracker::new();
        let handle = tracker
            .bind_image(vk::Image::from_raw(1), layout, 1)
            .unwrap();
        (tracker, handle)
    }

    #[test]
    fn read_after_read_emits_no_barrier() {
        let (mut tracker, buf) = tracker_with_buffer();
        let reads = [
            Access::buffer(
                buf,
                vk::PipelineStageFlags::VERTEX_SHADER,
                vk::AccessFlags::SHADER_READ,
            ),
            Access::buffer(
                buf,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::AccessFlags::SHADER_READ,
            ),
        ];
        let batch = tracker.compose_barriers(&reads);
        assert!(batch.is_empty());

        // Still nothing on a later read.
        let later = [Access::buffer(
            buf,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::AccessFlags::SHADER_READ,
        )];
        assert!(tracker.compose_barriers(&later).is_empty());
    }

    #[test]
    fn write_after_reads_waits_on_all_readers() {
        let (mut tracker, buf) = tracker_with_buffer();
        tracker.compose_barriers(&[
            Access::buffer(
                buf,
                vk::PipelineStageFlags::VERTEX_SHADER,
                vk::AccessFlags::SHADER_READ,
            ),
            Access::buffer(
                buf,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::AccessFlags::SHADER_READ,
            ),
        ]);

        let batch = tracker.compose_barriers(&[Access::buffer(
            buf,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::AccessFlags::SHADER_WRITE,
        )]);
        assert_eq!(batch.buffer_barriers.len(), 1);
        // The source scope is the union of both prior readers.
        assert_eq!(
            batch.src_stage_mask,
            vk::PipelineStageFlags::VERTEX_SHADER | vk::PipelineStageFlags::FRAGMENT_SHADER
        );
        assert_eq!(batch.dst_stage_mask, vk::PipelineStageFlags::COMPUTE_SHADER);
        assert_eq!(
            batch.buffer_barriers[0].src_access_mask,
            vk::AccessFlags::SHADER_READ
        );
        assert_eq!(
            batch.buffer_barriers[0].dst_access_mask,
            vk::AccessFlags::SHADER_WRITE
        );
    }

    #[test]
    fn consecutive_writes_each_emit_one_barrier() {
        let (mut tracker, buf) = tracker_with_buffer();
        let write = [Access::buffer(
            buf,
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_WRITE,
        )];
        let first = tracker.compose_barriers(&write);
        assert_eq!(first.buffer_barriers.len(), 1);

        let second = tracker.compose_barriers(&write);
        assert_eq!(second.buffer_barriers.len(), 1);
        // The tracked state was reset to the previous write's scope.
        assert_eq!(second.src_stage_mask, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(
            second.buffer_barriers[0].src_access_mask,
            vk::AccessFlags::TRANSFER_WRITE
        );
    }

    #[test]
    fn first_touch_write_sources_from_top_of_pipe() {
        let (mut tracker, buf) = tracker_with_buffer();
        let batch = tracker.compose_barriers(&[Access::buffer(
            buf,
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_WRITE,
        )]);
        assert_eq!(batch.src_stage_mask, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(
            batch.buffer_barriers[0].src_access_mask,
            vk::AccessFlags::empty()
        );
    }

    #[test]
    fn layout_change_forces_barrier_even_for_reads() {
        let (mut tracker, img) = tracker_with_image(vk::ImageLayout::GENERAL);

        let same_layout = [Access::image(
            img,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::AccessFlags::SHADER_READ,
            vk::ImageLayout::GENERAL,
        )];
        assert!(tracker.compose_barriers(&same_layout).is_empty());

        let new_layout = [Access::image(
            img,
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_READ,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        )];
        let batch = tracker.compose_barriers(&new_layout);
        assert_eq!(batch.image_barriers.len(), 1);
        assert_eq!(batch.image_barriers[0].old_layout, vk::ImageLayout::GENERAL);
        assert_eq!(
            batch.image_barriers[0].new_layout,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL
        );
    }

    #[test]
    fn present_transition_targets_bottom_of_pipe() {
        let (mut tracker, img) = tracker_with_image(vk::ImageLayout::UNDEFINED);
        tracker.compose_barriers(&[Access::image(
            img,
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )]);

        let batch = tracker.compose_barriers(&[Access::image(
            img,
            vk::PipelineStageFlags::empty(),
            vk::AccessFlags::empty(),
            vk::ImageLayout::PRESENT_SRC_KHR,
        )]);
        assert_eq!(batch.image_barriers.len(), 1);
        assert_eq!(batch.src_stage_mask, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(batch.dst_stage_mask, vk::PipelineStageFlags::BOTTOM_OF_PIPE);
        assert_eq!(
            batch.image_barriers[0].new_layout,
            vk::ImageLayout::PRESENT_SRC_KHR
        );
    }

    #[test]
    fn one_batch_for_multiple_resources() {
        let mut tracker = HazardTracker::new();
        let buf = tracker.bind_buffer(vk::Buffer::from_raw(1)).unwrap();
        let img = tracker
            .bind_image(vk::Image::from_raw(2), vk::ImageLayout::UNDEFINED, 1)
            .unwrap();

        let batch = tracker.compose_barriers(&[
            Access::buffer(
                buf,
                vk::PipelineStageFlags::TRANSFER,
                vk::AccessFlags::TRANSFER_WRITE,
            ),
            Access::image(
                img,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::AccessFlags::SHADER_WRITE,
                vk::ImageLayout::GENERAL,
            ),
        ]);
        assert_eq!(batch.buffer_barriers.len(), 1);
        assert_eq!(batch.image_barriers.len(), 1);
        assert_eq!(
            batch.dst_stage_mask,
            vk::PipelineStageFlags::TRANSFER | vk::PipelineStageFlags::COMPUTE_SHADER
        );
    }

    #[test]
    fn assume_work_finished_clears_access_scope() {
        let (mut tracker, buf) = tracker_with_buffer();
        tracker.compose_barriers(&[Access::buffer(
            buf,
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_WRITE,
        )]);

        tracker.assume_work_finished();

        // A read after the frame boundary needs no barrier.
        let batch = tracker.compose_barriers(&[Access::buffer(
            buf,
            vk::PipelineStageFlags::VERTEX_SHADER,
            vk::AccessFlags::SHADER_READ,
        )]);
        assert!(batch.is_empty());
    }

    #[test]
    fn registration_is_bounded() {
        let mut tracker = HazardTracker::new();
        for raw in 0..MAX_TRACKED_BUFFERS {
            tracker.bind_buffer(vk::Buffer::from_raw(raw as u64 + 1)).unwrap();
        }
        assert!(tracker.bind_buffer(vk::Buffer::from_raw(99)).is_err());
    }

    #[test]
    fn rebind_resets_tracked_state() {
        let (mut tracker, img) = tracker_with_image(vk::ImageLayout::PRESENT_SRC_KHR);
        tracker.compose_barriers(&[Access::image(
            img,
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )]);

        tracker.rebind_image(img, vk::Image::from_raw(7), vk::ImageLayout::UNDEFINED, 1);

        let batch = tracker.compose_barriers(&[Access::image(
            img,
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )]);
        assert_eq!(batch.image_barriers.len(), 1);
        assert_eq!(
            batch.image_barriers[0].old_layout,
            vk::ImageLayout::UNDEFINED
        );
        assert_eq!(batch.src_stage_mask, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(
            batch.image_barriers[0].image,
            vk::Image::from_raw(7)
        );
    }
}
