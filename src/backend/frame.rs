// Frame synchronizer - drives the per-frame loop
//
// Wait for the slot's previous use to finish, acquire a swapchain
// image, hand out the slot's command buffer for recording, then submit
// and present with the right semaphore ordering. The fence wait at the
// start is the only place the normal-frame path blocks; it bounds the
// CPU to MAX_FRAMES_IN_FLIGHT frames ahead of the GPU.

use anyhow::{bail, Context, Result};
use ash::vk;
use std::sync::Arc;

use super::deletion::{destroy_resources, DeletionQueue};
use super::swapchain::{Acquire, SwapchainManager};
use super::sync::{DoubleBuffered, FrameSlot, MAX_FRAMES_IN_FLIGHT};
use super::VulkanDevice;

/// Handed to the caller for the duration of one recorded frame. Only
/// valid between `begin_frame` and `end_frame`.
#[derive(Debug, Clone, Copy)]
pub struct ActiveFrame {
    pub cmd: vk::CommandBuffer,
    pub image_index: u32,
    /// Index for any double-buffered resource the application owns.
    pub parity: usize,
}

pub struct FrameSynchronizer {
    device: Arc<VulkanDevice>,
    swapchain: SwapchainManager,
    command_pool: vk::CommandPool,
    slots: DoubleBuffered<FrameSlot>,
    deletion: DeletionQueue,
    // Pre-allocated to avoid per-frame heap allocations
    wait_stages: [vk::PipelineStageFlags; 1],
    image_index: u32,
    needs_recreate: bool,
    recording: bool,
    generation: u64,
}

impl FrameSynchronizer {
    pub fn new(device: Arc<VulkanDevice>, swapchain: SwapchainManager) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.graphics_queue_family)
            .flags(
                vk::CommandPoolCreateFlags::TRANSIENT
                    | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            );
        let command_pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;

        // One command buffer per frame in flight
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(MAX_FRAMES_IN_FLIGHT as u32);
        let command_buffers = unsafe { device.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffers")?;

        let slots = DoubleBuffered::new(
            FrameSlot::new(&device, command_buffers[0])?,
            FrameSlot::new(&device, command_buffers[1])?,
        );

        Ok(Self {
            device,
            swapchain,
            command_pool,
            slots,
            deletion: DeletionQueue::new(),
            wait_stages: [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
            image_index: 0,
            needs_recreate: false,
            recording: false,
            generation: 0,
        })
    }

    /// Begins a frame: waits for this slot's previous submission,
    /// handles pending swapchain recreation, acquires an image, and
    /// returns the slot's command buffer ready for recording.
    ///
    /// Returns `None` when the frame is skipped (minimized window, or
    /// a stale surface that was just recreated; retried next tick).
    pub fn begin_frame(&mut self, extent: (u32, u32)) -> Result<Option<ActiveFrame>> {
        if self.recording {
            bail!("begin_frame called while a frame is already recording");
        }

        // Wait for the previous use of this slot. The fence is not
        // reset until an image is actually acquired, so a skipped
        // frame leaves it signaled.
        let fence = self.slots.write().in_flight;
        unsafe {
            self.device
                .device
                .wait_for_fences(&[fence], true, u64::MAX)
                .context("Fence wait failed")?;
        }

        // Everything enqueued two frames ago is now safe to destroy.
        let expired = self.deletion.next_group();
        destroy_resources(&self.device.device, expired);

        if self.needs_recreate {
            self.swapchain.recreate(extent)?;
            self.needs_recreate = false;
            self.generation += 1;
        }
        if !self.swapchain.is_ready() {
            // Minimized; nothing to present to.
            return Ok(None);
        }

        let slot = self.slots.write();
        let acquire = self
            .swapchain
            .acquire_next(u64::MAX, slot.image_available)?;
        let image_index = match acquire {
            Acquire::Ready {
                image_index,
                suboptimal,
            } => {
                if suboptimal {
                    self.needs_recreate = true;
                }
                image_index
            }
            Acquire::OutOfDate => {
                self.needs_recreate = true;
                return Ok(None);
            }
        };

        unsafe {
            self.device
                .device
                .reset_fences(&[fence])
                .context("Fence reset failed")?;
            self.device
                .device
                .reset_command_buffer(slot.command_buffer, vk::CommandBufferResetFlags::empty())
                .context("Command buffer reset failed")?;
            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device
                .device
                .begin_command_buffer(slot.command_buffer, &begin_info)
                .context("Command buffer begin failed")?;
        }

        self.image_index = image_index;
        self.recording = true;

        Ok(Some(ActiveFrame {
            cmd: slot.command_buffer,
            image_index,
            parity: self.slots.parity().write_index(),
        }))
    }

    /// Ends the frame: submits the recorded commands gated on image
    /// availability, presents gated on rendering completion, and flips
    /// the frame parity.
    pub fn end_frame(&mut self) -> Result<()> {
        if !self.recording {
            bail!("end_frame called without a recording frame");
        }
        self.recording = false;

        let slot = self.slots.write();
        unsafe {
            self.device
                .device
                .end_command_buffer(slot.command_buffer)
                .context("Command buffer end failed")?;
        }

        let wait_semaphores = [slot.image_available];
        let signal_semaphores = [slot.render_finished];
        let command_buffers = [slot.command_buffer];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)      // Wait for image to be available
            .wait_dst_stage_mask(&self.wait_stages) // Which stage waits
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores); // Signal when done

        unsafe {
            self.device.device.queue_submit(
                self.device.graphics_queue,
                &[submit_info.build()],
                slot.in_flight, // Signal this fence when GPU is done
            )?;
        }

        // A stale present is absorbed here; the recreation happens at
        // the top of the next frame.
        let stale = self.swapchain.present(
            self.device.graphics_queue,
            self.image_index,
            &signal_semaphores,
        )?;
        if stale {
            self.needs_recreate = true;
        }

        self.slots.advance();
        Ok(())
    }

    /// Asks for swapchain recreation at the next frame boundary
    /// (window resize).
    pub fn request_recreate(&mut self) {
        self.needs_recreate = true;
    }

    /// Index for the application's own double-buffered resources.
    pub fn parity(&self) -> usize {
        self.slots.parity().write_index()
    }

    pub fn frame_number(&self) -> u64 {
        self.slots.parity().frame_number()
    }

    /// Bumped whenever the swapchain was recreated; the application
    /// re-registers swapchain-derived resources when it changes.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn swapchain(&self) -> &SwapchainManager {
        &self.swapchain
    }

    pub fn deletion_mut(&mut self) -> &mut DeletionQueue {
        &mut self.deletion
    }
}

impl Drop for FrameSynchronizer {
    fn drop(&mut self) {
        // Drain all in-flight work before destroying anything it may
        // still reference.
        let _ = self.device.wait_idle();

        self.slots.for_each(|slot| slot.destroy(&self.device.device));
        unsafe {
            // Also frees the slot command buffers
            self.device
                .device
                .destroy_command_pool(self.command_pool, None);
        }
        destroy_resources(&self.device.device, self.deletion.drain_all());
    }
}
