// Synchronization primitives
//
// Frame parity, double-buffered containers, and the per-frame sync
// objects (fences, semaphores) for GPU-CPU and GPU-GPU sync.
// Critical for correct and efficient multi-frame rendering.

use anyhow::Result;
use ash::vk;

use super::VulkanDevice;

/// The CPU may record at most this many frames ahead of the GPU.
/// Triple buffering of per-frame resources is not supported.
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

/// Monotonic frame counter with a derived 0/1 buffer index.
///
/// The copy at `write_index()` is mutable by the producer this frame;
/// the copy at `read_index()` belongs to the out-of-phase consumer
/// (the GPU, or a background thread) until the matching completion
/// signal has fired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameParity {
    counter: u64,
}

impl FrameParity {
    pub fn new() -> Self {
        Self { counter: 0 }
    }

    /// Total number of frames advanced since creation.
    pub fn frame_number(&self) -> u64 {
        self.counter
    }

    /// Index of the copy being written this frame.
    pub fn write_index(&self) -> usize {
        (self.counter % 2) as usize
    }

    /// Index of the copy the consumer may still be reading.
    pub fn read_index(&self) -> usize {
        ((self.counter + 1) % 2) as usize
    }

    /// Flips the write/read roles and moves to the next frame.
    pub fn advance(&mut self) {
        self.counter = self.counter.wrapping_add(1);
    }
}

/// Exactly two instances of a resource whose write/read roles flip on
/// every `advance`.
///
/// `write_mut()` is idempotent between two `advance()` calls. Nothing
/// here blocks or validates: keeping the consumer off the write copy is
/// the synchronization contract of the layer above (fence waits for the
/// GPU, the explicit drain point for the hot-reload thread).
#[derive(Debug, Default)]
pub struct DoubleBuffered<T> {
    copies: [T; 2],
    parity: FrameParity,
}

impl<T> DoubleBuffered<T> {
    pub fn new(first: T, second: T) -> Self {
        Self {
            copies: [first, second],
            parity: FrameParity::new(),
        }
    }

    pub fn parity(&self) -> FrameParity {
        self.parity
    }

    /// The copy the producer writes this frame.
    pub fn write(&self) -> &T {
        &self.copies[self.parity.write_index()]
    }

    pub fn write_mut(&mut self) -> &mut T {
        &mut self.copies[self.parity.write_index()]
    }

    /// The copy handed to the out-of-phase consumer.
    pub fn read(&self) -> &T {
        &self.copies[self.parity.read_index()]
    }

    pub fn read_mut(&mut self) -> &mut T {
        &mut self.copies[self.parity.read_index()]
    }

    pub fn advance(&mut self) {
        self.parity.advance();
    }

    pub fn for_each(&self, mut func: impl FnMut(&T)) {
        for copy in &self.copies {
            func(copy);
        }
    }
}

/// Sync objects and command buffer for one frame in flight.
pub struct FrameSlot {
    pub command_buffer: vk::CommandBuffer,
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight: vk::Fence,
}

impl FrameSlot {
    pub fn new(device: &VulkanDevice, command_buffer: vk::CommandBuffer) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        // Fence starts signaled so the first wait on this slot returns
        // immediately.
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        unsafe {
            Ok(Self {
                command_buffer,
                image_available: device.device.create_semaphore(&semaphore_info, None)?,
                render_finished: device.device.create_semaphore(&semaphore_info, None)?,
                in_flight: device.device.create_fence(&fence_info, None)?,
            })
        }
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            device.destroy_semaphore(self.render_finished, None);
            device.destroy_fence(self.in_flight, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parity_starts_at_zero() {
        let parity = FrameParity::new();
        assert_eq!(parity.frame_number(), 0);
        assert_eq!(parity.write_index(), 0);
        assert_eq!(parity.read_index(), 1);
    }

    #[test]
    fn parity_flips_on_advance() {
        let mut parity = FrameParity::new();
        parity.advance();
        assert_eq!(parity.write_index(), 1);
        assert_eq!(parity.read_index(), 0);
        parity.advance();
        assert_eq!(parity.write_index(), 0);
        assert_eq!(parity.read_index(), 1);
    }

    #[test]
    fn parity_indices_stay_in_bounds() {
        let mut parity = FrameParity::new();
        for _ in 0..1000 {
            assert!(parity.write_index() < 2);
            assert!(parity.read_index() < 2);
            assert_ne!(parity.write_index(), parity.read_index());
            parity.advance();
        }
        assert_eq!(parity.frame_number(), 1000);
    }

    #[test]
    fn write_is_idempotent_between_advances() {
        let mut buffered = DoubleBuffered::new(0u32, 0u32);
        *buffered.write_mut() = 7;
        assert_eq!(*buffered.write(), 7);
        *buffered.write_mut() = 9;
        assert_eq!(*buffered.write(), 9);
        // The read copy was never touched.
        assert_eq!(*buffered.read(), 0);
    }

    #[test]
    fn read_returns_previous_write() {
        let mut buffered = DoubleBuffered::new(0u32, 0u32);
        *buffered.write_mut() = 1;
        buffered.advance();
        assert_eq!(*buffered.read(), 1);
        *buffered.write_mut() = 2;
        buffered.advance();
        assert_eq!(*buffered.read(), 2);
        assert_eq!(*buffered.write(), 1);
    }

    #[test]
    fn for_each_visits_both_copies() {
        let buffered = DoubleBuffered::new(3u32, 4u32);
        let mut sum = 0;
        buffered.for_each(|value| sum += value);
        assert_eq!(sum, 7);
    }
}
