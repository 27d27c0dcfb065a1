// Deferred destruction of Vulkan objects
//
// A handle enqueued here is only destroyed once its group is two frame
// boundaries old, i.e. once every frame that could still reference it
// has been observed complete.

use std::collections::VecDeque;

use ash::vk;

use super::sync::MAX_FRAMES_IN_FLIGHT;

/// A Vulkan handle whose destruction has been deferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredResource {
    Pipeline(vk::Pipeline),
    PipelineLayout(vk::PipelineLayout),
    ShaderModule(vk::ShaderModule),
    ImageView(vk::ImageView),
    Framebuffer(vk::Framebuffer),
    Buffer(vk::Buffer),
    Image(vk::Image),
}

enum Record {
    Boundary,
    Resource(DeferredResource),
}

/// Queue of handles awaiting destruction, grouped by frame.
///
/// The queue is seeded with `MAX_FRAMES_IN_FLIGHT` empty groups so that
/// nothing enqueued in frame N is released before frame N + 2 starts.
/// The queue itself never talks to the device; the caller destroys the
/// handles `next_group` hands back.
pub struct DeletionQueue {
    records: VecDeque<Record>,
}

impl DeletionQueue {
    pub fn new() -> Self {
        let mut records = VecDeque::new();
        for _ in 0..MAX_FRAMES_IN_FLIGHT {
            records.push_back(Record::Boundary);
        }
        Self { records }
    }

    /// Defers destruction of `resource` until the current group expires.
    pub fn enqueue(&mut self, resource: DeferredResource) {
        self.records.push_back(Record::Resource(resource));
    }

    /// Closes the current group and returns the group that is now old
    /// enough to destroy. Called once per frame.
    pub fn next_group(&mut self) -> Vec<DeferredResource> {
        self.records.push_back(Record::Boundary);

        let mut expired = Vec::new();
        while let Some(record) = self.records.pop_front() {
            match record {
                Record::Boundary => break,
                Record::Resource(resource) => expired.push(resource),
            }
        }
        expired
    }

    /// Returns every pending handle regardless of age. Only valid after
    /// a device-idle wait (teardown).
    pub fn drain_all(&mut self) -> Vec<DeferredResource> {
        let mut all = Vec::new();
        while let Some(record) = self.records.pop_front() {
            if let Record::Resource(resource) = record {
                all.push(resource);
            }
        }
        all
    }

    pub fn pending(&self) -> usize {
        self.records
            .iter()
            .filter(|record| matches!(record, Record::Resource(_)))
            .count()
    }
}

impl Default for DeletionQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Destroys a batch of deferred handles. The caller guarantees the GPU
/// is done with them (group age or device-idle wait).
pub fn destroy_resources(device: &ash::Device, resources: Vec<DeferredResource>) {
    for resource in resources {
        unsafe {
            match resource {
                DeferredResource::Pipeline(handle) => device.destroy_pipeline(handle, None),
                DeferredResource::PipelineLayout(handle) => {
                    device.destroy_pipeline_layout(handle, None)
                }
                DeferredResource::ShaderModule(handle) => {
                    device.destroy_shader_module(handle, None)
                }
                DeferredResource::ImageView(handle) => device.destroy_image_view(handle, None),
                DeferredResource::Framebuffer(handle) => device.destroy_framebuffer(handle, None),
                DeferredResource::Buffer(handle) => device.destroy_buffer(handle, None),
                DeferredResource::Image(handle) => device.destroy_image(handle, None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn pipeline(raw: u64) -> DeferredResource {
        DeferredResource::Pipeline(vk::Pipeline::from_raw(raw))
    }

    #[test]
    fn group_released_two_boundaries_later() {
        let mut queue = DeletionQueue::new();
        queue.enqueue(pipeline(1));

        // The two seeded groups expire first.
        assert!(queue.next_group().is_empty());
        assert!(queue.next_group().is_empty());
        assert_eq!(queue.next_group(), vec![pipeline(1)]);
    }

    #[test]
    fn groups_stay_separate() {
        let mut queue = DeletionQueue::new();
        queue.enqueue(pipeline(1));
        assert!(queue.next_group().is_empty());

        queue.enqueue(pipeline(2));
        assert!(queue.next_group().is_empty());

        assert_eq!(queue.next_group(), vec![pipeline(1)]);
        assert_eq!(queue.next_group(), vec![pipeline(2)]);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn drain_all_ignores_group_age() {
        let mut queue = DeletionQueue::new();
        queue.enqueue(pipeline(1));
        queue.next_group();
        queue.enqueue(pipeline(2));

        let all = queue.drain_all();
        assert_eq!(all, vec![pipeline(1), pipeline(2)]);
        assert_eq!(queue.pending(), 0);
    }
}
