use ash::vk;

///A device queue and the family it belongs to.
#[derive(Clone, Debug)]
pub struct Queue {
    pub inner: vk::Queue,
    pub family_index: u32,
    pub properties: vk::QueueFamilyProperties,
}

///Thin device abstraction that takes care of device destruction once its dropped.
///
/// # Safety and self creation
/// The struct is completely public, so it is possible to create a device "on your own". In that case you'll have to make sure
/// that the queues actually exist on the device.
pub struct Device {
    ///The raw ash device
    pub inner: ash::Device,
    pub queues: Vec<Queue>,
}

impl Device {
    ///Takes ownership of `device` and fetches `count` queues for each `(family_index, properties, count)` in `families`.
    ///
    /// # Safety
    /// The queues must have been requested when `device` was created. `device` must not be destroyed elsewhere.
    pub unsafe fn from_raw(
        device: ash::Device,
        families: &[(u32, vk::QueueFamilyProperties, u32)],
    ) -> Self {
        let queues = families
            .iter()
            .flat_map(|(family_index, properties, count)| {
                let device = &device;
                (0..*count).map(move |queue_index| Queue {
                    family_index: *family_index,
                    properties: *properties,
                    inner: unsafe { device.get_device_queue(*family_index, queue_index) },
                })
            })
            .collect();

        Device {
            inner: device,
            queues,
        }
    }

    ///Returns the first queue for the given family, if there is any.
    pub fn first_queue_for_family(&self, family: u32) -> Option<&Queue> {
        self.queues.iter().find(|q| q.family_index == family)
    }

    ///Returns the first queue that supports all `flags`.
    pub fn first_queue_with(&self, flags: vk::QueueFlags) -> Option<&Queue> {
        self.queues
            .iter()
            .find(|q| q.properties.queue_flags.contains(flags))
    }

    ///Family of `queue`, if it belongs to this device.
    pub fn family_of(&self, queue: vk::Queue) -> Option<u32> {
        self.queues
            .iter()
            .find(|q| q.inner == queue)
            .map(|q| q.family_index)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe { self.inner.destroy_device(None) };
    }
}
