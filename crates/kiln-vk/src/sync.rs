//! Owned wrappers around vulkan's binary semaphores and events.
//!
//! Primitives that are part of a graph are owned by the graph itself. The wrappers here are for primitives that are
//! wired into a graph from the outside via [add_extra_input](kiln::Graph::add_extra_input) and
//! [add_extra_output](kiln::Graph::add_extra_output), for instance the acquire and present semaphores of a swapchain.
//!
//! # Safety
//!
//! A wrapper destroys its primitive when dropped. It must outlive all graphs it is wired into, or be removed from them
//! (and the graph re-baked) before.

use std::{fmt::Debug, sync::Arc};

use ash::vk;
use kiln::SyncPrimitive;

use crate::{Device, VkBackend};

///Binary semaphore.
pub struct Semaphore {
    pub inner: vk::Semaphore,
    pub device: Arc<Device>,
}

impl Semaphore {
    pub fn new(device: &Arc<Device>) -> Result<Arc<Self>, vk::Result> {
        let ci = vk::SemaphoreCreateInfo::default();
        let semaphore = unsafe { device.inner.create_semaphore(&ci, None)? };

        Ok(Arc::new(Semaphore {
            inner: semaphore,
            device: device.clone(),
        }))
    }

    pub fn primitive(&self) -> SyncPrimitive<VkBackend> {
        SyncPrimitive::Semaphore(self.inner)
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe { self.device.inner.destroy_semaphore(self.inner, None) }
    }
}

impl Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}

///Event that can be set from the host, for instance to release work of a node that waits for an upload.
pub struct Event {
    pub inner: vk::Event,
    pub device: Arc<Device>,
}

impl Event {
    pub fn new(device: &Arc<Device>) -> Result<Arc<Self>, vk::Result> {
        let ci = vk::EventCreateInfo::default();
        let event = unsafe { device.inner.create_event(&ci, None)? };

        Ok(Arc::new(Event {
            inner: event,
            device: device.clone(),
        }))
    }

    pub fn primitive(&self) -> SyncPrimitive<VkBackend> {
        SyncPrimitive::Event(self.inner)
    }

    ///Sets the event into the "signaled" status.
    pub fn set(&self) -> Result<(), vk::Result> {
        unsafe { self.device.inner.set_event(self.inner) }
    }

    pub fn reset(&self) -> Result<(), vk::Result> {
        unsafe { self.device.inner.reset_event(self.inner) }
    }

    pub fn status(&self) -> Result<bool, vk::Result> {
        unsafe { self.device.inner.get_event_status(self.inner) }
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        unsafe { self.device.inner.destroy_event(self.inner, None) }
    }
}

impl Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}
