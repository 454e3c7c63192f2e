use std::{fmt::Debug, hash::Hash};

use crate::{Backend, task::Commands};

///A primitive a node can wait on, or signal.
pub enum SyncPrimitive<B: Backend> {
    Semaphore(B::Semaphore),
    Event(B::Event),
}

impl<B: Backend> SyncPrimitive<B> {
    pub fn as_semaphore(&self) -> Option<B::Semaphore> {
        if let SyncPrimitive::Semaphore(s) = self {
            Some(*s)
        } else {
            None
        }
    }

    pub fn as_event(&self) -> Option<B::Event> {
        if let SyncPrimitive::Event(e) = self {
            Some(*e)
        } else {
            None
        }
    }
}

impl<B: Backend> Clone for SyncPrimitive<B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<B: Backend> Copy for SyncPrimitive<B> {}

impl<B: Backend> PartialEq for SyncPrimitive<B> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (SyncPrimitive::Semaphore(a), SyncPrimitive::Semaphore(b)) => a == b,
            (SyncPrimitive::Event(a), SyncPrimitive::Event(b)) => a == b,
            _ => false,
        }
    }
}

impl<B: Backend> Eq for SyncPrimitive<B> {}

impl<B: Backend> Hash for SyncPrimitive<B> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            SyncPrimitive::Semaphore(s) => {
                0u8.hash(state);
                s.hash(state)
            }
            SyncPrimitive::Event(e) => {
                1u8.hash(state);
                e.hash(state)
            }
        }
    }
}

impl<B: Backend> Debug for SyncPrimitive<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncPrimitive::Semaphore(s) => write!(f, "Semaphore({:?})", s),
            SyncPrimitive::Event(e) => write!(f, "Event({:?})", e),
        }
    }
}

///Single wait of a submission. `stage` is the pipeline stage at which the primitive's producer signals.
pub struct WaitEntry<B: Backend> {
    pub primitive: SyncPrimitive<B>,
    pub stage: B::Stage,
}

impl<B: Backend> Clone for WaitEntry<B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<B: Backend> Copy for WaitEntry<B> {}

impl<B: Backend> PartialEq for WaitEntry<B> {
    fn eq(&self, other: &Self) -> bool {
        self.primitive == other.primitive && self.stage == other.stage
    }
}

impl<B: Backend> Debug for WaitEntry<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Wait({:?} @ {:?})", self.primitive, self.stage)
    }
}

///Per node submission record. Rebuilt on every bake, only the command buffers change from frame to frame.
///
/// The wait list always has exactly one entry per input edge (in the order the inputs were declared) followed by one
/// entry per extra input. The signal list always starts with the node's own event.
pub struct SubmitDescriptor<B: Backend> {
    pub(crate) commands: Commands<B>,
    pub(crate) waits: Vec<WaitEntry<B>>,
    pub(crate) signals: Vec<SyncPrimitive<B>>,
}

impl<B: Backend> SubmitDescriptor<B> {
    pub(crate) fn new() -> Self {
        SubmitDescriptor {
            commands: Commands::<B>::new(),
            waits: Vec::new(),
            signals: Vec::new(),
        }
    }

    ///Command buffers submitted this frame. Empty if the node produced nothing, or failed.
    pub fn commands(&self) -> &[B::CommandBuffer] {
        &self.commands
    }

    pub fn waits(&self) -> &[WaitEntry<B>] {
        &self.waits
    }

    pub fn signals(&self) -> &[SyncPrimitive<B>] {
        &self.signals
    }

    ///All semaphores (and their wait stage) the submission has to wait for.
    pub fn wait_semaphores(&self) -> impl Iterator<Item = (B::Semaphore, B::Stage)> + '_ {
        self.waits
            .iter()
            .filter_map(|w| w.primitive.as_semaphore().map(|s| (s, w.stage)))
    }

    ///All semaphores that are signaled once the submission has finished.
    pub fn signal_semaphores(&self) -> impl Iterator<Item = B::Semaphore> + '_ {
        self.signals.iter().filter_map(|s| s.as_semaphore())
    }

    ///All events (and their producer's stage) that have to be waited on within the node's command buffers.
    pub fn wait_events(&self) -> impl Iterator<Item = (B::Event, B::Stage)> + '_ {
        self.waits
            .iter()
            .filter_map(|w| w.primitive.as_event().map(|e| (e, w.stage)))
    }
}

impl<B: Backend> Debug for SubmitDescriptor<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmitDescriptor")
            .field("commands", &self.commands)
            .field("waits", &self.waits)
            .field("signals", &self.signals)
            .finish()
    }
}
