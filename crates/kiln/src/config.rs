use std::time::Duration;

///Runtime configuration of a [Graph](crate::Graph).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphConfig {
    ///Maximum time a frame waits for the previous frame's fence of a queue. If it elapses the frame fails with
    /// [DeviceStalled](crate::GraphError::DeviceStalled).
    pub fence_timeout: Duration,
    ///Number of threads command generation is fanned out to. `None` uses the available hardware concurrency.
    pub worker_threads: Option<usize>,
    ///Below this number of nodes command generation happens on the calling thread.
    pub parallel_threshold: usize,
    ///If true, a topology change that was not baked yet is baked at the start of the next frame. Otherwise the frame
    /// fails with [StaleBake](crate::GraphError::StaleBake).
    pub auto_rebake: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        GraphConfig {
            fence_timeout: Duration::from_secs(5),
            worker_threads: None,
            parallel_threshold: 4,
            auto_rebake: true,
        }
    }
}

impl GraphConfig {
    pub fn with_fence_timeout(mut self, timeout: Duration) -> Self {
        self.fence_timeout = timeout;
        self
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = Some(threads.max(1));
        self
    }

    pub fn with_parallel_threshold(mut self, threshold: usize) -> Self {
        self.parallel_threshold = threshold;
        self
    }

    pub fn with_auto_rebake(mut self, auto_rebake: bool) -> Self {
        self.auto_rebake = auto_rebake;
        self
    }

    ///Allows changing `self` builder style
    pub fn with(mut self, mut mapping: impl FnMut(&mut GraphConfig)) -> Self {
        mapping(&mut self);
        self
    }

    ///Number of worker threads that are actually used.
    pub fn effective_workers(&self) -> usize {
        self.worker_threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}
