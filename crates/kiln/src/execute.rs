//! Scatter of command generation over worker threads.

use std::{
    any::Any,
    panic::{AssertUnwindSafe, catch_unwind},
};

use crate::{Backend, Commands, FrameContext, Task};

///Command generation of a single node. The result is written in place, so results stay index aligned with the
/// execution order regardless of which thread ran the job.
pub(crate) struct Job<'a, B: Backend> {
    pub(crate) index: usize,
    pub(crate) name: &'a str,
    pub(crate) task: &'a mut dyn Task<B>,
    pub(crate) context: FrameContext<'a, B>,
    pub(crate) result: Option<Result<Commands<B>, anyhow::Error>>,
}

impl<B: Backend> Job<'_, B> {
    fn run(&mut self) {
        let task = &mut *self.task;
        let context = &self.context;
        let result = match catch_unwind(AssertUnwindSafe(|| task.commands(context))) {
            Ok(result) => result,
            Err(payload) => Err(anyhow::anyhow!(
                "node panicked while generating commands: {}",
                panic_message(payload.as_ref())
            )),
        };
        self.result = Some(result);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        *msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "unknown panic payload"
    }
}

///Runs all `jobs`, split into one chunk per worker. Returns once every job has finished.
pub(crate) fn scatter<B: Backend>(jobs: &mut [Job<'_, B>], workers: usize, threshold: usize) {
    #[cfg(feature = "profiling")]
    puffin::profile_function!();

    if workers <= 1 || jobs.len() < threshold.max(2) {
        for job in jobs.iter_mut() {
            job.run();
        }
        return;
    }

    let chunk_size = jobs.len().div_ceil(workers);
    std::thread::scope(|scope| {
        for chunk in jobs.chunks_mut(chunk_size) {
            scope.spawn(move || {
                for job in chunk.iter_mut() {
                    job.run();
                }
            });
        }
    });
}
