// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;

use super::stream::Channel;
use super::stream::Job;
use super::EngineClass;

/// Completion primitive behind a `Fence`, implemented by the channel that
/// created the job.
pub trait FenceOps: Send + Sync {
    /// Blocks until the job completes or `timeout` elapses. The timeout is a
    /// best-effort bound, not a cancellation: the job keeps running either
    /// way.
    fn wait(&self, timeout: Duration) -> io::Result<()>;

    /// Syncpoint threshold signaled by this fence, if the channel exposes
    /// one.
    fn syncpoint(&self) -> Option<(u32, u32)> {
        None
    }
}

/// A reference-counted handle to a submitted job's completion point.
///
/// Cloning shares the underlying primitive; dropping the last clone without
/// waiting is allowed (the async submit contract).
#[derive(Clone)]
pub struct Fence {
    class: EngineClass,
    ops: Arc<dyn FenceOps>,
}

impl Fence {
    pub fn new(class: EngineClass, ops: Arc<dyn FenceOps>) -> Self {
        Fence { class, ops }
    }

    /// Engine class the fenced job ran on.
    pub fn class(&self) -> EngineClass {
        self.class
    }

    /// Blocks on completion. Waiting more than once is idempotent.
    pub fn wait(&self, timeout: Duration) -> io::Result<()> {
        self.ops.wait(timeout)
    }

    pub fn syncpoint(&self) -> Option<(u32, u32)> {
        self.ops.syncpoint()
    }
}

struct Signaled;

impl FenceOps for Signaled {
    fn wait(&self, _timeout: Duration) -> io::Result<()> {
        Ok(())
    }
}

/// A channel that accepts every job and completes it immediately. Stands in
/// for the kernel job queue in tests.
#[derive(Default)]
pub struct DummyChannel {
    submitted: crate::sync::Mutex<Vec<Job>>,
}

impl DummyChannel {
    pub fn new() -> Self {
        Default::default()
    }

    /// Jobs submitted so far, in order.
    pub fn take_submitted(&self) -> Vec<Job> {
        std::mem::take(&mut self.submitted.lock())
    }

    pub fn submitted_count(&self) -> usize {
        self.submitted.lock().len()
    }
}

impl Channel for DummyChannel {
    fn submit(&self, job: Job) -> Result<Fence> {
        let class = job.class;
        self.submitted.lock().push(job);
        Ok(Fence::new(class, Arc::new(Signaled)))
    }
}
