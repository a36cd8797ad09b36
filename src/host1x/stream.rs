// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The command stream builder.
//!
//! A stream accumulates 32-bit opcode words and buffer relocations for one
//! hardware job, then hands the job to a `Channel` either synchronously
//! (`flush`) or asynchronously (`submit`). Only one job may be under
//! construction per stream at a time, enforced by the status state machine:
//!
//! `FREE -> CONSTRUCT -> READY -> FREE`, with `CONSTRUCTION_FAILED` as a sink
//! state entered when a push fails mid-construction.

use std::sync::Arc;
use std::time::Duration;

use log::error;

use crate::error::Result;
use crate::error::VdpError;
use crate::mem::BoRef;

use super::opcodes;
use super::EngineClass;
use super::Fence;

/// Initial job buffer size in words.
const INITIAL_WORDS: usize = 1024;
/// Growth increment when a bounded push does not fit.
const GROW_WORDS: usize = 1024;

/// How long `flush` waits for job completion before giving up. Best-effort
/// bound; the job is not cancelled on expiry.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StreamStatus {
    Free,
    Construct,
    Ready,
    ConstructionFailed,
}

/// A buffer-address patch applied at submission time. Recording a relocation
/// also marks the buffer as write-accessed by the job for synchronization
/// purposes.
pub struct Reloc {
    pub bo: BoRef,
    pub offset: u32,
    /// Index of the placeholder word in `Job::words`.
    pub target_word: usize,
}

/// One unit of submittable work.
pub struct Job {
    pub words: Vec<u32>,
    pub relocs: Vec<Reloc>,
    pub class: EngineClass,
}

/// Accepts finished jobs for execution.
pub trait Channel: Send + Sync {
    /// Queues `job` on the hardware and returns a fence for its completion.
    fn submit(&self, job: Job) -> Result<Fence>;

    /// Syncpoint this channel increments on OP_DONE.
    fn syncpt_id(&self) -> u32 {
        0
    }
}

pub struct Stream {
    channel: Arc<dyn Channel>,
    status: StreamStatus,
    words: Vec<u32>,
    capacity: usize,
    relocs: Vec<Reloc>,
    active_class: Option<EngineClass>,
    op_done_synced: bool,
}

impl Stream {
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Stream {
            channel,
            status: StreamStatus::Free,
            words: Vec::new(),
            capacity: 0,
            relocs: Vec::new(),
            active_class: None,
            op_done_synced: false,
        }
    }

    pub fn status(&self) -> StreamStatus {
        self.status
    }

    /// Starts constructing a new job. Legal only from `Free`.
    pub fn begin(&mut self) -> Result<()> {
        if self.status != StreamStatus::Free {
            return Err(VdpError::StreamState);
        }
        self.words = Vec::with_capacity(INITIAL_WORDS);
        self.capacity = INITIAL_WORDS;
        self.relocs = Vec::new();
        self.active_class = None;
        self.op_done_synced = false;
        self.status = StreamStatus::Construct;
        Ok(())
    }

    /// Grows the job buffer so that `extra` more words fit, by the larger of
    /// `extra` and a fixed chunk. Already-pushed content is preserved.
    pub fn ensure_space(&mut self, extra: usize) -> Result<()> {
        if self.status != StreamStatus::Construct {
            return Err(VdpError::StreamState);
        }
        let needed = self.words.len() + extra;
        if needed > self.capacity {
            let grow = extra.max(GROW_WORDS);
            self.words.reserve(grow);
            self.capacity += grow;
        }
        Ok(())
    }

    pub fn push_word(&mut self, word: u32) -> Result<()> {
        if self.status != StreamStatus::Construct {
            return Err(VdpError::StreamState);
        }
        if self.words.len() + 1 > self.capacity {
            if let Err(e) = self.ensure_space(1) {
                self.status = StreamStatus::ConstructionFailed;
                return Err(e);
            }
        }
        self.words.push(word);
        Ok(())
    }

    /// Pushes a placeholder word patched with `bo`'s hardware address plus
    /// `offset` at submission time.
    pub fn push_reloc(&mut self, bo: BoRef, offset: u32) -> Result<()> {
        if self.status != StreamStatus::Construct {
            return Err(VdpError::StreamState);
        }
        let target_word = self.words.len();
        self.push_word(0xdead_beef)?;
        self.relocs.push(Reloc {
            bo,
            offset,
            target_word,
        });
        Ok(())
    }

    /// Emits a class-switch opcode, coalescing consecutive requests for the
    /// class that is already active.
    pub fn push_setclass(&mut self, class: EngineClass) -> Result<()> {
        if self.active_class == Some(class) {
            return Ok(());
        }
        self.push_word(opcodes::setclass(class, 0, 0))?;
        self.active_class = Some(class);
        Ok(())
    }

    /// Explicitly requests an OP_DONE syncpoint increment at this point of
    /// the job. `end` will then not append its own.
    pub fn push_op_done_sync(&mut self) -> Result<()> {
        let syncpt = self.channel.syncpt_id();
        self.push_setclass(EngineClass::Host1x)?;
        self.push_word(opcodes::nonincr(opcodes::HOST1X_INCR_SYNCPT, 1))?;
        self.push_word(opcodes::syncpt_incr_op_done(syncpt))?;
        self.op_done_synced = true;
        Ok(())
    }

    /// Finishes construction. Appends an operation-done synchronization
    /// marker unless one was emitted explicitly during construction.
    pub fn end(&mut self) -> Result<()> {
        if self.status != StreamStatus::Construct {
            return Err(VdpError::StreamState);
        }
        if !self.op_done_synced {
            if let Err(e) = self.push_op_done_sync() {
                self.status = StreamStatus::ConstructionFailed;
                return Err(e);
            }
        }
        self.status = StreamStatus::Ready;
        Ok(())
    }

    fn take_job(&mut self) -> Job {
        Job {
            words: std::mem::take(&mut self.words),
            relocs: std::mem::take(&mut self.relocs),
            class: self.active_class.unwrap_or(EngineClass::Host1x),
        }
    }

    fn cleanup(&mut self) {
        self.words = Vec::new();
        self.capacity = 0;
        self.relocs = Vec::new();
        self.active_class = None;
        self.op_done_synced = false;
        self.status = StreamStatus::Free;
    }

    /// Discards any accumulated job without submitting it and returns the
    /// stream to `Free`. Aborting a free stream is a no-op.
    pub fn abort(&mut self) {
        self.cleanup();
    }

    /// Submits the accumulated job and waits for completion, then resets to
    /// `Free`. Flushing an already-free stream is a no-op success.
    pub fn flush(&mut self) -> Result<()> {
        match self.status {
            StreamStatus::Free => return Ok(()),
            StreamStatus::Ready => {}
            _ => {
                self.cleanup();
                return Err(VdpError::StreamState);
            }
        }
        let job = self.take_job();
        let result = self.channel.submit(job);
        self.cleanup();
        let fence = result.inspect_err(|e| error!("job submission failed: {}", e))?;
        fence.wait(FLUSH_TIMEOUT)?;
        Ok(())
    }

    /// Asynchronous submission: hands the job to the hardware queue and
    /// returns its fence without waiting. The caller eventually waits on or
    /// drops the fence.
    pub fn submit(&mut self) -> Result<Fence> {
        if self.status != StreamStatus::Ready {
            self.cleanup();
            return Err(VdpError::StreamState);
        }
        let job = self.take_job();
        let result = self.channel.submit(job);
        self.cleanup();
        result.inspect_err(|e| error!("job submission failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host1x::DummyChannel;
    use crate::mem::fake::FakeAllocator;
    use crate::mem::BufferAllocator;

    fn stream() -> (Arc<DummyChannel>, Stream) {
        let channel = Arc::new(DummyChannel::new());
        let stream = Stream::new(channel.clone());
        (channel, stream)
    }

    #[test]
    fn push_without_begin_fails() {
        let (_, mut s) = stream();
        assert!(matches!(s.push_word(0), Err(VdpError::StreamState)));
        assert_eq!(s.status(), StreamStatus::Free);
    }

    #[test]
    fn double_end_fails() {
        let (_, mut s) = stream();
        s.begin().unwrap();
        s.end().unwrap();
        assert!(matches!(s.end(), Err(VdpError::StreamState)));
    }

    #[test]
    fn begin_twice_fails() {
        let (_, mut s) = stream();
        s.begin().unwrap();
        assert!(matches!(s.begin(), Err(VdpError::StreamState)));
    }

    #[test]
    fn setclass_is_coalesced() {
        let (channel, mut s) = stream();
        s.begin().unwrap();
        s.push_setclass(EngineClass::Gr2d).unwrap();
        s.push_setclass(EngineClass::Gr2d).unwrap();
        s.push_setclass(EngineClass::Gr2dSb).unwrap();
        s.end().unwrap();
        s.flush().unwrap();
        let jobs = channel.take_submitted();
        let gr2d = opcodes::setclass(EngineClass::Gr2d, 0, 0);
        let gr2d_sb = opcodes::setclass(EngineClass::Gr2dSb, 0, 0);
        let count = |word| jobs[0].words.iter().filter(|&&w| w == word).count();
        // The repeated Gr2d request is coalesced away.
        assert_eq!(count(gr2d), 1);
        assert_eq!(count(gr2d_sb), 1);
    }

    #[test]
    fn end_appends_sync_marker_once() {
        let (channel, mut s) = stream();
        s.begin().unwrap();
        s.push_op_done_sync().unwrap();
        s.end().unwrap();
        s.flush().unwrap();
        let jobs = channel.take_submitted();
        let sync_words = jobs[0]
            .words
            .iter()
            .filter(|&&w| w == opcodes::syncpt_incr_op_done(0))
            .count();
        assert_eq!(sync_words, 1);
    }

    #[test]
    fn abort_discards_without_submission() {
        let (channel, mut s) = stream();
        s.begin().unwrap();
        s.push_word(7).unwrap();
        s.abort();
        assert_eq!(s.status(), StreamStatus::Free);
        assert_eq!(channel.submitted_count(), 0);
        // The stream is immediately reusable.
        s.begin().unwrap();
        s.end().unwrap();
        s.flush().unwrap();
        assert_eq!(channel.submitted_count(), 1);
    }

    #[test]
    fn flush_when_free_is_noop() {
        let (channel, mut s) = stream();
        s.flush().unwrap();
        assert_eq!(channel.submitted_count(), 0);
    }

    #[test]
    fn reloc_records_placeholder_position() {
        let (channel, mut s) = stream();
        let bo = FakeAllocator::new().alloc(64).unwrap();
        s.begin().unwrap();
        s.push_word(1).unwrap();
        s.push_reloc(bo, 16).unwrap();
        s.end().unwrap();
        s.flush().unwrap();
        let jobs = channel.take_submitted();
        assert_eq!(jobs[0].relocs.len(), 1);
        assert_eq!(jobs[0].relocs[0].target_word, 1);
        assert_eq!(jobs[0].relocs[0].offset, 16);
        assert_eq!(jobs[0].words[1], 0xdead_beef);
    }

    #[test]
    fn growth_preserves_content() {
        let (channel, mut s) = stream();
        s.begin().unwrap();
        for i in 0..4096u32 {
            s.push_word(i).unwrap();
        }
        s.end().unwrap();
        s.flush().unwrap();
        let jobs = channel.take_submitted();
        assert_eq!(jobs[0].words[4095], 4095);
    }
}
