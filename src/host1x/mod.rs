// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Command stream construction and submission for the host1x job queue.

mod fence;
pub mod opcodes;
mod stream;

pub use fence::DummyChannel;
pub use fence::Fence;
pub use fence::FenceOps;
pub use stream::Channel;
pub use stream::Job;
pub use stream::Reloc;
pub use stream::Stream;
pub use stream::StreamStatus;

/// Fixed-function engine classes addressable from a command stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum EngineClass {
    /// Host synchronization class.
    Host1x = 0x01,
    /// 2D blit/compositing engine.
    Gr2d = 0x51,
    /// 2D engine scaling variant.
    Gr2dSb = 0x52,
}
