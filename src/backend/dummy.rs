// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A decode backend that records what it was asked to do. Used by tests.

use crate::error::Result;
use crate::error::VdpError;
use crate::h264::reflist::DpbFrame;
use crate::sync::Mutex;

use super::DecodeBackend;
use super::DecodeParams;

/// One recorded `decode` call.
pub struct RecordedDecode {
    pub params: DecodeParams,
    pub dpb_len: usize,
    pub frame_nums: Vec<i32>,
    pub pocs: Vec<i32>,
}

#[derive(Default)]
pub struct DummyBackend {
    decodes: Mutex<Vec<RecordedDecode>>,
    fail_all: bool,
}

impl DummyBackend {
    pub fn new() -> Self {
        Default::default()
    }

    /// A backend whose every decode fails with an I/O error.
    pub fn failing() -> Self {
        DummyBackend {
            fail_all: true,
            ..Default::default()
        }
    }

    pub fn take_decodes(&self) -> Vec<RecordedDecode> {
        std::mem::take(&mut self.decodes.lock())
    }

    pub fn decode_count(&self) -> usize {
        self.decodes.lock().len()
    }
}

impl DecodeBackend for DummyBackend {
    fn decode(&self, params: &DecodeParams, dpb: &[DpbFrame]) -> Result<()> {
        if self.fail_all {
            return Err(VdpError::Io(std::io::Error::from_raw_os_error(libc::EIO)));
        }
        self.decodes.lock().push(RecordedDecode {
            params: params.clone(),
            dpb_len: dpb.len(),
            frame_nums: dpb.iter().map(|f| f.frame_num).collect(),
            pocs: dpb.iter().map(|f| f.poc).collect(),
        });
        Ok(())
    }
}
