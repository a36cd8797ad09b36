// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Errors surfaced by the driver's public entry points.

use thiserror::Error;

/// An error returned from a driver entry point.
///
/// Bitstream-integrity anomalies are deliberately absent from this list: the
/// driver favors best-effort playback and only logs them (see the decoder and
/// reference-list modules). The one non-recoverable condition, a guard-region
/// mismatch after a hardware operation, aborts the process instead of
/// returning.
#[derive(Debug, Error)]
pub enum VdpError {
    /// A versioned input structure carried a version we do not understand.
    #[error("unsupported struct version {0}")]
    BadStructVersion(u32),
    /// A handle does not name a live object of the expected kind.
    #[error("invalid handle")]
    InvalidHandle,
    /// A parameter failed validation before any hardware interaction.
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    /// A rectangle does not lie within its pixel buffer.
    #[error("rectangle out of pixel buffer bounds")]
    InvalidRect,
    /// Surface dimensions or formats do not match the operation.
    #[error("invalid size")]
    InvalidSize,
    /// The kernel rejected a hardware request.
    #[error("hardware request failed: {0}")]
    Io(#[from] std::io::Error),
    /// Allocation, handle-table, or fence-creation failure.
    #[error("out of resources")]
    Resources,
    /// A command stream operation was attempted in the wrong state.
    #[error("command stream is not in a valid state for this operation")]
    StreamState,
    /// The bitstream requests a codec feature this hardware cannot decode.
    #[error("unsupported codec feature: {0}")]
    Unsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, VdpError>;
