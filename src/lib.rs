// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! User-space H.264 decode and 2D composition driver core for Tegra-class
//! SoCs.
//!
//! The crate is organized around a [`device::Device`], which hands out
//! integer handles for surfaces, decoders, mixers, and presentation queues.
//! Decoding marshals per-picture state (reference lists, SPS/PPS fields)
//! into the kernel decode interface; composition builds host1x command
//! streams for the 2D engine. Kernel access goes through three seams
//! ([`mem::BufferAllocator`], [`host1x::Channel`],
//! [`backend::DecodeBackend`]) so the whole stack also runs against
//! in-process fakes.

pub mod backend;
pub mod cache;
pub mod config;
pub mod device;
pub mod error;
pub mod g2d;
pub mod h264;
pub mod handles;
pub mod host1x;
pub mod ioctl;
pub mod mem;
pub mod mixer;
pub mod pixbuf;
pub mod presentation;
pub mod surface;
pub mod sync;

pub use config::Config;
pub use device::Device;
pub use error::Result;
pub use error::VdpError;
