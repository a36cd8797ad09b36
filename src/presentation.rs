// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Presentation queue: timestamp-ordered display of surfaces on a target.
//!
//! A background thread sleeps until the earliest queued timestamp comes due,
//! consumes the surface's pending video transfer, and hands the surface to
//! the display target. Lock ordering is strict: the queue thread may take a
//! surface lock while holding the queue lock, so no caller may block on the
//! queue lock while holding a surface lock (use `try_lock` and back off, as
//! [`PresentationQueue::block_until_idle`] does).

use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use log::error;
use log::trace;

use crate::error::Result;
use crate::error::VdpError;
use crate::surface;
use crate::surface::PresentationStatus;
use crate::surface::Surface;
use crate::sync::Condvar;
use crate::sync::Mutex;

/// Where displayed surfaces end up. The real implementations hand the
/// surface to an overlay plane or an X11 drawable.
pub trait QueueTarget: Send + Sync {
    fn present(&self, surface: &Arc<Surface>) -> Result<()>;
}

struct PendingEntry {
    surface: Arc<Surface>,
    earliest: Instant,
}

struct QueueState {
    pending: Vec<PendingEntry>,
    last_displayed: Option<Arc<Surface>>,
    background: u32,
    shutdown: bool,
}

struct QueueInner {
    state: Mutex<QueueState>,
    cond: Condvar,
    target: Arc<dyn QueueTarget>,
}

pub struct PresentationQueue {
    inner: Arc<QueueInner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl PresentationQueue {
    pub fn new(target: Arc<dyn QueueTarget>) -> PresentationQueue {
        let inner = Arc::new(QueueInner {
            state: Mutex::new(QueueState {
                pending: Vec::new(),
                last_displayed: None,
                background: 0xff00_0000,
                shutdown: false,
            }),
            cond: Condvar::new(),
            target,
        });
        let worker = inner.clone();
        let thread = thread::Builder::new()
            .name("vdp-presentation".to_owned())
            .spawn(move || run(worker))
            .ok();
        PresentationQueue {
            inner,
            thread: Mutex::new(thread),
        }
    }

    /// The clock displayed timestamps are measured against.
    pub fn get_time() -> Instant {
        Instant::now()
    }

    pub fn set_background_color(&self, color: u32) {
        self.inner.state.lock().background = color;
    }

    pub fn background_color(&self) -> u32 {
        self.inner.state.lock().background
    }

    /// Queues `surface` for display no earlier than `earliest`. A surface
    /// may only be queued once at a time.
    pub fn display(&self, surface: Arc<Surface>, earliest: Instant) -> Result<()> {
        {
            let mut surface_state = surface.lock_state();
            if surface_state.status == PresentationStatus::Queued {
                return Err(VdpError::InvalidParameter("surface already queued"));
            }
            surface_state.status = PresentationStatus::Queued;
            surface_state.earliest_presentation = Some(earliest);
        }
        let mut state = self.inner.state.lock();
        if state.shutdown {
            surface.set_status(PresentationStatus::Idle);
            return Err(VdpError::InvalidHandle);
        }
        state.pending.push(PendingEntry { surface, earliest });
        self.inner.cond.notify_all();
        Ok(())
    }

    /// The surface's presentation status and, for a queued surface, its
    /// requested display time.
    pub fn query_status(&self, surface: &Surface) -> (PresentationStatus, Option<Instant>) {
        let state = surface.lock_state();
        (state.status, state.earliest_presentation)
    }

    /// Blocks until `surface` is no longer queued or visible.
    ///
    /// The surface lock is held across the wait, so the queue lock must
    /// never be blocked on here; the queue thread takes surface locks while
    /// holding its own.
    pub fn block_until_idle(&self, surface: &Arc<Surface>) {
        let mut state = surface.lock_state();
        loop {
            if state.status == PresentationStatus::Idle {
                return;
            }
            match self.inner.state.try_lock() {
                Some(queue_state) => {
                    if queue_state.shutdown {
                        return;
                    }
                    drop(queue_state);
                    state = surface.idle_cv().wait(state);
                }
                None => {
                    // The queue thread may be blocked on this very surface
                    // lock; back off fully so it can make progress.
                    drop(state);
                    thread::yield_now();
                    state = surface.lock_state();
                }
            }
        }
    }

    fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            state.shutdown = true;
            self.inner.cond.notify_all();
        }
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                error!("presentation thread panicked");
            }
        }
    }
}

impl Drop for PresentationQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(inner: Arc<QueueInner>) {
    let mut state = inner.state.lock();
    loop {
        if state.shutdown {
            // Force every still-queued surface idle so waiters wake.
            for entry in state.pending.drain(..) {
                entry.surface.set_status(PresentationStatus::Idle);
            }
            if let Some(previous) = state.last_displayed.take() {
                previous.set_status(PresentationStatus::Idle);
            }
            return;
        }

        let now = Instant::now();
        let mut due = Vec::new();
        let mut index = 0;
        while index < state.pending.len() {
            if state.pending[index].earliest <= now {
                due.push(state.pending.remove(index));
            } else {
                index += 1;
            }
        }
        if !due.is_empty() {
            // Surface locks are taken while the queue lock is held; this is
            // the one place that order is allowed.
            for entry in due {
                display_one(&inner, &mut state, entry.surface);
            }
            continue;
        }

        let next = state.pending.iter().map(|e| e.earliest).min();
        state = match next {
            Some(deadline) => {
                let timeout = deadline.saturating_duration_since(now);
                inner.cond.wait_timeout(state, timeout).0
            }
            None => inner.cond.wait(state),
        };
    }
}

fn display_one(
    inner: &QueueInner,
    state: &mut QueueState,
    surface: Arc<Surface>,
) {
    trace!("displaying surface {}", surface.serial());
    if let Err(e) = surface::transfer_shared(&surface) {
        error!("video transfer failed: {}", e);
    }
    if let Err(e) = inner.target.present(&surface) {
        error!("presentation failed: {}", e);
    }
    if let Some(previous) = state.last_displayed.take() {
        if !Arc::ptr_eq(&previous, &surface) {
            previous.set_status(PresentationStatus::Idle);
        }
    }
    {
        let mut surface_state = surface.lock_state();
        surface_state.status = PresentationStatus::Visible;
        surface_state.earliest_presentation = None;
    }
    state.last_displayed = Some(surface);
}
