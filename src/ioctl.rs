// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Thin helpers for composing ioctl request numbers and issuing ioctls.

#![allow(clippy::missing_safety_doc)]

use std::io;
use std::os::unix::io::RawFd;

pub type IoctlNr = libc::c_ulong;

const _IOC_NRBITS: IoctlNr = 8;
const _IOC_TYPEBITS: IoctlNr = 8;
const _IOC_SIZEBITS: IoctlNr = 14;

const _IOC_NRSHIFT: IoctlNr = 0;
const _IOC_TYPESHIFT: IoctlNr = _IOC_NRSHIFT + _IOC_NRBITS;
const _IOC_SIZESHIFT: IoctlNr = _IOC_TYPESHIFT + _IOC_TYPEBITS;
const _IOC_DIRSHIFT: IoctlNr = _IOC_SIZESHIFT + _IOC_SIZEBITS;

const _IOC_NONE: IoctlNr = 0;
const _IOC_WRITE: IoctlNr = 1;
const _IOC_READ: IoctlNr = 2;

const fn ioc(dir: IoctlNr, ty: u32, nr: u32, size: usize) -> IoctlNr {
    (dir << _IOC_DIRSHIFT)
        | ((ty as IoctlNr) << _IOC_TYPESHIFT)
        | ((nr as IoctlNr) << _IOC_NRSHIFT)
        | ((size as IoctlNr) << _IOC_SIZESHIFT)
}

/// `_IO(ty, nr)`
pub const fn io(ty: u32, nr: u32) -> IoctlNr {
    ioc(_IOC_NONE, ty, nr, 0)
}

/// `_IOW(ty, nr, T)`
pub const fn iow<T>(ty: u32, nr: u32) -> IoctlNr {
    ioc(_IOC_WRITE, ty, nr, std::mem::size_of::<T>())
}

/// `_IOR(ty, nr, T)`
pub const fn ior<T>(ty: u32, nr: u32) -> IoctlNr {
    ioc(_IOC_READ, ty, nr, std::mem::size_of::<T>())
}

/// `_IOWR(ty, nr, T)`
pub const fn iowr<T>(ty: u32, nr: u32) -> IoctlNr {
    ioc(_IOC_READ | _IOC_WRITE, ty, nr, std::mem::size_of::<T>())
}

/// Issues an ioctl carrying a read-only pointer to `arg`.
///
/// # Safety
/// `nr` must describe a request whose kernel handler reads at most
/// `size_of::<T>()` bytes from the argument.
pub unsafe fn ioctl_with_ref<T>(fd: RawFd, nr: IoctlNr, arg: &T) -> io::Result<()> {
    let ret = libc::ioctl(fd, nr as _, arg as *const T);
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Issues an ioctl carrying a mutable pointer to `arg`.
///
/// # Safety
/// `nr` must describe a request whose kernel handler accesses at most
/// `size_of::<T>()` bytes through the argument.
pub unsafe fn ioctl_with_mut_ref<T>(fd: RawFd, nr: IoctlNr, arg: &mut T) -> io::Result<()> {
    let ret = libc::ioctl(fd, nr as _, arg as *mut T);
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}
