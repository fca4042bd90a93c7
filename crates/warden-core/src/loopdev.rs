//! Bounded loop-device pool for image-backed container roots.
//!
//! Devices are taken from `/dev/loop-control`, attached to an image file,
//! and must be returned on free-resources; a failed start releases its
//! allocation before the error propagates.

use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use std::path::Path;

use warden_common::error::{Result, WardenError};

const LOOP_CONTROL: &str = "/dev/loop-control";

// From <linux/loop.h>.
const LOOP_SET_FD: libc::c_ulong = 0x4C00;
const LOOP_CLR_FD: libc::c_ulong = 0x4C01;
const LOOP_CTL_GET_FREE: libc::c_ulong = 0x4C82;

/// Upper bound on loop devices the daemon will hold at once.
const POOL_LIMIT: usize = 64;

/// Tracks loop devices handed out to containers.
#[derive(Debug, Default)]
pub struct LoopPool {
    in_use: Vec<i32>,
}

impl LoopPool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of devices currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.in_use.len()
    }

    /// True when no device is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.in_use.is_empty()
    }

    /// Allocates a free loop device and attaches the image at `backing`.
    ///
    /// Returns the loop device number.
    ///
    /// # Errors
    ///
    /// Returns an error when the pool is exhausted, no device is free, or
    /// the attach ioctl fails.
    pub fn acquire(&mut self, backing: &Path) -> Result<i32> {
        if self.in_use.len() >= POOL_LIMIT {
            return Err(WardenError::errno(
                "loop device pool exhausted",
                nix::errno::Errno::EBUSY,
            ));
        }

        let control = OpenOptions::new()
            .read(true)
            .write(true)
            .open(LOOP_CONTROL)
            .map_err(|e| WardenError::io(LOOP_CONTROL, e))?;
        // SAFETY: LOOP_CTL_GET_FREE takes no argument and returns a device
        // number or -1.
        let nr = unsafe { libc::ioctl(control.as_raw_fd(), LOOP_CTL_GET_FREE) };
        if nr < 0 {
            return Err(WardenError::errno(
                "LOOP_CTL_GET_FREE",
                nix::errno::Errno::last(),
            ));
        }

        let device_path = format!("/dev/loop{nr}");
        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&device_path)
            .map_err(|e| WardenError::io(device_path.clone(), e))?;
        let image = OpenOptions::new()
            .read(true)
            .write(true)
            .open(backing)
            .map_err(|e| WardenError::io(backing, e))?;

        // SAFETY: both descriptors are valid for the duration of the call.
        let ret = unsafe {
            libc::ioctl(
                device.as_raw_fd(),
                LOOP_SET_FD,
                libc::c_ulong::try_from(image.as_raw_fd()).unwrap_or_default(),
            )
        };
        if ret < 0 {
            return Err(WardenError::errno(
                format!("LOOP_SET_FD {device_path}"),
                nix::errno::Errno::last(),
            ));
        }

        self.in_use.push(nr);
        tracing::debug!(device = nr, backing = %backing.display(), "loop device attached");
        Ok(nr)
    }

    /// Detaches and returns a device to the pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot be opened or detached.
    pub fn release(&mut self, nr: i32) -> Result<()> {
        self.in_use.retain(|&held| held != nr);
        let device_path = format!("/dev/loop{nr}");
        let device = OpenOptions::new()
            .read(true)
            .open(&device_path)
            .map_err(|e| WardenError::io(device_path.clone(), e))?;
        // SAFETY: the descriptor is valid for the duration of the call.
        let ret = unsafe { libc::ioctl(device.as_raw_fd(), LOOP_CLR_FD) };
        if ret < 0 {
            return Err(WardenError::errno(
                format!("LOOP_CLR_FD {device_path}"),
                nix::errno::Errno::last(),
            ));
        }
        tracing::debug!(device = nr, "loop device released");
        Ok(())
    }

    /// Marks a restored device as held without touching the kernel, used
    /// when a container with a live loop mount is restored after restart.
    pub fn adopt(&mut self, nr: i32) {
        if !self.in_use.contains(&nr) {
            self.in_use.push(nr);
        }
    }
}
