//! Host/device mirrored buffers
//!
//! A [`DeviceBuffer`] owns a host vector and its device-side copy. Loaders
//! write the host side, `upload` publishes it to the device side, and the
//! compute kernels only ever read the device side. Device bytes are reserved
//! from a [`DeviceMemory`] budget for as long as the buffer lives.

use std::fmt;
use std::mem::size_of;
use std::sync::Arc;

use bytemuck::Pod;

use crate::error::{Error, Result};
use crate::memory::DeviceMemory;

/// Typed buffer mirrored between host and device
pub struct DeviceBuffer<T: Pod> {
    /// Host copy, written by loaders and accessors
    host: Vec<T>,

    /// Device copy, read by kernels
    device: Vec<T>,

    /// Bytes reserved from the budget
    reserved: usize,

    /// Budget the reservation is charged to
    memory: Arc<DeviceMemory>,
}

impl<T: Pod> DeviceBuffer<T> {
    /// Create a zeroed buffer of `len` elements
    pub fn new(len: usize, memory: &Arc<DeviceMemory>) -> Result<Self> {
        Self::filled(len, T::zeroed(), memory)
    }

    /// Create a buffer of `len` copies of `value`
    pub fn filled(len: usize, value: T, memory: &Arc<DeviceMemory>) -> Result<Self> {
        // Charge the budget before touching the allocator
        let reserved = byte_len::<T>(len)?;
        memory.allocate(reserved)?;
        Ok(Self {
            host: vec![value; len],
            device: vec![value; len],
            reserved,
            memory: Arc::clone(memory),
        })
    }

    /// Create a buffer from host data, already uploaded
    pub fn from_vec(host: Vec<T>, memory: &Arc<DeviceMemory>) -> Result<Self> {
        let reserved = byte_len::<T>(host.len())?;
        memory.allocate(reserved)?;
        let device = host.clone();
        Ok(Self {
            host,
            device,
            reserved,
            memory: Arc::clone(memory),
        })
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.host.len()
    }

    /// Whether the buffer holds no elements
    pub fn is_empty(&self) -> bool {
        self.host.is_empty()
    }

    /// Host copy
    pub fn host(&self) -> &[T] {
        &self.host
    }

    /// Mutable host copy
    pub fn host_mut(&mut self) -> &mut [T] {
        &mut self.host
    }

    /// Device copy
    pub fn device(&self) -> &[T] {
        &self.device
    }

    /// Mutable device copy, for kernels that produce device-resident data
    pub fn device_mut(&mut self) -> &mut [T] {
        &mut self.device
    }

    /// Copy host to device
    pub fn upload(&mut self) {
        self.device.copy_from_slice(&self.host);
    }

    /// Replace the host contents with `src` without touching the device copy
    pub fn copy_from_host(&mut self, src: &[T]) -> Result<()> {
        if src.len() > self.host.len() {
            return Err(Error::OutOfBounds(format!(
                "{} elements do not fit a buffer of {}",
                src.len(),
                self.host.len()
            )));
        }
        self.host[..src.len()].copy_from_slice(src);
        Ok(())
    }

    /// Resize both copies, charging or refunding the difference
    pub fn resize(&mut self, len: usize) -> Result<()> {
        let bytes = byte_len::<T>(len)?;
        if bytes > self.reserved {
            self.memory.allocate(bytes - self.reserved)?;
        } else if bytes < self.reserved {
            self.memory.release(self.reserved - bytes);
        }
        self.reserved = bytes;
        self.host.resize(len, T::zeroed());
        self.device.resize(len, T::zeroed());
        Ok(())
    }

    /// Host contents as raw bytes
    pub fn host_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.host)
    }

    /// Bytes held on the host
    pub fn host_size(&self) -> usize {
        self.host.len() * size_of::<T>()
    }

    /// Bytes reserved on the device
    pub fn device_size(&self) -> usize {
        self.reserved
    }
}

impl<T: Pod> Drop for DeviceBuffer<T> {
    fn drop(&mut self) {
        if self.reserved > 0 {
            self.memory.release(self.reserved);
        }
    }
}

impl<T: Pod> fmt::Debug for DeviceBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("len", &self.host.len())
            .field("element_size", &size_of::<T>())
            .field("reserved", &self.reserved)
            .finish()
    }
}

fn byte_len<T>(len: usize) -> Result<usize> {
    len.checked_mul(size_of::<T>())
        .ok_or(Error::MemoryAllocationFailed)
}
