use std::cell::RefCell;
use std::error::Error;
use std::fmt;
use std::rc::Rc;

use crate::number::LeBytes;

/// Errors from simulated device memory operations.
#[derive(Clone, Debug, PartialEq)]
pub enum DeviceError {
    /// An allocation would exceed the device's memory capacity.
    OutOfMemory { requested: usize, available: usize },

    /// A host/device copy does not match the buffer's size.
    CopySizeMismatch { buffer: usize, host: usize },
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::OutOfMemory {
                requested,
                available,
            } => write!(
                f,
                "allocation of {} bytes exceeds available device memory ({} bytes)",
                requested, available
            ),
            DeviceError::CopySizeMismatch { buffer, host } => write!(
                f,
                "copy size mismatch: buffer is {} bytes, host data is {} bytes",
                buffer, host
            ),
        }
    }
}

impl Error for DeviceError {}

struct DeviceState {
    capacity: Option<usize>,
    bytes_in_use: usize,
    alloc_count: usize,
}

/// A simulated accelerator address space.
///
/// This stands in for the GPU side of a real inference runtime: buffers live
/// in a separate allocation domain with explicit host/device copies, byte
/// accounting and an optional capacity limit. Dropping a [`DeviceBuffer`]
/// always returns its bytes to the device, on every exit path.
#[derive(Clone)]
pub struct Device {
    state: Rc<RefCell<DeviceState>>,
}

impl Device {
    /// Create a device with unlimited memory.
    pub fn new() -> Device {
        Device {
            state: Rc::new(RefCell::new(DeviceState {
                capacity: None,
                bytes_in_use: 0,
                alloc_count: 0,
            })),
        }
    }

    /// Create a device which can hold at most `capacity` bytes at a time.
    pub fn with_capacity(capacity: usize) -> Device {
        let device = Device::new();
        device.state.borrow_mut().capacity = Some(capacity);
        device
    }

    /// Allocate an uninitialized buffer of `len` bytes.
    pub fn alloc(&self, len: usize) -> Result<DeviceBuffer, DeviceError> {
        let mut state = self.state.borrow_mut();
        if let Some(capacity) = state.capacity {
            let available = capacity - state.bytes_in_use;
            if len > available {
                return Err(DeviceError::OutOfMemory {
                    requested: len,
                    available,
                });
            }
        }
        state.bytes_in_use += len;
        state.alloc_count += 1;
        Ok(DeviceBuffer {
            data: vec![0; len],
            state: self.state.clone(),
        })
    }

    /// Return the number of bytes currently allocated.
    pub fn bytes_in_use(&self) -> usize {
        self.state.borrow().bytes_in_use
    }

    /// Return the total number of allocations made on this device.
    pub fn alloc_count(&self) -> usize {
        self.state.borrow().alloc_count
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::new()
    }
}

/// A buffer allocated from a [`Device`].
pub struct DeviceBuffer {
    data: Vec<u8>,
    state: Rc<RefCell<DeviceState>>,
}

impl DeviceBuffer {
    /// Size of the buffer in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Copy `values` from host memory into this buffer.
    ///
    /// The buffer must have exactly the byte size of `values`.
    pub fn copy_from_host<T: LeBytes + Copy>(&mut self, values: &[T]) -> Result<(), DeviceError> {
        let host_len = std::mem::size_of::<T>() * values.len();
        if host_len != self.data.len() {
            return Err(DeviceError::CopySizeMismatch {
                buffer: self.data.len(),
                host: host_len,
            });
        }
        let mut offset = 0;
        for value in values {
            let bytes = value.to_le_bytes();
            let bytes = bytes.as_ref();
            self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
            offset += bytes.len();
        }
        Ok(())
    }

    /// Copy this buffer's contents back to host memory.
    ///
    /// The buffer must have exactly the byte size of `values`.
    pub fn copy_to_host<T: LeBytes + Copy>(&self, values: &mut [T]) -> Result<(), DeviceError> {
        let host_len = std::mem::size_of::<T>() * values.len();
        if host_len != self.data.len() {
            return Err(DeviceError::CopySizeMismatch {
                buffer: self.data.len(),
                host: host_len,
            });
        }
        let elem_size = std::mem::size_of::<T>();
        for (index, value) in values.iter_mut().enumerate() {
            let chunk = &self.data[index * elem_size..(index + 1) * elem_size];
            *value = T::from_le_bytes(chunk.try_into().expect("chunk size matches element size"));
        }
        Ok(())
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        self.state.borrow_mut().bytes_in_use -= self.data.len();
    }
}

#[cfg(test)]
mod tests {
    use super::{Device, DeviceError};

    #[test]
    fn test_alloc_accounting() {
        let device = Device::new();
        assert_eq!(device.bytes_in_use(), 0);

        let a = device.alloc(16).unwrap();
        let b = device.alloc(8).unwrap();
        assert_eq!(device.bytes_in_use(), 24);
        assert_eq!(device.alloc_count(), 2);

        drop(a);
        assert_eq!(device.bytes_in_use(), 8);
        drop(b);
        assert_eq!(device.bytes_in_use(), 0);

        // The allocation count is cumulative.
        assert_eq!(device.alloc_count(), 2);
    }

    #[test]
    fn test_alloc_capacity_exceeded() {
        let device = Device::with_capacity(16);
        let _a = device.alloc(12).unwrap();
        let result = device.alloc(8);
        assert_eq!(
            result.err(),
            Some(DeviceError::OutOfMemory {
                requested: 8,
                available: 4
            })
        );
    }

    #[test]
    fn test_copy_round_trip() {
        let device = Device::new();
        let values = [1.0f32, -2.5, 3.25];

        let mut buffer = device.alloc(std::mem::size_of_val(&values)).unwrap();
        buffer.copy_from_host(&values).unwrap();

        let mut restored = [0.0f32; 3];
        buffer.copy_to_host(&mut restored).unwrap();
        assert_eq!(restored, values);
    }

    #[test]
    fn test_copy_size_mismatch() {
        let device = Device::new();
        let mut buffer = device.alloc(8).unwrap();
        let result = buffer.copy_from_host(&[1.0f32]);
        assert_eq!(
            result.err(),
            Some(DeviceError::CopySizeMismatch { buffer: 8, host: 4 })
        );
    }
}
