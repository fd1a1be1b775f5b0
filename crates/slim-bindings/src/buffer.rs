//! Byte buffers that cross the C boundary.
//!
//! A [`SlimBuffer`] is always allocated and freed on the native side. The
//! foreign side hands bytes it owns to native code as [`ForeignBytes`], which
//! are only borrowed for the duration of a call.

use slim_session::{Result, SlimError};

/// Native-owned buffer: `{capacity, len, data}`.
#[repr(C)]
#[derive(Debug)]
pub struct SlimBuffer {
    /// Allocated bytes.
    pub capacity: u64,
    /// Initialised bytes.
    pub len: u64,
    /// Start of the allocation, null when empty.
    pub data: *mut u8,
}

impl Default for SlimBuffer {
    fn default() -> Self {
        Self::empty()
    }
}

impl SlimBuffer {
    /// Buffer with no allocation.
    pub fn empty() -> Self {
        Self {
            capacity: 0,
            len: 0,
            data: std::ptr::null_mut(),
        }
    }

    /// Takes ownership of `v`. Release with [`SlimBuffer::destroy_into_vec`].
    pub fn from_vec(v: Vec<u8>) -> Self {
        let mut v = std::mem::ManuallyDrop::new(v);
        Self {
            capacity: v.capacity() as u64,
            len: v.len() as u64,
            data: v.as_mut_ptr(),
        }
    }

    /// Reclaims the allocation.
    ///
    /// # Safety
    /// The buffer must come from [`SlimBuffer::from_vec`] and must not be
    /// used afterwards.
    pub unsafe fn destroy_into_vec(self) -> Vec<u8> {
        if self.data.is_null() {
            if self.len != 0 || self.capacity != 0 {
                panic!("null buffer with non-zero length or capacity");
            }
            return Vec::new();
        }
        if self.len > self.capacity {
            panic!("buffer length exceeds capacity");
        }
        Vec::from_raw_parts(self.data, self.len as usize, self.capacity as usize)
    }

    /// Frees the allocation.
    pub fn destroy(self) {
        drop(unsafe { self.destroy_into_vec() });
    }

    /// The initialised bytes.
    pub fn as_slice(&self) -> &[u8] {
        if self.data.is_null() {
            &[]
        } else {
            unsafe { std::slice::from_raw_parts(self.data, self.len as usize) }
        }
    }
}

/// Foreign-owned bytes, borrowed for one call.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ForeignBytes {
    /// Byte count; negative is rejected.
    pub len: i32,
    /// Start of the bytes.
    pub data: *const u8,
}

impl ForeignBytes {
    /// # Safety
    /// `data` must point to `len` readable bytes for the duration of the call.
    pub unsafe fn as_slice(&self) -> Result<&[u8]> {
        if self.data.is_null() {
            if self.len != 0 {
                return Err(SlimError::InvalidArgument(
                    "null foreign bytes with non-zero length".to_string(),
                ));
            }
            return Ok(&[]);
        }
        let len = usize::try_from(self.len).map_err(|_| {
            SlimError::InvalidArgument("negative foreign bytes length".to_string())
        })?;
        Ok(std::slice::from_raw_parts(self.data, len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_roundtrip() {
        let buf = SlimBuffer::from_vec(vec![1, 2, 3]);
        assert_eq!(buf.len, 3);
        assert_eq!(buf.as_slice(), &[1, 2, 3]);
        assert_eq!(unsafe { buf.destroy_into_vec() }, vec![1, 2, 3]);
    }

    #[test]
    fn test_empty_buffer() {
        let buf = SlimBuffer::empty();
        assert!(buf.as_slice().is_empty());
        assert!(unsafe { buf.destroy_into_vec() }.is_empty());
    }

    #[test]
    fn test_foreign_bytes() {
        let data = [9u8, 8, 7];
        let fb = ForeignBytes {
            len: 3,
            data: data.as_ptr(),
        };
        assert_eq!(unsafe { fb.as_slice() }.unwrap(), &data);

        let bad = ForeignBytes {
            len: -1,
            data: data.as_ptr(),
        };
        assert!(unsafe { bad.as_slice() }.is_err());

        let null = ForeignBytes {
            len: 0,
            data: std::ptr::null(),
        };
        assert!(unsafe { null.as_slice() }.unwrap().is_empty());
    }
}
