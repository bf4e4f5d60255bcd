//! Memory-region registry: local registrations and the remote descriptors
//! created from identifiers received over the wire.

use std::convert::TryInto;
use std::ptr;

use bitflags::bitflags;

use crate::error::{check_fi, Result};
use crate::ffi;
use crate::zone::Zone;

bitflags! {
    /// Access modes a local registration grants, translated to libfabric's
    /// MR access bits in `MemoryRegionLocal::new`.
    pub struct Access: u32 {
        /// Local destination of a remote `read`.
        const READ_DST = 0b0000_0001;
        /// Local source of a remote `write`.
        const WRITE_SRC = 0b0000_0010;
        /// Remote destination of a `write`/`atomic_write` issued by a peer.
        const WRITE_DST = 0b0000_0100;
        /// Remote source of a `read` issued by a peer.
        const READ_SRC = 0b0000_1000;
    }
}

fn to_fi_access(access: Access) -> u64 {
    let mut bits = 0u64;
    if access.contains(Access::READ_DST) {
        bits |= ffi::FI_MR_ACCESS_WRITE; // local buffer is written into by the read
    }
    if access.contains(Access::WRITE_SRC) {
        bits |= ffi::FI_MR_ACCESS_READ; // local buffer is read from by the write
    }
    if access.contains(Access::WRITE_DST) {
        bits |= ffi::FI_MR_ACCESS_REMOTE_WRITE;
    }
    if access.contains(Access::READ_SRC) {
        bits |= ffi::FI_MR_ACCESS_REMOTE_READ;
    }
    bits
}

/// The transportable identifier of a registered region: `(raddr, rkey,
/// size)`, 24 bytes, little-endian on the wire.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryId {
    pub raddr: u64,
    pub rkey: u64,
    pub size: u64,
}

impl MemoryId {
    pub const WIRE_SIZE: usize = 24;

    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..8].copy_from_slice(&self.raddr.to_le_bytes());
        buf[8..16].copy_from_slice(&self.rkey.to_le_bytes());
        buf[16..24].copy_from_slice(&self.size.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::WIRE_SIZE {
            return Err(crate::error::Error::Protocol(
                crate::error::ProtocolError::InvalidMsg,
            ));
        }
        Ok(MemoryId {
            raddr: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            rkey: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            size: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
        })
    }
}

/// A local buffer registered with the fabric domain. Owns the registration,
/// not the backing buffer: the caller supplied the pointer and remains
/// responsible for its lifetime exceeding this registration's.
pub struct MemoryLocal {
    mr: *mut ffi::fid_mr,
    ptr: *mut u8,
    size: usize,
    desc: *mut std::os::raw::c_void,
    id: MemoryId,
}

// The registration itself may be read/written from any thread that holds a
// reference; the fabric domain is `FI_THREAD_SAFE`.
unsafe impl Send for MemoryLocal {}
unsafe impl Sync for MemoryLocal {}

impl MemoryLocal {
    /// Registers `len` bytes starting at `ptr` with `zone`'s domain.
    ///
    /// # Safety
    /// `ptr` must remain valid and exclusively owned by this registration
    /// for as long as the returned `MemoryLocal` (and any RMA operation
    /// referencing it) lives.
    pub unsafe fn new(zone: &Zone, ptr: *mut u8, len: usize, access: Access) -> Result<Self> {
        let mut mr: *mut ffi::fid_mr = ptr::null_mut();
        let ret = ffi::fi_mr_reg(
            zone.domain_ptr(),
            ptr as *const _,
            len,
            to_fi_access(access),
            0,
            0,
            0,
            &mut mr,
            ptr::null_mut(),
        );
        check_fi("fi_mr_reg", ret)?;

        let rkey = ffi::fi_mr_key(mr);
        let desc = ffi::fi_mr_desc(mr);

        Ok(MemoryLocal {
            mr,
            ptr,
            size: len,
            desc,
            id: MemoryId {
                raddr: ptr as u64,
                rkey,
                size: len as u64,
            },
        })
    }

    /// A registration-free stub backed by `ptr`, for dispatcher/connection
    /// tests that need a `MemoryLocal` to fill a struct field but never
    /// issue an RMA op against it.
    #[cfg(test)]
    pub(crate) fn new_test_stub(ptr: *mut u8, len: usize) -> Self {
        MemoryLocal {
            mr: std::ptr::null_mut(),
            ptr,
            size: len,
            desc: std::ptr::null_mut(),
            id: MemoryId {
                raddr: ptr as u64,
                rkey: 0,
                size: len as u64,
            },
        }
    }

    pub fn ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn id(&self) -> MemoryId {
        self.id
    }

    pub(crate) fn desc(&self) -> *mut std::os::raw::c_void {
        self.desc
    }

    /// Returns the region as a byte slice. Callers are responsible for not
    /// racing this read against an in-flight RDMA write into the region.
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.ptr, self.size)
    }

    pub unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr, self.size)
    }
}

impl Drop for MemoryLocal {
    fn drop(&mut self) {
        if self.mr.is_null() {
            return;
        }
        unsafe {
            ffi::fi_close(self.mr as ffi::fid_t);
        }
    }
}

/// A remote descriptor created from an identifier received over the
/// messaging channel. Immutable after creation; owned by whoever decoded
/// it.
#[derive(Clone, Copy, Debug)]
pub struct MemoryRemote {
    id: MemoryId,
}

impl MemoryRemote {
    pub fn new(id: MemoryId) -> Result<Self> {
        Ok(MemoryRemote { id })
    }

    pub fn id(&self) -> MemoryId {
        self.id
    }

    pub fn raddr(&self) -> u64 {
        self.id.raddr
    }

    pub fn rkey(&self) -> u64 {
        self.id.rkey
    }

    pub fn size(&self) -> u64 {
        self.id.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_round_trips_through_the_wire_format() {
        let id = MemoryId {
            raddr: 0xdead_beef,
            rkey: 0x1234_5678,
            size: 4096,
        };
        let bytes = id.to_bytes();
        assert_eq!(bytes.len(), MemoryId::WIRE_SIZE);
        assert_eq!(MemoryId::from_bytes(&bytes).unwrap(), id);
    }

    #[test]
    fn remote_new_preserves_the_identifier() {
        let id = MemoryId {
            raddr: 1,
            rkey: 2,
            size: 3,
        };
        let remote = MemoryRemote::new(id).unwrap();
        assert_eq!(remote.id(), id);
    }

    #[test]
    fn from_bytes_rejects_short_buffers() {
        assert!(MemoryId::from_bytes(&[0u8; 8]).is_err());
    }
}
