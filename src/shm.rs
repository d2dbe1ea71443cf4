//! POSIX shared-memory segments.
//!
//! [`MappedRegion`] is the receiver's read-only view of a segment owned by
//! the producer. [`SegmentWriter`] is the producer side, used by the test
//! pattern binary and the tests.

use std::ffi::CString;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr;

use tracing::{debug, trace};

use crate::codec::{self, HEADER_LEN};
use crate::error::SegmentError;
use crate::frame::FrameHeader;

fn segment_name(name: &str) -> Result<(String, CString), SegmentError> {
    let name = if name.starts_with('/') {
        name.to_owned()
    } else {
        format!("/{name}")
    };
    if name.len() < 2 || name[1..].contains('/') {
        return Err(SegmentError::InvalidName { name });
    }
    let c_name = CString::new(name.as_str()).map_err(|_| SegmentError::InvalidName {
        name: name.clone(),
    })?;
    Ok((name, c_name))
}

fn segment_size(name: &str, fd: &OwnedFd) -> Result<usize, SegmentError> {
    // SAFETY: an all-zero `stat` is a valid value; fstat overwrites it.
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    // SAFETY: fd is open for the lifetime of `fd`, stat points to owned memory
    if unsafe { libc::fstat(fd.as_raw_fd(), &mut stat) } < 0 {
        return Err(SegmentError::io(name, io::Error::last_os_error()));
    }
    Ok(stat.st_size as usize)
}

fn map(name: &str, fd: &OwnedFd, len: usize, prot: libc::c_int) -> Result<*mut u8, SegmentError> {
    // SAFETY: fd is a valid shm descriptor and len is its size
    let addr = unsafe { libc::mmap(ptr::null_mut(), len, prot, libc::MAP_SHARED, fd.as_raw_fd(), 0) };
    if addr == libc::MAP_FAILED {
        return Err(SegmentError::io(name, io::Error::last_os_error()));
    }
    Ok(addr.cast())
}

fn unmap(addr: *mut u8, len: usize) {
    // SAFETY: addr/len come from a successful mmap that has not been unmapped
    unsafe {
        libc::munmap(addr.cast(), len);
    }
}

/// Read-only mapping of an existing segment.
///
/// The bytes behind the mapping change whenever the producer writes; there
/// is no lock and no snapshot. Callers must treat every read as possibly
/// torn.
#[derive(Debug)]
pub struct MappedRegion {
    name: String,
    addr: *mut u8,
    len: usize,
}

// SAFETY: the mapping is never written through this handle, and the raw
// pointer is only dereferenced while the region is open.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Attaches to the segment `name`.
    ///
    /// With `expected_len` the segment must be exactly that large; otherwise
    /// it only has to hold a frame header.
    pub fn open(name: &str, expected_len: Option<usize>) -> Result<Self, SegmentError> {
        let (name, c_name) = segment_name(name)?;

        // SAFETY: c_name is a valid NUL-terminated string
        let raw = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0 as libc::c_uint) };
        if raw < 0 {
            return Err(SegmentError::from_os(&name, io::Error::last_os_error()));
        }
        // SAFETY: shm_open succeeded, we own the descriptor
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let len = segment_size(&name, &fd)?;
        let expected = expected_len.unwrap_or(HEADER_LEN);
        let fits = match expected_len {
            Some(expected) => len == expected,
            None => len >= HEADER_LEN,
        };
        if !fits {
            return Err(SegmentError::SizeMismatch {
                name,
                actual: len,
                expected,
            });
        }

        let addr = map(&name, &fd, len, libc::PROT_READ)?;
        debug!(name = %name, len, "mapped shared memory");
        Ok(Self { name, addr, len })
    }

    /// The producer's current bytes, with no copy and no synchronization.
    ///
    /// The producer keeps writing while the slice is borrowed, so payload
    /// bytes may change under it. Only the header words are copied out by
    /// [`codec::decode`]; a handler that needs stable pixels must copy them,
    /// e.g. with [`Frame::to_owned_frame`](crate::frame::Frame::to_owned_frame).
    ///
    /// Empty once the region is closed.
    pub fn read_current(&self) -> &[u8] {
        if self.addr.is_null() {
            return &[];
        }
        // SAFETY: the mapping is live and len bytes long until close(),
        // which needs &mut self
        unsafe { std::slice::from_raw_parts(self.addr, self.len) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_closed(&self) -> bool {
        self.addr.is_null()
    }

    pub fn close(&mut self) {
        if self.addr.is_null() {
            return;
        }
        unmap(self.addr, self.len);
        self.addr = ptr::null_mut();
        trace!(name = %self.name, "unmapped shared memory");
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        self.close();
    }
}

/// Producer-side handle: creates the segment and writes frames into it.
///
/// The segment is unlinked when the writer is dropped.
#[derive(Debug)]
pub struct SegmentWriter {
    name: String,
    c_name: CString,
    addr: *mut u8,
    len: usize,
}

// SAFETY: the writer is the only handle writing through its mapping.
unsafe impl Send for SegmentWriter {}

impl SegmentWriter {
    pub fn create(name: &str, len: usize) -> Result<Self, SegmentError> {
        let (name, c_name) = segment_name(name)?;
        if len < HEADER_LEN {
            return Err(SegmentError::SizeMismatch {
                name,
                actual: len,
                expected: HEADER_LEN,
            });
        }

        // SAFETY: c_name is a valid NUL-terminated string
        let raw = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR,
                0o600 as libc::c_uint,
            )
        };
        if raw < 0 {
            return Err(SegmentError::from_os(&name, io::Error::last_os_error()));
        }
        // SAFETY: shm_open succeeded, we own the descriptor
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // SAFETY: fd is valid
        if unsafe { libc::ftruncate(fd.as_raw_fd(), len as libc::off_t) } < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: c_name is a valid NUL-terminated string
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
            return Err(SegmentError::io(&name, err));
        }

        let addr = match map(&name, &fd, len, libc::PROT_READ | libc::PROT_WRITE) {
            Ok(addr) => addr,
            Err(e) => {
                // SAFETY: c_name is a valid NUL-terminated string
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
                return Err(e);
            }
        };
        debug!(name = %name, len, "created shared memory");
        Ok(Self {
            name,
            c_name,
            addr,
            len,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Raw access to the whole segment.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: the mapping is live and len bytes long for the writer's lifetime
        unsafe { std::slice::from_raw_parts_mut(self.addr, self.len) }
    }

    /// Writes the header, then the payload.
    pub fn write_frame(&mut self, header: &FrameHeader, payload: &[u8]) -> Result<(), SegmentError> {
        let required = HEADER_LEN + payload.len();
        if header.payload_len() != Some(payload.len()) || required > self.len {
            return Err(SegmentError::SizeMismatch {
                name: self.name.clone(),
                actual: self.len,
                expected: required,
            });
        }
        let bytes = self.bytes_mut();
        codec::encode_header(header, bytes);
        bytes[HEADER_LEN..required].copy_from_slice(payload);
        Ok(())
    }
}

impl Drop for SegmentWriter {
    fn drop(&mut self) {
        unmap(self.addr, self.len);
        // SAFETY: c_name is a valid NUL-terminated string
        unsafe { libc::shm_unlink(self.c_name.as_ptr()) };
        trace!(name = %self.name, "unlinked shared memory");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn unique_name(tag: &str) -> String {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        format!(
            "/shmframe-shm-{tag}-{}-{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[test]
    fn missing_segment_is_not_found() {
        let err = MappedRegion::open(&unique_name("missing"), None).unwrap_err();
        assert!(matches!(err, SegmentError::NotFound { .. }));
    }

    #[test]
    fn nested_name_is_invalid() {
        assert!(matches!(
            MappedRegion::open("/a/b", None),
            Err(SegmentError::InvalidName { .. })
        ));
        assert!(matches!(
            MappedRegion::open("", None),
            Err(SegmentError::InvalidName { .. })
        ));
    }

    #[test]
    fn reader_sees_writer_updates() {
        let name = unique_name("live");
        let mut writer = SegmentWriter::create(&name, HEADER_LEN + 4).unwrap();
        let region = MappedRegion::open(&name, None).unwrap();
        assert_eq!(region.len(), HEADER_LEN + 4);

        writer.bytes_mut()[HEADER_LEN] = 42;
        assert_eq!(region.read_current()[HEADER_LEN], 42);
        writer.bytes_mut()[HEADER_LEN] = 43;
        assert_eq!(region.read_current()[HEADER_LEN], 43);
    }

    #[test]
    fn borrowed_payload_moves_but_owned_copy_stays() {
        let name = unique_name("borrow");
        let mut writer = SegmentWriter::create(&name, HEADER_LEN + 2).unwrap();
        let header = FrameHeader {
            sequence: 1,
            width: 2,
            height: 1,
            channels: 1,
        };
        writer.write_frame(&header, &[1, 2]).unwrap();
        let region = MappedRegion::open(&name, None).unwrap();

        let frame = codec::decode(region.read_current(), &codec::FrameLimits::default()).unwrap();
        let copy = frame.to_owned_frame();
        writer.bytes_mut()[HEADER_LEN] = 9;

        assert_eq!(frame.data[0], 9);
        assert_eq!(frame.sequence(), 1);
        assert_eq!(copy.data, vec![1, 2]);
    }

    #[test]
    fn name_without_slash_is_accepted() {
        let name = unique_name("slash");
        let _writer = SegmentWriter::create(&name, HEADER_LEN).unwrap();
        let region = MappedRegion::open(name.trim_start_matches('/'), None).unwrap();
        assert_eq!(region.name(), name);
    }

    #[test]
    fn expected_len_is_enforced() {
        let name = unique_name("size");
        let _writer = SegmentWriter::create(&name, HEADER_LEN + 4).unwrap();
        let err = MappedRegion::open(&name, Some(HEADER_LEN + 8)).unwrap_err();
        assert!(matches!(
            err,
            SegmentError::SizeMismatch { actual, expected, .. }
                if actual == HEADER_LEN + 4 && expected == HEADER_LEN + 8
        ));
        assert!(MappedRegion::open(&name, Some(HEADER_LEN + 4)).is_ok());
    }

    #[test]
    fn close_is_idempotent() {
        let name = unique_name("close");
        let _writer = SegmentWriter::create(&name, HEADER_LEN).unwrap();
        let mut region = MappedRegion::open(&name, None).unwrap();
        region.close();
        region.close();
        assert!(region.is_closed());
        assert!(region.read_current().is_empty());
    }

    #[test]
    fn write_frame_rejects_mismatched_payload() {
        let name = unique_name("mismatch");
        let mut writer = SegmentWriter::create(&name, HEADER_LEN + 4).unwrap();
        let header = FrameHeader {
            sequence: 1,
            width: 2,
            height: 2,
            channels: 1,
        };
        assert!(writer.write_frame(&header, &[1, 2, 3]).is_err());
        assert!(writer.write_frame(&header, &[1, 2, 3, 4]).is_ok());
    }
}
