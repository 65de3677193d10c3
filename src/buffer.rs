use std::io::{self, IoSlice, IoSliceMut};
use std::os::unix::io::RawFd;

/// Default reserved head room so a length prefix can be prepended without a
/// copy.
pub const PREPEND_SIZE: usize = 8;
const INITIAL_SIZE: usize = 1024;
const SCRATCH_SIZE: usize = 65536;

/// A growable byte buffer with separate read/write cursors and a small
/// prepend reservation, the way the teacher's selector layer keeps readiness
/// bookkeeping in one contiguous allocation rather than a list of small
/// ones.
///
/// Layout: `[0, read_idx)` prependable, `[read_idx, write_idx)` readable,
/// `[write_idx, cap)` writable.
#[derive(Debug, Clone)]
pub struct Buffer {
    data: Vec<u8>,
    read_idx: usize,
    write_idx: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Buffer::new()
    }
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(initial_size: usize) -> Buffer {
        Buffer {
            data: vec![0u8; PREPEND_SIZE + initial_size],
            read_idx: PREPEND_SIZE,
            write_idx: PREPEND_SIZE,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.write_idx - self.read_idx
    }

    pub fn writable_bytes(&self) -> usize {
        self.data.len() - self.write_idx
    }

    pub fn prependable_bytes(&self) -> usize {
        self.read_idx
    }

    pub fn readable(&self) -> &[u8] {
        &self.data[self.read_idx..self.write_idx]
    }

    pub fn peek(&self) -> &[u8] {
        self.readable()
    }

    /// Advances the read cursor past `len` consumed bytes, resetting both
    /// cursors to the start of the prepend window once the buffer empties.
    pub fn retrieve(&mut self, len: usize) {
        let len = len.min(self.readable_bytes());
        self.read_idx += len;
        if self.read_idx == self.write_idx {
            self.read_idx = PREPEND_SIZE;
            self.write_idx = PREPEND_SIZE;
        }
    }

    pub fn retrieve_all(&mut self) {
        self.read_idx = PREPEND_SIZE;
        self.write_idx = PREPEND_SIZE;
    }

    /// Atomically drains the readable region as an owned `String`.
    ///
    /// Invalid UTF-8 is replaced, matching the behaviour applications get
    /// from `String::from_utf8_lossy` when treating arbitrary wire bytes as
    /// text; callers that need raw bytes should use `retrieve_all_bytes`.
    pub fn retrieve_all_as_string(&mut self) -> String {
        let s = String::from_utf8_lossy(self.readable()).into_owned();
        self.retrieve_all();
        s
    }

    pub fn retrieve_all_bytes(&mut self) -> Vec<u8> {
        let bytes = self.readable().to_vec();
        self.retrieve_all();
        bytes
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.ensure_writable(bytes.len());
        let start = self.write_idx;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        self.write_idx += bytes.len();
    }

    pub fn prepend(&mut self, bytes: &[u8]) {
        assert!(
            bytes.len() <= self.prependable_bytes(),
            "prepend of {} bytes exceeds {} available",
            bytes.len(),
            self.prependable_bytes()
        );
        self.read_idx -= bytes.len();
        self.data[self.read_idx..self.read_idx + bytes.len()].copy_from_slice(bytes);
    }

    /// Ensures at least `len` bytes are writable, compacting the existing
    /// readable span down to the prepend boundary if that alone is enough,
    /// otherwise growing the backing allocation.
    fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() >= len {
            return;
        }
        if self.prependable_bytes() + self.writable_bytes() >= len + PREPEND_SIZE {
            let readable = self.readable_bytes();
            self.data
                .copy_within(self.read_idx..self.write_idx, PREPEND_SIZE);
            self.read_idx = PREPEND_SIZE;
            self.write_idx = PREPEND_SIZE + readable;
        } else {
            let readable = self.readable_bytes();
            let mut grown = vec![0u8; PREPEND_SIZE + readable + len];
            grown[PREPEND_SIZE..PREPEND_SIZE + readable]
                .copy_from_slice(&self.data[self.read_idx..self.write_idx]);
            self.data = grown;
            self.read_idx = PREPEND_SIZE;
            self.write_idx = PREPEND_SIZE + readable;
        }
    }

    /// Reads from `fd` into the buffer's writable tail plus a 64 KiB stack
    /// scratch area, amortising a single `readv` against an over-allocated
    /// temporary so a typical small message never forces a resize.
    ///
    /// Returns `Ok(0)` on EOF, `Ok(n)` on `n` bytes read, or an `io::Error`
    /// (including `WouldBlock` on a non-blocking fd with nothing pending).
    pub fn read_from_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut scratch = [0u8; SCRATCH_SIZE];
        let writable = self.writable_bytes();
        let n = {
            let tail = &mut self.data[self.write_idx..];
            let mut slices = [IoSliceMut::new(tail), IoSliceMut::new(&mut scratch)];
            syscall_readv(fd, &mut slices)?
        };
        if n <= writable {
            self.write_idx += n;
        } else {
            self.write_idx = self.data.len();
            let extra = n - writable;
            self.append(&scratch[..extra]);
        }
        Ok(n)
    }

    /// Writes the whole readable span to `fd`, retiring whatever the kernel
    /// accepted. Returns the number of bytes the kernel accepted, which may
    /// be less than `readable_bytes()` on a non-blocking socket.
    pub fn write_to_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let slice = IoSlice::new(self.readable());
        let n = syscall_writev(fd, std::slice::from_ref(&slice))?;
        self.retrieve(n);
        Ok(n)
    }
}

fn syscall_readv(fd: RawFd, slices: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
    let iov = slices.as_mut_ptr() as *mut libc::iovec;
    let res = unsafe { libc::readv(fd, iov, slices.len() as i32) };
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res as usize)
    }
}

fn syscall_writev(fd: RawFd, slices: &[IoSlice<'_>]) -> io::Result<usize> {
    let iov = slices.as_ptr() as *const libc::iovec;
    let res = unsafe { libc::writev(fd, iov, slices.len() as i32) };
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_retrieve_all_round_trips() {
        let mut buf = Buffer::new();
        buf.append(b"hello world");
        assert_eq!(buf.retrieve_all_as_string(), "hello world");
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn cursors_stay_within_invariant() {
        let mut buf = Buffer::new();
        for _ in 0..10 {
            buf.append(b"abcdefgh");
            assert!(buf.prependable_bytes() >= PREPEND_SIZE.min(buf.prependable_bytes()));
            buf.retrieve(3);
        }
        buf.retrieve_all();
        assert_eq!(buf.prependable_bytes(), PREPEND_SIZE);
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn prepend_writes_immediately_before_read_idx() {
        let mut buf = Buffer::new();
        buf.append(b"world");
        buf.prepend(b"hello ");
        assert_eq!(buf.retrieve_all_as_string(), "hello world");
    }

    #[test]
    fn growth_preserves_readable_content() {
        let mut buf = Buffer::with_capacity(4);
        let big = vec![b'x'; 10_000];
        buf.append(&big);
        assert_eq!(buf.readable_bytes(), 10_000);
        assert_eq!(buf.readable(), &big[..]);
    }

    #[test]
    fn compaction_reclaims_prependable_head_room() {
        let mut buf = Buffer::with_capacity(16);
        buf.append(&[0u8; 16]);
        buf.retrieve(16);
        buf.append(&[1u8; 16]);
        assert_eq!(buf.readable_bytes(), 16);
    }

    #[test]
    fn read_from_fd_via_pipe_uses_scratch_for_overflow() {
        let mut fds = [0i32; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        let (read_fd, write_fd) = (fds[0], fds[1]);
        let payload = vec![b'z'; 70_000];
        let mut remaining = &payload[..];
        while !remaining.is_empty() {
            let n = unsafe {
                libc::write(
                    write_fd,
                    remaining.as_ptr() as *const libc::c_void,
                    remaining.len(),
                )
            };
            assert!(n > 0);
            remaining = &remaining[n as usize..];
        }
        unsafe { libc::close(write_fd) };

        let mut buf = Buffer::with_capacity(16);
        let mut total = 0usize;
        loop {
            match buf.read_from_fd(read_fd) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        unsafe { libc::close(read_fd) };
        assert_eq!(total, payload.len());
        assert_eq!(buf.readable_bytes(), payload.len());
    }
}
