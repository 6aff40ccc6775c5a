//! The profiler's return channel: a non-blocking Unix datagram socket bound
//! to a filesystem path. The external profiler sends fixed-size frames to the
//! path; the JVM drains them into a buffer of equally sized slots.

use crate::error::{AgentError, Result};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::sys::socket::{bind, recv, sendto, socket, AddressFamily, MsgFlags, SockFlag, SockType, UnixAddr};
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use log::{debug, trace};

/// `<temp dir>/jvmti_correlation_socket_<unix millis>`.
pub fn default_channel_path() -> PathBuf {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    std::env::temp_dir().join(format!("jvmti_correlation_socket_{millis}"))
}

#[derive(Debug)]
pub struct ReturnChannel {
    fd: OwnedFd,
    path: PathBuf,
    address: UnixAddr,
}

impl ReturnChannel {
    /// Creates the socket and binds it to `path`, which must not exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let fd = socket(AddressFamily::Unix, SockType::Datagram, SockFlag::empty(), None)
            .map_err(|e| AgentError::transport("socket", e))?;
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
            .map_err(|e| AgentError::transport("fcntl", e))?;
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
            .map_err(|e| AgentError::transport("fcntl", e))?;

        let address = UnixAddr::new(path.as_path()).map_err(|e| AgentError::transport("bind", e))?;
        bind(fd.as_raw_fd(), &address).map_err(|e| AgentError::transport("bind", e))?;
        debug!("return channel bound to {}", path.display());
        Ok(ReturnChannel { fd, path, address })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sends `message` as one datagram to the bound path.
    pub fn send(&self, message: &[u8]) -> Result<()> {
        sendto(self.fd.as_raw_fd(), message, &self.address, MsgFlags::MSG_DONTWAIT)
            .map_err(|e| AgentError::transport("send", e))?;
        Ok(())
    }

    /// Drains pending datagrams into consecutive `bytes_per_message` slots of
    /// `dst` and returns how many complete messages were stored.
    ///
    /// Stops when the next slot would not fit or nothing more is pending.
    /// Datagrams shorter than a slot are dropped and their slot reused.
    pub fn receive(&self, dst: &mut [u8], bytes_per_message: usize) -> Result<usize> {
        if bytes_per_message == 0 {
            return Err(AgentError::InvalidArgument("bytes per message must be > 0".to_string()));
        }
        let slots = dst.len() / bytes_per_message;
        let mut count = 0;
        while count < slots {
            let slot = &mut dst[count * bytes_per_message..(count + 1) * bytes_per_message];
            match recv(self.fd.as_raw_fd(), slot, MsgFlags::MSG_DONTWAIT) {
                Ok(n) if n < bytes_per_message => {
                    trace!("dropping truncated return frame ({n} of {bytes_per_message} bytes)");
                }
                Ok(_) => count += 1,
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(AgentError::transport("receive", e)),
            }
        }
        Ok(count)
    }

    /// Closes the socket and removes its path. The path is removed even if
    /// closing fails; the first failure is returned.
    pub fn close(self) -> Result<()> {
        let ReturnChannel { fd, path, .. } = self;
        let closed = nix::unistd::close(fd.into_raw_fd()).map_err(|e| AgentError::transport("close", e));
        let unlinked = std::fs::remove_file(&path).map_err(|e| AgentError::io("unlink", &e));
        debug!("return channel at {} closed", path.display());
        closed.and(unlinked)
    }
}

/// Size of a frame sent back by the profiler.
pub const RETURN_FRAME_SIZE: usize = 42;

/// One profiler result: the stack trace a sampled span ran into, and how
/// often.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReturnFrame {
    pub trace_id: [u8; 16],
    pub transaction_id: [u8; 8],
    pub stack_trace_id: [u8; 16],
    pub sample_count: u16,
}

impl ReturnFrame {
    /// Parses the first [`RETURN_FRAME_SIZE`] bytes of `slot`.
    pub fn decode(slot: &[u8]) -> Option<Self> {
        let slot = slot.get(..RETURN_FRAME_SIZE)?;
        let mut frame = ReturnFrame::default();
        frame.trace_id.copy_from_slice(&slot[0..16]);
        frame.transaction_id.copy_from_slice(&slot[16..24]);
        frame.stack_trace_id.copy_from_slice(&slot[24..40]);
        frame.sample_count = u16::from_ne_bytes([slot[40], slot[41]]);
        Some(frame)
    }

    pub fn encode(&self) -> [u8; RETURN_FRAME_SIZE] {
        let mut out = [0u8; RETURN_FRAME_SIZE];
        out[0..16].copy_from_slice(&self.trace_id);
        out[16..24].copy_from_slice(&self.transaction_id);
        out[24..40].copy_from_slice(&self.stack_trace_id);
        out[40..42].copy_from_slice(&self.sample_count.to_ne_bytes());
        out
    }
}
