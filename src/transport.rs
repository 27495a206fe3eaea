//! Byte-stream transports handed to subscribers.
//!
//! A subscriber stream is one end of a connected `AF_UNIX` socket pair. The
//! local end is always non-blocking and is written with [`send_nosignal`], so a
//! reader that went away shows up as `EPIPE` instead of a `SIGPIPE`.

use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

/// Creates a connected socket pair. The first end is non-blocking and
/// meant to stay in this process, the second is for the subscriber.
pub fn socket_pair() -> io::Result<(UnixStream, UnixStream)> {
    let (local, remote) = UnixStream::pair()?;
    local.set_nonblocking(true)?;
    suppress_sigpipe(&local)?;
    Ok((local, remote))
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
fn suppress_sigpipe(stream: &UnixStream) -> io::Result<()> {
    let one: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_NOSIGPIPE,
            &one as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(any(target_os = "macos", target_os = "ios", target_os = "freebsd")))]
fn suppress_sigpipe(_stream: &UnixStream) -> io::Result<()> {
    Ok(())
}

/// Writes as much of `buf` as the socket accepts without raising SIGPIPE.
///
/// # Returns
///
/// The number of bytes written. A full socket buffer is reported as
/// `ErrorKind::WouldBlock`, a vanished reader as `ErrorKind::BrokenPipe`.
pub fn send_nosignal(stream: &UnixStream, buf: &[u8]) -> io::Result<usize> {
    let rc = unsafe {
        libc::send(
            stream.as_raw_fd(),
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            SEND_FLAGS,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(rc as usize)
}
