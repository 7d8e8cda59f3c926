//! Kernel mapping channel.

use nix::errno::Errno;
use socket2::{Domain, Socket, Type};
use std::io::{self, Read, Write};
use std::os::unix::net::UnixDatagram;
use tracing::info;

/// Protocol family of the LISP mapping socket.
pub const PF_MAP: i32 = 38;

/// Largest mapping message handled.
pub const MAX_MESSAGE: usize = 8192;

/// Message-oriented channel carrying mapping messages.
pub trait MapChannel: Send + Sync {
    /// Receive one message into `buf`.
    fn recv_message(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Send one message.
    fn send_message(&self, msg: &[u8]) -> io::Result<usize>;
}

impl MapChannel for Socket {
    fn recv_message(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut socket: &Socket = self;
        socket.read(buf)
    }

    fn send_message(&self, msg: &[u8]) -> io::Result<usize> {
        let mut socket: &Socket = self;
        socket.write(msg)
    }
}

impl MapChannel for UnixDatagram {
    fn recv_message(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.recv(buf)
    }

    fn send_message(&self, msg: &[u8]) -> io::Result<usize> {
        self.send(msg)
    }
}

/// Open the kernel mapping socket.
pub fn open_kernel_socket() -> io::Result<Socket> {
    let socket = Socket::new(Domain::from(PF_MAP), Type::RAW, None)?;
    info!("Mapping socket opened");
    Ok(socket)
}

/// Write errors the mapping socket reports for requests it simply did not
/// act upon (unknown entry, entry exists, queue full, ...).
pub fn is_benign_write_error(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error().map(Errno::from_raw),
        Some(Errno::EINVAL | Errno::ESRCH | Errno::EBUSY | Errno::ENOBUFS | Errno::EEXIST)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_benign_errors() {
        for errno in [Errno::EINVAL, Errno::ESRCH, Errno::EBUSY, Errno::ENOBUFS, Errno::EEXIST] {
            assert!(is_benign_write_error(&io::Error::from(errno)), "{errno}");
        }
        assert!(!is_benign_write_error(&io::Error::from(Errno::EPIPE)));
        assert!(!is_benign_write_error(&io::Error::other("no errno")));
    }

    #[test]
    fn test_unix_datagram_channel() {
        let (a, b) = UnixDatagram::pair().unwrap();
        assert_eq!(a.send_message(b"\x01\x02\x03").unwrap(), 3);

        let mut buf = [0u8; MAX_MESSAGE];
        assert_eq!(b.recv_message(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"\x01\x02\x03");
    }
}
