//! Byte transports a handle can run the protocol over.
//!
//! Establishing a transport (connect, spawn) blocks once; afterwards the
//! descriptor is switched to non-blocking mode and every read or write is
//! attempted only when the caller reports readiness.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::process::{Child, Command, Stdio};

use tracing::{debug, warn};

/// A duplex byte stream with a pollable descriptor.
///
/// `recv` and `send` must not block: when no progress is possible they
/// return [`io::ErrorKind::WouldBlock`]. `recv` returning `Ok(0)` means the
/// peer closed its write side.
pub trait Transport: Send {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn send(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Descriptor polled for readiness.
    fn as_fd(&self) -> BorrowedFd<'_>;

    /// Whether decoded bytes are already buffered inside the transport, so
    /// `recv` can make progress without the descriptor becoming readable.
    fn pending(&self) -> bool {
        false
    }

    /// Close the write direction after the final request.
    fn shutdown_write(&mut self) -> io::Result<()>;

    /// Release everything the transport owns.
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Upgrades a plaintext transport after the server acknowledges STARTTLS.
///
/// The upgrade may perform a blocking TLS handshake on the descriptor.
pub trait TlsUpgrade: Send {
    fn upgrade(
        &mut self,
        transport: Box<dyn Transport>,
        server_name: Option<&str>,
    ) -> io::Result<Box<dyn Transport>>;
}

impl Transport for TcpStream {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(self, buf)
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        Write::write(self, buf)
    }

    fn as_fd(&self) -> BorrowedFd<'_> {
        AsFd::as_fd(self)
    }

    fn shutdown_write(&mut self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Write)
    }
}

impl Transport for UnixStream {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(self, buf)
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        Write::write(self, buf)
    }

    fn as_fd(&self) -> BorrowedFd<'_> {
        AsFd::as_fd(self)
    }

    fn shutdown_write(&mut self) -> io::Result<()> {
        UnixStream::shutdown(self, Shutdown::Write)
    }
}

pub(crate) fn tcp(host: &str, port: u16) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in (host, port).to_socket_addrs()? {
        match TcpStream::connect(addr) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                stream.set_nonblocking(true)?;
                debug!(%addr, "connected");
                return Ok(stream);
            }
            Err(e) => {
                debug!(%addr, error = %e, "connect failed");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("{host}:{port} did not resolve to any address"),
        )
    }))
}

pub(crate) fn unix(path: &Path) -> io::Result<UnixStream> {
    let stream = UnixStream::connect(path)?;
    stream.set_nonblocking(true)?;
    Ok(stream)
}

/// Adopt an already-connected stream socket.
pub(crate) fn socket(fd: OwnedFd) -> io::Result<UnixStream> {
    let stream = UnixStream::from(fd);
    stream.set_nonblocking(true)?;
    Ok(stream)
}

/// A server subprocess speaking NBD on its stdin and stdout.
///
/// The child gets one end of a socket pair as both stdin and stdout; it is
/// killed and reaped when the transport is closed or dropped.
pub struct CommandTransport {
    stream: UnixStream,
    child: Option<Child>,
}

impl CommandTransport {
    pub fn spawn<S: AsRef<std::ffi::OsStr>>(argv: &[S]) -> io::Result<Self> {
        let (program, args) = argv.split_first().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "empty command line")
        })?;
        let (ours, theirs) = UnixStream::pair()?;
        let stdin = OwnedFd::from(theirs.try_clone()?);
        let stdout = OwnedFd::from(theirs);
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::from(stdin))
            .stdout(Stdio::from(stdout))
            .spawn()?;
        ours.set_nonblocking(true)?;
        debug!(pid = child.id(), "spawned server command");
        Ok(Self {
            stream: ours,
            child: Some(child),
        })
    }

    fn reap(&mut self) -> io::Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        if child.try_wait()?.is_none() {
            if let Err(e) = child.kill() {
                warn!(pid = child.id(), error = %e, "failed to kill server command");
            }
        }
        let status = child.wait()?;
        debug!(%status, "server command exited");
        Ok(())
    }
}

impl Transport for CommandTransport {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.recv(buf)
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.send(buf)
    }

    fn as_fd(&self) -> BorrowedFd<'_> {
        AsFd::as_fd(&self.stream)
    }

    fn shutdown_write(&mut self) -> io::Result<()> {
        self.stream.shutdown_write()
    }

    fn close(&mut self) -> io::Result<()> {
        self.reap()
    }
}

impl Drop for CommandTransport {
    fn drop(&mut self) {
        if let Err(e) = self.reap() {
            warn!(error = %e, "failed to reap server command");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_pair_is_a_transport() {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let mut a: Box<dyn Transport> = Box::new(a);
        let mut b: Box<dyn Transport> = Box::new(b);

        let mut buf = [0u8; 4];
        let err = a.recv(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        assert_eq!(b.send(b"ping").unwrap(), 4);
        assert_eq!(a.recv(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"ping");

        b.shutdown_write().unwrap();
        assert_eq!(a.recv(&mut buf).unwrap(), 0);
    }

    #[test]
    fn command_transport_echoes_through_child() {
        let mut transport = CommandTransport::spawn(&["cat"]).unwrap();
        let mut written = 0;
        while written < 5 {
            match transport.send(&b"hello"[written..]) {
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => panic!("send failed: {e}"),
            }
        }

        let mut out = Vec::new();
        let mut buf = [0u8; 16];
        while out.len() < 5 {
            match transport.recv(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(1))
                }
                Err(e) => panic!("recv failed: {e}"),
            }
        }
        assert_eq!(out, b"hello");
        transport.close().unwrap();
    }

    #[test]
    fn spawn_rejects_empty_argv() {
        let argv: [&str; 0] = [];
        assert!(CommandTransport::spawn(&argv).is_err());
    }
}
