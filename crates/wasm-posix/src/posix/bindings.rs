//! Host-side POSIX capabilities consumed by the syscall handlers.
//!
//! Which of these a host actually has depends on the platform and on what
//! the embedder supplies, so nothing is checked up front: every method has
//! a default that reports [`HostError::Unsupported`], and the handler that
//! hits it fails loudly at call time.

use nix::errno::Errno;
use std::time::Duration;

/// Failure of a host capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostError {
    /// The host has no such capability
    Unsupported(&'static str),
    /// The host operation failed with a POSIX error
    Os(Errno),
}

impl From<Errno> for HostError {
    fn from(errno: Errno) -> Self {
        HostError::Os(errno)
    }
}

impl From<std::io::Error> for HostError {
    fn from(err: std::io::Error) -> Self {
        HostError::Os(err.raw_os_error().map_or(Errno::EIO, Errno::from_raw))
    }
}

/// Result of a host capability.
pub type HostResult<T> = std::result::Result<T, HostError>;

/// Process, terminal and environment operations of the host.
pub trait HostBindings: Send + Sync {
    /// Process id
    fn getpid(&self) -> HostResult<i32> {
        Err(HostError::Unsupported("getpid"))
    }

    /// Parent process id
    fn getppid(&self) -> HostResult<i32> {
        Err(HostError::Unsupported("getppid"))
    }

    /// Real user id
    fn getuid(&self) -> HostResult<i32> {
        Err(HostError::Unsupported("getuid"))
    }

    /// Effective user id
    fn geteuid(&self) -> HostResult<i32> {
        Err(HostError::Unsupported("geteuid"))
    }

    /// Real group id
    fn getgid(&self) -> HostResult<i32> {
        Err(HostError::Unsupported("getgid"))
    }

    /// Effective group id
    fn getegid(&self) -> HostResult<i32> {
        Err(HostError::Unsupported("getegid"))
    }

    /// Process group of `pid` (0 = self)
    fn getpgid(&self, _pid: i32) -> HostResult<i32> {
        Err(HostError::Unsupported("getpgid"))
    }

    /// Start a new session
    fn setsid(&self) -> HostResult<i32> {
        Err(HostError::Unsupported("setsid"))
    }

    /// Send a signal
    fn kill(&self, _pid: i32, _signal: i32) -> HostResult<()> {
        Err(HostError::Unsupported("kill"))
    }

    /// Whether `fd` refers to a terminal
    fn isatty(&self, _fd: i32) -> HostResult<bool> {
        Err(HostError::Unsupported("isatty"))
    }

    /// Path of the controlling terminal
    fn ctermid(&self) -> HostResult<String> {
        Err(HostError::Unsupported("ctermid"))
    }

    /// Make `fd` the controlling terminal and stdio of the process
    fn login_tty(&self, _fd: i32) -> HostResult<()> {
        Err(HostError::Unsupported("login_tty"))
    }

    /// Host name
    fn gethostname(&self) -> HostResult<String> {
        Err(HostError::Unsupported("gethostname"))
    }

    /// Read from the host's stdin
    fn read_stdin(&self, _buf: &mut [u8]) -> HostResult<usize> {
        Err(HostError::Unsupported("read_stdin"))
    }

    /// Block the calling thread
    fn sleep(&self, duration: Duration) -> HostResult<()> {
        std::thread::sleep(duration);
        Ok(())
    }
}

/// Bindings with no host capabilities at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBindings;

impl HostBindings for NoBindings {}

/// Bindings backed by the local operating system.
#[cfg(all(unix, feature = "native"))]
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeBindings;

#[cfg(all(unix, feature = "native"))]
impl HostBindings for NativeBindings {
    fn getpid(&self) -> HostResult<i32> {
        Ok(nix::unistd::getpid().as_raw())
    }

    fn getppid(&self) -> HostResult<i32> {
        Ok(nix::unistd::getppid().as_raw())
    }

    fn getuid(&self) -> HostResult<i32> {
        Ok(nix::unistd::getuid().as_raw() as i32)
    }

    fn geteuid(&self) -> HostResult<i32> {
        Ok(nix::unistd::geteuid().as_raw() as i32)
    }

    fn getgid(&self) -> HostResult<i32> {
        Ok(nix::unistd::getgid().as_raw() as i32)
    }

    fn getegid(&self) -> HostResult<i32> {
        Ok(nix::unistd::getegid().as_raw() as i32)
    }

    fn getpgid(&self, pid: i32) -> HostResult<i32> {
        let pid = (pid != 0).then(|| nix::unistd::Pid::from_raw(pid));
        Ok(nix::unistd::getpgid(pid)?.as_raw())
    }

    fn setsid(&self) -> HostResult<i32> {
        Ok(nix::unistd::setsid()?.as_raw())
    }

    fn kill(&self, pid: i32, signal: i32) -> HostResult<()> {
        let signal = match signal {
            0 => None,
            n => Some(nix::sys::signal::Signal::try_from(n)?),
        };
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), signal)?;
        Ok(())
    }

    fn isatty(&self, fd: i32) -> HostResult<bool> {
        // SAFETY: isatty only inspects the descriptor number.
        Ok(unsafe { libc::isatty(fd) } == 1)
    }

    fn ctermid(&self) -> HostResult<String> {
        Ok("/dev/tty".to_string())
    }

    fn gethostname(&self) -> HostResult<String> {
        Ok(nix::unistd::gethostname()?.to_string_lossy().into_owned())
    }

    fn read_stdin(&self, buf: &mut [u8]) -> HostResult<usize> {
        use std::io::Read;
        Ok(std::io::stdin().read(buf)?)
    }
}

/// The bindings used when the embedder does not supply any.
pub fn default_bindings() -> std::sync::Arc<dyn HostBindings> {
    #[cfg(all(unix, feature = "native"))]
    {
        std::sync::Arc::new(NativeBindings)
    }
    #[cfg(not(all(unix, feature = "native")))]
    {
        std::sync::Arc::new(NoBindings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_bindings_are_unsupported() {
        let b = NoBindings;
        assert_eq!(b.getpid(), Err(HostError::Unsupported("getpid")));
        assert_eq!(b.login_tty(0), Err(HostError::Unsupported("login_tty")));
        assert!(b.sleep(Duration::from_millis(0)).is_ok());
    }

    #[test]
    fn test_io_error_maps_to_errno() {
        let err = std::io::Error::from_raw_os_error(libc::ENOENT);
        assert_eq!(HostError::from(err), HostError::Os(Errno::ENOENT));

        let err = std::io::Error::new(std::io::ErrorKind::Other, "no os code");
        assert_eq!(HostError::from(err), HostError::Os(Errno::EIO));
    }

    #[cfg(all(unix, feature = "native"))]
    #[test]
    fn test_native_identity() {
        let b = NativeBindings;
        assert_eq!(b.getpid(), Ok(std::process::id() as i32));
        assert!(b.getppid().is_ok());
        assert_eq!(b.ctermid(), Ok("/dev/tty".to_string()));
        assert_eq!(b.login_tty(0), Err(HostError::Unsupported("login_tty")));
    }
}
