//! Chromium child process wired to the parent through fds 3 and 4.

use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;
use std::process::Stdio;

use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::error::CdpError;

/// Descriptor the child reads commands from.
const CHILD_READ_FD: libc::c_int = 3;
/// Descriptor the child writes responses to.
const CHILD_WRITE_FD: libc::c_int = 4;

pub const CHROMIUM_FLAGS: &[&str] = &[
    "--headless",
    "--remote-debugging-pipe",
    "--no-sandbox",
    "--disable-gpu",
    "--disable-dev-shm-usage",
    "--disable-software-rasterizer",
    "--disable-extensions",
    "--disable-background-networking",
    "--disable-sync",
    "--disable-default-apps",
    "--mute-audio",
];

pub type PipeReader = pipe::Receiver;
pub type PipeWriter = pipe::Sender;

/// A running Chromium plus the parent ends of its debugging pipes.
#[derive(Debug)]
pub struct BrowserPipe {
    pub child: Child,
    pub reader: PipeReader,
    pub writer: PipeWriter,
}

impl BrowserPipe {
    /// Spawns `binary` with the pipe flag set. Must run inside a tokio runtime.
    pub fn spawn(binary: &Path, extra_args: &[String]) -> Result<Self, CdpError> {
        let spawn_err = |err: io::Error| CdpError::Spawn {
            path: binary.to_path_buf(),
            reason: err.to_string(),
        };

        let (child_read, parent_write) = pipe_cloexec().map_err(spawn_err)?;
        let (parent_read, child_write) = pipe_cloexec().map_err(spawn_err)?;

        let mut command = Command::new(binary);
        command
            .args(CHROMIUM_FLAGS)
            .args(extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let child_read_raw = child_read.as_raw_fd();
        let child_write_raw = child_write.as_raw_fd();
        // SAFETY: the hook only calls async-signal-safe fcntl/dup2 on descriptors that stay open
        // in the parent until spawn returns.
        unsafe {
            command.pre_exec(move || {
                // Lift both ends out of the 3..=4 range first so one dup2 cannot clobber the
                // source of the other.
                let read_fd = libc::fcntl(child_read_raw, libc::F_DUPFD_CLOEXEC, 10);
                if read_fd < 0 {
                    return Err(io::Error::last_os_error());
                }
                let write_fd = libc::fcntl(child_write_raw, libc::F_DUPFD_CLOEXEC, 10);
                if write_fd < 0 {
                    return Err(io::Error::last_os_error());
                }
                // dup2 clears close-on-exec on the target only.
                if libc::dup2(read_fd, CHILD_READ_FD) < 0 {
                    return Err(io::Error::last_os_error());
                }
                if libc::dup2(write_fd, CHILD_WRITE_FD) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = command.spawn().map_err(spawn_err)?;
        info!(
            target: "cdp-pipe",
            pid = child.id(),
            binary = %binary.display(),
            "spawned chromium"
        );

        // The parent must not hold the child's ends, or EOF never arrives when Chromium exits.
        drop(child_read);
        drop(child_write);

        let reader = pipe::Receiver::from_file(File::from(parent_read)).map_err(spawn_err)?;
        let writer = pipe::Sender::from_file(File::from(parent_write)).map_err(spawn_err)?;
        debug!(target: "cdp-pipe", "debugging pipes attached");

        Ok(Self {
            child,
            reader,
            writer,
        })
    }

    pub fn into_parts(self) -> (Child, PipeReader, PipeWriter) {
        (self.child, self.reader, self.writer)
    }
}

/// `(read_end, write_end)`, both close-on-exec.
fn pipe_cloexec() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: `fds` is a valid two-element buffer for pipe2 to fill.
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pipe2 succeeded, so both descriptors are open and owned by nobody else.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}
