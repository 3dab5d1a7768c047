//! Process-duplication backend.
//!
//! `spawn` forks. The child runs the work and leaves through `_exit` with
//! one of two sentinel codes, [`FULFILLED_EXIT`] or [`REJECTED_EXIT`]. Since
//! the child's memory is discarded, `notify` also writes the outcome to a
//! pipe as a length-prefixed JSON frame that the parent decodes in `wait`.
//! Any other exit status surfaces as [`Error::UnexpectedExitCode`].
//!
//! Nothing is logged on the child side: a subscriber lock held by a thread
//! that did not survive the fork would never be released.
use parking_lot::Mutex;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::panic::{self, AssertUnwindSafe};
use std::task::Poll;
use std::thread;

use super::{Drive, Work};
use crate::slot::Outcome;
use crate::{Error, Status};

pub const FULFILLED_EXIT: i32 = 127;
pub const REJECTED_EXIT: i32 = 128;
/// The child returned from its work without notifying.
const UNSIGNALED_EXIT: i32 = 1;

#[derive(Debug)]
enum Role {
    Idle,
    Parent { pid: libc::pid_t, payload: File },
    Child { payload: File },
    Reaped,
}

#[derive(Debug)]
pub struct ForkDriver {
    role: Mutex<Role>,
}

impl ForkDriver {
    pub fn new() -> Result<Self, Error> {
        Ok(ForkDriver {
            role: Mutex::new(Role::Idle),
        })
    }

    /// Whether this copy of the driver lives in the forked child.
    pub fn is_child(&self) -> bool {
        matches!(*self.role.lock(), Role::Child { .. })
    }

    fn finish(pid: libc::pid_t, mut payload: File) -> Result<Option<Outcome>, Error> {
        // Read before reaping: a child blocked on a full pipe never exits.
        let frame = read_frame(&mut payload);
        let code = reap(pid)?;
        tracing::debug!(pid, code, "child process reaped");
        let expected = match code {
            FULFILLED_EXIT => Status::Fulfilled,
            REJECTED_EXIT => Status::Rejected,
            other => return Err(Error::UnexpectedExitCode(other)),
        };
        let outcome = frame?;
        if outcome.status() != expected {
            return Err(Error::UnexpectedExitCode(code));
        }
        Ok(Some(outcome))
    }
}

fn misuse(role: &Role) -> Error {
    Error::PreconditionViolation(match role {
        Role::Idle => "the fork driver was never spawned",
        Role::Child { .. } => "cannot wait in the child process, wait in the parent",
        Role::Parent { .. } => "cannot notify in the parent process, notify in the child",
        Role::Reaped => "the child process was already reaped",
    })
}

impl Drive for ForkDriver {
    fn spawn(&self, work: Work) -> Result<(), Error> {
        let mut role = self.role.lock();
        if !matches!(*role, Role::Idle) {
            return Err(Error::PreconditionViolation("the fork driver spawns only once"));
        }
        let (reader, writer) = pipe()?;
        // SAFETY: the child only runs `work` and always leaves through
        // `_exit`, it never returns into the caller's stack.
        match unsafe { libc::fork() } {
            -1 => Err(io::Error::last_os_error().into()),
            0 => {
                drop(reader);
                *role = Role::Child { payload: writer };
                drop(role);
                let _ = panic::catch_unwind(AssertUnwindSafe(work));
                // SAFETY: terminating the child without running the
                // parent's destructors or atexit handlers.
                unsafe { libc::_exit(UNSIGNALED_EXIT) }
            }
            pid => {
                drop(writer);
                tracing::debug!(pid, "forked unit of work");
                *role = Role::Parent {
                    pid,
                    payload: reader,
                };
                Ok(())
            }
        }
    }

    fn wait(&self) -> Result<Option<Outcome>, Error> {
        let mut role = self.role.lock();
        match std::mem::replace(&mut *role, Role::Reaped) {
            Role::Parent { pid, payload } => {
                drop(role);
                Self::finish(pid, payload)
            }
            other => {
                let err = misuse(&other);
                *role = other;
                Err(err)
            }
        }
    }

    fn notify(&self, outcome: &Outcome) -> Result<(), Error> {
        let mut role = self.role.lock();
        match &mut *role {
            Role::Child { payload } => {
                let code = match write_frame(payload, outcome) {
                    Ok(()) if outcome.is_fulfilled() => FULFILLED_EXIT,
                    Ok(()) => REJECTED_EXIT,
                    Err(_) => UNSIGNALED_EXIT,
                };
                // SAFETY: see `spawn`, the child ends here.
                unsafe { libc::_exit(code) }
            }
            other => Err(misuse(other)),
        }
    }

    fn poll(&self) -> Result<Poll<Option<Outcome>>, Error> {
        let role = self.role.lock();
        let fd = match &*role {
            Role::Parent { payload, .. } => payload.as_raw_fd(),
            other => return Err(misuse(other)),
        };
        let mut pollfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: one valid pollfd, zero timeout.
        let ready = unsafe { libc::poll(&mut pollfd, 1, 0) };
        if ready == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Poll::Pending);
            }
            return Err(err.into());
        }
        if ready == 0 {
            return Ok(Poll::Pending);
        }
        // The child is writing its frame or gone: finishing no longer
        // blocks for long.
        drop(role);
        self.wait().map(Poll::Ready)
    }

    fn needs_polling(&self) -> bool {
        true
    }

    fn crosses_address_space(&self) -> bool {
        true
    }
}

impl Drop for ForkDriver {
    /// Reaps a child nobody waited for. The pipe closes first, so a child
    /// still writing its frame gets EPIPE instead of blocking.
    fn drop(&mut self) {
        let (pid, payload) = match std::mem::replace(self.role.get_mut(), Role::Reaped) {
            Role::Parent { pid, payload } => (pid, payload),
            _ => return,
        };
        drop(payload);
        let mut status = 0;
        // SAFETY: non-blocking reap of our own child.
        if unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) } != 0 {
            return;
        }
        tracing::debug!(pid, "reaping the running child of a dropped fork driver");
        let reaper = thread::Builder::new()
            .name(format!("fork-reaper-{}", pid))
            .spawn(move || reap(pid));
        if let Err(e) = reaper {
            tracing::warn!(pid, error = %e, "no reaper thread, reaping inline");
            let _ = reap(pid);
        }
    }
}

fn pipe() -> io::Result<(File, File)> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: `fds` has room for the two descriptors pipe() writes.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: both descriptors are fresh and owned by nobody else.
    Ok(unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) })
}

fn write_frame(payload: &mut File, outcome: &Outcome) -> Result<(), Error> {
    let body = serde_json::to_vec(outcome)?;
    payload.write_all(&(body.len() as u64).to_le_bytes())?;
    payload.write_all(&body)?;
    payload.flush()?;
    Ok(())
}

fn read_frame(payload: &mut File) -> Result<Outcome, Error> {
    let mut len = [0u8; 8];
    payload.read_exact(&mut len)?;
    let mut body = vec![0u8; u64::from_le_bytes(len) as usize];
    payload.read_exact(&mut body)?;
    Ok(serde_json::from_slice(&body)?)
}

/// Blocks until `pid` terminates and returns its exit code. A signal death
/// maps to `128 + signal`, as shells report it.
fn reap(pid: libc::pid_t) -> Result<i32, Error> {
    loop {
        let mut status = 0;
        // SAFETY: blocking wait on our own child.
        if unsafe { libc::waitpid(pid, &mut status, 0) } == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err.into());
        }
        if libc::WIFEXITED(status) {
            return Ok(libc::WEXITSTATUS(status));
        }
        if libc::WIFSIGNALED(status) {
            return Ok(128 + libc::WTERMSIG(status));
        }
    }
}
