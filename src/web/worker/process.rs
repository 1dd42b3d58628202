//! Worker child process handle.
//!
//! The worker's stdout and stderr share one pipe so log lines keep their
//! order and the ready marker can appear on either stream. The handle can be
//! waited on and killed from different threads at the same time.

use std::io::{self, Read};
use std::net::TcpListener;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};

use super::invocation::{Invocation, CHILD_ADDR};

/// Exit code recorded when the worker could not be started at all.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 127;

/// Streams handed to the supervisor after spawn.
pub struct WorkerIo {
    pub stdin: ChildStdin,
    /// Combined stdout + stderr.
    pub output: Box<dyn Read + Send>,
}

pub struct WorkerProcess {
    child: Mutex<Child>,
    pid: u32,
}

impl WorkerProcess {
    pub fn spawn(invocation: &Invocation) -> io::Result<(Self, WorkerIo)> {
        info!("Spawning worker: {}", invocation.command_line());

        // The command owns the parent's copies of the pipe write ends; it
        // must be dropped after spawn so the reader sees EOF on exit.
        let (mut child, output) = {
            let mut command = Command::new(&invocation.program);
            command
                .args(&invocation.args)
                .envs(invocation.env.iter().map(|(k, v)| (k, v)))
                .stdin(Stdio::piped());
            spawn_with_combined_output(command)?
        };

        let stdin = match child.stdin.take() {
            Some(stdin) => stdin,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(io::Error::other("worker stdin not available"));
            }
        };

        let pid = child.id();
        debug!("Worker started with pid {pid}");
        Ok((
            Self {
                child: Mutex::new(child),
                pid,
            },
            WorkerIo { stdin, output },
        ))
    }

    /// Block until the worker exits and return its exit code. A worker
    /// killed by signal N reports 128 + N.
    pub fn wait_exit(&self) -> i32 {
        #[cfg(unix)]
        self.wait_exited_without_reaping();

        #[cfg(not(unix))]
        loop {
            match self.lock_child().try_wait() {
                Ok(Some(_)) | Err(_) => break,
                Ok(None) => std::thread::sleep(std::time::Duration::from_millis(50)),
            }
        }

        match self.lock_child().wait() {
            Ok(status) => exit_code_of(status),
            Err(e) => {
                warn!("Failed to reap worker {}: {e}", self.pid);
                -1
            }
        }
    }

    /// Wait for exit but leave the process a zombie, so `kill` can never hit
    /// a recycled pid and the child lock isn't held while blocking.
    #[cfg(unix)]
    fn wait_exited_without_reaping(&self) {
        loop {
            // SAFETY: an all-zero siginfo_t is a valid out-parameter.
            let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
            // SAFETY: `info` outlives the call; the pid belongs to our child.
            let rc = unsafe {
                libc::waitid(
                    libc::P_PID,
                    self.pid as libc::id_t,
                    &mut info,
                    libc::WEXITED | libc::WNOWAIT,
                )
            };
            if rc == 0 {
                return;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                warn!("waitid failed for worker {}: {err}", self.pid);
                return;
            }
        }
    }

    /// Force-kill the worker. Safe to call after it exited.
    pub fn kill(&self) {
        if let Err(e) = self.lock_child().kill() {
            debug!("Kill of worker {} failed: {e}", self.pid);
        }
    }

    fn lock_child(&self) -> MutexGuard<'_, Child> {
        self.child.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        let mut child = self.lock_child();
        if let Ok(None) = child.try_wait() {
            warn!("Killing orphaned worker {}", self.pid);
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

#[cfg(unix)]
fn spawn_with_combined_output(mut command: Command) -> io::Result<(Child, Box<dyn Read + Send>)> {
    let (read, write) = unix_pipe::combined_pipe()?;
    command
        .stdout(Stdio::from(write.try_clone()?))
        .stderr(Stdio::from(write));
    let child = command.spawn()?;
    Ok((child, Box::new(read)))
}

#[cfg(not(unix))]
fn spawn_with_combined_output(mut command: Command) -> io::Result<(Child, Box<dyn Read + Send>)> {
    command.stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut child = command.spawn()?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (tx, rx) = crossbeam_channel::unbounded::<Vec<u8>>();
    for stream in [
        stdout.map(|s| Box::new(s) as Box<dyn Read + Send>),
        stderr.map(|s| Box::new(s) as Box<dyn Read + Send>),
    ]
    .into_iter()
    .flatten()
    {
        let tx = tx.clone();
        std::thread::spawn(move || {
            let mut reader = io::BufReader::new(stream);
            loop {
                let mut line = Vec::new();
                match io::BufRead::read_until(&mut reader, b'\n', &mut line) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }
    Ok((child, Box::new(MergedOutput { rx, pending: Vec::new() })))
}

/// Line-interleaved reader over two child streams.
#[cfg(not(unix))]
struct MergedOutput {
    rx: crossbeam_channel::Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

#[cfg(not(unix))]
impl Read for MergedOutput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv() {
                Ok(line) => self.pending = line,
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

#[cfg(unix)]
mod unix_pipe {
    use std::fs::File;
    use std::io;
    use std::os::fd::{FromRawFd, OwnedFd};

    /// A close-on-exec pipe: (read end, write end).
    pub fn combined_pipe() -> io::Result<(File, OwnedFd)> {
        let mut fds = [0 as libc::c_int; 2];
        create(&mut fds)?;
        // SAFETY: the pipe call succeeded, so both descriptors are open and
        // owned by nobody else.
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        Ok((File::from(read), write))
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn create(fds: &mut [libc::c_int; 2]) -> io::Result<()> {
        // SAFETY: `fds` points at two writable c_ints.
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn create(fds: &mut [libc::c_int; 2]) -> io::Result<()> {
        // SAFETY: `fds` points at two writable c_ints.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        for fd in fds.iter() {
            // SAFETY: `fd` was just returned by pipe().
            let ok = unsafe {
                let flags = libc::fcntl(*fd, libc::F_GETFD);
                flags >= 0 && libc::fcntl(*fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) >= 0
            };
            if !ok {
                let err = io::Error::last_os_error();
                // SAFETY: closing descriptors we own and never hand out.
                unsafe {
                    libc::close(fds[0]);
                    libc::close(fds[1]);
                }
                return Err(err);
            }
        }
        Ok(())
    }
}

/// Ask the OS for a free loopback port.
pub fn pick_free_port() -> io::Result<u16> {
    let listener = TcpListener::bind((CHILD_ADDR, 0))?;
    Ok(listener.local_addr()?.port())
}
