//! Line protocol between the router and a worker.
//!
//! Worker -> router: the worker prints [`READY_MARKER`] on its output once it
//! accepts requests.
//! Router -> worker: [`EXIT_COMMAND`] on stdin asks for a graceful shutdown;
//! stdin EOF means the router is gone.

use std::io::{self, BufRead, Write};
use std::thread;

pub const READY_MARKER: &str = "cmd_child_to_router:ready";
pub const EXIT_COMMAND: &str = "cmd_router_to_child:exit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    Exit,
}

impl ControlMessage {
    pub fn as_line(self) -> &'static str {
        match self {
            ControlMessage::Exit => EXIT_COMMAND,
        }
    }

    pub fn parse(line: &str) -> Option<Self> {
        match line.trim() {
            EXIT_COMMAND => Some(ControlMessage::Exit),
            _ => None,
        }
    }
}

/// Router-side handle used to signal a worker.
pub trait ControlChannel: Send {
    fn send(&mut self, message: ControlMessage) -> io::Result<()>;
}

/// Control channel over the worker's stdin (or any writer).
pub struct StdinControl<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> StdinControl<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W: Write + Send> ControlChannel for StdinControl<W> {
    fn send(&mut self, message: ControlMessage) -> io::Result<()> {
        self.writer.write_all(message.as_line().as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }
}

/// Worker-side helper: announce readiness on stdout, then watch stdin on a
/// background thread. The exit command calls `shutdown(0)`; stdin EOF (router
/// died) terminates the process with status 1.
pub fn announce_ready_and_watch<F>(shutdown: F) -> io::Result<thread::JoinHandle<()>>
where
    F: FnOnce(i32) + Send + 'static,
{
    {
        let mut stdout = io::stdout().lock();
        writeln!(stdout, "{READY_MARKER}")?;
        stdout.flush()?;
    }

    thread::Builder::new()
        .name("router-control".to_string())
        .spawn(move || {
            let stdin = io::stdin();
            for line in stdin.lock().lines() {
                match line {
                    Ok(line) if ControlMessage::parse(&line) == Some(ControlMessage::Exit) => {
                        shutdown(0);
                        return;
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
            // Router went away without asking us to exit.
            std::process::exit(1);
        })
}
