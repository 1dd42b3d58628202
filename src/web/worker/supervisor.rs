//! Per-run worker supervision.
//!
//! Thread design (all joined before the supervising thread returns):
//! - Output watcher: reads combined worker output line by line, forwards it
//!   to the log and promotes the model to `Loaded` on the ready marker
//! - Stop watcher: waits for an unload request, sends the exit command and
//!   kills the worker if it is still alive after the stop timeout
//! - Supervising thread (reaper): waits for the exit, records it and writes
//!   the final `Unloaded` state

use std::io::{self, BufRead, BufReader, Read};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};

use super::control::{ControlChannel, ControlMessage, StdinControl, READY_MARKER};
use super::process::{WorkerIo, WorkerProcess};
use crate::web::registry::SharedRegistry;

/// Start supervising a freshly spawned worker for model `name`.
pub fn spawn(
    registry: SharedRegistry,
    name: String,
    process: WorkerProcess,
    io: WorkerIo,
    port: u16,
    stop_timeout: Duration,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("supervisor-{port}"))
        .spawn(move || supervise(registry, name, process, io, port, stop_timeout))
}

fn supervise(
    registry: SharedRegistry,
    name: String,
    process: WorkerProcess,
    io: WorkerIo,
    port: u16,
    stop_timeout: Duration,
) {
    let WorkerIo { stdin, output } = io;

    thread::scope(|scope| {
        let output_watcher = scope.spawn(|| watch_output(&registry, &name, output, port));
        let stop_watcher = scope.spawn(|| {
            watch_stop(
                &registry,
                &name,
                &process,
                StdinControl::new(stdin),
                stop_timeout,
            )
        });

        let exit_code = process.wait_exit();
        info!("Worker for model {name} (port {port}) exited with code {exit_code}");
        registry.mark_exited(&name);

        if stop_watcher.join().is_err() {
            warn!("Stop watcher for model {name} panicked");
        }
        if output_watcher.join().is_err() {
            warn!("Output watcher for model {name} panicked");
        }

        registry.finish(&name, exit_code);
    });
}

fn watch_output(registry: &SharedRegistry, name: &str, output: Box<dyn Read + Send>, port: u16) {
    let mut reader = BufReader::new(output);
    let mut ready = false;
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("Output of worker on port {port} closed: {e}");
                break;
            }
        }
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(['\r', '\n']);
        info!(target: "worker", "[{port:5}] {line}");

        if !ready && line.contains(READY_MARKER) {
            ready = true;
            registry.mark_ready(name);
        }
    }
}

fn watch_stop(
    registry: &SharedRegistry,
    name: &str,
    process: &WorkerProcess,
    mut control: impl ControlChannel,
    stop_timeout: Duration,
) {
    if !registry.wait_for_stop_request(name) {
        return;
    }

    info!("Stopping worker for model {name}");
    if let Err(e) = control.send(ControlMessage::Exit) {
        debug!("Could not send exit command to model {name}: {e}");
    }

    if !registry.wait_for_exit(name, stop_timeout) {
        warn!(
            "Worker for model {name} did not exit within {}s, killing it",
            stop_timeout.as_secs()
        );
        process.kill();
    }
    // `control` (the worker's stdin) stays open until here so the worker
    // sees the exit command, not EOF.
}
