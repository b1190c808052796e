//! The remote-serial debugger stub: a TCP accept point opened opportunistically
//! on fault so an operator can attach a remote debugger. The wire protocol
//! itself is an external collaborator and is not implemented here — this
//! module only owns the listen/accept/timeout contract a worker relies on.

use std::io;
use std::net::TcpListener;
use std::time::{Duration, Instant};

use tracing::{info, warn};

/// Port the debugger stub listens on.
pub const DEBUGGER_PORT: u16 = 2159;
/// How long `open_debugger` waits for a connection before giving up.
pub const DEBUGGER_ACCEPT_TIMEOUT: Duration = Duration::from_secs(60);

/// Bind the debugger port and block until a client connects or the accept
/// timeout elapses. Never returns an error to the caller: a stub that cannot
/// bind, or that nobody connects to, must not itself crash the worker.
pub fn open_debugger(worker_index: usize) {
    let listener = match TcpListener::bind(("0.0.0.0", DEBUGGER_PORT)) {
        Ok(l) => l,
        Err(err) => {
            warn!(worker_index, %err, "could not bind debugger port");
            return;
        }
    };
    if let Err(err) = listener.set_nonblocking(true) {
        warn!(worker_index, %err, "could not configure debugger listener");
        return;
    }

    let deadline = Instant::now() + DEBUGGER_ACCEPT_TIMEOUT;
    loop {
        match listener.accept() {
            Ok((_stream, peer)) => {
                info!(worker_index, %peer, "debugger attached");
                return;
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    info!(worker_index, "debugger accept timed out, resuming");
                    return;
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(err) => {
                warn!(worker_index, %err, "debugger accept failed");
                return;
            }
        }
    }
}
