//! Blocking TCP server for the interop socket.
//!
//! One external tool at a time: the first connection is served until it
//! terminates or disconnects, and any connection attempt made while one is
//! active is accepted and immediately closed. Decoded commands are handed
//! to the session through the caller's handler.

use std::io::Read;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::codec::{Command, CommandDecoder};

/// Fixed port of the interop wire contract.
pub const INTEROP_PORT: u16 = 39393;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Consecutive accept failures tolerated before the server gives up.
const MAX_ACCEPT_FAILURES: u32 = 16;

/// Accept-error budget: transient failures back off and retry, a persistent
/// streak stops the server instead of spinning the loop hot.
struct AcceptRetry {
    failures: u32,
}

impl AcceptRetry {
    fn new() -> AcceptRetry {
        AcceptRetry { failures: 0 }
    }

    /// Records a failure; returns false once the budget is exhausted.
    fn failed(&mut self) -> bool {
        self.failures += 1;
        self.failures < MAX_ACCEPT_FAILURES
    }

    fn succeeded(&mut self) {
        self.failures = 0;
    }
}

pub struct ServerHandle {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn shutdown(mut self) {
        self.request_shutdown();
        if let Some(task) = self.task.take() {
            let _ = task.join();
        }
    }

    fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // Unblock the accept call.
        let _ = TcpStream::connect(self.addr);
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.request_shutdown();
        if let Some(task) = self.task.take() {
            let _ = task.join();
        }
    }
}

/// Binds `port` (0 picks an ephemeral port, used by tests) and serves
/// connections on a background thread until the handle shuts down.
pub fn start_server<H>(port: u16, handler: H) -> std::io::Result<ServerHandle>
where
    H: FnMut(Command) + Send + 'static,
{
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))?;
    let addr = listener.local_addr()?;
    let shutdown = Arc::new(AtomicBool::new(false));
    let handler = Arc::new(Mutex::new(handler));

    let task = {
        let shutdown = Arc::clone(&shutdown);
        std::thread::spawn(move || accept_loop(listener, shutdown, handler))
    };

    info!(%addr, "interop server listening");
    Ok(ServerHandle {
        addr,
        shutdown,
        task: Some(task),
    })
}

fn accept_loop<H>(listener: TcpListener, shutdown: Arc<AtomicBool>, handler: Arc<Mutex<H>>)
where
    H: FnMut(Command) + Send + 'static,
{
    let active = Arc::new(AtomicBool::new(false));
    let mut retry = AcceptRetry::new();
    loop {
        let (stream, peer) = match listener.accept() {
            Ok(pair) => pair,
            Err(e) => {
                if shutdown.load(Ordering::SeqCst) {
                    return;
                }
                if !retry.failed() {
                    warn!("interop accept failing persistently, stopping server: {e}");
                    return;
                }
                warn!("interop accept failed, retrying: {e}");
                std::thread::sleep(POLL_INTERVAL);
                continue;
            }
        };
        retry.succeeded();
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        if active.swap(true, Ordering::SeqCst) {
            // A tool is already connected; close the newcomer.
            debug!(%peer, "rejecting second interop connection");
            drop(stream);
            continue;
        }

        info!(%peer, "interop connection accepted");
        let active = Arc::clone(&active);
        let shutdown = Arc::clone(&shutdown);
        let handler = Arc::clone(&handler);
        std::thread::spawn(move || {
            serve_connection(stream, &shutdown, &handler);
            active.store(false, Ordering::SeqCst);
        });
    }
}

fn serve_connection<H>(mut stream: TcpStream, shutdown: &AtomicBool, handler: &Mutex<H>)
where
    H: FnMut(Command),
{
    if stream.set_read_timeout(Some(POLL_INTERVAL)).is_err() {
        return;
    }
    let mut decoder = CommandDecoder::new();
    let mut chunk = [0u8; 4096];
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        let read = match stream.read(&mut chunk) {
            Ok(0) => {
                debug!("interop peer disconnected");
                return;
            }
            Ok(n) => n,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                warn!("interop read failed: {e}");
                return;
            }
        };
        decoder.push(&chunk[..read]);
        loop {
            match decoder.next_command() {
                Ok(Some(Command::Terminate)) => {
                    if let Ok(mut h) = handler.lock() {
                        (*h)(Command::Terminate);
                    }
                    debug!("interop peer terminated");
                    return;
                }
                Ok(Some(command)) => {
                    if let Ok(mut h) = handler.lock() {
                        (*h)(command);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("interop protocol violation: {e}");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::mpsc;

    use crate::codec::encode_command;

    fn start_test_server() -> (ServerHandle, mpsc::Receiver<Command>) {
        let (tx, rx) = mpsc::channel();
        let handle = start_server(0, move |command| {
            let _ = tx.send(command);
        })
        .unwrap();
        (handle, rx)
    }

    #[test]
    fn accept_error_budget_is_bounded_and_resets_on_success() {
        let mut retry = AcceptRetry::new();
        for _ in 0..MAX_ACCEPT_FAILURES - 1 {
            assert!(retry.failed(), "within budget, must keep retrying");
        }
        assert!(!retry.failed(), "budget exhausted, must stop");

        let mut retry = AcceptRetry::new();
        for _ in 0..MAX_ACCEPT_FAILURES - 1 {
            assert!(retry.failed());
        }
        retry.succeeded();
        assert!(retry.failed(), "a successful accept resets the streak");
    }

    #[test]
    fn commands_flow_from_socket_to_handler() {
        let (handle, rx) = start_test_server();
        let mut stream = TcpStream::connect(handle.local_addr()).unwrap();

        let wire = encode_command(&Command::SetEvent {
            linear_id: 42,
            command_buffer_id: 7,
            event_name: "Draw".to_owned(),
        });
        stream.write_all(wire.as_bytes()).unwrap();

        let received = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(
            received,
            Command::SetEvent {
                linear_id: 42,
                command_buffer_id: 7,
                event_name: "Draw".to_owned(),
            }
        );
        handle.shutdown();
    }

    #[test]
    fn second_connection_is_closed_immediately() {
        let (handle, rx) = start_test_server();
        let mut first = TcpStream::connect(handle.local_addr()).unwrap();

        // Make sure the first connection is the active one before the
        // second attempt races in.
        first
            .write_all(
                encode_command(&Command::Initialize {
                    version: 1,
                    name: "tool".to_owned(),
                })
                .as_bytes(),
            )
            .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let mut second = TcpStream::connect(handle.local_addr()).unwrap();
        second
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut buf = [0u8; 1];
        // EOF, not data and not a hang.
        assert_eq!(second.read(&mut buf).unwrap(), 0);

        drop(first);
        handle.shutdown();
    }

    #[test]
    fn terminate_closes_the_connection_but_not_the_server() {
        let (handle, rx) = start_test_server();

        let mut first = TcpStream::connect(handle.local_addr()).unwrap();
        first
            .write_all(encode_command(&Command::Terminate).as_bytes())
            .unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            Command::Terminate
        );

        // The slot frees up; a new tool can connect and talk.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let mut next = TcpStream::connect(handle.local_addr()).unwrap();
            next.write_all(encode_command(&Command::Terminate).as_bytes())
                .unwrap();
            if rx.recv_timeout(Duration::from_millis(500)).is_ok() {
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "connection slot never freed"
            );
        }
        handle.shutdown();
    }
}
