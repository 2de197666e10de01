//! Request handler workers and the per-connection keep-alive loop.

use std::net::TcpStream;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Weak;
use std::thread;

use crate::channel::{self, Receiver, Sender};
use crate::core::context::{render_error_page, write_error_page};
use crate::core::error::ConnError;
use crate::core::http::{Request, Response};
use crate::core::listener::Listener;
use crate::core::server::ServerShared;
use crate::core::stream::Stream;
use crate::core::syncpool::Retire;
use crate::support::debug::{self, InfoLevel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnState {
    Idle,
    Allocating,
    ParsingRequestLine,
    ParsingHeaders,
    Dispatching,
    Finishing,
}

pub(crate) enum Assignment {
    Serve(TcpStream),
    Terminate,
}

/// The pool's side of a worker thread. Every worker has its own channel, so handing over a socket
/// wakes exactly that worker.
#[derive(Clone)]
pub(crate) struct WorkerHandle {
    id: usize,
    tx: Sender<Assignment>,
}

impl WorkerHandle {
    #[inline]
    pub(crate) fn id(&self) -> usize {
        self.id
    }

    /// Hand a socket to the worker. On failure the socket comes back.
    pub(crate) fn assign(&self, socket: TcpStream) -> Result<(), TcpStream> {
        match self.tx.send(Assignment::Serve(socket)) {
            Ok(()) => Ok(()),
            Err(err) => match err.into_inner() {
                Assignment::Serve(socket) => Err(socket),
                Assignment::Terminate => Ok(()),
            },
        }
    }
}

impl Retire for WorkerHandle {
    fn retire(self) {
        let _ = self.tx.send(Assignment::Terminate);
    }
}

pub(crate) fn spawn_worker(id: usize, server: Weak<ServerShared>) -> std::io::Result<WorkerHandle> {
    let (tx, rx) = channel::unbounded();
    let handle = WorkerHandle { id, tx };
    let own = handle.clone();

    thread::Builder::new()
        .name(format!("request-handler-{}", id))
        .spawn(move || run_worker(own, rx, server))?;

    Ok(handle)
}

fn run_worker(own: WorkerHandle, rx: Receiver<Assignment>, server: Weak<ServerShared>) {
    tracing::debug!(worker = own.id(), state = ?ConnState::Idle, "worker started");

    while let Ok(Assignment::Serve(socket)) = rx.recv() {
        let shared = match server.upgrade() {
            Some(shared) => shared,
            None => break,
        };

        if panic::catch_unwind(AssertUnwindSafe(|| serve_connection(&shared, socket))).is_err() {
            debug::print(
                &format!("Request handler {} recovered from a panic", own.id()),
                InfoLevel::Error,
            );
        }

        if shared.is_shutting_down() {
            shared.pool().workers().forget();
            break;
        }

        tracing::debug!(worker = own.id(), state = ?ConnState::Idle, "worker released");
        shared.pool().release_worker(own.clone());
    }

    tracing::debug!(worker = own.id(), "worker stopped");
}

fn transition(state: &mut ConnState, next: ConnState) {
    tracing::trace!(from = ?*state, to = ?next, "connection state");
    *state = next;
}

/// Serve every request a connection carries, then give everything back.
pub(crate) fn serve_connection(server: &ServerShared, socket: TcpStream) {
    let listener = server.listener();
    let mut stream = Stream::new(socket);
    let mut state = ConnState::Idle;

    transition(&mut state, ConnState::Allocating);
    let (mut req, mut resp) = match allocate(server, listener, &mut stream) {
        Ok(pair) => pair,
        Err(err) => {
            listener.release_socket(stream);
            debug::print(&format!("Unable to allocate a connection: {}", err), InfoLevel::Warning);
            return;
        }
    };

    let mut first = true;
    let mut in_cycle = false;
    let mut failure: Option<String> = None;

    loop {
        if server.is_shutting_down() {
            break;
        }

        transition(&mut state, ConnState::ParsingRequestLine);
        match listener.parse_request_line(&mut stream, &mut req, first) {
            Ok(true) => in_cycle = true,
            Ok(false) => break,
            Err(ConnError::Malformed(reason)) => {
                in_cycle = true;
                reject_malformed(&mut req, &mut resp, &reason);
                break;
            }
            Err(err) => {
                debug::print(&format!("Failed to read the request: {}", err), InfoLevel::Warning);
                break;
            }
        }

        transition(&mut state, ConnState::ParsingHeaders);
        match listener.parse_headers(&mut stream, &mut req) {
            Ok(()) => {}
            Err(ConnError::Malformed(reason)) => {
                reject_malformed(&mut req, &mut resp, &reason);
                break;
            }
            Err(err) => {
                debug::print(&format!("Failed to read request headers: {}", err), InfoLevel::Warning);
                break;
            }
        }

        transition(&mut state, ConnState::Dispatching);
        resp.bind_request(&req);

        let dispatched = panic::catch_unwind(AssertUnwindSafe(|| server.route(&mut req, &mut resp)));
        if dispatched.is_err() {
            failure = Some(format!("panic while serving {}", req.request_uri()));
            if !resp.is_committed() {
                resp.clear_include_stack();
                let _ = resp.reset();
                resp.set_status(500);
                resp.set_header("Connection", "close");
                write_error_page(&mut resp, &render_error_page(500, "internal error", None, req.request_uri()));
            }
            break;
        }

        transition(&mut state, ConnState::Finishing);
        if let Err(err) = resp.finish() {
            debug::print(&format!("Unable to send the response: {}", err), InfoLevel::Warning);
            break;
        }

        let keep_alive = listener.process_keep_alive(&req, &resp);

        listener.deallocate(&mut req, &mut resp);
        in_cycle = false;
        req.reset();
        resp.reset_for_pool();

        if !keep_alive {
            break;
        }

        if let Err(err) = listener.allocate(&mut stream, &mut req, &mut resp) {
            debug::print(&format!("Unable to re-arm the connection: {}", err), InfoLevel::Warning);
            break;
        }

        first = false;
    }

    // cleanup runs before any failure is reported
    if in_cycle {
        listener.deallocate(&mut req, &mut resp);
    }
    server.pool().release_request(req);
    server.pool().release_response(resp);
    listener.release_socket(stream);

    if let Some(failure) = failure {
        debug::print(&failure, InfoLevel::Error);
    }
}

fn allocate(
    server: &ServerShared,
    listener: &dyn Listener,
    stream: &mut Stream,
) -> Result<(Box<Request>, Box<Response>), ConnError> {
    let mut req = server.pool().acquire_request()?;
    let mut resp = match server.pool().acquire_response() {
        Ok(resp) => resp,
        Err(err) => {
            server.pool().release_request(req);
            return Err(err.into());
        }
    };

    if let Err(err) = listener.allocate(stream, &mut req, &mut resp) {
        server.pool().release_request(req);
        server.pool().release_response(resp);
        return Err(err);
    }

    Ok((req, resp))
}

/// Answer an unparseable request with 400 and close.
fn reject_malformed(req: &mut Request, resp: &mut Response, reason: &str) {
    debug::print(&format!("Malformed request: {}", reason), InfoLevel::Warning);

    resp.bind_request(req);
    resp.set_status(400);
    resp.set_header("Connection", "close");
    write_error_page(resp, &render_error_page(400, reason, None, req.request_uri()));
}

/// The page for requests no mounted application claims.
pub(crate) fn not_found(req: &mut Request, resp: &mut Response) {
    resp.set_status(404);
    write_error_page(resp, &render_error_page(404, "no application is mounted here", None, req.request_uri()));
}
