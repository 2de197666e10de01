//! The server: one listening socket, a shared worker pool and any number of mounted
//! applications, routed by longest context path.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::core::config::ServerConfig;
use crate::core::conn::{self, WorkerHandle};
use crate::core::context::AppContext;
use crate::core::descriptor::AppDescriptor;
use crate::core::error::{ConfigError, ServerError};
use crate::core::http::{Request, Response};
use crate::core::listener::{HttpListener, Listener};
use crate::core::registry::Factories;
use crate::core::states::{AsyncController, ControlMessage, ServerStates};
use crate::core::syncpool::ResourcePool;
use crate::parking_lot::{Mutex, RwLock};
use crate::support::debug::{self, InfoLevel};
use crate::support::scheduler::Scheduler;

const CONTROL_POLL: Duration = Duration::from_millis(200);
const WAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// Builds a server: configure, mount applications, then [`start`](HttpServer::start).
///
/// ```no_run
/// use rusty_appserver::prelude::*;
///
/// let factories = Factories::new();
/// let app = AppDescriptor::new("site", "");
///
/// let handle = HttpServer::new(ServerConfig::new(), factories)
///     .mount(app)?
///     .start()?;
///
/// println!("serving on {}", handle.local_addr());
/// handle.wait();
/// # Ok::<(), ServerError>(())
/// ```
pub struct HttpServer {
    config: ServerConfig,
    factories: Factories,
    descriptors: Vec<AppDescriptor>,
}

impl HttpServer {
    pub fn new(config: ServerConfig, factories: Factories) -> Self {
        HttpServer {
            config,
            factories,
            descriptors: Vec::new(),
        }
    }

    /// Adjust the configuration before the server starts.
    pub fn config(&mut self) -> &mut ServerConfig {
        &mut self.config
    }

    /// Mount an application. Names and context paths must be unique across the server.
    pub fn mount(mut self, descriptor: AppDescriptor) -> Result<Self, ServerError> {
        let context_path = descriptor.normalized_context_path();

        for mounted in self.descriptors.iter() {
            if mounted.name == descriptor.name {
                return Err(ConfigError::DuplicateName(descriptor.name).into());
            }

            if mounted.normalized_context_path() == context_path {
                return Err(ConfigError::DuplicateContext(context_path).into());
            }
        }

        self.descriptors.push(descriptor);
        Ok(self)
    }

    /// Compile every application, bind the socket and start serving. Configuration errors surface
    /// here, before any connection is accepted.
    pub fn start(self) -> Result<ServerHandle, ServerError> {
        debug::initialize();

        let mut apps = Vec::with_capacity(self.descriptors.len());
        for descriptor in self.descriptors.iter() {
            apps.push(Arc::new(AppContext::build(descriptor, &self.factories)?));
        }
        sort_by_context(&mut apps);

        let socket = TcpListener::bind((self.config.get_http_address(), self.config.get_http_port()))?;
        let local_addr = socket.local_addr()?;

        let HttpServer { config, factories, .. } = self;

        let shared = Arc::new_cyclic(|weak: &Weak<ServerShared>| {
            let server = weak.clone();
            ServerShared {
                pool: ResourcePool::new(&config, move |id| conn::spawn_worker(id, server.clone())),
                listener: Box::new(HttpListener::new(&config)),
                apps: RwLock::new(apps),
                states: ServerStates::new(),
                tasks: Mutex::new(Scheduler::new()),
                local_addr,
                factories,
                config,
            }
        });

        for app in shared.apps.read().iter() {
            app.start();
        }

        let threads = match launch(&shared, socket) {
            Ok(threads) => threads,
            Err(err) => {
                shared.shutdown();
                return Err(ServerError::Threads(err));
            }
        };

        shared.states.toggle_running_state(true);
        debug::print(&format!("Listening for connections on {}", local_addr), InfoLevel::Info);

        Ok(ServerHandle {
            controller: shared.states.get_courier(),
            shared,
            threads,
        })
    }
}

/// Start workers, background tasks, the control loop and the accept loop.
fn launch(shared: &Arc<ServerShared>, socket: TcpListener) -> std::io::Result<Vec<JoinHandle<()>>> {
    shared.pool.workers().prestart(shared.config.get_startup_workers())?;

    {
        let mut tasks = shared.tasks.lock();

        let server = Arc::downgrade(shared);
        tasks.every("pool-trim", shared.config.get_pool_trim_period(), move || {
            if let Some(server) = server.upgrade() {
                let trimmed = server.pool.workers().trim_idle();
                if trimmed > 0 {
                    tracing::debug!(trimmed, "retired idle request handlers");
                }
            }
        })?;

        let server = Arc::downgrade(shared);
        tasks.every("session-sweep", shared.config.get_session_sweep_period(), move || {
            if let Some(server) = server.upgrade() {
                server.sweep_sessions();
            }
        })?;
    }

    let control = {
        let server = Arc::clone(shared);
        thread::Builder::new()
            .name("server-control".to_owned())
            .spawn(move || control_loop(&server))?
    };

    let acceptor = {
        let server = Arc::clone(shared);
        thread::Builder::new()
            .name("acceptor".to_owned())
            .spawn(move || accept_loop(&server, socket))?
    };

    Ok(vec![acceptor, control])
}

fn accept_loop(server: &ServerShared, socket: TcpListener) {
    for stream in socket.incoming() {
        if server.is_shutting_down() {
            break;
        }

        match stream {
            Ok(stream) => server.hand_off(stream),
            Err(err) => debug::print(
                &format!("Failed to receive the upcoming stream: {}", err),
                InfoLevel::Warning,
            ),
        }
    }

    tracing::debug!("accept loop stopped");
}

fn control_loop(server: &ServerShared) {
    while !server.is_shutting_down() {
        let envelope = match server.states.courier_recv(CONTROL_POLL) {
            Some(envelope) => envelope,
            None => continue,
        };

        let outcome = match envelope.message {
            ControlMessage::Terminate => {
                server.shutdown();
                Ok(())
            }
            ControlMessage::Reload(name) => server.reload(&name),
        };

        if let Some(reply) = envelope.reply {
            let _ = reply.send(outcome);
        } else if let Err(err) = outcome {
            debug::print(&format!("Control message failed: {}", err), InfoLevel::Error);
        }
    }

    server.states.close_courier();
}

fn sort_by_context(apps: &mut [Arc<AppContext>]) {
    apps.sort_by(|a, b| b.context_path().len().cmp(&a.context_path().len()));
}

/// Whether `uri` falls under `context_path`. The root context claims everything.
fn claims(context_path: &str, uri: &str) -> bool {
    if context_path.is_empty() {
        return true;
    }

    match uri.strip_prefix(context_path) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || rest.starts_with('?'),
        None => false,
    }
}

/// State shared by the accept loop, the control loop, background tasks and every worker.
pub(crate) struct ServerShared {
    config: ServerConfig,
    factories: Factories,
    apps: RwLock<Vec<Arc<AppContext>>>,
    pool: ResourcePool<WorkerHandle>,
    listener: Box<dyn Listener>,
    states: ServerStates,
    tasks: Mutex<Scheduler>,
    local_addr: SocketAddr,
}

impl ServerShared {
    #[inline]
    pub(crate) fn listener(&self) -> &dyn Listener {
        self.listener.as_ref()
    }

    #[inline]
    pub(crate) fn pool(&self) -> &ResourcePool<WorkerHandle> {
        &self.pool
    }

    #[inline]
    pub(crate) fn is_shutting_down(&self) -> bool {
        self.states.is_shutting_down()
    }

    fn app_for(&self, uri: &str) -> Option<Arc<AppContext>> {
        self.apps
            .read()
            .iter()
            .find(|app| claims(app.context_path(), uri))
            .cloned()
    }

    fn app_named(&self, name: &str) -> Option<Arc<AppContext>> {
        self.apps.read().iter().find(|app| app.name() == name).cloned()
    }

    /// Hand the request to the application with the longest matching context path.
    pub(crate) fn route(&self, req: &mut Request, resp: &mut Response) {
        match self.app_for(req.request_uri()) {
            Some(app) => app.process(req, resp),
            None => conn::not_found(req, resp),
        }
    }

    fn hand_off(&self, stream: TcpStream) {
        let worker = match self.pool.acquire_worker() {
            Ok(worker) => worker,
            Err(err) => {
                let workers = self.pool.workers();
                debug::print(
                    &format!(
                        "Connection dropped: {} ({} busy, {} idle, {} retries, {} rejections)",
                        err,
                        workers.used(),
                        workers.idle(),
                        workers.retries(),
                        workers.rejections()
                    ),
                    InfoLevel::Warning,
                );
                return;
            }
        };

        if let Err(stream) = worker.assign(stream) {
            debug::print(
                &format!("Request handler {} is gone, dropping the connection", worker.id()),
                InfoLevel::Error,
            );
            self.pool.workers().forget();
            drop(stream);
        }
    }

    fn sweep_sessions(&self) {
        let apps: Vec<Arc<AppContext>> = self.apps.read().clone();
        for app in apps {
            let swept = app.sessions().sweep_expired();
            if swept > 0 {
                tracing::debug!(app = app.name(), swept, "expired sessions removed");
            }
        }
    }

    /// Rebuild one application from its descriptor. The old instance is torn down first so its
    /// sessions reach the session directory before the new one loads them.
    fn reload(&self, name: &str) -> Result<(), ServerError> {
        if self.is_shutting_down() {
            return Err(ServerError::ControlClosed);
        }

        let old = self
            .app_named(name)
            .ok_or_else(|| ServerError::UnknownApp(name.to_owned()))?;
        let fresh = Arc::new(AppContext::build(old.descriptor(), &self.factories)?);

        old.destroy();
        fresh.start();

        {
            let mut apps = self.apps.write();
            for slot in apps.iter_mut() {
                if Arc::ptr_eq(slot, &old) {
                    *slot = Arc::clone(&fresh);
                }
            }
        }

        debug::print(&format!("Application {} reloaded", name), InfoLevel::Info);
        Ok(())
    }

    /// Stop accepting, stop background tasks, retire idle workers and tear down every
    /// application. Connections in flight finish their current request.
    fn shutdown(&self) {
        if !self.states.begin_shutdown() {
            return;
        }

        debug::print("Shutting down...", InfoLevel::Info);
        self.wake_acceptor();
        self.tasks.lock().stop();
        self.pool.workers().retire_all();

        let apps: Vec<Arc<AppContext>> = self.apps.read().clone();
        for app in apps.iter().rev() {
            app.destroy();
        }

        self.states.toggle_running_state(false);
    }

    /// The accept loop only notices shutdown when a connection arrives, so make one.
    fn wake_acceptor(&self) {
        let mut target = self.local_addr;
        if target.ip().is_unspecified() {
            target.set_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
        }

        if let Err(err) = TcpStream::connect_timeout(&target, WAKE_TIMEOUT) {
            tracing::debug!(error = %err, "unable to wake the accept loop");
        }
    }
}

/// A running server. Dropping the handle shuts the server down.
pub struct ServerHandle {
    shared: Arc<ServerShared>,
    controller: AsyncController,
    threads: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// A controller that can be moved to another thread to reload or stop the server.
    #[inline]
    #[must_use]
    pub fn get_courier(&self) -> AsyncController {
        self.controller.clone()
    }

    /// The running instance of the named application.
    pub fn app(&self, name: &str) -> Option<Arc<AppContext>> {
        self.shared.app_named(name)
    }

    pub fn is_running(&self) -> bool {
        self.shared.states.is_running()
    }

    /// Rebuild the named application from its descriptor. Blocks until the reload is done.
    pub fn reload(&self, name: &str) -> Result<(), ServerError> {
        self.controller.request(ControlMessage::Reload(name.to_owned()))
    }

    /// Block until some controller sends [`ControlMessage::Terminate`].
    pub fn wait(mut self) {
        self.join_threads();
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shared.shutdown();
        self.join_threads();
    }

    fn join_threads(&mut self) {
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                debug::print("A server thread ended with a panic", InfoLevel::Error);
            }
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            self.stop();
        }
    }
}
