//! Named handlers and filters, created lazily through factories supplied by the embedding program.
//!
//! Each registration owns its own init lock, so initializing one handler never blocks another.
//! Callers that arrive while an initialization is running wait for its outcome instead of
//! starting a second one. A failed initialization is terminal for the registration: it turns
//! unavailable, drops out of URL resolution, and keeps the original cause for error dispatch.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::core::context::AppContext;
use crate::core::dispatch::RequestDispatcher;
use crate::core::error::{ConfigError, Fault, HandlerError};
use crate::core::http::{Request, Response};
use crate::core::router::MappingTarget;
use crate::hashbrown::HashMap;
use crate::parking_lot::{Condvar, Mutex};
use crate::support::debug::{self, InfoLevel};

pub trait Handler: Send + Sync {
    fn init(&self, _config: &HandlerConfig) -> Result<(), HandlerError> {
        Ok(())
    }

    fn service(
        &self,
        ctx: &AppContext,
        req: &mut Request,
        resp: &mut Response,
    ) -> Result<(), HandlerError>;

    fn destroy(&self) {}
}

/// A filter decides whether the chain continues by calling `chain.do_filter`. Not calling it
/// ends the chain quietly.
pub trait Filter: Send + Sync {
    fn init(&self, _config: &FilterConfig) -> Result<(), HandlerError> {
        Ok(())
    }

    fn do_filter(
        &self,
        ctx: &AppContext,
        req: &mut Request,
        resp: &mut Response,
        chain: &mut RequestDispatcher,
    ) -> Result<(), HandlerError>;

    fn destroy(&self) {}
}

pub type HandlerFactory = Arc<dyn Fn() -> Result<Arc<dyn Handler>, HandlerError> + Send + Sync>;
pub type FilterFactory = Arc<dyn Fn() -> Result<Arc<dyn Filter>, HandlerError> + Send + Sync>;

/// String id to constructor, for handlers and filters alike.
#[derive(Clone, Default)]
pub struct Factories {
    handlers: HashMap<String, HandlerFactory>,
    filters: HashMap<String, FilterFactory>,
}

impl Factories {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn register_handler<F>(&mut self, id: &str, factory: F) -> &mut Self
    where
        F: Fn() -> Result<Arc<dyn Handler>, HandlerError> + Send + Sync + 'static,
    {
        self.handlers.insert(id.to_owned(), Arc::new(factory));
        self
    }

    pub fn register_filter<F>(&mut self, id: &str, factory: F) -> &mut Self
    where
        F: Fn() -> Result<Arc<dyn Filter>, HandlerError> + Send + Sync + 'static,
    {
        self.filters.insert(id.to_owned(), Arc::new(factory));
        self
    }

    pub(crate) fn handler_factory(&self, id: &str) -> Option<HandlerFactory> {
        self.handlers.get(id).cloned()
    }

    pub(crate) fn filter_factory(&self, id: &str) -> Option<FilterFactory> {
        self.filters.get(id).cloned()
    }
}

#[derive(Debug, Clone, Default)]
pub struct HandlerConfig {
    name: String,
    init_params: Vec<(String, String)>,
}

pub type FilterConfig = HandlerConfig;

impl HandlerConfig {
    pub fn new(name: &str, init_params: Vec<(String, String)>) -> Self {
        HandlerConfig {
            name: name.to_owned(),
            init_params,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn init_parameter(&self, key: &str) -> Option<&str> {
        self.init_params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[inline]
    pub fn init_parameters(&self) -> &[(String, String)] {
        &self.init_params
    }
}

enum InitState<T: ?Sized> {
    Uninitialized,
    Initializing,
    Ready(Arc<T>),
    Unavailable(HandlerError),
}

/// Single-flight lazy slot shared by handler and filter registrations.
struct InitCell<T: ?Sized> {
    state: Mutex<InitState<T>>,
    ready: Condvar,
    live: AtomicBool,
}

impl<T: ?Sized> InitCell<T> {
    fn new() -> Self {
        InitCell {
            state: Mutex::new(InitState::Uninitialized),
            ready: Condvar::new(),
            live: AtomicBool::new(true),
        }
    }

    /// The flag tells whether this call was the one that observed the failure.
    fn get_or_init<F>(&self, init: F) -> (Result<Arc<T>, HandlerError>, bool)
    where
        F: FnOnce() -> Result<Arc<T>, HandlerError>,
    {
        let mut state = self.state.lock();

        loop {
            match &*state {
                InitState::Ready(instance) => return (Ok(Arc::clone(instance)), false),
                InitState::Unavailable(cause) => return (Err(cause.clone()), false),
                InitState::Initializing => self.ready.wait(&mut state),
                InitState::Uninitialized => break,
            }
        }

        *state = InitState::Initializing;
        drop(state);

        // now run the initializer without holding the lock; waiters park on the condvar
        let outcome = match panic::catch_unwind(AssertUnwindSafe(init)) {
            Ok(result) => result,
            Err(_) => Err(HandlerError::Fatal("initialization panicked".to_owned())),
        };

        let mut state = self.state.lock();
        let result = match outcome {
            Ok(instance) => {
                *state = InitState::Ready(Arc::clone(&instance));
                Ok(instance)
            }
            Err(cause) => {
                self.live.store(false, Ordering::Release);
                *state = InitState::Unavailable(cause.clone());
                Err(cause)
            }
        };

        self.ready.notify_all();
        let failed = result.is_err();
        (result, failed)
    }

    fn mark_unavailable(&self, cause: HandlerError) -> Option<Arc<T>> {
        let mut state = self.state.lock();
        self.live.store(false, Ordering::Release);

        match std::mem::replace(&mut *state, InitState::Unavailable(cause)) {
            InitState::Ready(instance) => Some(instance),
            _ => None,
        }
    }

    fn unavailable_cause(&self) -> Option<HandlerError> {
        match &*self.state.lock() {
            InitState::Unavailable(cause) => Some(cause.clone()),
            _ => None,
        }
    }

    fn is_ready(&self) -> bool {
        matches!(&*self.state.lock(), InitState::Ready(_))
    }

    #[inline]
    fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }
}

fn stopped() -> HandlerError {
    HandlerError::Unavailable(Fault::new("unavailable.stopped", "the application has stopped"))
}

fn missing_factory(target: &str) -> HandlerError {
    HandlerError::Unavailable(Fault::new(
        "unavailable.missing",
        &format!("no factory is registered as `{}`", target),
    ))
}

pub struct HandlerRegistration {
    config: HandlerConfig,
    target: String,
    load_on_startup: Option<i32>,
    factory: Option<HandlerFactory>,
    cell: InitCell<dyn Handler>,
    serial: Option<Mutex<()>>,
}

impl HandlerRegistration {
    pub fn new(
        config: HandlerConfig,
        target: &str,
        load_on_startup: Option<i32>,
        single_threaded: bool,
        factory: Option<HandlerFactory>,
    ) -> Self {
        HandlerRegistration {
            config,
            target: target.to_owned(),
            load_on_startup,
            factory,
            cell: InitCell::new(),
            serial: if single_threaded {
                Some(Mutex::new(()))
            } else {
                None
            },
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.config.name()
    }

    #[inline]
    pub fn target(&self) -> &str {
        &self.target
    }

    #[inline]
    pub fn load_on_startup(&self) -> Option<i32> {
        self.load_on_startup
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.cell.is_ready()
    }

    pub fn unavailable_cause(&self) -> Option<HandlerError> {
        self.cell.unavailable_cause()
    }

    /// The handler instance, creating and initializing it on first use.
    pub fn get_or_init(&self) -> Result<Arc<dyn Handler>, HandlerError> {
        let (result, fresh_failure) = self.cell.get_or_init(|| {
            let factory = self
                .factory
                .as_ref()
                .ok_or_else(|| missing_factory(&self.target))?;

            let handler = factory()?;
            handler.init(&self.config)?;
            Ok(handler)
        });

        if let (Err(cause), true) = (&result, fresh_failure) {
            debug::print(
                &format!("Handler {} is unavailable: {}", self.name(), cause),
                InfoLevel::Error,
            );
        }

        result
    }

    /// Quarantine the handler. Its instance is destroyed once nothing else is using it.
    pub fn mark_unavailable(&self, cause: HandlerError) {
        debug::print(
            &format!("Handler {} marked unavailable: {}", self.name(), cause),
            InfoLevel::Error,
        );

        if let Some(instance) = self.cell.mark_unavailable(cause) {
            instance.destroy();
        }
    }

    /// Run the handler. An unavailable handler diverts to the error dispatch for its cause.
    pub fn execute(
        &self,
        ctx: &AppContext,
        req: &mut Request,
        resp: &mut Response,
    ) -> Result<(), HandlerError> {
        let handler = match self.get_or_init() {
            Ok(handler) => handler,
            Err(cause) => {
                // an error page that is itself unavailable must not dispatch again
                if req.error_attributes().is_some() {
                    return Err(cause);
                }

                let mut dispatcher = ctx.error_dispatcher_by_cause(req, &cause, Some(self.name()));
                return ctx.run_error_dispatch(&mut dispatcher, req, resp);
            }
        };

        let result = {
            let _serial = self.serial.as_ref().map(|lock| lock.lock());
            handler.service(ctx, req, resp)
        };

        match result {
            Err(cause @ HandlerError::Unavailable(_)) => {
                let message = cause.summary();
                self.mark_unavailable(cause);
                ctx.send_error(req, resp, 404, Some(&message))
            }
            other => other,
        }
    }

    pub(crate) fn destroy(&self) {
        if let Some(instance) = self.cell.mark_unavailable(stopped()) {
            instance.destroy();
        }
    }
}

impl MappingTarget for HandlerRegistration {
    fn is_live(&self) -> bool {
        self.cell.is_live()
    }
}

pub struct FilterRegistration {
    config: FilterConfig,
    target: String,
    factory: Option<FilterFactory>,
    cell: InitCell<dyn Filter>,
}

impl FilterRegistration {
    pub fn new(config: FilterConfig, target: &str, factory: Option<FilterFactory>) -> Self {
        FilterRegistration {
            config,
            target: target.to_owned(),
            factory,
            cell: InitCell::new(),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.config.name()
    }

    #[inline]
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn get_or_init(&self) -> Result<Arc<dyn Filter>, HandlerError> {
        let (result, fresh_failure) = self.cell.get_or_init(|| {
            let factory = self
                .factory
                .as_ref()
                .ok_or_else(|| missing_factory(&self.target))?;

            let filter = factory()?;
            filter.init(&self.config)?;
            Ok(filter)
        });

        if let (Err(cause), true) = (&result, fresh_failure) {
            debug::print(
                &format!("Filter {} is unavailable: {}", self.name(), cause),
                InfoLevel::Error,
            );
        }

        result
    }

    pub(crate) fn execute(
        &self,
        ctx: &AppContext,
        req: &mut Request,
        resp: &mut Response,
        chain: &mut RequestDispatcher,
    ) -> Result<(), HandlerError> {
        let filter = self.get_or_init()?;

        match filter.do_filter(ctx, req, resp, chain) {
            Err(cause @ HandlerError::Unavailable(_)) => {
                if let Some(instance) = self.cell.mark_unavailable(cause.clone()) {
                    instance.destroy();
                }
                Err(cause)
            }
            other => other,
        }
    }

    pub(crate) fn destroy(&self) {
        if let Some(instance) = self.cell.mark_unavailable(stopped()) {
            instance.destroy();
        }
    }
}

/// Every handler and filter of one application, by name.
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<HandlerRegistration>>,
    order: Vec<Arc<HandlerRegistration>>,
    filters: HashMap<String, Arc<FilterRegistration>>,
    filter_order: Vec<Arc<FilterRegistration>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        HandlerRegistry {
            handlers: HashMap::new(),
            order: Vec::new(),
            filters: HashMap::new(),
            filter_order: Vec::new(),
        }
    }

    pub fn add_handler(&mut self, registration: HandlerRegistration) -> Result<(), ConfigError> {
        if self.handlers.contains_key(registration.name()) {
            return Err(ConfigError::DuplicateName(registration.name().to_owned()));
        }

        let registration = Arc::new(registration);
        self.handlers
            .insert(registration.name().to_owned(), Arc::clone(&registration));
        self.order.push(registration);
        Ok(())
    }

    pub fn add_filter(&mut self, registration: FilterRegistration) -> Result<(), ConfigError> {
        if self.filters.contains_key(registration.name()) {
            return Err(ConfigError::DuplicateName(registration.name().to_owned()));
        }

        let registration = Arc::new(registration);
        self.filters
            .insert(registration.name().to_owned(), Arc::clone(&registration));
        self.filter_order.push(registration);
        Ok(())
    }

    /// Live handlers only; an unavailable handler counts as removed.
    pub fn handler(&self, name: &str) -> Option<Arc<HandlerRegistration>> {
        self.handlers
            .get(name)
            .filter(|registration| registration.is_live())
            .cloned()
    }

    /// Any registration by name, live or not. Used when compiling mappings.
    pub(crate) fn registered_handler(&self, name: &str) -> Option<Arc<HandlerRegistration>> {
        self.handlers.get(name).cloned()
    }

    pub fn filter(&self, name: &str) -> Option<Arc<FilterRegistration>> {
        self.filters.get(name).cloned()
    }

    /// Handlers flagged for eager start, ascending priority, ties in registration order.
    pub fn startup_order(&self) -> Vec<Arc<HandlerRegistration>> {
        let mut eager: Vec<Arc<HandlerRegistration>> = self
            .order
            .iter()
            .filter(|registration| matches!(registration.load_on_startup(), Some(n) if n >= 0))
            .cloned()
            .collect();

        eager.sort_by_key(|registration| registration.load_on_startup().unwrap_or(0));
        eager
    }

    /// Initialize eager handlers; failures only quarantine the handler.
    pub fn init_on_startup(&self) {
        for registration in self.startup_order() {
            let _ = registration.get_or_init();
        }
    }

    /// Filters first, then handlers, each in reverse registration order.
    pub fn destroy_all(&self) {
        for filter in self.filter_order.iter().rev() {
            filter.destroy();
        }

        for handler in self.order.iter().rev() {
            handler.destroy();
        }
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        HandlerRegistry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    struct Noop;

    impl Handler for Noop {
        fn service(&self, _: &AppContext, _: &mut Request, _: &mut Response) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    fn counting_factory(counter: Arc<AtomicUsize>, delay: Duration) -> HandlerFactory {
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            thread::sleep(delay);
            Ok(Arc::new(Noop) as Arc<dyn Handler>)
        })
    }

    #[test]
    fn concurrent_callers_share_one_initialization() {
        let counter = Arc::new(AtomicUsize::new(0));
        let registration = Arc::new(HandlerRegistration::new(
            HandlerConfig::new("slow", Vec::new()),
            "slow",
            None,
            false,
            Some(counting_factory(Arc::clone(&counter), Duration::from_millis(50))),
        ));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let registration = Arc::clone(&registration);
                thread::spawn(move || registration.get_or_init().is_ok())
            })
            .collect();

        for worker in workers {
            assert!(worker.join().unwrap());
        }

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(registration.is_ready());
    }

    #[test]
    fn failed_init_is_terminal_and_keeps_its_cause() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&attempts);
        let factory: HandlerFactory = Arc::new(move || {
            seen.fetch_add(1, Ordering::SeqCst);
            Err(HandlerError::failure("db.down", "database unreachable"))
        });

        let registration = HandlerRegistration::new(
            HandlerConfig::new("broken", Vec::new()),
            "broken",
            None,
            false,
            Some(factory),
        );

        for _ in 0..3 {
            let err = registration.get_or_init().err().unwrap();
            assert_eq!(err.class(), "db.down");
        }

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(!registration.is_live());
        assert_eq!(registration.unavailable_cause().unwrap().class(), "db.down");
    }

    #[test]
    fn missing_factory_reads_as_unavailable() {
        let registration = HandlerRegistration::new(
            HandlerConfig::new("ghost", Vec::new()),
            "nowhere",
            None,
            false,
            None,
        );

        let err = registration.get_or_init().err().unwrap();
        assert!(err.is_unavailable());
        assert_eq!(err.class(), "unavailable.missing");
    }

    #[test]
    fn init_panics_do_not_strand_waiters() {
        let factory: HandlerFactory = Arc::new(|| panic!("boom"));
        let registration = HandlerRegistration::new(
            HandlerConfig::new("panicky", Vec::new()),
            "panicky",
            None,
            false,
            Some(factory),
        );

        assert!(matches!(registration.get_or_init(), Err(HandlerError::Fatal(_))));
        assert!(matches!(registration.get_or_init(), Err(HandlerError::Fatal(_))));
    }

    #[test]
    fn startup_order_sorts_by_priority_then_registration() {
        let mut registry = HandlerRegistry::new();
        for (name, priority) in [("c", Some(2)), ("lazy", None), ("a", Some(1)), ("b", Some(2)), ("neg", Some(-1))] {
            registry
                .add_handler(HandlerRegistration::new(
                    HandlerConfig::new(name, Vec::new()),
                    name,
                    priority,
                    false,
                    None,
                ))
                .unwrap();
        }

        let order: Vec<String> = registry
            .startup_order()
            .iter()
            .map(|r| r.name().to_owned())
            .collect();
        assert_eq!(order, vec!["a", "c", "b"]);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = HandlerRegistry::new();
        let make = || HandlerRegistration::new(HandlerConfig::new("x", Vec::new()), "x", None, false, None);

        registry.add_handler(make()).unwrap();
        assert!(matches!(registry.add_handler(make()), Err(ConfigError::DuplicateName(_))));
    }

    #[test]
    fn unavailable_handlers_leave_the_registry() {
        let mut registry = HandlerRegistry::new();
        registry
            .add_handler(HandlerRegistration::new(
                HandlerConfig::new("h", Vec::new()),
                "h",
                None,
                false,
                Some(Arc::new(|| Ok(Arc::new(Noop) as Arc<dyn Handler>))),
            ))
            .unwrap();

        let handler = registry.handler("h").unwrap();
        handler.mark_unavailable(HandlerError::unavailable("maintenance"));

        assert!(registry.handler("h").is_none());
        assert!(registry.registered_handler("h").is_some());
    }

    #[test]
    fn init_parameters_keep_their_order() {
        let config = HandlerConfig::new(
            "h",
            vec![("b".to_owned(), "2".to_owned()), ("a".to_owned(), "1".to_owned())],
        );

        assert_eq!(config.init_parameter("a"), Some("1"));
        assert_eq!(config.init_parameters()[0].0, "b");
        assert!(config.init_parameter("c").is_none());
    }
}
