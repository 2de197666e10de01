mod common;

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::*;
use rusty_appserver::prelude::*;

/// Writes "A", includes `/part`, writes "C".
struct Page;

impl Handler for Page {
    fn service(&self, ctx: &AppContext, req: &mut Request, resp: &mut Response) -> Result<(), HandlerError> {
        resp.write_all(b"A")?;
        if let Some(mut part) = ctx.request_dispatcher("/part?piece=b") {
            part.include(ctx, req, resp)?;
        }
        resp.write_all(b"C")?;
        Ok(())
    }
}

/// Writes its `piece` parameter and the include path it was reached through.
struct Part;

impl Handler for Part {
    fn service(&self, _: &AppContext, req: &mut Request, resp: &mut Response) -> Result<(), HandlerError> {
        let piece = req.parameter("piece").unwrap_or_default();
        let via = req
            .include_attributes()
            .map(|attrs| attrs.servlet_path.clone())
            .unwrap_or_default();

        // ignored inside an include
        resp.set_status(418);
        resp.set_header("X-From-Include", "yes");

        write!(resp, "[{}{}]", piece.to_uppercase(), via)?;
        Ok(())
    }
}

struct Jump;

impl Handler for Jump {
    fn service(&self, ctx: &AppContext, req: &mut Request, resp: &mut Response) -> Result<(), HandlerError> {
        resp.write_all(b"discarded")?;
        match ctx.request_dispatcher("/landing?step=2") {
            Some(mut target) => target.forward(ctx, req, resp),
            None => ctx.send_error(req, resp, 404, None),
        }
    }
}

struct Landing;

impl Handler for Landing {
    fn service(&self, _: &AppContext, req: &mut Request, resp: &mut Response) -> Result<(), HandlerError> {
        let from = req
            .forward_attributes()
            .map(|attrs| attrs.request_uri.clone())
            .unwrap_or_default();
        let step = req.parameter("step").unwrap_or_default();
        write!(resp, "landed step={} from={} now={}", step, from, req.request_uri())?;
        Ok(())
    }
}

/// Tags the response and passes the request on.
struct Tag(&'static str);

impl Filter for Tag {
    fn do_filter(
        &self,
        ctx: &AppContext,
        req: &mut Request,
        resp: &mut Response,
        chain: &mut RequestDispatcher,
    ) -> Result<(), HandlerError> {
        resp.add_header("X-Filters", self.0);
        chain.do_filter(ctx, req, resp)
    }
}

/// Answers 403 without calling the rest of the chain.
struct Gate;

impl Filter for Gate {
    fn do_filter(
        &self,
        _: &AppContext,
        _: &mut Request,
        resp: &mut Response,
        _: &mut RequestDispatcher,
    ) -> Result<(), HandlerError> {
        resp.set_status(403);
        resp.write_all(b"keep out")?;
        Ok(())
    }
}

struct Failing(&'static str);

impl Handler for Failing {
    fn service(&self, _: &AppContext, _: &mut Request, _: &mut Response) -> Result<(), HandlerError> {
        Err(HandlerError::Failure(
            Fault::new("render", "template failed").caused_by(Fault::new(self.0, "gave up")),
        ))
    }
}

/// Shows what the error dispatch carried.
struct ErrorView(&'static str);

impl Handler for ErrorView {
    fn service(&self, _: &AppContext, req: &mut Request, resp: &mut Response) -> Result<(), HandlerError> {
        let (status, handler) = req
            .error_attributes()
            .map(|error| (error.status, error.handler_name.clone().unwrap_or_default()))
            .unwrap_or((0, String::new()));
        write!(resp, "{} status={} handler={}", self.0, status, handler)?;
        Ok(())
    }
}

fn register(factories: &mut Factories, id: &str, handler: Arc<dyn Handler>) {
    factories.register_handler(id, move || Ok(Arc::clone(&handler)));
}

fn dispatch_server() -> ServerHandle {
    let mut factories = Factories::new();
    register(&mut factories, "page", Arc::new(Page));
    register(&mut factories, "part", Arc::new(Part));
    register(&mut factories, "jump", Arc::new(Jump));
    register(&mut factories, "landing", Arc::new(Landing));
    register(&mut factories, "db-failing", Arc::new(Failing("db.timeout")));
    register(&mut factories, "io-failing", Arc::new(Failing("net.reset")));
    register(&mut factories, "db-errors", Arc::new(ErrorView("db page")));
    register(&mut factories, "server-errors", Arc::new(ErrorView("500 page")));
    register(&mut factories, "secret", Arc::new(Text("secret")));
    factories
        .register_filter("outer", || Ok(Arc::new(Tag("outer")) as Arc<dyn Filter>))
        .register_filter("inner", || Ok(Arc::new(Tag("inner")) as Arc<dyn Filter>))
        .register_filter("forwarded", || Ok(Arc::new(Tag("forwarded")) as Arc<dyn Filter>))
        .register_filter("gate", || Ok(Arc::new(Gate) as Arc<dyn Filter>));

    let app = AppDescriptor::new("site", "/site")
        .handler(HandlerDef::new("page", "page"))
        .handler(HandlerDef::new("part", "part"))
        .handler(HandlerDef::new("jump", "jump"))
        .handler(HandlerDef::new("landing", "landing"))
        .handler(HandlerDef::new("db-failing", "db-failing"))
        .handler(HandlerDef::new("io-failing", "io-failing"))
        .handler(HandlerDef::new("db-errors", "db-errors"))
        .handler(HandlerDef::new("server-errors", "server-errors"))
        .handler(HandlerDef::new("secret", "secret"))
        .map("/page", "page")
        .map("/part", "part")
        .map("/jump", "jump")
        .map("/landing", "landing")
        .map("/fail/db", "db-failing")
        .map("/fail/net", "io-failing")
        .map("/errors/db", "db-errors")
        .map("/errors/500", "server-errors")
        .map("/secret/*", "secret")
        .filter(FilterDef::new("outer", "outer"))
        .filter(FilterDef::new("inner", "inner"))
        .filter(FilterDef::new("forwarded", "forwarded"))
        .filter(FilterDef::new("gate", "gate"))
        .filter_url("outer", "/*", &[DispatchType::Request])
        .filter_url("inner", "/page", &[DispatchType::Request])
        .filter_handler("forwarded", "landing", &[DispatchType::Forward])
        .filter_url("gate", "/secret/*", &[])
        .error_page(ErrorPageKey::Class("db".to_owned()), "/errors/db")
        .error_page(ErrorPageKey::Status(500), "/errors/500");

    start(test_config(), factories, vec![app])
}

#[test]
fn includes_land_in_place_and_ignore_status_changes() {
    let server = dispatch_server();
    let mut client = Client::connect(server.local_addr());

    let reply = client.request(&get("/site/page"));
    assert_eq!(reply.status(), 200);
    assert_eq!(reply.body, "A[B/part]C");
    assert!(reply.header("X-From-Include").is_none());

    server.shutdown();
}

#[test]
fn request_filters_run_outermost_first() {
    let server = dispatch_server();
    let mut client = Client::connect(server.local_addr());

    let reply = client.request(&get("/site/page"));
    let filters: Vec<&str> = reply
        .headers
        .iter()
        .filter(|(key, _)| key == "X-Filters")
        .map(|(_, value)| value.as_str())
        .collect();

    // both match; the exact mapping sorts ahead of the wildcard
    assert_eq!(filters, vec!["inner", "outer"]);

    server.shutdown();
}

#[test]
fn forwards_discard_output_and_expose_the_original_path() {
    let server = dispatch_server();
    let mut client = Client::connect(server.local_addr());

    let reply = client.request(&get("/site/jump"));
    assert_eq!(reply.status(), 200);
    assert_eq!(reply.body, "landed step=2 from=/site/jump now=/site/landing");

    let filters: Vec<&str> = reply
        .headers
        .iter()
        .filter(|(key, _)| key == "X-Filters")
        .map(|(_, value)| value.as_str())
        .collect();
    assert_eq!(filters, vec!["outer", "forwarded"]);

    server.shutdown();
}

#[test]
fn a_filter_can_end_the_chain() {
    let server = dispatch_server();
    let mut client = Client::connect(server.local_addr());

    let reply = client.request(&get("/site/secret/plans"));
    assert_eq!(reply.status(), 403);
    assert_eq!(reply.body, "keep out");

    server.shutdown();
}

#[test]
fn error_pages_match_the_cause_chain_by_class() {
    let server = dispatch_server();
    let mut client = Client::connect(server.local_addr());

    let reply = client.request(&get("/site/fail/db"));
    assert_eq!(reply.status(), 500);
    assert_eq!(reply.body, "db page status=500 handler=db-failing");

    server.shutdown();
}

#[test]
fn unmatched_faults_fall_back_to_the_status_page() {
    let server = dispatch_server();
    let mut client = Client::connect(server.local_addr());

    let reply = client.request(&get("/site/fail/net"));
    assert_eq!(reply.status(), 500);
    assert_eq!(reply.body, "500 page status=500 handler=io-failing");

    server.shutdown();
}

#[test]
fn unmapped_paths_get_the_builtin_404() {
    let server = dispatch_server();
    let mut client = Client::connect(server.local_addr());

    let reply = client.request(&get("/site/nowhere"));
    assert_eq!(reply.status(), 404);
    assert!(reply.body.contains("404 Not Found"));
    assert_eq!(reply.header("Content-Length"), Some(reply.body.len().to_string().as_str()));

    server.shutdown();
}

static WARMUPS: AtomicUsize = AtomicUsize::new(0);
static QUITS: AtomicUsize = AtomicUsize::new(0);

struct NeverWarm;

impl Handler for NeverWarm {
    fn init(&self, _: &HandlerConfig) -> Result<(), HandlerError> {
        WARMUPS.fetch_add(1, Ordering::SeqCst);
        Err(HandlerError::unavailable("still warming up"))
    }

    fn service(&self, _: &AppContext, _: &mut Request, resp: &mut Response) -> Result<(), HandlerError> {
        resp.write_all(b"never")?;
        Ok(())
    }
}

struct Quitter;

impl Handler for Quitter {
    fn service(&self, _: &AppContext, _: &mut Request, _: &mut Response) -> Result<(), HandlerError> {
        QUITS.fetch_add(1, Ordering::SeqCst);
        Err(HandlerError::unavailable("shutting down for maintenance"))
    }
}

#[test]
fn unavailable_handlers_are_quarantined() {
    let mut factories = Factories::new();
    factories
        .register_handler("cold", || Ok(Arc::new(NeverWarm) as Arc<dyn Handler>))
        .register_handler("quitter", || Ok(Arc::new(Quitter) as Arc<dyn Handler>))
        .register_handler("busy", text("come back later"));

    let app = AppDescriptor::new("fragile", "")
        .handler(HandlerDef::new("cold", "cold"))
        .handler(HandlerDef::new("quitter", "quitter"))
        .handler(HandlerDef::new("busy", "busy"))
        .map("/cold", "cold")
        .map("/quit", "quitter")
        .map("/busy", "busy")
        .error_page(ErrorPageKey::Status(503), "/busy");

    let server = start(test_config(), factories, vec![app]);
    let mut client = Client::connect(server.local_addr());

    let reply = client.request(&get("/cold"));
    assert_eq!(reply.status(), 503);
    assert_eq!(reply.body, "come back later");

    // no longer mapped, and never initialized again
    assert_eq!(client.request(&get("/cold")).status(), 404);
    assert_eq!(WARMUPS.load(Ordering::SeqCst), 1);

    let reply = client.request(&get("/quit"));
    assert_eq!(reply.status(), 404);
    assert!(reply.body.contains("shutting down for maintenance"));

    assert_eq!(client.request(&get("/quit")).status(), 404);
    assert_eq!(QUITS.load(Ordering::SeqCst), 1);

    server.shutdown();
}

static ACCESS_CHECKS: AtomicUsize = AtomicUsize::new(0);

/// Turns away anything under `/private` with a login challenge.
struct Doorman;

impl Authenticator for Doorman {
    fn check_access(&self, _: &mut Request, resp: &mut Response, path: &str) -> Result<bool, HandlerError> {
        ACCESS_CHECKS.fetch_add(1, Ordering::SeqCst);
        if path.starts_with("/private") {
            resp.set_status(401);
            resp.write_all(b"login first")?;
            return Ok(false);
        }

        Ok(true)
    }
}

#[test]
fn authenticator_runs_once_per_request_and_can_refuse() {
    let mut factories = Factories::new();
    register(&mut factories, "jump", Arc::new(Jump));
    register(&mut factories, "landing", Arc::new(Landing));
    register(&mut factories, "db-failing", Arc::new(Failing("db.timeout")));
    register(&mut factories, "db-errors", Arc::new(ErrorView("db page")));
    register(&mut factories, "secret", Arc::new(Text("secret")));

    let app = AppDescriptor::new("guarded", "")
        .handler(HandlerDef::new("jump", "jump"))
        .handler(HandlerDef::new("landing", "landing"))
        .handler(HandlerDef::new("db-failing", "db-failing"))
        .handler(HandlerDef::new("db-errors", "db-errors"))
        .handler(HandlerDef::new("secret", "secret"))
        .map("/jump", "jump")
        .map("/landing", "landing")
        .map("/fail", "db-failing")
        .map("/errors/db", "db-errors")
        .map("/private/*", "secret")
        .error_page(ErrorPageKey::Class("db".to_owned()), "/errors/db")
        .authenticator(Arc::new(Doorman));

    let server = start(test_config(), factories, vec![app]);
    let mut client = Client::connect(server.local_addr());

    // the forward to /landing is not checked again
    let reply = client.request(&get("/jump"));
    assert_eq!(reply.status(), 200);
    assert!(reply.body.starts_with("landed step=2"));
    assert_eq!(ACCESS_CHECKS.load(Ordering::SeqCst), 1);

    // neither is the error dispatch to /errors/db
    let reply = client.request(&get("/fail"));
    assert_eq!(reply.status(), 500);
    assert_eq!(reply.body, "db page status=500 handler=db-failing");
    assert_eq!(ACCESS_CHECKS.load(Ordering::SeqCst), 2);

    let reply = client.request(&get("/private/plans"));
    assert_eq!(reply.status(), 401);
    assert_eq!(reply.body, "login first");
    assert_eq!(ACCESS_CHECKS.load(Ordering::SeqCst), 3);

    server.shutdown();
}
