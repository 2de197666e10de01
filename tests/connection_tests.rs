mod common;

use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::*;
use rusty_appserver::prelude::*;

fn hello_app() -> (Factories, AppDescriptor) {
    let mut factories = Factories::new();
    factories.register_handler("hello", text("hi"));

    let app = AppDescriptor::new("hello", "")
        .handler(HandlerDef::new("hello", "hello"))
        .map("/hello", "hello");

    (factories, app)
}

#[test]
fn keep_alive_serves_several_requests_on_one_connection() {
    let (factories, app) = hello_app();
    let server = start(test_config(), factories, vec![app]);
    let mut client = Client::connect(server.local_addr());

    let first = client.request(&get("/hello"));
    assert_eq!(first.status(), 200);
    assert_eq!(first.body, "hi");
    assert_eq!(first.header("Content-Length"), Some("2"));
    assert!(first.header("Date").is_some());
    assert!(first.header("Server").is_some());

    let second = client.request(&get("/hello"));
    assert_eq!(second.status(), 200);
    assert_eq!(second.body, "hi");

    let last = client.request(&get_closing("/hello"));
    assert_eq!(last.header("Connection"), Some("close"));
    assert!(client.is_closed());

    server.shutdown();
}

#[test]
fn idle_keep_alive_connections_time_out() {
    let (factories, app) = hello_app();
    let server = start(test_config(), factories, vec![app]);
    let mut client = Client::connect(server.local_addr());

    assert_eq!(client.request(&get("/hello")).status(), 200);

    let started = Instant::now();
    assert!(client.is_closed());
    assert!(started.elapsed() < Duration::from_secs(4));

    server.shutdown();
}

#[test]
fn http_10_closes_after_the_response() {
    let (factories, app) = hello_app();
    let server = start(test_config(), factories, vec![app]);
    let mut client = Client::connect(server.local_addr());

    let reply = client.request("GET /hello HTTP/1.0\r\n\r\n");
    assert!(reply.status_line.starts_with("HTTP/1.0 200"));
    assert_eq!(reply.header("Connection"), Some("close"));
    assert!(client.is_closed());

    let mut client = Client::connect(server.local_addr());
    let reply = client.request("GET /hello HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n");
    assert_eq!(reply.body, "hi");
    assert_eq!(client.request("GET /hello HTTP/1.0\r\n\r\n").body, "hi");

    server.shutdown();
}

#[test]
fn http_09_gets_the_body_only() {
    let (factories, app) = hello_app();
    let server = start(test_config(), factories, vec![app]);
    let mut client = Client::connect(server.local_addr());

    client.send("GET /hello\r\n");
    assert_eq!(client.read_all(), "hi");

    server.shutdown();
}

#[test]
fn malformed_requests_get_400_and_a_closed_connection() {
    let (factories, app) = hello_app();
    let server = start(test_config(), factories, vec![app]);

    let mut client = Client::connect(server.local_addr());
    let reply = client.request("GET /hello HTTP/1.1\r\nno colon here\r\n\r\n");
    assert_eq!(reply.status(), 400);
    assert!(client.is_closed());

    // the server is still fine afterwards
    let mut client = Client::connect(server.local_addr());
    assert_eq!(client.request(&get_closing("/hello")).body, "hi");

    server.shutdown();
}

#[test]
fn request_bodies_are_read_before_the_next_request() {
    struct Echo;
    impl Handler for Echo {
        fn service(&self, _: &AppContext, req: &mut Request, resp: &mut Response) -> Result<(), HandlerError> {
            let body = req.body().to_vec();
            resp.write_all(&body)?;
            Ok(())
        }
    }

    let mut factories = Factories::new();
    factories.register_handler("echo", || Ok(Arc::new(Echo) as Arc<dyn Handler>));
    let app = AppDescriptor::new("echo", "")
        .handler(HandlerDef::new("echo", "echo"))
        .map("/echo", "echo");

    let server = start(test_config(), factories, vec![app]);
    let mut client = Client::connect(server.local_addr());

    let reply = client.request("POST /echo HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello");
    assert_eq!(reply.body, "hello");

    let reply = client.request("POST /echo HTTP/1.1\r\nContent-Length: 3\r\n\r\nbye");
    assert_eq!(reply.body, "bye");

    server.shutdown();
}

#[test]
fn requests_route_to_the_longest_context_path() {
    let mut factories = Factories::new();
    factories
        .register_handler("root", text("root"))
        .register_handler("shop", text("shop"))
        .register_handler("admin", text("admin"));

    let apps = vec![
        AppDescriptor::new("root", "")
            .handler(HandlerDef::new("root", "root"))
            .map("/", "root"),
        AppDescriptor::new("shop", "/shop")
            .handler(HandlerDef::new("shop", "shop"))
            .map("/", "shop"),
        AppDescriptor::new("admin", "/shop/admin")
            .handler(HandlerDef::new("admin", "admin"))
            .map("/", "admin"),
    ];

    let server = start(test_config(), factories, apps);
    let mut client = Client::connect(server.local_addr());

    assert_eq!(client.request(&get("/shop/admin/users")).body, "admin");
    assert_eq!(client.request(&get("/shop/cart")).body, "shop");
    assert_eq!(client.request(&get("/shopping")).body, "root");
    assert_eq!(client.request(&get("/")).body, "root");

    let redirect = client.request(&get("/shop"));
    assert_eq!(redirect.status(), 302);
    assert_eq!(redirect.header("Location"), Some("/shop/"));

    server.shutdown();
}

#[test]
fn paths_no_application_claims_get_404() {
    let mut factories = Factories::new();
    factories.register_handler("shop", text("shop"));
    let app = AppDescriptor::new("shop", "/shop")
        .handler(HandlerDef::new("shop", "shop"))
        .map("/", "shop");

    let server = start(test_config(), factories, vec![app]);
    let mut client = Client::connect(server.local_addr());

    let reply = client.request(&get("/elsewhere"));
    assert_eq!(reply.status(), 404);
    assert!(reply.body.contains("404"));

    server.shutdown();
}

#[test]
fn panicking_handlers_get_500_and_the_worker_survives() {
    struct Explodes;
    impl Handler for Explodes {
        fn service(&self, _: &AppContext, _: &mut Request, _: &mut Response) -> Result<(), HandlerError> {
            panic!("boom");
        }
    }

    let mut factories = Factories::new();
    factories
        .register_handler("explodes", || Ok(Arc::new(Explodes) as Arc<dyn Handler>))
        .register_handler("hello", text("hi"));
    let app = AppDescriptor::new("app", "")
        .handler(HandlerDef::new("explodes", "explodes"))
        .handler(HandlerDef::new("hello", "hello"))
        .map("/explode", "explodes")
        .map("/hello", "hello");

    let mut config = test_config();
    config.set_max_workers(1);
    config.set_startup_workers(1);
    let server = start(config, factories, vec![app]);

    let mut client = Client::connect(server.local_addr());
    let reply = client.request(&get("/explode"));
    assert_eq!(reply.status(), 500);
    assert!(client.is_closed());

    let mut client = Client::connect(server.local_addr());
    assert_eq!(client.request(&get_closing("/hello")).body, "hi");

    server.shutdown();
}

#[test]
fn terminate_from_a_controller_stops_the_server() {
    let (factories, app) = hello_app();
    let server = start(test_config(), factories, vec![app]);
    let controller = server.get_courier();

    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        controller.send(ControlMessage::Terminate).unwrap();
    });

    server.wait();
    stopper.join().unwrap();
}

#[test]
fn early_flush_commits_without_a_length_and_closes() {
    struct Late;
    impl Handler for Late {
        fn service(&self, _: &AppContext, _: &mut Request, resp: &mut Response) -> Result<(), HandlerError> {
            resp.write_all(b"done")?;
            resp.flush()?;
            Ok(())
        }
    }

    let mut factories = Factories::new();
    factories.register_handler("late", || Ok(Arc::new(Late) as Arc<dyn Handler>));
    let app = AppDescriptor::new("late", "")
        .handler(HandlerDef::new("late", "late"))
        .map("/late", "late");

    let server = start(test_config(), factories, vec![app]);
    let mut client = Client::connect(server.local_addr());

    // flushed early, so the length is unknown and the connection closes
    let reply = client.request(&get("/late"));
    assert_eq!(reply.status(), 200);
    assert_eq!(reply.header("Connection"), Some("close"));
    assert_eq!(reply.body, "done");

    server.shutdown();
}

#[test]
fn default_config_binds_an_ephemeral_port_and_serves() {
    let (factories, app) = hello_app();

    let mut config = ServerConfig::new();
    config.set_http_port(0);

    let server = HttpServer::new(config, factories).mount(app).unwrap().start().unwrap();
    assert_ne!(server.local_addr().port(), 0);
    assert!(server.local_addr().ip().is_loopback());

    let mut client = Client::connect(server.local_addr());
    let reply = client.request(&get_closing("/hello"));
    assert_eq!(reply.status(), 200);
    assert_eq!(reply.body, "hi");

    server.shutdown();
}
