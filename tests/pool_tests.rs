mod common;

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::*;
use rusty_appserver::prelude::*;

struct Slow(Duration);

impl Handler for Slow {
    fn service(&self, _: &AppContext, _: &mut Request, resp: &mut Response) -> Result<(), HandlerError> {
        thread::sleep(self.0);
        resp.write_all(b"slow")?;
        Ok(())
    }
}

fn slow_server(work: Duration, retry: Duration) -> ServerHandle {
    let mut factories = Factories::new();
    factories.register_handler("slow", move || Ok(Arc::new(Slow(work)) as Arc<dyn Handler>));

    let app = AppDescriptor::new("slow", "")
        .handler(HandlerDef::new("slow", "slow"))
        .map("/slow", "slow");

    let mut config = test_config();
    config.set_max_workers(2);
    config.set_startup_workers(2);
    config.set_worker_retry(retry);

    start(config, factories, vec![app])
}

/// Two connections occupy both workers; the third arrives while they are still busy.
fn three_connections(server: &ServerHandle) -> Vec<String> {
    let addr = server.local_addr();
    let mut clients = Vec::new();

    for _ in 0..2 {
        clients.push(thread::spawn(move || {
            let mut client = Client::connect(addr);
            client.send(&get_closing("/slow"));
            client.read_all()
        }));
        thread::sleep(Duration::from_millis(30));
    }

    clients.push(thread::spawn(move || {
        let mut client = Client::connect(addr);
        client.send(&get_closing("/slow"));
        client.read_all()
    }));

    clients.into_iter().map(|client| client.join().unwrap()).collect()
}

#[test]
fn third_connection_is_closed_when_no_worker_frees_up() {
    let server = slow_server(Duration::from_millis(800), Duration::from_millis(100));
    let replies = three_connections(&server);

    assert!(replies[0].ends_with("slow"));
    assert!(replies[1].ends_with("slow"));
    assert!(replies[2].is_empty(), "third connection got: {}", replies[2]);

    server.shutdown();
}

#[test]
fn third_connection_is_served_when_a_worker_frees_up_during_the_retry() {
    let server = slow_server(Duration::from_millis(150), Duration::from_millis(800));
    let replies = three_connections(&server);

    for reply in replies.iter() {
        assert!(reply.starts_with("HTTP/1.1 200"), "unexpected reply: {}", reply);
        assert!(reply.ends_with("slow"));
    }

    server.shutdown();
}

/// Records how many requests are inside `service` at once.
struct Solo {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl Handler for Solo {
    fn service(&self, _: &AppContext, _: &mut Request, resp: &mut Response) -> Result<(), HandlerError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(40));
        self.active.fetch_sub(1, Ordering::SeqCst);

        resp.write_all(b"solo")?;
        Ok(())
    }
}

#[test]
fn single_threaded_handlers_serve_one_request_at_a_time() {
    let solo = Arc::new(Solo {
        active: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });

    let mut factories = Factories::new();
    let instance = Arc::clone(&solo);
    factories.register_handler("solo", move || Ok(Arc::clone(&instance) as Arc<dyn Handler>));

    let app = AppDescriptor::new("solo", "")
        .handler(HandlerDef::new("solo", "solo").single_threaded())
        .map("/solo", "solo");

    let server = start(test_config(), factories, vec![app]);
    let addr = server.local_addr();

    let clients: Vec<_> = (0..4)
        .map(|_| {
            thread::spawn(move || {
                let mut client = Client::connect(addr);
                client.send(&get_closing("/solo"));
                client.read_all()
            })
        })
        .collect();

    for client in clients {
        let reply = client.join().unwrap();
        assert!(reply.starts_with("HTTP/1.1 200"), "unexpected reply: {}", reply);
        assert!(reply.ends_with("solo"));
    }

    assert_eq!(solo.peak.load(Ordering::SeqCst), 1);

    server.shutdown();
}
