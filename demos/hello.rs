//! A small site: a greeting page with a visit counter, a page that includes a footer, and a
//! logging filter in front of everything.
//!
//! Run with `cargo run --example hello`, then open <http://127.0.0.1:8080/hello/>. Set
//! `DEBUG_LEVEL=1` (or `RUST_LOG=rusty_appserver=debug`) to see the server's own logging.

use std::env;
use std::io::Write;
use std::sync::Arc;

use rusty_appserver::prelude::*;

struct Greeting;

impl Handler for Greeting {
    fn service(&self, ctx: &AppContext, req: &mut Request, resp: &mut Response) -> Result<(), HandlerError> {
        let visits = match ctx.session(req, resp, true)? {
            Some(session) => {
                let visits = session.attribute::<u32>("visits")?.unwrap_or(0) + 1;
                session.set_attribute("visits", &visits)?;
                visits
            }
            None => 1,
        };

        let name = req.parameter("name").unwrap_or_else(|| "stranger".to_owned());

        resp.set_content_type("text/html; charset=utf-8");
        write!(resp, "<h1>Hello, {}!</h1><p>Visit number {}.</p>", name, visits)?;

        if let Some(mut footer) = ctx.request_dispatcher("/footer") {
            footer.include(ctx, req, resp)?;
        }

        Ok(())
    }
}

struct Footer;

impl Handler for Footer {
    fn service(&self, ctx: &AppContext, _: &mut Request, resp: &mut Response) -> Result<(), HandlerError> {
        let motto = ctx.init_parameter("motto").unwrap_or("");
        write!(resp, "<footer>{}</footer>", motto)?;
        Ok(())
    }
}

struct AccessLog;

impl Filter for AccessLog {
    fn do_filter(
        &self,
        ctx: &AppContext,
        req: &mut Request,
        resp: &mut Response,
        chain: &mut RequestDispatcher,
    ) -> Result<(), HandlerError> {
        let result = chain.do_filter(ctx, req, resp);
        println!("{} {} -> {}", req.method(), req.request_uri(), resp.status());
        result
    }
}

fn main() -> Result<(), ServerError> {
    let mut config = match env::args().nth(1) {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::new(),
    };
    config.set_max_workers(32);

    let mut factories = Factories::new();
    factories
        .register_handler("greeting", || Ok(Arc::new(Greeting) as Arc<dyn Handler>))
        .register_handler("footer", || Ok(Arc::new(Footer) as Arc<dyn Handler>))
        .register_filter("access-log", || Ok(Arc::new(AccessLog) as Arc<dyn Filter>));

    let site = AppDescriptor::new("hello", "/hello")
        .init_param("motto", "served by rusty_appserver")
        .handler(HandlerDef::new("greeting", "greeting").load_on_startup(1))
        .handler(HandlerDef::new("footer", "footer"))
        .map("/index", "greeting")
        .map("/", "greeting")
        .map("/footer", "footer")
        .welcome_file("index")
        .filter(FilterDef::new("access-log", "access-log"))
        .filter_url("access-log", "/*", &[DispatchType::Request])
        .session_timeout(Some(30));

    let server = HttpServer::new(config, factories).mount(site)?.start()?;
    println!("Listening on http://{}/hello/", server.local_addr());

    server.wait();
    Ok(())
}
