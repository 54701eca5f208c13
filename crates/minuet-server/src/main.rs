//! Minuet application server.
//!
//! Usage: `minuet-server [port]` — the port defaults to the configured
//! `SERVER_PORT` (8080). Exits 0 on clean shutdown, 1 on bind or
//! initialization failure.

mod aggregate;
mod handlers;

use std::rc::Rc;

use mimalloc::MiMalloc;
use tracing::{error, info, warn};

use minuet_core::config::Config;
use minuet_core::fileserver::{FileServer, FileServerConfig, FileServerMode};
use minuet_core::server::Server;
use minuet_core::{MinuetError, MinuetResult, logging};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() {
    logging::init();

    if let Err(e) = run() {
        error!(target: "server", "fatal: {e}");
        std::process::exit(1);
    }
}

fn run() -> MinuetResult<()> {
    let config = Config::from_env();

    let port = match std::env::args().nth(1) {
        Some(raw) => raw
            .parse::<u16>()
            .map_err(|_| MinuetError::Other(format!("invalid port argument: {raw}")))?,
        None => config.server_port,
    };

    let server = Server::new()?;
    configure_fileserver(&server, &config);
    register_routes(&server);

    server.install_ctrlc_handler()?;
    let bound = server.bind(&config.server_host, port)?;
    info!(target: "server", "minuet running on http://localhost:{bound}");

    server.run()
}

fn configure_fileserver(server: &Server, config: &Config) {
    let fs_config = FileServerConfig {
        static_dir: config.static_dir.clone().into(),
        cache_file: config.static_cache_file.clone().into(),
        url_prefix: config.static_url_prefix.clone(),
        mode: FileServerMode::Hybrid,
        auto_reload: config.is_dev(),
        max_file_size: 10 * 1024 * 1024,
        exclude_patterns: vec![
            "/*.map".to_string(),
            "/*.zip".to_string(),
            "/privat/*".to_string(),
        ],
    };

    match FileServer::init(fs_config) {
        Ok(fs) => {
            *server.context().fileserver.borrow_mut() = Some(fs);
        }
        Err(e) => {
            // The server still runs; static URLs fall through to 404.
            warn!(target: "server", "file server disabled: {e}");
        }
    }
}

fn register_routes(server: &Server) {
    let mut routes = server.context().routes.borrow_mut();
    routes.add_route("/", Rc::new(handlers::home), false);
    routes.add_route("/speedtest", Rc::new(handlers::speedtest), false);
    routes.add_route("/datahub", Rc::new(handlers::datahub), true);
    routes.set_dynamic_param("/datahub", true);
}
