use std::path::Path;
use std::sync::Arc;

use pingora::server::configuration::Opt;
use sentiment_gateway::configuration::ServerConfig;
use sentiment_gateway::metric::Metrics;
use sentiment_gateway::server::Server;

fn main() {
    // RUST_LOG=info for request lifecycle logs.
    env_logger::init();

    let opt = Opt::parse_args();
    // Gateway settings share the pingora config file.
    let conf_path = opt.conf.clone().unwrap_or_else(|| "conf.yaml".to_string());

    let server_conf = match ServerConfig::load(&conf_path) {
        Ok(conf) => conf,
        Err(e) => {
            log::error!("Failed to load {conf_path}: {e}");
            std::process::exit(1);
        }
    };
    let config_base_path = Path::new(&conf_path)
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let listen = server_conf.listen.clone();

    let mut server = match Server::new(Some(opt)) {
        Ok(server) => server,
        Err(e) => {
            log::error!("Failed to create server: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = server.bootstrap(
        server_conf,
        &config_base_path,
        &listen,
        Arc::new(Metrics::new()),
    ) {
        log::error!("Failed to bootstrap server: {e}");
        std::process::exit(1);
    }

    log::info!("Sentiment gateway listening on {listen}");
    server.run_forever();
}
