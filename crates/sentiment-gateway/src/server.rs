use std::path::Path;
use std::sync::Arc;

use pingora::apps::http_app::HttpServer;
use pingora::prelude::*;
use pingora::server::RunArgs;
use pingora::server::Server as PingoraServer;
use pingora::server::configuration::Opt;
use pingora::services::listening::Service;
use secret_key::KeyIssuer;

use crate::accounts::{AccountRegistry, Plan};
use crate::app::GatewayApp;
use crate::configuration::ServerConfig;
use crate::db::init_schema;
use crate::handler::Gateway;
use crate::inference::{HttpInferenceClient, InferenceClient};
use crate::ledger::{Clock, QuotaLedger, SystemClock};
use crate::metric::Metrics;
use crate::store::SqliteQuotaStore;
use crate::videos::VideoStore;

fn internal(context: &str, e: impl std::fmt::Display) -> Box<Error> {
    Error::explain(ErrorType::InternalError, format!("{context}: {e}"))
}

pub struct Server {
    server: PingoraServer,
}

impl Server {
    pub fn new(opt: Option<Opt>) -> Result<Self> {
        let server = PingoraServer::new(opt)?;
        Ok(Server { server })
    }

    /// Prepare the database and register the API service on `listen_addr`.
    pub fn bootstrap(
        &mut self,
        server_conf: ServerConfig,
        config_base_path: &Path,
        listen_addr: &str,
        metrics: Arc<Metrics>,
    ) -> Result<()> {
        let inference = HttpInferenceClient::new(&server_conf.inference)
            .map_err(|e| internal("failed to build inference client", e))?;
        self.bootstrap_with(
            server_conf,
            config_base_path,
            listen_addr,
            Arc::new(inference),
            metrics,
        )
    }

    /// Like [`Server::bootstrap`] with a caller-provided model client.
    pub fn bootstrap_with(
        &mut self,
        server_conf: ServerConfig,
        config_base_path: &Path,
        listen_addr: &str,
        inference: Arc<dyn InferenceClient>,
        metrics: Arc<Metrics>,
    ) -> Result<()> {
        self.server.bootstrap();

        server_conf
            .validate()
            .map_err(|e| internal("invalid server config", e))?;

        let db_path = server_conf.database_path(config_base_path);
        init_schema(&db_path).map_err(|e| internal("failed to initialize database", e))?;
        log::info!("Using quota database at {:?}", db_path);

        let registry = AccountRegistry::new(&db_path, KeyIssuer::new(&server_conf.key_prefix));
        for plan in &server_conf.plans {
            registry
                .upsert_plan(&Plan {
                    name: plan.name.clone(),
                    monthly_quota: plan.monthly_quota,
                })
                .map_err(|e| internal("failed to store plan", e))?;
        }

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let gateway = Gateway::new(
            registry,
            QuotaLedger::with_clock(Arc::new(SqliteQuotaStore::new(&db_path)), clock.clone()),
            VideoStore::new(&db_path),
            inference,
            metrics,
            clock,
            server_conf.default_plan.clone(),
        );

        let mut api_service = Service::new(
            "sentiment gateway".to_string(),
            HttpServer::new_app(GatewayApp::new(Arc::new(gateway))),
        );
        api_service.add_tcp(listen_addr);
        self.server.add_service(api_service);

        Ok(())
    }

    pub fn run_forever(self) {
        self.server.run_forever();
    }

    pub fn run(self, args: RunArgs) {
        self.server.run(args);
    }
}
