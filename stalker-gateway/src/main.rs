use actix_web::{middleware::Logger, web, App, HttpServer};
use dotenv::dotenv;
use std::sync::Arc;

mod config;
mod controllers;
mod error;
mod gateway;
mod stalker;
mod upstream;

use config::Config;
use gateway::Gateway;
use upstream::WsConnector;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();
    env_logger::init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Invalid configuration: {}", e);
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, e));
        }
    };

    if config.endpoints.is_empty() {
        log::warn!(
            "No chain endpoints configured; set ALCHEMY_API_KEY, HELIUS_API_KEY or <CHAIN>_WSS_URL"
        );
    }
    for chain in config.enabled_chains() {
        if let Some(endpoint) = config.endpoints.get(&chain) {
            log::info!(
                "{} endpoint: {}",
                chain,
                upstream::ws_link::redact_endpoint(endpoint)
            );
        }
    }

    let connector = Arc::new(WsConnector::new(
        config.endpoints.clone(),
        config.ack_timeout,
        config.idle_ping,
    ));

    log::info!("Initializing Gateway");
    let gateway = Arc::new(Gateway::start(&config, connector));

    log::info!(
        "Starting wallet stalker gateway on {}:{}",
        config.host,
        config.port
    );

    let gw = gateway.clone();
    let result = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(Arc::clone(&gw)))
            .wrap(Logger::default())
            .route("/ws", web::get().to(gateway::actix_ws::ws_handler))
            .configure(controllers::health::config_routes)
    })
    .bind((config.host.as_str(), config.port))?
    .run()
    .await;

    gateway.shutdown().await;
    result
}
