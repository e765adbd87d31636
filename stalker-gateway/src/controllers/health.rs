use crate::gateway::Gateway;
use actix_web::{web, HttpResponse, Responder};
use stalker_types::RpcResponse;
use std::sync::Arc;

pub fn config_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/health").route(web::get().to(health_check)));
    cfg.service(web::resource("/rpc/status").route(web::get().to(rpc_status)));
}

async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy"
    }))
}

// GET /rpc/status
async fn rpc_status(gateway: web::Data<Arc<Gateway>>) -> impl Responder {
    let status = gateway.status().await;
    HttpResponse::Ok().json(RpcResponse::ok(status))
}
