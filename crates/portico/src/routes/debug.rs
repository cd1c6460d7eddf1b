use crate::scripting::pool::ScriptPool;
use actix_web::{web, HttpResponse, Result};
use std::sync::Arc;

/// Script pool statistics endpoint.
///
/// # Response Format
///
/// ```json
/// { "created": 3, "available": 2, "in_use": 1, "pool_size": 10 }
/// ```
pub async fn script_pool_stats(pool: web::Data<Arc<ScriptPool>>) -> Result<HttpResponse> {
    Ok(HttpResponse::Ok().json(pool.stats()))
}

/// Registers `GET /debug/script-pool`. Only mounted when scripting is
/// enabled; the pool handle arrives through app data.
pub fn configure_debug(cfg: &mut web::ServiceConfig) {
    cfg.route("/debug/script-pool", web::get().to(script_pool_stats));
}
