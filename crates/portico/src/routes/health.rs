use actix_web::{web, HttpResponse, Result};

/// Gateway liveness endpoint.
///
/// Returns `200 OK` with a plain-text `OK` body. Says nothing about
/// backend health; those are visible through logs and breaker state.
pub async fn health_check() -> Result<HttpResponse> {
    Ok(HttpResponse::Ok().content_type("text/plain").body("OK"))
}

/// Registers `GET /health`.
pub fn configure_health(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check));
}
