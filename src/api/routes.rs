use actix_web::web;

use super::handlers;

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(handlers::health_check))
        .route("/metrics", web::get().to(handlers::metrics_endpoint))
        .service(
            web::scope("/api/v1")
                .service(
                    web::scope("/jobs")
                        .route("", web::post().to(handlers::submit_job))
                        .route("/stats", web::get().to(handlers::job_stats))
                        .route("/{id}", web::get().to(handlers::get_status))
                        .route("/{id}/retry", web::post().to(handlers::retry_job))
                        .route("/{id}/cancel", web::post().to(handlers::cancel_job)),
                )
                .route("/owners/{id}/quota", web::get().to(handlers::owner_quota))
                .route("/validate", web::post().to(handlers::validate_invoice))
                .route("/validate/auto-fix", web::post().to(handlers::auto_fix_invoice))
                .route("/invoices/{id}/templates", web::post().to(handlers::learn_invoice_template)),
        );
}
