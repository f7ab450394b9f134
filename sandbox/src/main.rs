//! Sandbox binary: one EBICS host behind `POST /ebicsweb`

use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use moneta_sandbox::{DemoAccount, EbicsHost};
use std::env;
use std::sync::Arc;
use tracing::info;

struct SandboxConfig {
    bind: String,
    host_id: String,
    currency: String,
    partner_id: String,
    user_id: String,
    iban: String,
    bic: String,
    holder: String,
}

impl SandboxConfig {
    fn from_env() -> Self {
        Self {
            bind: env::var("SANDBOX_BIND").unwrap_or_else(|_| "127.0.0.1:5000".to_string()),
            host_id: env::var("SANDBOX_HOST_ID").unwrap_or_else(|_| "HOST01".to_string()),
            currency: env::var("SANDBOX_CURRENCY").unwrap_or_else(|_| "EUR".to_string()),
            partner_id: env::var("SANDBOX_PARTNER_ID").unwrap_or_else(|_| "PARTNER1".to_string()),
            user_id: env::var("SANDBOX_USER_ID").unwrap_or_else(|_| "USER1".to_string()),
            iban: env::var("SANDBOX_IBAN")
                .unwrap_or_else(|_| "GB33BUKB20201555555555".to_string()),
            bic: env::var("SANDBOX_BIC").unwrap_or_else(|_| "BUKBGB22".to_string()),
            holder: env::var("SANDBOX_HOLDER").unwrap_or_else(|_| "Oliver Smith".to_string()),
        }
    }
}

async fn ebicsweb(
    host: web::Data<Arc<EbicsHost>>,
    request: HttpRequest,
    body: web::Bytes,
) -> HttpResponse {
    // EBICS peers post either content type; anything else is not ours.
    let content_type = request
        .headers()
        .get(actix_web::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !content_type.starts_with("text/xml") && !content_type.starts_with("text/plain") {
        return HttpResponse::UnsupportedMediaType()
            .body("expected text/xml or text/plain");
    }
    let Ok(body) = String::from_utf8(body.to_vec()) else {
        return HttpResponse::BadRequest().body("request body is not UTF-8");
    };
    HttpResponse::Ok()
        .content_type("text/xml")
        .body(host.handle(&body))
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = SandboxConfig::from_env();
    let host = Arc::new(EbicsHost::new(&config.host_id, &config.currency)?);

    // Seed one subscriber with one account, like a freshly signed
    // contract.
    host.register_subscriber(&config.partner_id, &config.user_id);
    host.add_account(
        &config.partner_id,
        &config.user_id,
        DemoAccount {
            iban: config.iban.clone(),
            bic: config.bic.clone(),
            holder: config.holder.clone(),
            currency: config.currency.clone(),
        },
    );

    info!(
        host = %config.host_id,
        bind = %config.bind,
        "sandbox EBICS host listening"
    );

    let data = web::Data::new(host);
    HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .route("/ebicsweb", web::post().to(ebicsweb))
    })
    .bind(&config.bind)?
    .run()
    .await?;
    Ok(())
}
