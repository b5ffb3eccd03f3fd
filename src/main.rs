use std::path::Path;
use std::time::Duration;

use actix_web::{App, HttpServer};
use match_server::app::{configure_app, Services};
use match_server::config::AppConfig;
use match_server::db::init_db;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();
    let config = AppConfig::from_env();

    if let Some(parent) = Path::new(config.database_url.trim_start_matches("sqlite://")).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let pool = init_db(&config.database_url)
        .await
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;

    let port = config.port;
    let services = Services::build(config, pool);
    log::info!("listening on 0.0.0.0:{}", port);

    HttpServer::new(move || {
        let services = services.clone();
        App::new().configure(move |cfg| configure_app(cfg, &services))
    })
    .client_request_timeout(Duration::from_secs(30))
    .bind(("0.0.0.0", port))?
    .run()
    .await
}
