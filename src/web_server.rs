use actix_web::{App, HttpServer, dev::Server, middleware, web};
use sqlx::sqlite::SqlitePool;

use crate::config::ServerConfig;
use crate::routes::{AuthPolicy, configure};
use crate::sandbox::Engine;

pub fn build_server(
    server_config: ServerConfig,
    db_pool: SqlitePool,
    engine: web::Data<Engine>,
    policy: AuthPolicy,
) -> std::io::Result<Server> {
    let db_pool = web::Data::new(db_pool);
    let policy = web::Data::new(policy);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(db_pool.clone())
            .app_data(policy.clone())
            .app_data(engine.clone())
            .wrap(middleware::Logger::default())
            .configure(configure)
    })
    .bind((server_config.bind_address(), server_config.bind_port()))?
    .run();

    Ok(server)
}
