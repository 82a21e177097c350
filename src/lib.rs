pub mod config;
pub mod database;
pub mod janitor;
pub mod routes;
pub mod sandbox;
pub mod validator;
pub mod web_server;
