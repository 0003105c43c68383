pub mod clients;
pub mod config;
pub mod repositories;
pub mod routes;
pub mod services;
pub mod workers;
