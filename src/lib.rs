pub mod auth;
pub mod certificate;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod numbering;
pub mod rendering;
pub mod routes;
pub mod schema;
pub mod state;
pub mod storage;
pub mod utils;
pub mod workflow;

use diesel_migrations::{embed_migrations, EmbeddedMigrations};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");
