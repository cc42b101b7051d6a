use std::env;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use diesel::prelude::*;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use letterdesk::{
    auth::{is_valid_role, password, ROLES},
    config::AppConfig,
    db::{self, PgPool},
    models::{Archive, NewUser},
    schema::{archives, users},
    storage::{ObjectStorage, S3Storage},
};

const USAGE: &str = "Usage: maintenance <command>

Commands:
  create-user <username> <password> <role> [full name]
  expired-archives
  verify-archive-files";

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let args: Vec<String> = env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("create-user") => create_user(&args[1..])?,
        Some("expired-archives") => expired_archives()?,
        Some("verify-archive-files") => verify_archive_files().await?,
        Some(cmd) => {
            eprintln!("Unknown command: {cmd}\n{USAGE}");
            std::process::exit(1);
        }
        None => {
            eprintln!("{USAGE}");
            std::process::exit(1);
        }
    }

    Ok(())
}

fn connect(config: &AppConfig) -> Result<PgPool> {
    tracing::info!(
        component = "maintenance",
        database_url = %config.redacted_database_url(),
        s3_bucket = %config.s3_bucket,
        "loaded letterdesk configuration"
    );
    db::init_pool_with_size(&config.database_url, 1)
}

fn create_user(args: &[String]) -> Result<()> {
    let (username, password, role) = match args {
        [username, password, role, ..] => (username.trim(), password.as_str(), role.trim()),
        _ => bail!("{USAGE}"),
    };
    if username.is_empty() {
        bail!("username must not be empty");
    }
    if password.len() < 8 {
        bail!("password must be at least 8 characters");
    }
    if !is_valid_role(role) {
        bail!("unknown role '{role}', expected one of: {}", ROLES.join(", "));
    }
    let full_name = args.get(3..).map(|rest| rest.join(" ")).unwrap_or_default();

    let config = AppConfig::from_env()?;
    let pool = connect(&config)?;
    let mut conn = pool.get().context("failed to get database connection")?;

    let user = NewUser {
        id: Uuid::new_v4(),
        username: username.to_string(),
        full_name: full_name.trim().to_string(),
        password_hash: password::hash_password(password)?,
        role: role.to_string(),
    };
    diesel::insert_into(users::table)
        .values(&user)
        .execute(&mut conn)
        .with_context(|| format!("failed to create user {username}"))?;

    tracing::info!(user_id = %user.id, username = %user.username, role = %user.role, "user created");
    println!("{}", user.id);
    Ok(())
}

fn expired_archives() -> Result<()> {
    let config = AppConfig::from_env()?;
    let pool = connect(&config)?;
    let mut conn = pool.get().context("failed to get database connection")?;

    let today = Utc::now().date_naive();
    let expired: Vec<Archive> = archives::table
        .filter(archives::retention_until.lt(today))
        .order(archives::retention_until.asc())
        .load(&mut conn)
        .context("failed to load archives")?;

    if expired.is_empty() {
        println!("No archives past their retention date.");
        return Ok(());
    }

    for archive in &expired {
        println!(
            "{}\t{}\t{}\t{}\t{}",
            archive.retention_until,
            archive.document_type,
            archive.document_number,
            archive.classification,
            archive.title
        );
    }
    tracing::info!(count = expired.len(), "listed expired archives");
    Ok(())
}

async fn verify_archive_files() -> Result<()> {
    let config = AppConfig::from_env()?;
    let pool = connect(&config)?;
    let storage = S3Storage::from_config(&config).await?;

    let records: Vec<Archive> = {
        let mut conn = pool.get().context("failed to get database connection")?;
        archives::table
            .order(archives::archived_at.asc())
            .load(&mut conn)
            .context("failed to load archives")?
    };

    let mut missing = 0usize;
    for archive in &records {
        match storage.object_exists(&archive.file_path).await {
            Ok(true) => {}
            Ok(false) => {
                missing += 1;
                tracing::warn!(
                    archive_id = %archive.id,
                    document_number = %archive.document_number,
                    file_path = %archive.file_path,
                    "archived file is missing from storage"
                );
            }
            Err(err) => {
                missing += 1;
                tracing::error!(archive_id = %archive.id, error = %err, "failed to check archived file");
            }
        }
    }

    println!("Checked {} archives, {missing} missing.", records.len());
    if missing > 0 {
        std::process::exit(2);
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
