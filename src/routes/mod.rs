use std::collections::HashMap;

use axum::http::HeaderValue;
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use diesel::{prelude::*, PgConnection};
use serde::Serialize;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;
use uuid::Uuid;

use crate::{auth::AuthenticatedUser, error::AppResult, schema::users, state::AppState};

pub mod archives;
pub mod auth;
pub mod dispositions;
pub mod health;
pub mod incoming_letters;
pub mod outgoing_letters;
pub mod templates;
pub mod verification;

const MAX_UPLOAD_BYTES: usize = 1024 * 1024 * 64;

pub fn create_router(state: AppState) -> Router<()> {
    let allow_origin = match state.config.cors_allowed_origin.as_ref() {
        Some(origins) => {
            let headers: Vec<HeaderValue> = origins
                .split(',')
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .filter_map(|value| match value.parse::<HeaderValue>() {
                    Ok(header) => Some(header),
                    Err(_) => {
                        warn!(origin = %value, "ignoring invalid CORS allowed origin");
                        None
                    }
                })
                .collect();
            AllowOrigin::list(headers)
        }
        None => AllowOrigin::mirror_request(),
    };

    let cors = CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true);

    let auth_routes = Router::new()
        .route("/login", post(auth::login))
        .route("/refresh", post(auth::refresh))
        .route("/logout", post(auth::logout))
        .route("/me", get(auth::me));

    let incoming_routes = Router::new()
        .route(
            "/",
            get(incoming_letters::list_incoming_letters)
                .post(incoming_letters::create_incoming_letter),
        )
        .route(
            "/:id",
            get(incoming_letters::get_incoming_letter)
                .patch(incoming_letters::update_incoming_letter)
                .delete(incoming_letters::delete_incoming_letter),
        )
        .route(
            "/:id/attachment",
            get(incoming_letters::download_attachment).post(incoming_letters::upload_attachment),
        )
        .route("/:id/dispositions", post(dispositions::create_disposition));

    let disposition_routes = Router::new()
        .route("/", get(dispositions::list_dispositions))
        .route(
            "/:id",
            get(dispositions::get_disposition).delete(dispositions::cancel_disposition),
        )
        .route("/:id/read", post(dispositions::mark_read))
        .route("/:id/in-progress", post(dispositions::mark_in_progress))
        .route("/:id/follow-ups", post(dispositions::add_follow_up))
        .route("/:id/complete", post(dispositions::mark_completed));

    let template_routes = Router::new()
        .route(
            "/",
            get(templates::list_templates).post(templates::create_template),
        )
        .route(
            "/:id",
            get(templates::get_template)
                .patch(templates::update_template)
                .delete(templates::delete_template),
        )
        .route("/:id/numbering/preview", get(templates::preview_numbering));

    let outgoing_routes = Router::new()
        .route(
            "/",
            get(outgoing_letters::list_letters).post(outgoing_letters::create_letter),
        )
        .route(
            "/:id",
            get(outgoing_letters::get_letter)
                .patch(outgoing_letters::update_letter)
                .delete(outgoing_letters::delete_letter),
        )
        .route("/:id/submit", post(outgoing_letters::submit_letter))
        .route("/:id/sign", post(outgoing_letters::sign_letter))
        .route("/:id/reject", post(outgoing_letters::reject_letter))
        .route(
            "/:id/request-revision",
            post(outgoing_letters::request_revision),
        )
        .route("/:id/resubmit", post(outgoing_letters::resubmit_letter))
        .route("/:id/preview", get(outgoing_letters::preview_letter));

    let archive_routes = Router::new()
        .route(
            "/",
            get(archives::list_archives).post(archives::create_archive),
        )
        .route(
            "/:id",
            get(archives::get_archive).delete(archives::delete_archive),
        );

    let public_routes = Router::new()
        .route("/download/:token", get(archives::download_with_token))
        .route("/verify/:hash", get(verification::verify_certificate))
        .route("/verify/:hash/qr", get(verification::verification_qr));

    let protected_state = state.clone();
    let protected_routes = Router::new()
        .nest("/api/incoming-letters", incoming_routes)
        .nest("/api/dispositions", disposition_routes)
        .nest("/api/templates", template_routes)
        .nest("/api/outgoing-letters", outgoing_routes)
        .nest("/api/archives", archive_routes)
        .layer(middleware::from_extractor_with_state::<AuthenticatedUser, _>(protected_state));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .nest("/api/auth", auth_routes)
        .route("/api/health", get(health::health_check))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
}

pub(crate) fn to_iso(dt: NaiveDateTime) -> String {
    DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc).to_rfc3339()
}

pub(crate) fn inline_content_disposition(filename: &str) -> Option<String> {
    if filename.is_empty() {
        return None;
    }

    let sanitized: String = filename
        .chars()
        .map(|ch| match ch {
            '"' | '\\' => '_',
            _ => ch,
        })
        .collect();

    let encoded =
        percent_encoding::utf8_percent_encode(&sanitized, percent_encoding::NON_ALPHANUMERIC);
    Some(format!(
        "inline; filename=\"{}\"; filename*=UTF-8''{}",
        sanitized, encoded
    ))
}

#[derive(Debug, Clone, Serialize)]
pub struct UserSummary {
    pub id: Uuid,
    pub username: String,
    pub full_name: String,
}

impl UserSummary {
    /// Falls back to a bare id when the user row is gone.
    pub fn lookup(users: &HashMap<Uuid, UserSummary>, id: Uuid) -> UserSummary {
        users.get(&id).cloned().unwrap_or_else(|| UserSummary {
            id,
            username: String::new(),
            full_name: String::new(),
        })
    }
}

pub(crate) fn load_user_summaries(
    conn: &mut PgConnection,
    ids: impl IntoIterator<Item = Uuid>,
) -> AppResult<HashMap<Uuid, UserSummary>> {
    let mut ids: Vec<Uuid> = ids.into_iter().collect();
    ids.sort_unstable();
    ids.dedup();
    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let rows: Vec<(Uuid, String, String)> = users::table
        .filter(users::id.eq_any(&ids))
        .select((users::id, users::username, users::full_name))
        .load(conn)?;

    Ok(rows
        .into_iter()
        .map(|(id, username, full_name)| {
            (
                id,
                UserSummary {
                    id,
                    username,
                    full_name,
                },
            )
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_disposition_escapes_quotes() {
        let header = inline_content_disposition("surat \"final\".pdf").unwrap();
        assert!(header.starts_with("inline; filename=\"surat _final_.pdf\""));
        assert!(header.ends_with("filename*=UTF-8''surat%20%5Ffinal%5F%2Epdf"));
        assert!(inline_content_disposition("").is_none());
    }

    #[test]
    fn iso_timestamps_are_utc() {
        let dt = chrono::NaiveDate::from_ymd_opt(2025, 1, 15)
            .unwrap()
            .and_hms_opt(8, 30, 0)
            .unwrap();
        assert_eq!(to_iso(dt), "2025-01-15T08:30:00+00:00");
    }
}
