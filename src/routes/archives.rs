use std::collections::HashMap;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Redirect},
    Json,
};
use chrono::{Months, NaiveDate, Utc};
use diesel::{dsl::exists, prelude::*, select, PgConnection};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::outgoing_letters::store_final_document;
use super::{load_user_summaries, to_iso, UserSummary};
use crate::auth::{AuthenticatedUser, ROLE_SECRETARY};
use crate::error::{AppError, AppResult};
use crate::models::{Archive, IncomingLetter, NewArchive, OutgoingLetter};
use crate::schema::{archives, incoming_letters, outgoing_letters, refresh_tokens};
use crate::state::AppState;
use crate::workflow::LetterStatus;

const PRESIGNED_URL_EXPIRY_SECONDS: u64 = 300;
const MAX_RETENTION_YEARS: i32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentType {
    Incoming,
    Outgoing,
}

impl DocumentType {
    pub fn as_str(self) -> &'static str {
        match self {
            DocumentType::Incoming => "incoming",
            DocumentType::Outgoing => "outgoing",
        }
    }

    pub fn parse(value: &str) -> AppResult<Self> {
        match value {
            "incoming" => Ok(DocumentType::Incoming),
            "outgoing" => Ok(DocumentType::Outgoing),
            other => Err(AppError::bad_request(format!(
                "unknown document_type '{other}'"
            ))),
        }
    }
}

#[derive(Deserialize)]
pub struct CreateArchiveRequest {
    pub document_type: DocumentType,
    pub document_id: Uuid,
    pub classification: String,
    pub retention_period: Option<i32>,
    pub notes: Option<String>,
}

#[derive(Deserialize)]
pub struct ArchiveListQuery {
    pub document_type: Option<String>,
    #[serde(default)]
    pub expired: bool,
}

#[derive(Serialize)]
pub struct ArchiveResponse {
    pub id: Uuid,
    pub document_type: String,
    pub document_id: Uuid,
    pub title: String,
    pub document_number: String,
    pub classification: String,
    pub retention_period: i32,
    pub retention_until: NaiveDate,
    pub expired: bool,
    pub notes: Option<String>,
    pub archived_by: UserSummary,
    pub archived_at: String,
}

#[derive(Serialize)]
pub struct ArchiveDetailResponse {
    #[serde(flatten)]
    pub archive: ArchiveResponse,
    pub file_available: bool,
    pub download_path: Option<String>,
}

/// What gets archived for a document: its title, number and stored file.
struct ArchiveSource {
    title: String,
    document_number: String,
    file_path: Option<String>,
}

pub(crate) fn find_archive(
    conn: &mut PgConnection,
    document_type: DocumentType,
    document_id: Uuid,
) -> AppResult<Option<Archive>> {
    let archive = archives::table
        .filter(archives::document_type.eq(document_type.as_str()))
        .filter(archives::document_id.eq(document_id))
        .first(conn)
        .optional()?;
    Ok(archive)
}

/// `None` when the date would overflow the calendar.
pub fn retention_until(archived_on: NaiveDate, years: i32) -> Option<NaiveDate> {
    let months = u32::try_from(years).ok()?.checked_mul(12)?;
    archived_on.checked_add_months(Months::new(months))
}

pub async fn create_archive(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<CreateArchiveRequest>,
) -> AppResult<(StatusCode, Json<ArchiveDetailResponse>)> {
    user.require_any_role(&[ROLE_SECRETARY])?;

    let classification = payload.classification.trim().to_string();
    if classification.is_empty() {
        return Err(AppError::bad_request("classification must not be empty"));
    }
    let retention_period = payload
        .retention_period
        .unwrap_or(state.config.default_retention_years);
    if !(1..=MAX_RETENTION_YEARS).contains(&retention_period) {
        return Err(AppError::bad_request(format!(
            "retention_period must be between 1 and {MAX_RETENTION_YEARS} years"
        )));
    }
    let notes = payload
        .notes
        .map(|notes| notes.trim().to_string())
        .filter(|notes| !notes.is_empty());

    let source = {
        let mut conn = state.db()?;
        if find_archive(&mut conn, payload.document_type, payload.document_id)?.is_some() {
            return Err(AppError::bad_request("document is already archived"));
        }
        load_source(&mut conn, payload.document_type, payload.document_id)?
    };

    let file_path = match source.file_path {
        Some(path) => path,
        None => store_final_document(&state, payload.document_id).await?,
    };

    let now = Utc::now().naive_utc();
    let retention_until = retention_until(now.date(), retention_period)
        .ok_or_else(|| AppError::bad_request("retention_period is out of range"))?;

    let new_archive = NewArchive {
        id: Uuid::new_v4(),
        document_type: payload.document_type.as_str().to_string(),
        document_id: payload.document_id,
        title: source.title,
        document_number: source.document_number,
        classification,
        retention_period,
        retention_until,
        file_path,
        notes,
        archived_by: user.user_id,
        archived_at: now,
    };

    let mut conn = state.db()?;
    let archive = match diesel::insert_into(archives::table)
        .values(&new_archive)
        .get_result::<Archive>(&mut conn)
    {
        Ok(archive) => archive,
        Err(diesel::result::Error::DatabaseError(
            diesel::result::DatabaseErrorKind::UniqueViolation,
            _,
        )) => {
            return Err(AppError::bad_request("document is already archived"));
        }
        Err(err) => return Err(AppError::from(err)),
    };

    info!(
        archive_id = %archive.id,
        document_type = %archive.document_type,
        document_id = %archive.document_id,
        retention_until = %archive.retention_until,
        "document archived"
    );

    let users = load_user_summaries(&mut conn, [archive.archived_by])?;
    drop(conn);
    let detail = build_archive_detail(&state, archive, &users, user.user_id).await?;
    Ok((StatusCode::CREATED, Json(detail)))
}

pub async fn list_archives(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
    Query(query): Query<ArchiveListQuery>,
) -> AppResult<Json<Vec<ArchiveResponse>>> {
    let mut conn = state.db()?;
    let mut rows = archives::table
        .order(archives::archived_at.desc())
        .into_boxed();

    if let Some(raw) = query
        .document_type
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        let document_type = DocumentType::parse(raw)?;
        rows = rows.filter(archives::document_type.eq(document_type.as_str()));
    }

    let today = Utc::now().date_naive();
    if query.expired {
        rows = rows.filter(archives::retention_until.lt(today));
    }

    let items: Vec<Archive> = rows.load(&mut conn)?;
    let users = load_user_summaries(&mut conn, items.iter().map(|a| a.archived_by))?;
    Ok(Json(
        items
            .into_iter()
            .map(|archive| to_archive_response(archive, &users, today))
            .collect(),
    ))
}

pub async fn get_archive(
    State(state): State<AppState>,
    Path(archive_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<Json<ArchiveDetailResponse>> {
    let (archive, users) = {
        let mut conn = state.db()?;
        let archive: Archive = archives::table.find(archive_id).first(&mut conn)?;
        let users = load_user_summaries(&mut conn, [archive.archived_by])?;
        (archive, users)
    };
    let detail = build_archive_detail(&state, archive, &users, user.user_id).await?;
    Ok(Json(detail))
}

/// Removes the archive record only; the stored file stays with its letter.
pub async fn delete_archive(
    State(state): State<AppState>,
    Path(archive_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<impl IntoResponse> {
    if !user.is_admin() {
        return Err(AppError::forbidden());
    }

    let mut conn = state.db()?;
    let deleted = diesel::delete(archives::table.find(archive_id)).execute(&mut conn)?;
    if deleted == 0 {
        return Err(AppError::not_found());
    }

    info!(archive_id = %archive_id, user_id = %user.user_id, "archive deleted");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn download_with_token(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> AppResult<impl IntoResponse> {
    let claims = state
        .jwt
        .verify_download_token(&token)
        .map_err(|_| AppError::unauthorized())?;

    let mut conn = state.db()?;
    let archive: Archive = archives::table.find(claims.archive_id).first(&mut conn)?;

    let now = Utc::now().naive_utc();
    let has_active_refresh: bool = select(exists(
        refresh_tokens::table
            .filter(refresh_tokens::user_id.eq(claims.user_id))
            .filter(refresh_tokens::revoked_at.is_null())
            .filter(refresh_tokens::expires_at.gt(now)),
    ))
    .get_result(&mut conn)?;
    if !has_active_refresh {
        return Err(AppError::unauthorized());
    }
    drop(conn);

    if !file_available(&state, &archive).await {
        return Err(AppError::not_found());
    }

    let presigned_url = state
        .storage
        .presign_get_object(
            &archive.file_path,
            Duration::from_secs(PRESIGNED_URL_EXPIRY_SECONDS),
        )
        .await
        .map_err(|err| AppError::internal(format!("failed to generate download URL: {err}")))?;

    Ok(Redirect::temporary(&presigned_url))
}

fn load_source(
    conn: &mut PgConnection,
    document_type: DocumentType,
    document_id: Uuid,
) -> AppResult<ArchiveSource> {
    match document_type {
        DocumentType::Incoming => {
            let letter: IncomingLetter = incoming_letters::table
                .find(document_id)
                .first(conn)
                .optional()?
                .ok_or_else(|| AppError::bad_request("incoming letter does not exist"))?;
            let file_path = letter.attachment_key.ok_or_else(|| {
                AppError::bad_request("an incoming letter needs an attachment before archiving")
            })?;
            Ok(ArchiveSource {
                title: letter.subject,
                document_number: letter.agenda_number,
                file_path: Some(file_path),
            })
        }
        DocumentType::Outgoing => {
            let letter: OutgoingLetter = outgoing_letters::table
                .find(document_id)
                .first(conn)
                .optional()?
                .ok_or_else(|| AppError::bad_request("outgoing letter does not exist"))?;
            if LetterStatus::parse(&letter.status)? != LetterStatus::Signed {
                return Err(AppError::bad_request(
                    "only fully signed letters can be archived",
                ));
            }
            Ok(ArchiveSource {
                title: letter.subject,
                document_number: letter.letter_number,
                file_path: letter.rendered_key,
            })
        }
    }
}

/// Storage errors count as unavailable.
async fn file_available(state: &AppState, archive: &Archive) -> bool {
    match state.storage.object_exists(&archive.file_path).await {
        Ok(true) => true,
        Ok(false) => {
            warn!(
                archive_id = %archive.id,
                file_path = %archive.file_path,
                "archived file is missing from storage"
            );
            false
        }
        Err(err) => {
            warn!(
                archive_id = %archive.id,
                error = %err,
                "failed to check archived file"
            );
            false
        }
    }
}

async fn build_archive_detail(
    state: &AppState,
    archive: Archive,
    users: &HashMap<Uuid, UserSummary>,
    user_id: Uuid,
) -> AppResult<ArchiveDetailResponse> {
    let file_available = file_available(state, &archive).await;
    let download_path = if file_available {
        let token = state
            .jwt
            .generate_download_token(archive.id, user_id)
            .map_err(|err| {
                AppError::internal(format!("failed to generate download token: {err}"))
            })?;
        Some(format!("/download/{token}"))
    } else {
        None
    };

    Ok(ArchiveDetailResponse {
        archive: to_archive_response(archive, users, Utc::now().date_naive()),
        file_available,
        download_path,
    })
}

fn to_archive_response(
    archive: Archive,
    users: &HashMap<Uuid, UserSummary>,
    today: NaiveDate,
) -> ArchiveResponse {
    ArchiveResponse {
        id: archive.id,
        expired: archive.retention_until < today,
        archived_by: UserSummary::lookup(users, archive.archived_by),
        document_type: archive.document_type,
        document_id: archive.document_id,
        title: archive.title,
        document_number: archive.document_number,
        classification: archive.classification,
        retention_period: archive.retention_period,
        retention_until: archive.retention_until,
        notes: archive.notes,
        archived_at: to_iso(archive.archived_at),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn retention_adds_whole_years() {
        assert_eq!(retention_until(day(2025, 1, 15), 5), Some(day(2030, 1, 15)));
        assert_eq!(retention_until(day(2025, 1, 15), 1), Some(day(2026, 1, 15)));
    }

    #[test]
    fn leap_day_clamps_to_end_of_february() {
        assert_eq!(retention_until(day(2024, 2, 29), 1), Some(day(2025, 2, 28)));
        assert_eq!(retention_until(day(2024, 2, 29), 4), Some(day(2028, 2, 29)));
    }

    #[test]
    fn negative_years_are_rejected() {
        assert_eq!(retention_until(day(2025, 1, 15), -1), None);
    }

    #[test]
    fn document_types_parse() {
        assert_eq!(DocumentType::parse("incoming").unwrap(), DocumentType::Incoming);
        assert_eq!(DocumentType::Outgoing.as_str(), "outgoing");
        assert!(DocumentType::parse("memo").is_err());
    }
}
