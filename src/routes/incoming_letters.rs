use std::{collections::HashMap, time::Duration};

use axum::{
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{NaiveDate, NaiveDateTime, Utc};
use diesel::{dsl::count_star, prelude::*};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::archives::{find_archive, DocumentType};
use super::dispositions::{attach_children, group_by_parent, DispositionNode};
use super::{inline_content_disposition, load_user_summaries, to_iso, UserSummary};
use crate::auth::{AuthenticatedUser, ROLE_SECRETARY};
use crate::error::{AppError, AppResult};
use crate::models::{Disposition, IncomingLetter, NewIncomingLetter};
use crate::numbering::{self, NumberRequest, INCOMING_AGENDA_SCOPE};
use crate::schema::{dispositions, incoming_letters};
use crate::state::AppState;
use crate::utils::json::{nullable_text, required_date, required_text};
use crate::workflow::{self, DispositionProgress, DispositionStatus, IncomingStatus};

const AGENDA_CODE: &str = "SM";
const PRESIGNED_URL_EXPIRY_SECONDS: u64 = 300;

#[derive(Deserialize)]
pub struct CreateIncomingLetterRequest {
    pub letter_number: String,
    pub sender: String,
    pub subject: String,
    pub summary: Option<String>,
    pub letter_date: NaiveDate,
    pub received_date: Option<NaiveDate>,
}

#[derive(Deserialize)]
pub struct IncomingLetterListQuery {
    pub status: Option<String>,
    pub q: Option<String>,
}

#[derive(Serialize)]
pub struct AttachmentResponse {
    pub name: Option<String>,
    pub content_type: Option<String>,
    pub checksum: Option<String>,
}

#[derive(Serialize)]
pub struct IncomingLetterResponse {
    pub id: Uuid,
    pub agenda_number: String,
    pub letter_number: String,
    pub sender: String,
    pub subject: String,
    pub summary: Option<String>,
    pub letter_date: NaiveDate,
    pub received_date: NaiveDate,
    pub status: String,
    pub attachment: Option<AttachmentResponse>,
    pub registered_by: UserSummary,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Serialize)]
pub struct IncomingLetterDetailResponse {
    #[serde(flatten)]
    pub letter: IncomingLetterResponse,
    pub dispositions: Vec<DispositionNode>,
    pub disposition_progress: DispositionProgress,
    pub archive_id: Option<Uuid>,
}

#[derive(Serialize)]
pub struct AttachmentDownloadResponse {
    pub url: String,
    pub expires_in: u64,
    pub filename: Option<String>,
    pub content_type: Option<String>,
}

#[derive(AsChangeset)]
#[diesel(table_name = incoming_letters)]
struct UpdateIncomingLetterChangeset {
    letter_number: Option<String>,
    sender: Option<String>,
    subject: Option<String>,
    summary: Option<Option<String>>,
    letter_date: Option<NaiveDate>,
    received_date: Option<NaiveDate>,
    updated_at: NaiveDateTime,
}

pub async fn create_incoming_letter(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<CreateIncomingLetterRequest>,
) -> AppResult<(StatusCode, Json<IncomingLetterResponse>)> {
    user.require_any_role(&[ROLE_SECRETARY])?;

    let letter_number = non_empty(&payload.letter_number, "letter_number")?;
    let sender = non_empty(&payload.sender, "sender")?;
    let subject = non_empty(&payload.subject, "subject")?;
    let summary = payload
        .summary
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);
    let received_date = payload
        .received_date
        .unwrap_or_else(|| Utc::now().date_naive());
    check_date_order(payload.letter_date, received_date)?;

    let config = state.config.clone();
    let mut conn = state.db()?;
    let letter = conn.transaction::<_, AppError, _>(|conn| {
        let agenda_number = numbering::allocate_number(
            conn,
            &NumberRequest {
                scope_id: INCOMING_AGENDA_SCOPE,
                format: &config.incoming_agenda_format,
                code: AGENDA_CODE,
                unit: &config.organization_unit_code,
                date: received_date,
                padding: config.number_padding,
            },
        )?;

        let new_letter = NewIncomingLetter {
            id: Uuid::new_v4(),
            agenda_number,
            letter_number: letter_number.clone(),
            sender: sender.clone(),
            subject: subject.clone(),
            summary: summary.clone(),
            letter_date: payload.letter_date,
            received_date,
            status: IncomingStatus::Received.as_str().to_string(),
            registered_by: user.user_id,
        };

        match diesel::insert_into(incoming_letters::table)
            .values(&new_letter)
            .execute(conn)
        {
            Ok(_) => {}
            Err(diesel::result::Error::DatabaseError(
                diesel::result::DatabaseErrorKind::UniqueViolation,
                _,
            )) => {
                return Err(AppError::bad_request("agenda number already exists"));
            }
            Err(err) => return Err(AppError::from(err)),
        }

        let stored: IncomingLetter = incoming_letters::table.find(new_letter.id).first(conn)?;
        Ok(stored)
    })?;

    info!(
        letter_id = %letter.id,
        agenda_number = %letter.agenda_number,
        user_id = %user.user_id,
        "incoming letter registered"
    );

    let users = load_user_summaries(&mut conn, [letter.registered_by])?;
    Ok((
        StatusCode::CREATED,
        Json(to_incoming_response(letter, &users)),
    ))
}

pub async fn list_incoming_letters(
    State(state): State<AppState>,
    Query(query): Query<IncomingLetterListQuery>,
) -> AppResult<Json<Vec<IncomingLetterResponse>>> {
    let mut conn = state.db()?;
    let mut rows = incoming_letters::table
        .order((
            incoming_letters::received_date.desc(),
            incoming_letters::created_at.desc(),
        ))
        .into_boxed();

    if let Some(status) = query.status.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        let status = IncomingStatus::parse(status)?;
        rows = rows.filter(incoming_letters::status.eq(status.as_str()));
    }

    if let Some(term) = query.q.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        let pattern = like_pattern(term);
        rows = rows.filter(
            incoming_letters::subject
                .ilike(pattern.clone())
                .or(incoming_letters::sender.ilike(pattern.clone()))
                .or(incoming_letters::letter_number.ilike(pattern.clone()))
                .or(incoming_letters::agenda_number.ilike(pattern)),
        );
    }

    let letters: Vec<IncomingLetter> = rows.load(&mut conn)?;
    let users = load_user_summaries(&mut conn, letters.iter().map(|l| l.registered_by))?;

    Ok(Json(
        letters
            .into_iter()
            .map(|letter| to_incoming_response(letter, &users))
            .collect(),
    ))
}

pub async fn get_incoming_letter(
    State(state): State<AppState>,
    Path(letter_id): Path<Uuid>,
) -> AppResult<Json<IncomingLetterDetailResponse>> {
    let mut conn = state.db()?;
    let letter: IncomingLetter = incoming_letters::table.find(letter_id).first(&mut conn)?;
    let rows: Vec<Disposition> = dispositions::table
        .filter(dispositions::incoming_letter_id.eq(letter_id))
        .order(dispositions::created_at.asc())
        .load(&mut conn)?;

    let statuses = rows
        .iter()
        .map(|row| DispositionStatus::parse(&row.status))
        .collect::<Result<Vec<_>, _>>()?;
    let progress = workflow::disposition_progress(statuses);

    let users = load_user_summaries(
        &mut conn,
        rows.iter()
            .flat_map(|d| [d.from_user_id, d.to_user_id])
            .chain([letter.registered_by]),
    )?;
    let archive_id = find_archive(&mut conn, DocumentType::Incoming, letter_id)?.map(|a| a.id);

    let mut grouped = group_by_parent(rows);
    let tree = attach_children(None, &mut grouped, &users);

    Ok(Json(IncomingLetterDetailResponse {
        letter: to_incoming_response(letter, &users),
        dispositions: tree,
        disposition_progress: progress,
        archive_id,
    }))
}

/// `agenda_number` is assigned at registration and never changes.
pub async fn update_incoming_letter(
    State(state): State<AppState>,
    Path(letter_id): Path<Uuid>,
    user: AuthenticatedUser,
    Json(body): Json<Value>,
) -> AppResult<Json<IncomingLetterResponse>> {
    user.require_any_role(&[ROLE_SECRETARY])?;
    if body.get("agenda_number").is_some() {
        return Err(AppError::bad_request("agenda_number cannot be changed"));
    }

    let changeset = UpdateIncomingLetterChangeset {
        letter_number: required_text(&body, "letter_number").map_err(AppError::bad_request)?,
        sender: required_text(&body, "sender").map_err(AppError::bad_request)?,
        subject: required_text(&body, "subject").map_err(AppError::bad_request)?,
        summary: nullable_text(&body, "summary").map_err(AppError::bad_request)?,
        letter_date: required_date(&body, "letter_date").map_err(AppError::bad_request)?,
        received_date: required_date(&body, "received_date").map_err(AppError::bad_request)?,
        updated_at: Utc::now().naive_utc(),
    };

    let mut conn = state.db()?;
    let updated = conn.transaction::<_, AppError, _>(|conn| {
        let existing: IncomingLetter = incoming_letters::table
            .find(letter_id)
            .for_update()
            .first(conn)?;
        check_date_order(
            changeset.letter_date.unwrap_or(existing.letter_date),
            changeset.received_date.unwrap_or(existing.received_date),
        )?;

        let updated = diesel::update(incoming_letters::table.find(letter_id))
            .set(&changeset)
            .get_result::<IncomingLetter>(conn)?;
        Ok(updated)
    })?;

    info!(letter_id = %letter_id, user_id = %user.user_id, "incoming letter updated");

    let users = load_user_summaries(&mut conn, [updated.registered_by])?;
    Ok(Json(to_incoming_response(updated, &users)))
}

pub async fn delete_incoming_letter(
    State(state): State<AppState>,
    Path(letter_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<impl IntoResponse> {
    user.require_any_role(&[ROLE_SECRETARY])?;

    let mut conn = state.db()?;
    let letter = conn.transaction::<_, AppError, _>(|conn| {
        let letter: IncomingLetter = incoming_letters::table.find(letter_id).first(conn)?;

        let disposition_count: i64 = dispositions::table
            .filter(dispositions::incoming_letter_id.eq(letter_id))
            .select(count_star())
            .first(conn)?;
        if disposition_count > 0 {
            return Err(AppError::bad_request(
                "cannot delete a letter that has dispositions",
            ));
        }
        if find_archive(conn, DocumentType::Incoming, letter_id)?.is_some() {
            return Err(AppError::bad_request("cannot delete an archived letter"));
        }

        diesel::delete(incoming_letters::table.find(letter_id)).execute(conn)?;
        Ok(letter)
    })?;
    drop(conn);

    if let Some(key) = letter.attachment_key.as_deref() {
        if let Err(err) = state.storage.delete_object(key).await {
            warn!(error = %err, key = %key, "failed to delete attachment of removed letter");
        }
    }

    info!(letter_id = %letter_id, user_id = %user.user_id, "incoming letter deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// Stores the scanned letter under `incoming/{id}/{sha256}`.
pub async fn upload_attachment(
    State(state): State<AppState>,
    Path(letter_id): Path<Uuid>,
    user: AuthenticatedUser,
    mut multipart: Multipart,
) -> AppResult<Json<IncomingLetterResponse>> {
    user.require_any_role(&[ROLE_SECRETARY])?;

    let mut file_bytes: Option<Vec<u8>> = None;
    let mut original_name: Option<String> = None;
    let mut content_type: Option<String> = None;

    while let Some(field) = multipart.next_field().await.map_err(|err| {
        error!(error = %err, "invalid multipart data");
        AppError::bad_request(format!("invalid multipart data: {err}"))
    })? {
        if field.name() != Some("file") {
            continue;
        }
        original_name = field.file_name().map(|n| n.to_string());
        content_type = field.content_type().map(|mime| mime.to_string());
        let data = field.bytes().await.map_err(|err| {
            error!(error = %err, "failed to read attachment bytes");
            AppError::bad_request(format!("failed to read file bytes: {err}"))
        })?;
        file_bytes = Some(data.to_vec());
    }

    let bytes = file_bytes.ok_or_else(|| AppError::bad_request("file field is required"))?;
    if bytes.is_empty() {
        return Err(AppError::bad_request("file field must not be empty"));
    }
    let original_name = original_name
        .filter(|name| !name.trim().is_empty())
        .ok_or_else(|| AppError::bad_request("filename is required"))?;
    let content_type = content_type.or_else(|| {
        mime_guess::from_path(&original_name)
            .first_raw()
            .map(str::to_string)
    });

    {
        let mut conn = state.db()?;
        incoming_letters::table
            .find(letter_id)
            .select(incoming_letters::id)
            .first::<Uuid>(&mut conn)?;
        if find_archive(&mut conn, DocumentType::Incoming, letter_id)?.is_some() {
            return Err(AppError::bad_request(
                "cannot replace the attachment of an archived letter",
            ));
        }
    }

    let checksum = hex::encode(Sha256::digest(&bytes));
    let key = format!("incoming/{letter_id}/{checksum}");
    let size_bytes = bytes.len();

    state
        .storage
        .put_object(
            &key,
            bytes,
            content_type.clone(),
            inline_content_disposition(&original_name),
        )
        .await
        .map_err(|err| {
            error!(error = %err, key = %key, "failed to store attachment");
            AppError::internal(format!("failed to store attachment: {err}"))
        })?;

    let mut conn = state.db()?;
    let previous_key: Option<String> = incoming_letters::table
        .find(letter_id)
        .select(incoming_letters::attachment_key)
        .first(&mut conn)?;
    let updated = diesel::update(incoming_letters::table.find(letter_id))
        .set((
            incoming_letters::attachment_key.eq(Some(key.as_str())),
            incoming_letters::attachment_name.eq(Some(original_name.as_str())),
            incoming_letters::attachment_content_type.eq(content_type.as_deref()),
            incoming_letters::attachment_checksum.eq(Some(checksum.as_str())),
            incoming_letters::updated_at.eq(Utc::now().naive_utc()),
        ))
        .get_result::<IncomingLetter>(&mut conn)?;
    let users = load_user_summaries(&mut conn, [updated.registered_by])?;
    drop(conn);

    if let Some(previous) = previous_key.filter(|previous| *previous != key) {
        if let Err(err) = state.storage.delete_object(&previous).await {
            warn!(error = %err, key = %previous, "failed to delete replaced attachment");
        }
    }

    info!(
        letter_id = %letter_id,
        key = %key,
        size_bytes,
        "incoming letter attachment stored"
    );

    Ok(Json(to_incoming_response(updated, &users)))
}

pub async fn download_attachment(
    State(state): State<AppState>,
    Path(letter_id): Path<Uuid>,
) -> AppResult<Json<AttachmentDownloadResponse>> {
    let mut conn = state.db()?;
    let letter: IncomingLetter = incoming_letters::table.find(letter_id).first(&mut conn)?;
    drop(conn);

    let key = letter.attachment_key.ok_or_else(AppError::not_found)?;
    let url = state
        .storage
        .presign_get_object(&key, Duration::from_secs(PRESIGNED_URL_EXPIRY_SECONDS))
        .await
        .map_err(|err| AppError::internal(format!("failed to generate download URL: {err}")))?;

    Ok(Json(AttachmentDownloadResponse {
        url,
        expires_in: PRESIGNED_URL_EXPIRY_SECONDS,
        filename: letter.attachment_name,
        content_type: letter.attachment_content_type,
    }))
}

fn non_empty(value: &str, field: &str) -> AppResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(AppError::bad_request(format!("{field} must not be empty")))
    } else {
        Ok(trimmed.to_string())
    }
}

fn check_date_order(letter_date: NaiveDate, received_date: NaiveDate) -> AppResult<()> {
    if received_date < letter_date {
        return Err(AppError::bad_request(
            "received_date cannot be earlier than letter_date",
        ));
    }
    Ok(())
}

fn like_pattern(term: &str) -> String {
    let escaped = term
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

fn to_incoming_response(
    letter: IncomingLetter,
    users: &HashMap<Uuid, UserSummary>,
) -> IncomingLetterResponse {
    let attachment = letter.attachment_key.as_ref().map(|_| AttachmentResponse {
        name: letter.attachment_name.clone(),
        content_type: letter.attachment_content_type.clone(),
        checksum: letter.attachment_checksum.clone(),
    });

    IncomingLetterResponse {
        id: letter.id,
        agenda_number: letter.agenda_number,
        letter_number: letter.letter_number,
        sender: letter.sender,
        subject: letter.subject,
        summary: letter.summary,
        letter_date: letter.letter_date,
        received_date: letter.received_date,
        status: letter.status,
        attachment,
        registered_by: UserSummary::lookup(users, letter.registered_by),
        created_at: to_iso(letter.created_at),
        updated_at: to_iso(letter.updated_at),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("50%_off"), "%50\\%\\_off%");
        assert_eq!(like_pattern("undangan"), "%undangan%");
    }

    #[test]
    fn received_before_letter_date_is_rejected() {
        let letter = NaiveDate::from_ymd_opt(2025, 1, 10).unwrap();
        assert!(check_date_order(letter, letter).is_ok());
        assert!(check_date_order(letter, letter.pred_opt().unwrap()).is_err());
    }
}
