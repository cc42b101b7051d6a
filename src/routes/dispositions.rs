use std::collections::{HashMap, HashSet};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{NaiveDate, Utc};
use diesel::{dsl::count_star, prelude::*, PgConnection};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::{load_user_summaries, to_iso, UserSummary};
use crate::auth::{AuthenticatedUser, ROLE_MANAGER, ROLE_SECRETARY};
use crate::error::{AppError, AppResult};
use crate::models::{
    Disposition, DispositionFollowUp, IncomingLetter, NewDisposition, NewDispositionFollowUp,
};
use crate::schema::{disposition_follow_ups, dispositions, incoming_letters, users};
use crate::state::AppState;
use crate::workflow::{
    self, DispositionAction, DispositionPriority, DispositionStatus, IncomingStatus,
    WorkflowError,
};

#[derive(Deserialize)]
pub struct CreateDispositionRequest {
    pub to_user_id: Uuid,
    pub instruction: String,
    pub priority: Option<String>,
    pub due_date: Option<NaiveDate>,
    pub parent_disposition_id: Option<Uuid>,
}

#[derive(Deserialize)]
pub struct FollowUpRequest {
    pub note: String,
}

#[derive(Deserialize)]
pub struct DispositionListQuery {
    #[serde(rename = "box")]
    pub mailbox: Option<String>,
    pub status: Option<String>,
}

#[derive(Serialize)]
pub struct DispositionResponse {
    pub id: Uuid,
    pub incoming_letter_id: Uuid,
    pub parent_disposition_id: Option<Uuid>,
    pub from_user: UserSummary,
    pub to_user: UserSummary,
    pub instruction: String,
    pub priority: String,
    pub due_date: Option<NaiveDate>,
    pub status: String,
    pub read_at: Option<String>,
    pub completed_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Serialize)]
pub struct DispositionNode {
    #[serde(flatten)]
    pub disposition: DispositionResponse,
    pub children: Vec<DispositionNode>,
}

#[derive(Serialize)]
pub struct FollowUpResponse {
    pub id: Uuid,
    pub user: UserSummary,
    pub note: String,
    pub created_at: String,
}

#[derive(Serialize)]
pub struct LetterSummary {
    pub id: Uuid,
    pub agenda_number: String,
    pub subject: String,
}

#[derive(Serialize)]
pub struct DispositionListEntry {
    #[serde(flatten)]
    pub disposition: DispositionResponse,
    pub letter: LetterSummary,
}

#[derive(Serialize)]
pub struct DispositionDetailResponse {
    #[serde(flatten)]
    pub disposition: DispositionResponse,
    pub letter: LetterSummary,
    pub follow_ups: Vec<FollowUpResponse>,
    pub children: Vec<DispositionNode>,
}

pub async fn create_disposition(
    State(state): State<AppState>,
    Path(letter_id): Path<Uuid>,
    user: AuthenticatedUser,
    Json(payload): Json<CreateDispositionRequest>,
) -> AppResult<(StatusCode, Json<DispositionResponse>)> {
    let instruction = payload.instruction.trim().to_string();
    if instruction.is_empty() {
        return Err(AppError::bad_request("instruction must not be empty"));
    }
    let priority = match payload.priority.as_deref().map(str::trim) {
        None | Some("") => DispositionPriority::Normal,
        Some(value) => DispositionPriority::parse(value)
            .map_err(|_| AppError::bad_request(format!("unknown priority '{value}'")))?,
    };
    if payload.to_user_id == user.user_id {
        return Err(AppError::bad_request("cannot dispose a letter to yourself"));
    }

    let mut conn = state.db()?;
    let disposition = conn.transaction::<_, AppError, _>(|conn| {
        let letter: IncomingLetter = incoming_letters::table.find(letter_id).first(conn)?;

        match payload.parent_disposition_id {
            Some(parent_id) => {
                let parent: Disposition = dispositions::table
                    .find(parent_id)
                    .first(conn)
                    .optional()?
                    .ok_or_else(|| AppError::bad_request("parent disposition does not exist"))?;
                if parent.incoming_letter_id != letter.id {
                    return Err(AppError::bad_request(
                        "parent disposition belongs to another letter",
                    ));
                }
                if parent.to_user_id != user.user_id {
                    return Err(WorkflowError::NotRecipient.into());
                }
                if DispositionStatus::parse(&parent.status)? == DispositionStatus::Completed {
                    return Err(AppError::bad_request(
                        "cannot delegate a completed disposition",
                    ));
                }
            }
            None => {
                if !user.can_dispose() {
                    return Err(AppError::forbidden());
                }
            }
        }

        let recipient_exists: bool = diesel::select(diesel::dsl::exists(
            users::table.filter(users::id.eq(payload.to_user_id)),
        ))
        .get_result(conn)?;
        if !recipient_exists {
            return Err(AppError::bad_request("recipient does not exist"));
        }

        let new_disposition = NewDisposition {
            id: Uuid::new_v4(),
            incoming_letter_id: letter.id,
            parent_disposition_id: payload.parent_disposition_id,
            from_user_id: user.user_id,
            to_user_id: payload.to_user_id,
            instruction: instruction.clone(),
            priority: priority.as_str().to_string(),
            due_date: payload.due_date,
            status: DispositionStatus::Pending.as_str().to_string(),
        };
        diesel::insert_into(dispositions::table)
            .values(&new_disposition)
            .execute(conn)?;

        sync_incoming_status(conn, letter.id)?;

        let created: Disposition = dispositions::table.find(new_disposition.id).first(conn)?;
        Ok(created)
    })?;

    info!(
        disposition_id = %disposition.id,
        letter_id = %letter_id,
        to_user_id = %disposition.to_user_id,
        nested = disposition.parent_disposition_id.is_some(),
        "disposition created"
    );

    let users = load_user_summaries(
        &mut conn,
        [disposition.from_user_id, disposition.to_user_id],
    )?;
    Ok((
        StatusCode::CREATED,
        Json(to_disposition_response(disposition, &users)),
    ))
}

pub async fn list_dispositions(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(query): Query<DispositionListQuery>,
) -> AppResult<Json<Vec<DispositionListEntry>>> {
    let mut conn = state.db()?;

    let mut rows = dispositions::table
        .inner_join(incoming_letters::table)
        .select((
            dispositions::all_columns,
            (
                incoming_letters::id,
                incoming_letters::agenda_number,
                incoming_letters::subject,
            ),
        ))
        .order(dispositions::created_at.desc())
        .into_boxed();

    rows = match query.mailbox.as_deref().unwrap_or("inbox") {
        "inbox" => rows.filter(dispositions::to_user_id.eq(user.user_id)),
        "outbox" => rows.filter(dispositions::from_user_id.eq(user.user_id)),
        other => {
            return Err(AppError::bad_request(format!(
                "box must be inbox or outbox, got '{other}'"
            )))
        }
    };

    if let Some(status) = query.status.as_deref().filter(|s| !s.trim().is_empty()) {
        let status = DispositionStatus::parse(status.trim())?;
        rows = rows.filter(dispositions::status.eq(status.as_str()));
    }

    let rows: Vec<(Disposition, (Uuid, String, String))> = rows.load(&mut conn)?;
    let users = load_user_summaries(
        &mut conn,
        rows.iter()
            .flat_map(|(d, _)| [d.from_user_id, d.to_user_id]),
    )?;

    let entries = rows
        .into_iter()
        .map(|(disposition, (id, agenda_number, subject))| DispositionListEntry {
            disposition: to_disposition_response(disposition, &users),
            letter: LetterSummary {
                id,
                agenda_number,
                subject,
            },
        })
        .collect();

    Ok(Json(entries))
}

/// Opening a pending disposition as its recipient marks it read.
pub async fn get_disposition(
    State(state): State<AppState>,
    Path(disposition_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<Json<DispositionDetailResponse>> {
    let mut conn = state.db()?;
    let mut disposition: Disposition = dispositions::table.find(disposition_id).first(&mut conn)?;

    let involved = disposition.from_user_id == user.user_id || disposition.to_user_id == user.user_id;
    if !involved {
        user.require_any_role(&[ROLE_SECRETARY, ROLE_MANAGER])?;
    }

    if disposition.to_user_id == user.user_id
        && DispositionStatus::parse(&disposition.status)? == DispositionStatus::Pending
    {
        disposition = persist_transition(&mut conn, &disposition, DispositionAction::Read)?;
    }

    let letter: IncomingLetter = incoming_letters::table
        .find(disposition.incoming_letter_id)
        .first(&mut conn)?;
    let follow_ups: Vec<DispositionFollowUp> = disposition_follow_ups::table
        .filter(disposition_follow_ups::disposition_id.eq(disposition.id))
        .order(disposition_follow_ups::created_at.asc())
        .load(&mut conn)?;
    let siblings: Vec<Disposition> = dispositions::table
        .filter(dispositions::incoming_letter_id.eq(letter.id))
        .order(dispositions::created_at.asc())
        .load(&mut conn)?;

    let users = load_user_summaries(
        &mut conn,
        siblings
            .iter()
            .flat_map(|d| [d.from_user_id, d.to_user_id])
            .chain(follow_ups.iter().map(|f| f.user_id)),
    )?;

    let mut grouped = group_by_parent(siblings);
    let children = attach_children(Some(disposition.id), &mut grouped, &users);

    Ok(Json(DispositionDetailResponse {
        disposition: to_disposition_response(disposition, &users),
        letter: LetterSummary {
            id: letter.id,
            agenda_number: letter.agenda_number,
            subject: letter.subject,
        },
        follow_ups: follow_ups
            .into_iter()
            .map(|follow_up| to_follow_up_response(follow_up, &users))
            .collect(),
        children,
    }))
}

pub async fn mark_read(
    state: State<AppState>,
    path: Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<Json<DispositionResponse>> {
    act_on_disposition(state, path, user, DispositionAction::Read).await
}

pub async fn mark_in_progress(
    state: State<AppState>,
    path: Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<Json<DispositionResponse>> {
    act_on_disposition(state, path, user, DispositionAction::Start).await
}

pub async fn mark_completed(
    state: State<AppState>,
    path: Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<Json<DispositionResponse>> {
    act_on_disposition(state, path, user, DispositionAction::Complete).await
}

async fn act_on_disposition(
    State(state): State<AppState>,
    Path(disposition_id): Path<Uuid>,
    user: AuthenticatedUser,
    action: DispositionAction,
) -> AppResult<Json<DispositionResponse>> {
    let mut conn = state.db()?;
    let updated = conn.transaction::<_, AppError, _>(|conn| {
        let disposition: Disposition = dispositions::table
            .find(disposition_id)
            .for_update()
            .first(conn)?;
        if disposition.to_user_id != user.user_id {
            return Err(WorkflowError::NotRecipient.into());
        }

        let updated = persist_transition(conn, &disposition, action)?;
        if updated.status != disposition.status {
            sync_incoming_status(conn, updated.incoming_letter_id)?;
        }
        Ok(updated)
    })?;

    info!(
        disposition_id = %updated.id,
        status = %updated.status,
        user_id = %user.user_id,
        "disposition status updated"
    );

    let users = load_user_summaries(&mut conn, [updated.from_user_id, updated.to_user_id])?;
    Ok(Json(to_disposition_response(updated, &users)))
}

pub async fn add_follow_up(
    State(state): State<AppState>,
    Path(disposition_id): Path<Uuid>,
    user: AuthenticatedUser,
    Json(payload): Json<FollowUpRequest>,
) -> AppResult<(StatusCode, Json<FollowUpResponse>)> {
    let note = payload.note.trim().to_string();
    if note.is_empty() {
        return Err(AppError::bad_request("note must not be empty"));
    }

    let mut conn = state.db()?;
    let follow_up = conn.transaction::<_, AppError, _>(|conn| {
        let disposition: Disposition = dispositions::table.find(disposition_id).first(conn)?;
        if disposition.to_user_id != user.user_id {
            return Err(WorkflowError::NotRecipient.into());
        }
        if DispositionStatus::parse(&disposition.status)? == DispositionStatus::Completed {
            return Err(AppError::bad_request(
                "cannot add follow-ups to a completed disposition",
            ));
        }

        let new_follow_up = NewDispositionFollowUp {
            id: Uuid::new_v4(),
            disposition_id,
            user_id: user.user_id,
            note: note.clone(),
        };
        diesel::insert_into(disposition_follow_ups::table)
            .values(&new_follow_up)
            .execute(conn)?;

        let stored: DispositionFollowUp = disposition_follow_ups::table
            .find(new_follow_up.id)
            .first(conn)?;
        Ok(stored)
    })?;

    info!(disposition_id = %disposition_id, follow_up_id = %follow_up.id, "follow-up recorded");

    let users = load_user_summaries(&mut conn, [follow_up.user_id])?;
    Ok((
        StatusCode::CREATED,
        Json(to_follow_up_response(follow_up, &users)),
    ))
}

pub async fn cancel_disposition(
    State(state): State<AppState>,
    Path(disposition_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<impl IntoResponse> {
    let mut conn = state.db()?;
    let letter_id = conn.transaction::<_, AppError, _>(|conn| {
        let disposition: Disposition = dispositions::table.find(disposition_id).first(conn)?;
        if disposition.from_user_id != user.user_id && !user.is_admin() {
            return Err(AppError::forbidden());
        }

        let children: i64 = dispositions::table
            .filter(dispositions::parent_disposition_id.eq(disposition_id))
            .select(count_star())
            .first(conn)?;
        if children > 0 {
            return Err(AppError::bad_request(
                "cannot cancel a disposition that has been delegated further",
            ));
        }
        if DispositionStatus::parse(&disposition.status)? == DispositionStatus::Completed {
            return Err(AppError::bad_request("cannot cancel a completed disposition"));
        }

        diesel::delete(dispositions::table.find(disposition_id)).execute(conn)?;
        sync_incoming_status(conn, disposition.incoming_letter_id)?;
        Ok(disposition.incoming_letter_id)
    })?;

    info!(disposition_id = %disposition_id, letter_id = %letter_id, "disposition cancelled");
    Ok(StatusCode::NO_CONTENT)
}

fn persist_transition(
    conn: &mut PgConnection,
    disposition: &Disposition,
    action: DispositionAction,
) -> AppResult<Disposition> {
    let current = DispositionStatus::parse(&disposition.status)?;
    let follow_ups: i64 = disposition_follow_ups::table
        .filter(disposition_follow_ups::disposition_id.eq(disposition.id))
        .select(count_star())
        .first(conn)?;
    let next = workflow::next_disposition_status(current, action, follow_ups)?;
    if next == current {
        return Ok(disposition.clone());
    }

    let now = Utc::now().naive_utc();
    let read_at = disposition.read_at.unwrap_or(now);
    let completed_at = (next == DispositionStatus::Completed).then_some(now);

    let updated = diesel::update(dispositions::table.find(disposition.id))
        .set((
            dispositions::status.eq(next.as_str()),
            dispositions::read_at.eq(Some(read_at)),
            dispositions::completed_at.eq(completed_at),
            dispositions::updated_at.eq(now),
        ))
        .get_result::<Disposition>(conn)?;
    Ok(updated)
}

/// Recomputes the incoming letter status from all of its dispositions.
pub(crate) fn sync_incoming_status(
    conn: &mut PgConnection,
    letter_id: Uuid,
) -> AppResult<IncomingStatus> {
    let statuses: Vec<String> = dispositions::table
        .filter(dispositions::incoming_letter_id.eq(letter_id))
        .select(dispositions::status)
        .load(conn)?;
    let parsed = statuses
        .iter()
        .map(|status| DispositionStatus::parse(status))
        .collect::<Result<Vec<_>, _>>()?;
    let status = workflow::incoming_status(parsed);

    diesel::update(incoming_letters::table.find(letter_id))
        .set((
            incoming_letters::status.eq(status.as_str()),
            incoming_letters::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;
    Ok(status)
}

pub(crate) fn group_by_parent(rows: Vec<Disposition>) -> HashMap<Option<Uuid>, Vec<Disposition>> {
    let ids: HashSet<Uuid> = rows.iter().map(|row| row.id).collect();
    let mut grouped: HashMap<Option<Uuid>, Vec<Disposition>> = HashMap::new();
    for row in rows {
        let parent = row.parent_disposition_id.filter(|id| ids.contains(id));
        grouped.entry(parent).or_default().push(row);
    }
    grouped
}

pub(crate) fn attach_children(
    parent: Option<Uuid>,
    grouped: &mut HashMap<Option<Uuid>, Vec<Disposition>>,
    users: &HashMap<Uuid, UserSummary>,
) -> Vec<DispositionNode> {
    let Some(rows) = grouped.remove(&parent) else {
        return Vec::new();
    };
    rows.into_iter()
        .map(|row| {
            let children = attach_children(Some(row.id), grouped, users);
            DispositionNode {
                disposition: to_disposition_response(row, users),
                children,
            }
        })
        .collect()
}

pub(crate) fn to_disposition_response(
    disposition: Disposition,
    users: &HashMap<Uuid, UserSummary>,
) -> DispositionResponse {
    DispositionResponse {
        id: disposition.id,
        incoming_letter_id: disposition.incoming_letter_id,
        parent_disposition_id: disposition.parent_disposition_id,
        from_user: UserSummary::lookup(users, disposition.from_user_id),
        to_user: UserSummary::lookup(users, disposition.to_user_id),
        instruction: disposition.instruction,
        priority: disposition.priority,
        due_date: disposition.due_date,
        status: disposition.status,
        read_at: disposition.read_at.map(to_iso),
        completed_at: disposition.completed_at.map(to_iso),
        created_at: to_iso(disposition.created_at),
        updated_at: to_iso(disposition.updated_at),
    }
}

fn to_follow_up_response(
    follow_up: DispositionFollowUp,
    users: &HashMap<Uuid, UserSummary>,
) -> FollowUpResponse {
    FollowUpResponse {
        id: follow_up.id,
        user: UserSummary::lookup(users, follow_up.user_id),
        note: follow_up.note,
        created_at: to_iso(follow_up.created_at),
    }
}
