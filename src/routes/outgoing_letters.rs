use std::collections::{HashMap, HashSet};

use axum::{
    extract::{Path, Query, State},
    http::{header::CONTENT_TYPE, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::{NaiveDateTime, Utc};
use diesel::{dsl::count_star, prelude::*, PgConnection};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info};
use uuid::Uuid;

use super::archives::{find_archive, DocumentType};
use super::{inline_content_disposition, load_user_summaries, to_iso, UserSummary};
use crate::auth::{AuthenticatedUser, ROLE_MANAGER, ROLE_SECRETARY};
use crate::certificate;
use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::models::{
    Certificate, LetterSignatory, LetterTemplate, NewCertificate, NewLetterSignatory,
    NewOutgoingLetter, NewSignatureEvent, OutgoingLetter, SignatureEvent,
};
use crate::numbering::{self, NumberRequest};
use crate::rendering::{self, RenderInput, RenderedSignature, TemplateLayout};
use crate::schema::{
    certificates, letter_signatories, letter_templates, outgoing_letters, signature_events, users,
};
use crate::state::AppState;
use crate::utils::json::required_text;
use crate::workflow::{self, LetterEvent, LetterStatus, SignatoryStatus, WorkflowError};

pub const EVENT_APPROVED: &str = "approved";
pub const EVENT_REJECTED: &str = "rejected";
pub const EVENT_REVISION_REQUESTED: &str = "revision_requested";
pub const EVENT_RESET: &str = "reset";

#[derive(Deserialize)]
pub struct CreateLetterRequest {
    pub template_id: Uuid,
    pub subject: String,
    pub recipient: String,
    pub unit_code: Option<String>,
    pub variables: Option<Value>,
    /// Signature slot key -> user id.
    pub signatories: HashMap<String, Uuid>,
}

#[derive(Deserialize)]
pub struct LetterListQuery {
    pub status: Option<String>,
    #[serde(default)]
    pub awaiting_me: bool,
}

#[derive(Deserialize, Default)]
pub struct SignatoryActionRequest {
    pub note: Option<String>,
}

#[derive(Clone, Serialize)]
pub struct TemplateSummary {
    pub id: Uuid,
    pub name: String,
    pub code: String,
}

#[derive(Serialize)]
pub struct LetterResponse {
    pub id: Uuid,
    pub template: TemplateSummary,
    pub letter_number: String,
    pub subject: String,
    pub recipient: String,
    pub unit_code: String,
    pub variables: Value,
    pub status: String,
    pub created_by: UserSummary,
    pub has_final_document: bool,
    pub submitted_at: Option<String>,
    pub signed_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Serialize)]
pub struct SignatoryResponse {
    pub id: Uuid,
    pub slot_key: String,
    pub slot_label: String,
    pub column: i32,
    pub order: i32,
    pub user: UserSummary,
    pub status: String,
    pub note: Option<String>,
    pub acted_at: Option<String>,
}

#[derive(Serialize)]
pub struct SignatureEventResponse {
    pub id: Uuid,
    pub signatory_id: Option<Uuid>,
    pub user: UserSummary,
    pub action: String,
    pub note: Option<String>,
    pub created_at: String,
}

#[derive(Serialize)]
pub struct CertificateSummary {
    pub verification_hash: String,
    pub verification_url: String,
    pub signer_id: Uuid,
    pub issued_at: String,
}

#[derive(Serialize)]
pub struct LetterDetailResponse {
    #[serde(flatten)]
    pub letter: LetterResponse,
    pub signatories: Vec<SignatoryResponse>,
    pub events: Vec<SignatureEventResponse>,
    pub certificate: Option<CertificateSummary>,
    pub archive_id: Option<Uuid>,
    /// Whether the caller holds a slot that may act right now.
    pub can_act: bool,
}

#[derive(Serialize)]
pub struct LetterListEntry {
    #[serde(flatten)]
    pub letter: LetterResponse,
    pub can_act: bool,
}

#[derive(Debug, Clone, Copy)]
enum SignatoryAction {
    Approve,
    Reject,
    RequestRevision,
}

impl SignatoryAction {
    fn requires_note(self) -> bool {
        !matches!(self, SignatoryAction::Approve)
    }

    fn event_action(self) -> &'static str {
        match self {
            SignatoryAction::Approve => EVENT_APPROVED,
            SignatoryAction::Reject => EVENT_REJECTED,
            SignatoryAction::RequestRevision => EVENT_REVISION_REQUESTED,
        }
    }

    fn event(self, signatory_id: Uuid) -> LetterEvent {
        match self {
            SignatoryAction::Approve => LetterEvent::Approve { signatory_id },
            SignatoryAction::Reject => LetterEvent::Reject { signatory_id },
            SignatoryAction::RequestRevision => LetterEvent::RequestRevision { signatory_id },
        }
    }
}

pub async fn create_letter(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<CreateLetterRequest>,
) -> AppResult<(StatusCode, Json<LetterDetailResponse>)> {
    let subject = payload.subject.trim().to_string();
    if subject.is_empty() {
        return Err(AppError::bad_request("subject must not be empty"));
    }
    let recipient = payload.recipient.trim().to_string();
    if recipient.is_empty() {
        return Err(AppError::bad_request("recipient must not be empty"));
    }
    let unit_code = payload
        .unit_code
        .as_deref()
        .map(str::trim)
        .filter(|unit| !unit.is_empty())
        .unwrap_or(state.config.organization_unit_code.as_str())
        .to_string();
    let variables = rendering::normalize_variables(payload.variables)?;

    let config = state.config.clone();
    let mut conn = state.db()?;
    let letter_id = conn.transaction::<_, AppError, _>(|conn| {
        let template: LetterTemplate = letter_templates::table
            .find(payload.template_id)
            .first(conn)
            .optional()?
            .ok_or_else(|| AppError::bad_request("template does not exist"))?;
        if !template.is_active {
            return Err(AppError::bad_request(
                "template is inactive and cannot be used for new letters",
            ));
        }
        let layout = TemplateLayout::from_value(&template.layout)?;
        check_slot_assignments(conn, &layout, &payload.signatories)?;

        let today = Utc::now().date_naive();
        let letter_number = numbering::allocate_number(
            conn,
            &NumberRequest {
                scope_id: template.numbering_scope(),
                format: &template.numbering_format,
                code: &template.code,
                unit: &unit_code,
                date: today,
                padding: config.number_padding,
            },
        )?;

        let new_letter = NewOutgoingLetter {
            id: Uuid::new_v4(),
            template_id: template.id,
            created_by: user.user_id,
            letter_number,
            subject: subject.clone(),
            recipient: recipient.clone(),
            unit_code: unit_code.clone(),
            variables: Value::Object(variables.clone()),
            status: LetterStatus::Draft.as_str().to_string(),
            submitted_at: None,
        };
        match diesel::insert_into(outgoing_letters::table)
            .values(&new_letter)
            .execute(conn)
        {
            Ok(_) => {}
            Err(diesel::result::Error::DatabaseError(
                diesel::result::DatabaseErrorKind::UniqueViolation,
                _,
            )) => {
                return Err(AppError::bad_request("letter number already exists"));
            }
            Err(err) => return Err(AppError::from(err)),
        }

        let rows = layout
            .signature_slots
            .iter()
            .map(|slot| {
                let key = slot.key.trim();
                let user_id = *payload.signatories.get(key).ok_or_else(|| {
                    AppError::bad_request(format!("missing signatory for slot '{key}'"))
                })?;
                Ok(NewLetterSignatory {
                    id: Uuid::new_v4(),
                    letter_id: new_letter.id,
                    user_id,
                    slot_key: key.to_string(),
                    slot_label: slot.label.clone(),
                    slot_column: slot.column,
                    sign_order: slot.order,
                    status: SignatoryStatus::Pending.as_str().to_string(),
                })
            })
            .collect::<AppResult<Vec<_>>>()?;
        diesel::insert_into(letter_signatories::table)
            .values(&rows)
            .execute(conn)?;

        info!(
            letter_id = %new_letter.id,
            letter_number = %new_letter.letter_number,
            template_id = %template.id,
            signatories = rows.len(),
            "outgoing letter created"
        );
        Ok(new_letter.id)
    })?;

    let detail = build_letter_detail(&mut conn, &config, letter_id, &user)?;
    Ok((StatusCode::CREATED, Json(detail)))
}

pub async fn list_letters(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(query): Query<LetterListQuery>,
) -> AppResult<Json<Vec<LetterListEntry>>> {
    let mut conn = state.db()?;
    let mut rows = outgoing_letters::table
        .order(outgoing_letters::created_at.desc())
        .into_boxed();

    if let Some(status) = query.status.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        let status = LetterStatus::parse(status)?;
        rows = rows.filter(outgoing_letters::status.eq(status.as_str()));
    }

    if !sees_all_letters(&user) {
        let mine = letter_signatories::table
            .filter(letter_signatories::user_id.eq(user.user_id))
            .select(letter_signatories::letter_id);
        rows = rows.filter(
            outgoing_letters::created_by
                .eq(user.user_id)
                .or(outgoing_letters::id.eq_any(mine)),
        );
    }

    let letters: Vec<OutgoingLetter> = rows.load(&mut conn)?;
    let letter_ids: Vec<Uuid> = letters.iter().map(|letter| letter.id).collect();
    let signatory_rows: Vec<LetterSignatory> = letter_signatories::table
        .filter(letter_signatories::letter_id.eq_any(&letter_ids))
        .load(&mut conn)?;
    let mut by_letter: HashMap<Uuid, Vec<LetterSignatory>> = HashMap::new();
    for row in signatory_rows {
        by_letter.entry(row.letter_id).or_default().push(row);
    }

    let templates = load_template_summaries(&mut conn, letters.iter().map(|l| l.template_id))?;
    let users = load_user_summaries(&mut conn, letters.iter().map(|l| l.created_by))?;

    let mut entries = Vec::with_capacity(letters.len());
    for letter in letters {
        let status = LetterStatus::parse(&letter.status)?;
        let views = workflow::signatory_views(
            by_letter.get(&letter.id).map(Vec::as_slice).unwrap_or_default(),
        )?;
        let can_act = workflow::actionable_slot(status, user.user_id, &views).is_some();
        if query.awaiting_me && !can_act {
            continue;
        }
        entries.push(LetterListEntry {
            letter: to_letter_response(letter, &templates, &users),
            can_act,
        });
    }

    Ok(Json(entries))
}

pub async fn get_letter(
    State(state): State<AppState>,
    Path(letter_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<Json<LetterDetailResponse>> {
    let mut conn = state.db()?;
    let letter: OutgoingLetter = outgoing_letters::table.find(letter_id).first(&mut conn)?;
    ensure_can_view(&mut conn, &user, &letter)?;
    let detail = build_letter_detail(&mut conn, &state.config, letter_id, &user)?;
    Ok(Json(detail))
}

/// The letter number is fixed at creation; only body fields change here.
pub async fn update_letter(
    State(state): State<AppState>,
    Path(letter_id): Path<Uuid>,
    user: AuthenticatedUser,
    Json(body): Json<Value>,
) -> AppResult<Json<LetterDetailResponse>> {
    if body.get("letter_number").is_some() {
        return Err(AppError::bad_request("letter_number cannot be changed"));
    }
    let subject = required_text(&body, "subject").map_err(AppError::bad_request)?;
    let recipient = required_text(&body, "recipient").map_err(AppError::bad_request)?;
    let variables = match body.get("variables") {
        None => None,
        Some(value) => Some(Value::Object(rendering::normalize_variables(Some(
            value.clone(),
        ))?)),
    };

    let mut conn = state.db()?;
    conn.transaction::<_, AppError, _>(|conn| {
        let letter: OutgoingLetter = outgoing_letters::table
            .find(letter_id)
            .for_update()
            .first(conn)?;
        ensure_creator(&user, &letter)?;
        let status = LetterStatus::parse(&letter.status)?;
        if !status.is_editable() {
            return Err(AppError::bad_request(format!(
                "a letter with status {status} cannot be edited"
            )));
        }

        let now = Utc::now().naive_utc();
        diesel::update(outgoing_letters::table.find(letter_id))
            .set((
                subject.as_deref().map(|value| outgoing_letters::subject.eq(value)),
                recipient
                    .as_deref()
                    .map(|value| outgoing_letters::recipient.eq(value)),
                variables
                    .as_ref()
                    .map(|value| outgoing_letters::variables.eq(value)),
                outgoing_letters::updated_at.eq(now),
            ))
            .execute(conn)?;
        Ok(())
    })?;

    info!(letter_id = %letter_id, user_id = %user.user_id, "outgoing letter updated");
    let detail = build_letter_detail(&mut conn, &state.config, letter_id, &user)?;
    Ok(Json(detail))
}

/// Only possible until the first signatory acts.
pub async fn delete_letter(
    State(state): State<AppState>,
    Path(letter_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<impl IntoResponse> {
    let mut conn = state.db()?;
    conn.transaction::<_, AppError, _>(|conn| {
        let letter: OutgoingLetter = outgoing_letters::table
            .find(letter_id)
            .for_update()
            .first(conn)?;
        ensure_creator(&user, &letter)?;

        let events: i64 = signature_events::table
            .filter(signature_events::letter_id.eq(letter_id))
            .select(count_star())
            .first(conn)?;
        if events > 0 {
            return Err(AppError::bad_request(
                "cannot delete a letter after signatories have acted on it",
            ));
        }
        if LetterStatus::parse(&letter.status)? == LetterStatus::Signed {
            return Err(AppError::bad_request("cannot delete a signed letter"));
        }

        diesel::delete(outgoing_letters::table.find(letter_id)).execute(conn)?;
        Ok(())
    })?;

    info!(letter_id = %letter_id, user_id = %user.user_id, "outgoing letter deleted");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn submit_letter(
    State(state): State<AppState>,
    Path(letter_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<Json<LetterDetailResponse>> {
    let mut conn = state.db()?;
    let to = conn.transaction::<_, AppError, _>(|conn| {
        let letter: OutgoingLetter = outgoing_letters::table
            .find(letter_id)
            .for_update()
            .first(conn)?;
        ensure_creator(&user, &letter)?;
        require_template_variables(conn, &letter)?;

        let rows = load_signatories(conn, letter_id)?;
        let views = workflow::signatory_views(&rows)?;
        let transition = workflow::apply(
            LetterStatus::parse(&letter.status)?,
            LetterEvent::Submit,
            &views,
        )?;

        let now = Utc::now().naive_utc();
        diesel::update(outgoing_letters::table.find(letter_id))
            .set((
                outgoing_letters::status.eq(transition.to.as_str()),
                outgoing_letters::submitted_at.eq(Some(now)),
                outgoing_letters::updated_at.eq(now),
            ))
            .execute(conn)?;
        Ok(transition.to)
    })?;

    info!(letter_id = %letter_id, status = %to, "outgoing letter submitted");
    let detail = build_letter_detail(&mut conn, &state.config, letter_id, &user)?;
    Ok(Json(detail))
}

pub async fn sign_letter(
    state: State<AppState>,
    path: Path<Uuid>,
    user: AuthenticatedUser,
    payload: Option<Json<SignatoryActionRequest>>,
) -> AppResult<Json<LetterDetailResponse>> {
    act_as_signatory(state, path, user, payload, SignatoryAction::Approve).await
}

pub async fn reject_letter(
    state: State<AppState>,
    path: Path<Uuid>,
    user: AuthenticatedUser,
    payload: Option<Json<SignatoryActionRequest>>,
) -> AppResult<Json<LetterDetailResponse>> {
    act_as_signatory(state, path, user, payload, SignatoryAction::Reject).await
}

pub async fn request_revision(
    state: State<AppState>,
    path: Path<Uuid>,
    user: AuthenticatedUser,
    payload: Option<Json<SignatoryActionRequest>>,
) -> AppResult<Json<LetterDetailResponse>> {
    act_as_signatory(state, path, user, payload, SignatoryAction::RequestRevision).await
}

async fn act_as_signatory(
    State(state): State<AppState>,
    Path(letter_id): Path<Uuid>,
    user: AuthenticatedUser,
    payload: Option<Json<SignatoryActionRequest>>,
    action: SignatoryAction,
) -> AppResult<Json<LetterDetailResponse>> {
    let note = payload
        .and_then(|Json(body)| body.note)
        .map(|note| note.trim().to_string())
        .filter(|note| !note.is_empty());
    if action.requires_note() && note.is_none() {
        return Err(AppError::bad_request("note is required"));
    }

    let mut conn = state.db()?;
    let transition = conn.transaction::<_, AppError, _>(|conn| {
        let letter: OutgoingLetter = outgoing_letters::table
            .find(letter_id)
            .for_update()
            .first(conn)?;
        let status = LetterStatus::parse(&letter.status)?;
        let rows = load_signatories(conn, letter_id)?;
        let views = workflow::signatory_views(&rows)?;

        let signatory_id = workflow::actionable_slot(status, user.user_id, &views)
            .or_else(|| views.iter().find(|view| view.user_id == user.user_id))
            .map(|view| view.id)
            .ok_or(WorkflowError::NotYourTurn)?;
        let transition = workflow::apply(status, action.event(signatory_id), &views)?;

        let now = Utc::now().naive_utc();
        match transition.signatory_update {
            Some((id, next)) => {
                diesel::update(letter_signatories::table.find(id))
                    .set((
                        letter_signatories::status.eq(next.as_str()),
                        letter_signatories::note.eq(note.as_deref()),
                        letter_signatories::acted_at.eq(Some(now)),
                        letter_signatories::updated_at.eq(now),
                    ))
                    .execute(conn)?;
            }
            None => {
                diesel::update(letter_signatories::table.find(signatory_id))
                    .set((
                        letter_signatories::note.eq(note.as_deref()),
                        letter_signatories::updated_at.eq(now),
                    ))
                    .execute(conn)?;
            }
        }

        diesel::insert_into(signature_events::table)
            .values(&NewSignatureEvent {
                id: Uuid::new_v4(),
                letter_id,
                signatory_id: Some(signatory_id),
                user_id: user.user_id,
                action: action.event_action().to_string(),
                note: note.clone(),
            })
            .execute(conn)?;

        let signed_at = transition.completes_letter().then_some(now);
        diesel::update(outgoing_letters::table.find(letter_id))
            .set((
                outgoing_letters::status.eq(transition.to.as_str()),
                signed_at.map(|at| outgoing_letters::signed_at.eq(Some(at))),
                outgoing_letters::updated_at.eq(now),
            ))
            .execute(conn)?;

        if let Some(signed_at) = signed_at {
            let issued = issue_certificate(conn, &letter, user.user_id, signed_at)?;
            info!(
                letter_id = %letter_id,
                verification_hash = %issued.verification_hash,
                "verification certificate issued"
            );
        }

        Ok(transition)
    })?;
    drop(conn);

    info!(
        letter_id = %letter_id,
        user_id = %user.user_id,
        action = action.event_action(),
        from = %transition.from,
        to = %transition.to,
        "signatory action recorded"
    );

    if transition.completes_letter() {
        if let Err(err) = store_final_document(&state, letter_id).await {
            error!(
                letter_id = %letter_id,
                error = %err.message(),
                "failed to store final letter document"
            );
        }
    }

    let mut conn = state.db()?;
    let detail = build_letter_detail(&mut conn, &state.config, letter_id, &user)?;
    Ok(Json(detail))
}

/// Sends a revised or rejected letter back to every signatory.
pub async fn resubmit_letter(
    State(state): State<AppState>,
    Path(letter_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<Json<LetterDetailResponse>> {
    let mut conn = state.db()?;
    let to = conn.transaction::<_, AppError, _>(|conn| {
        let letter: OutgoingLetter = outgoing_letters::table
            .find(letter_id)
            .for_update()
            .first(conn)?;
        ensure_creator(&user, &letter)?;
        require_template_variables(conn, &letter)?;

        let rows = load_signatories(conn, letter_id)?;
        let views = workflow::signatory_views(&rows)?;
        let transition = workflow::apply(
            LetterStatus::parse(&letter.status)?,
            LetterEvent::Resubmit,
            &views,
        )?;

        let now = Utc::now().naive_utc();
        if transition.reset_signatories {
            diesel::update(
                letter_signatories::table.filter(letter_signatories::letter_id.eq(letter_id)),
            )
            .set((
                letter_signatories::status.eq(SignatoryStatus::Pending.as_str()),
                letter_signatories::note.eq(None::<String>),
                letter_signatories::acted_at.eq(None::<NaiveDateTime>),
                letter_signatories::updated_at.eq(now),
            ))
            .execute(conn)?;

            diesel::insert_into(signature_events::table)
                .values(&NewSignatureEvent {
                    id: Uuid::new_v4(),
                    letter_id,
                    signatory_id: None,
                    user_id: user.user_id,
                    action: EVENT_RESET.to_string(),
                    note: None,
                })
                .execute(conn)?;
        }

        diesel::update(outgoing_letters::table.find(letter_id))
            .set((
                outgoing_letters::status.eq(transition.to.as_str()),
                outgoing_letters::submitted_at.eq(Some(now)),
                outgoing_letters::updated_at.eq(now),
            ))
            .execute(conn)?;
        Ok(transition.to)
    })?;

    info!(letter_id = %letter_id, status = %to, "outgoing letter resubmitted");
    let detail = build_letter_detail(&mut conn, &state.config, letter_id, &user)?;
    Ok(Json(detail))
}

pub async fn preview_letter(
    State(state): State<AppState>,
    Path(letter_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<impl IntoResponse> {
    let mut conn = state.db()?;
    let letter: OutgoingLetter = outgoing_letters::table.find(letter_id).first(&mut conn)?;
    ensure_can_view(&mut conn, &user, &letter)?;
    let html = render_letter(&mut conn, &state.config, &letter)?;
    Ok(([(CONTENT_TYPE, "text/html; charset=utf-8")], html))
}

/// Renders the letter and writes it to `letters/{id}/final.html`.
pub(crate) async fn store_final_document(state: &AppState, letter_id: Uuid) -> AppResult<String> {
    let (html, filename) = {
        let mut conn = state.db()?;
        let letter: OutgoingLetter = outgoing_letters::table.find(letter_id).first(&mut conn)?;
        let html = render_letter(&mut conn, &state.config, &letter)?;
        (html, format!("{}.html", letter.letter_number.replace('/', "-")))
    };

    let key = format!("letters/{letter_id}/final.html");
    state
        .storage
        .put_object(
            &key,
            html.into_bytes(),
            Some("text/html; charset=utf-8".to_string()),
            inline_content_disposition(&filename),
        )
        .await
        .map_err(|err| {
            error!(error = %err, key = %key, "failed to store final letter document");
            AppError::internal(format!("failed to store final document: {err}"))
        })?;

    let mut conn = state.db()?;
    diesel::update(outgoing_letters::table.find(letter_id))
        .set(outgoing_letters::rendered_key.eq(Some(key.as_str())))
        .execute(&mut conn)?;

    info!(letter_id = %letter_id, key = %key, "final letter document stored");
    Ok(key)
}

fn render_letter(
    conn: &mut PgConnection,
    config: &AppConfig,
    letter: &OutgoingLetter,
) -> AppResult<String> {
    let template: LetterTemplate = letter_templates::table
        .find(letter.template_id)
        .first(conn)?;
    let layout = TemplateLayout::from_value(&template.layout)?;
    let rows = load_signatories(conn, letter.id)?;
    let users = load_user_summaries(conn, rows.iter().map(|row| row.user_id))?;
    let certificate: Option<Certificate> = certificates::table
        .filter(certificates::letter_id.eq(letter.id))
        .first(conn)
        .optional()?;
    let verification_url = certificate
        .as_ref()
        .map(|cert| config.verification_url(&cert.verification_hash));

    let signatures = rows
        .iter()
        .map(|row| {
            Ok(RenderedSignature {
                slot_label: row.slot_label.clone(),
                column: row.slot_column,
                order: row.sign_order,
                signer_name: display_name(&UserSummary::lookup(&users, row.user_id)),
                status: SignatoryStatus::parse(&row.status)?,
                acted_at: row.acted_at,
            })
        })
        .collect::<AppResult<Vec<_>>>()?;
    let variables: Map<String, Value> = letter.variables.as_object().cloned().unwrap_or_default();

    Ok(rendering::render_html(
        &layout,
        &RenderInput {
            letter_number: &letter.letter_number,
            subject: &letter.subject,
            recipient: &letter.recipient,
            date: letter.created_at.date(),
            variables: &variables,
            signatures: &signatures,
            verification_url: verification_url.as_deref(),
        },
    ))
}

fn issue_certificate(
    conn: &mut PgConnection,
    letter: &OutgoingLetter,
    signer_id: Uuid,
    now: NaiveDateTime,
) -> AppResult<Certificate> {
    let issued_at = certificate::issue_time(now);
    let new_certificate = NewCertificate {
        id: Uuid::new_v4(),
        letter_id: letter.id,
        verification_hash: certificate::verification_hash(
            letter.id,
            &letter.letter_number,
            signer_id,
            issued_at,
        ),
        letter_number: letter.letter_number.clone(),
        signer_id,
        issued_at,
    };
    let stored = diesel::insert_into(certificates::table)
        .values(&new_certificate)
        .get_result::<Certificate>(conn)?;
    Ok(stored)
}

/// Every slot needs exactly one existing user and no unknown slot keys.
fn check_slot_assignments(
    conn: &mut PgConnection,
    layout: &TemplateLayout,
    assignments: &HashMap<String, Uuid>,
) -> AppResult<()> {
    let slot_keys: HashSet<&str> = layout
        .signature_slots
        .iter()
        .map(|slot| slot.key.trim())
        .collect();

    let mut missing: Vec<&str> = slot_keys
        .iter()
        .copied()
        .filter(|key| !assignments.contains_key(*key))
        .collect();
    if !missing.is_empty() {
        missing.sort_unstable();
        return Err(AppError::bad_request(format!(
            "missing signatories for slots: {}",
            missing.join(", ")
        )));
    }
    if let Some(unknown) = assignments
        .keys()
        .find(|key| !slot_keys.contains(key.as_str()))
    {
        return Err(AppError::bad_request(format!(
            "unknown signature slot '{unknown}'"
        )));
    }

    let wanted: HashSet<Uuid> = assignments.values().copied().collect();
    let found: Vec<Uuid> = users::table
        .filter(users::id.eq_any(wanted.iter().copied().collect::<Vec<_>>()))
        .select(users::id)
        .load(conn)?;
    if found.len() != wanted.len() {
        return Err(AppError::bad_request("signatory user does not exist"));
    }
    Ok(())
}

fn require_template_variables(conn: &mut PgConnection, letter: &OutgoingLetter) -> AppResult<()> {
    let layout_value: Value = letter_templates::table
        .find(letter.template_id)
        .select(letter_templates::layout)
        .first(conn)?;
    let layout = TemplateLayout::from_value(&layout_value)?;
    let variables = letter.variables.as_object().cloned().unwrap_or_default();
    layout.require_variables(&variables)?;
    Ok(())
}

fn sees_all_letters(user: &AuthenticatedUser) -> bool {
    user.is_admin() || user.has_any_role(&[ROLE_SECRETARY, ROLE_MANAGER])
}

fn ensure_can_view(
    conn: &mut PgConnection,
    user: &AuthenticatedUser,
    letter: &OutgoingLetter,
) -> AppResult<()> {
    if sees_all_letters(user) || letter.created_by == user.user_id {
        return Ok(());
    }
    let is_signatory: bool = diesel::select(diesel::dsl::exists(
        letter_signatories::table
            .filter(letter_signatories::letter_id.eq(letter.id))
            .filter(letter_signatories::user_id.eq(user.user_id)),
    ))
    .get_result(conn)?;
    if is_signatory {
        Ok(())
    } else {
        Err(AppError::forbidden())
    }
}

fn ensure_creator(user: &AuthenticatedUser, letter: &OutgoingLetter) -> AppResult<()> {
    if letter.created_by == user.user_id || user.is_admin() {
        Ok(())
    } else {
        Err(AppError::forbidden())
    }
}

fn load_signatories(conn: &mut PgConnection, letter_id: Uuid) -> AppResult<Vec<LetterSignatory>> {
    let rows = letter_signatories::table
        .filter(letter_signatories::letter_id.eq(letter_id))
        .order((
            letter_signatories::slot_column.asc(),
            letter_signatories::sign_order.asc(),
        ))
        .load(conn)?;
    Ok(rows)
}

fn load_template_summaries(
    conn: &mut PgConnection,
    ids: impl IntoIterator<Item = Uuid>,
) -> AppResult<HashMap<Uuid, TemplateSummary>> {
    let ids: HashSet<Uuid> = ids.into_iter().collect();
    let rows: Vec<(Uuid, String, String)> = letter_templates::table
        .filter(letter_templates::id.eq_any(ids.into_iter().collect::<Vec<_>>()))
        .select((
            letter_templates::id,
            letter_templates::name,
            letter_templates::code,
        ))
        .load(conn)?;
    Ok(rows
        .into_iter()
        .map(|(id, name, code)| (id, TemplateSummary { id, name, code }))
        .collect())
}

fn build_letter_detail(
    conn: &mut PgConnection,
    config: &AppConfig,
    letter_id: Uuid,
    user: &AuthenticatedUser,
) -> AppResult<LetterDetailResponse> {
    let letter: OutgoingLetter = outgoing_letters::table.find(letter_id).first(conn)?;
    let status = LetterStatus::parse(&letter.status)?;
    let rows = load_signatories(conn, letter_id)?;
    let events: Vec<SignatureEvent> = signature_events::table
        .filter(signature_events::letter_id.eq(letter_id))
        .order(signature_events::created_at.asc())
        .load(conn)?;
    let certificate: Option<Certificate> = certificates::table
        .filter(certificates::letter_id.eq(letter_id))
        .first(conn)
        .optional()?;
    let archive_id = find_archive(conn, DocumentType::Outgoing, letter_id)?.map(|a| a.id);

    let views = workflow::signatory_views(&rows)?;
    let can_act = workflow::actionable_slot(status, user.user_id, &views).is_some();

    let users = load_user_summaries(
        conn,
        rows.iter()
            .map(|row| row.user_id)
            .chain(events.iter().map(|event| event.user_id))
            .chain([letter.created_by]),
    )?;
    let templates = load_template_summaries(conn, [letter.template_id])?;

    let signatories = rows
        .into_iter()
        .map(|row| SignatoryResponse {
            id: row.id,
            user: UserSummary::lookup(&users, row.user_id),
            slot_key: row.slot_key,
            slot_label: row.slot_label,
            column: row.slot_column,
            order: row.sign_order,
            status: row.status,
            note: row.note,
            acted_at: row.acted_at.map(to_iso),
        })
        .collect();
    let events = events
        .into_iter()
        .map(|event| SignatureEventResponse {
            id: event.id,
            signatory_id: event.signatory_id,
            user: UserSummary::lookup(&users, event.user_id),
            action: event.action,
            note: event.note,
            created_at: to_iso(event.created_at),
        })
        .collect();
    let certificate = certificate.map(|cert| CertificateSummary {
        verification_url: config.verification_url(&cert.verification_hash),
        verification_hash: cert.verification_hash,
        signer_id: cert.signer_id,
        issued_at: to_iso(cert.issued_at),
    });

    Ok(LetterDetailResponse {
        letter: to_letter_response(letter, &templates, &users),
        signatories,
        events,
        certificate,
        archive_id,
        can_act,
    })
}

fn to_letter_response(
    letter: OutgoingLetter,
    templates: &HashMap<Uuid, TemplateSummary>,
    users: &HashMap<Uuid, UserSummary>,
) -> LetterResponse {
    let template = templates
        .get(&letter.template_id)
        .cloned()
        .unwrap_or_else(|| TemplateSummary {
            id: letter.template_id,
            name: String::new(),
            code: String::new(),
        });

    LetterResponse {
        id: letter.id,
        template,
        letter_number: letter.letter_number,
        subject: letter.subject,
        recipient: letter.recipient,
        unit_code: letter.unit_code,
        variables: letter.variables,
        status: letter.status,
        created_by: UserSummary::lookup(users, letter.created_by),
        has_final_document: letter.rendered_key.is_some(),
        submitted_at: letter.submitted_at.map(to_iso),
        signed_at: letter.signed_at.map(to_iso),
        created_at: to_iso(letter.created_at),
        updated_at: to_iso(letter.updated_at),
    }
}

pub(crate) fn display_name(user: &UserSummary) -> String {
    if user.full_name.trim().is_empty() {
        user.username.clone()
    } else {
        user.full_name.clone()
    }
}
