use chrono::{NaiveDate, NaiveDateTime};
use diesel::prelude::*;
use uuid::Uuid;

use crate::schema::*;

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = users)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub full_name: String,
    pub password_hash: String,
    pub role: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = users)]
pub struct NewUser {
    pub id: Uuid,
    pub username: String,
    pub full_name: String,
    pub password_hash: String,
    pub role: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = refresh_tokens)]
#[diesel(belongs_to(User))]
pub struct RefreshToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token_hash: String,
    pub issued_at: NaiveDateTime,
    pub expires_at: NaiveDateTime,
    pub revoked_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = refresh_tokens)]
pub struct NewRefreshToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token_hash: String,
    pub issued_at: NaiveDateTime,
    pub expires_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = incoming_letters)]
pub struct IncomingLetter {
    pub id: Uuid,
    pub agenda_number: String,
    pub letter_number: String,
    pub sender: String,
    pub subject: String,
    pub summary: Option<String>,
    pub letter_date: NaiveDate,
    pub received_date: NaiveDate,
    pub status: String,
    pub attachment_key: Option<String>,
    pub attachment_name: Option<String>,
    pub attachment_content_type: Option<String>,
    pub attachment_checksum: Option<String>,
    pub registered_by: Uuid,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = incoming_letters)]
pub struct NewIncomingLetter {
    pub id: Uuid,
    pub agenda_number: String,
    pub letter_number: String,
    pub sender: String,
    pub subject: String,
    pub summary: Option<String>,
    pub letter_date: NaiveDate,
    pub received_date: NaiveDate,
    pub status: String,
    pub registered_by: Uuid,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = dispositions)]
#[diesel(belongs_to(IncomingLetter))]
pub struct Disposition {
    pub id: Uuid,
    pub incoming_letter_id: Uuid,
    pub parent_disposition_id: Option<Uuid>,
    pub from_user_id: Uuid,
    pub to_user_id: Uuid,
    pub instruction: String,
    pub priority: String,
    pub due_date: Option<NaiveDate>,
    pub status: String,
    pub read_at: Option<NaiveDateTime>,
    pub completed_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = dispositions)]
pub struct NewDisposition {
    pub id: Uuid,
    pub incoming_letter_id: Uuid,
    pub parent_disposition_id: Option<Uuid>,
    pub from_user_id: Uuid,
    pub to_user_id: Uuid,
    pub instruction: String,
    pub priority: String,
    pub due_date: Option<NaiveDate>,
    pub status: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = disposition_follow_ups)]
#[diesel(belongs_to(Disposition))]
pub struct DispositionFollowUp {
    pub id: Uuid,
    pub disposition_id: Uuid,
    pub user_id: Uuid,
    pub note: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = disposition_follow_ups)]
pub struct NewDispositionFollowUp {
    pub id: Uuid,
    pub disposition_id: Uuid,
    pub user_id: Uuid,
    pub note: String,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = letter_templates)]
pub struct LetterTemplate {
    pub id: Uuid,
    pub name: String,
    pub code: String,
    pub layout: serde_json::Value,
    pub numbering_format: String,
    pub numbering_group_id: Option<Uuid>,
    pub is_active: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl LetterTemplate {
    /// Templates sharing a numbering group draw from one sequence.
    pub fn numbering_scope(&self) -> Uuid {
        self.numbering_group_id.unwrap_or(self.id)
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = letter_templates)]
pub struct NewLetterTemplate {
    pub id: Uuid,
    pub name: String,
    pub code: String,
    pub layout: serde_json::Value,
    pub numbering_format: String,
    pub numbering_group_id: Option<Uuid>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = outgoing_letters)]
#[diesel(belongs_to(LetterTemplate, foreign_key = template_id))]
pub struct OutgoingLetter {
    pub id: Uuid,
    pub template_id: Uuid,
    pub created_by: Uuid,
    pub letter_number: String,
    pub subject: String,
    pub recipient: String,
    pub unit_code: String,
    pub variables: serde_json::Value,
    pub status: String,
    pub rendered_key: Option<String>,
    pub submitted_at: Option<NaiveDateTime>,
    pub signed_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = outgoing_letters)]
pub struct NewOutgoingLetter {
    pub id: Uuid,
    pub template_id: Uuid,
    pub created_by: Uuid,
    pub letter_number: String,
    pub subject: String,
    pub recipient: String,
    pub unit_code: String,
    pub variables: serde_json::Value,
    pub status: String,
    pub submitted_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = letter_signatories)]
#[diesel(belongs_to(OutgoingLetter, foreign_key = letter_id))]
pub struct LetterSignatory {
    pub id: Uuid,
    pub letter_id: Uuid,
    pub user_id: Uuid,
    pub slot_key: String,
    pub slot_label: String,
    pub slot_column: i32,
    pub sign_order: i32,
    pub status: String,
    pub note: Option<String>,
    pub acted_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = letter_signatories)]
pub struct NewLetterSignatory {
    pub id: Uuid,
    pub letter_id: Uuid,
    pub user_id: Uuid,
    pub slot_key: String,
    pub slot_label: String,
    pub slot_column: i32,
    pub sign_order: i32,
    pub status: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = signature_events)]
#[diesel(belongs_to(OutgoingLetter, foreign_key = letter_id))]
pub struct SignatureEvent {
    pub id: Uuid,
    pub letter_id: Uuid,
    pub signatory_id: Option<Uuid>,
    pub user_id: Uuid,
    pub action: String,
    pub note: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = signature_events)]
pub struct NewSignatureEvent {
    pub id: Uuid,
    pub letter_id: Uuid,
    pub signatory_id: Option<Uuid>,
    pub user_id: Uuid,
    pub action: String,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = certificates)]
pub struct Certificate {
    pub id: Uuid,
    pub letter_id: Uuid,
    pub verification_hash: String,
    pub letter_number: String,
    pub signer_id: Uuid,
    pub issued_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = certificates)]
pub struct NewCertificate {
    pub id: Uuid,
    pub letter_id: Uuid,
    pub verification_hash: String,
    pub letter_number: String,
    pub signer_id: Uuid,
    pub issued_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = archives)]
pub struct Archive {
    pub id: Uuid,
    pub document_type: String,
    pub document_id: Uuid,
    pub title: String,
    pub document_number: String,
    pub classification: String,
    pub retention_period: i32,
    pub retention_until: NaiveDate,
    pub file_path: String,
    pub notes: Option<String>,
    pub archived_by: Uuid,
    pub archived_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = archives)]
pub struct NewArchive {
    pub id: Uuid,
    pub document_type: String,
    pub document_id: Uuid,
    pub title: String,
    pub document_number: String,
    pub classification: String,
    pub retention_period: i32,
    pub retention_until: NaiveDate,
    pub file_path: String,
    pub notes: Option<String>,
    pub archived_by: Uuid,
    pub archived_at: NaiveDateTime,
}
