//! Status rules for outgoing-letter sign-off and disposition routing.
//!
//! Handlers never pick a next status themselves. They load rows, translate
//! them into the views below, ask [`apply`] or [`next_disposition_status`] for
//! the outcome, and persist it.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::LetterSignatory;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("unknown status '{0}'")]
    UnknownStatus(String),
    #[error("cannot {action} a letter with status {status}")]
    InvalidLetterTransition {
        action: &'static str,
        status: LetterStatus,
    },
    #[error("letter has no signatories")]
    NoSignatories,
    #[error("it is not your turn to act on this letter")]
    NotYourTurn,
    #[error("only the recipient may act on this disposition")]
    NotRecipient,
    #[error("cannot move a disposition from {from} to {to}")]
    InvalidDispositionTransition {
        from: DispositionStatus,
        to: DispositionStatus,
    },
    #[error("a disposition can only be completed after at least one follow-up")]
    FollowUpRequired,
}

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            pub fn parse(value: &str) -> Result<Self, WorkflowError> {
                match value {
                    $($text => Ok($name::$variant),)+
                    other => Err(WorkflowError::UnknownStatus(other.to_string())),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

string_enum!(LetterStatus {
    Draft => "draft",
    Pending => "pending",
    Partial => "partial",
    Signed => "signed",
    Rejected => "rejected",
    Revision => "revision",
});

string_enum!(SignatoryStatus {
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
});

string_enum!(DispositionStatus {
    Pending => "pending",
    Read => "read",
    InProgress => "in_progress",
    Completed => "completed",
});

string_enum!(DispositionPriority {
    Low => "low",
    Normal => "normal",
    High => "high",
    Urgent => "urgent",
});

string_enum!(IncomingStatus {
    Received => "received",
    Disposed => "disposed",
    Completed => "completed",
});

impl LetterStatus {
    /// Statuses in which the creator may still change the letter body.
    pub fn is_editable(self) -> bool {
        matches!(
            self,
            LetterStatus::Draft | LetterStatus::Revision | LetterStatus::Rejected
        )
    }

    fn accepts_signatures(self) -> bool {
        matches!(self, LetterStatus::Pending | LetterStatus::Partial)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatoryView {
    pub id: Uuid,
    pub user_id: Uuid,
    pub column: i32,
    pub order: i32,
    pub status: SignatoryStatus,
}

impl TryFrom<&LetterSignatory> for SignatoryView {
    type Error = WorkflowError;

    fn try_from(row: &LetterSignatory) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            column: row.slot_column,
            order: row.sign_order,
            status: SignatoryStatus::parse(&row.status)?,
        })
    }
}

pub fn signatory_views(rows: &[LetterSignatory]) -> Result<Vec<SignatoryView>, WorkflowError> {
    rows.iter().map(SignatoryView::try_from).collect()
}

/// A signatory may act when it is still pending, the letter is collecting
/// signatures, and everyone ahead of it in the same column has approved.
pub fn can_sign(letter: LetterStatus, signatory: &SignatoryView, all: &[SignatoryView]) -> bool {
    letter.accepts_signatures()
        && signatory.status == SignatoryStatus::Pending
        && all
            .iter()
            .filter(|other| other.column == signatory.column && other.order < signatory.order)
            .all(|other| other.status == SignatoryStatus::Approved)
}

/// First slot held by `user_id` that may act right now.
pub fn actionable_slot(
    letter: LetterStatus,
    user_id: Uuid,
    all: &[SignatoryView],
) -> Option<&SignatoryView> {
    let mut mine: Vec<&SignatoryView> = all.iter().filter(|s| s.user_id == user_id).collect();
    mine.sort_by_key(|s| (s.column, s.order));
    mine.into_iter().find(|s| can_sign(letter, s, all))
}

/// Letter status implied by the signatories alone.
pub fn aggregate_status<I>(statuses: I) -> LetterStatus
where
    I: IntoIterator<Item = SignatoryStatus>,
{
    let mut total = 0usize;
    let mut approved = 0usize;
    for status in statuses {
        total += 1;
        match status {
            SignatoryStatus::Rejected => return LetterStatus::Rejected,
            SignatoryStatus::Approved => approved += 1,
            SignatoryStatus::Pending => {}
        }
    }

    if total > 0 && approved == total {
        LetterStatus::Signed
    } else if approved > 0 {
        LetterStatus::Partial
    } else {
        LetterStatus::Pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LetterEvent {
    Submit,
    Approve { signatory_id: Uuid },
    Reject { signatory_id: Uuid },
    RequestRevision { signatory_id: Uuid },
    Resubmit,
}

impl LetterEvent {
    fn action(&self) -> &'static str {
        match self {
            LetterEvent::Submit => "submit",
            LetterEvent::Approve { .. } => "approve",
            LetterEvent::Reject { .. } => "reject",
            LetterEvent::RequestRevision { .. } => "request revision on",
            LetterEvent::Resubmit => "resubmit",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: LetterStatus,
    pub to: LetterStatus,
    /// Signatory row whose status changes with this event.
    pub signatory_update: Option<(Uuid, SignatoryStatus)>,
    /// Every signatory goes back to pending.
    pub reset_signatories: bool,
}

impl Transition {
    pub fn completes_letter(&self) -> bool {
        self.from != LetterStatus::Signed && self.to == LetterStatus::Signed
    }
}

pub fn apply(
    current: LetterStatus,
    event: LetterEvent,
    signatories: &[SignatoryView],
) -> Result<Transition, WorkflowError> {
    let invalid = || WorkflowError::InvalidLetterTransition {
        action: event.action(),
        status: current,
    };

    match event {
        LetterEvent::Submit => {
            if current != LetterStatus::Draft {
                return Err(invalid());
            }
            if signatories.is_empty() {
                return Err(WorkflowError::NoSignatories);
            }
            Ok(Transition {
                from: current,
                to: aggregate_status(signatories.iter().map(|s| s.status)),
                signatory_update: None,
                reset_signatories: false,
            })
        }
        LetterEvent::Resubmit => {
            if !matches!(current, LetterStatus::Revision | LetterStatus::Rejected) {
                return Err(invalid());
            }
            if signatories.is_empty() {
                return Err(WorkflowError::NoSignatories);
            }
            Ok(Transition {
                from: current,
                to: LetterStatus::Pending,
                signatory_update: None,
                reset_signatories: true,
            })
        }
        LetterEvent::Approve { signatory_id }
        | LetterEvent::Reject { signatory_id }
        | LetterEvent::RequestRevision { signatory_id } => {
            if !current.accepts_signatures() {
                return Err(invalid());
            }
            let signatory = signatories
                .iter()
                .find(|s| s.id == signatory_id)
                .ok_or(WorkflowError::NotYourTurn)?;
            if !can_sign(current, signatory, signatories) {
                return Err(WorkflowError::NotYourTurn);
            }

            let (signatory_update, to) = match event {
                LetterEvent::Approve { .. } => {
                    let next = signatories.iter().map(|s| {
                        if s.id == signatory_id {
                            SignatoryStatus::Approved
                        } else {
                            s.status
                        }
                    });
                    (
                        Some((signatory_id, SignatoryStatus::Approved)),
                        aggregate_status(next),
                    )
                }
                LetterEvent::Reject { .. } => (
                    Some((signatory_id, SignatoryStatus::Rejected)),
                    LetterStatus::Rejected,
                ),
                _ => (None, LetterStatus::Revision),
            };

            Ok(Transition {
                from: current,
                to,
                signatory_update,
                reset_signatories: false,
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispositionAction {
    Read,
    Start,
    Complete,
}

/// Reading is idempotent; starting and completing are not.
pub fn next_disposition_status(
    current: DispositionStatus,
    action: DispositionAction,
    follow_ups: i64,
) -> Result<DispositionStatus, WorkflowError> {
    use DispositionStatus::*;

    match (action, current) {
        (DispositionAction::Read, Pending) => Ok(Read),
        (DispositionAction::Read, other) => Ok(other),
        (DispositionAction::Start, Pending | Read) => Ok(InProgress),
        (DispositionAction::Start, from) => Err(WorkflowError::InvalidDispositionTransition {
            from,
            to: InProgress,
        }),
        (DispositionAction::Complete, Completed) => {
            Err(WorkflowError::InvalidDispositionTransition {
                from: Completed,
                to: Completed,
            })
        }
        (DispositionAction::Complete, _) if follow_ups < 1 => {
            Err(WorkflowError::FollowUpRequired)
        }
        (DispositionAction::Complete, _) => Ok(Completed),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispositionProgress {
    pub total: i64,
    pub completed: i64,
    pub percentage: i64,
}

pub fn disposition_progress<I>(statuses: I) -> DispositionProgress
where
    I: IntoIterator<Item = DispositionStatus>,
{
    let (total, completed) = statuses.into_iter().fold((0i64, 0i64), |(t, c), status| {
        (t + 1, c + i64::from(status == DispositionStatus::Completed))
    });
    let percentage = if total == 0 {
        0
    } else {
        ((completed as f64 / total as f64) * 100.0).round() as i64
    };
    DispositionProgress {
        total,
        completed,
        percentage,
    }
}

/// Incoming letter status implied by its dispositions.
pub fn incoming_status<I>(statuses: I) -> IncomingStatus
where
    I: IntoIterator<Item = DispositionStatus>,
{
    let progress = disposition_progress(statuses);
    if progress.total == 0 {
        IncomingStatus::Received
    } else if progress.completed == progress.total {
        IncomingStatus::Completed
    } else {
        IncomingStatus::Disposed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(column: i32, order: i32, status: SignatoryStatus) -> SignatoryView {
        SignatoryView {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            column,
            order,
            status,
        }
    }

    #[test]
    fn statuses_roundtrip_through_text() {
        for status in LetterStatus::ALL {
            assert_eq!(LetterStatus::parse(status.as_str()).unwrap(), *status);
        }
        assert_eq!(
            DispositionStatus::parse("in_progress").unwrap(),
            DispositionStatus::InProgress
        );
        assert!(matches!(
            LetterStatus::parse("archived"),
            Err(WorkflowError::UnknownStatus(_))
        ));
    }

    #[test]
    fn lower_order_in_same_column_must_approve_first() {
        let first = slot(0, 1, SignatoryStatus::Pending);
        let second = slot(0, 2, SignatoryStatus::Pending);
        let parallel = slot(1, 1, SignatoryStatus::Pending);
        let all = vec![first.clone(), second.clone(), parallel.clone()];

        assert!(can_sign(LetterStatus::Pending, &first, &all));
        assert!(!can_sign(LetterStatus::Pending, &second, &all));
        assert!(can_sign(LetterStatus::Pending, &parallel, &all));
        assert!(!can_sign(LetterStatus::Draft, &first, &all));
    }

    #[test]
    fn approving_every_slot_signs_the_letter() {
        let mut all = vec![
            slot(0, 1, SignatoryStatus::Pending),
            slot(0, 2, SignatoryStatus::Pending),
        ];
        let mut status = apply(LetterStatus::Draft, LetterEvent::Submit, &all)
            .unwrap()
            .to;
        assert_eq!(status, LetterStatus::Pending);

        for index in 0..all.len() {
            let transition = apply(
                status,
                LetterEvent::Approve {
                    signatory_id: all[index].id,
                },
                &all,
            )
            .unwrap();
            assert_eq!(
                transition.signatory_update,
                Some((all[index].id, SignatoryStatus::Approved))
            );
            all[index].status = SignatoryStatus::Approved;
            status = transition.to;
        }

        assert_eq!(status, LetterStatus::Signed);
        let after = apply(
            status,
            LetterEvent::Reject {
                signatory_id: all[0].id,
            },
            &all,
        );
        assert!(matches!(
            after,
            Err(WorkflowError::InvalidLetterTransition { .. })
        ));
        assert!(apply(status, LetterEvent::Resubmit, &all).is_err());
    }

    #[test]
    fn partial_after_first_of_two_approvals() {
        let all = vec![
            slot(0, 1, SignatoryStatus::Pending),
            slot(1, 1, SignatoryStatus::Pending),
        ];
        let transition = apply(
            LetterStatus::Pending,
            LetterEvent::Approve {
                signatory_id: all[1].id,
            },
            &all,
        )
        .unwrap();
        assert_eq!(transition.to, LetterStatus::Partial);
        assert!(!transition.completes_letter());
    }

    #[test]
    fn out_of_turn_signatory_is_refused() {
        let all = vec![
            slot(0, 1, SignatoryStatus::Pending),
            slot(0, 2, SignatoryStatus::Pending),
        ];
        let result = apply(
            LetterStatus::Pending,
            LetterEvent::Approve {
                signatory_id: all[1].id,
            },
            &all,
        );
        assert_eq!(result, Err(WorkflowError::NotYourTurn));
    }

    #[test]
    fn rejection_and_revision_then_resubmit() {
        let all = vec![slot(0, 1, SignatoryStatus::Pending)];
        let rejected = apply(
            LetterStatus::Pending,
            LetterEvent::Reject {
                signatory_id: all[0].id,
            },
            &all,
        )
        .unwrap();
        assert_eq!(rejected.to, LetterStatus::Rejected);

        let revision = apply(
            LetterStatus::Pending,
            LetterEvent::RequestRevision {
                signatory_id: all[0].id,
            },
            &all,
        )
        .unwrap();
        assert_eq!(revision.to, LetterStatus::Revision);
        assert_eq!(revision.signatory_update, None);

        let resubmitted = apply(LetterStatus::Revision, LetterEvent::Resubmit, &all).unwrap();
        assert_eq!(resubmitted.to, LetterStatus::Pending);
        assert!(resubmitted.reset_signatories);
        assert!(apply(LetterStatus::Pending, LetterEvent::Resubmit, &all).is_err());
    }

    #[test]
    fn submit_requires_draft_and_signatories() {
        assert_eq!(
            apply(LetterStatus::Draft, LetterEvent::Submit, &[]),
            Err(WorkflowError::NoSignatories)
        );
        let all = vec![slot(0, 1, SignatoryStatus::Pending)];
        assert!(apply(LetterStatus::Pending, LetterEvent::Submit, &all).is_err());
    }

    #[test]
    fn actionable_slot_picks_first_signable_slot_of_user() {
        let user = Uuid::new_v4();
        let mut first = slot(0, 1, SignatoryStatus::Approved);
        first.user_id = user;
        let mut second = slot(0, 2, SignatoryStatus::Pending);
        second.user_id = user;
        let all = vec![first, second.clone()];
        assert_eq!(
            actionable_slot(LetterStatus::Partial, user, &all).map(|s| s.id),
            Some(second.id)
        );
        assert!(actionable_slot(LetterStatus::Partial, Uuid::new_v4(), &all).is_none());
    }

    #[test]
    fn disposition_transitions() {
        use DispositionAction::{Complete, Start};
        use DispositionStatus::*;

        assert_eq!(
            next_disposition_status(Pending, DispositionAction::Read, 0),
            Ok(Read)
        );
        assert_eq!(
            next_disposition_status(InProgress, DispositionAction::Read, 0),
            Ok(InProgress)
        );
        assert_eq!(next_disposition_status(Read, Start, 0), Ok(InProgress));
        assert!(next_disposition_status(Completed, Start, 1).is_err());
        assert_eq!(
            next_disposition_status(InProgress, Complete, 0),
            Err(WorkflowError::FollowUpRequired)
        );
        assert_eq!(next_disposition_status(InProgress, Complete, 2), Ok(Completed));
        assert!(next_disposition_status(Completed, Complete, 2).is_err());
    }

    #[test]
    fn progress_and_incoming_status() {
        use DispositionStatus::*;

        let empty = disposition_progress(Vec::new());
        assert_eq!(empty.percentage, 0);
        assert_eq!(incoming_status(Vec::new()), IncomingStatus::Received);

        let done = disposition_progress(vec![Completed]);
        assert_eq!(done.percentage, 100);
        assert_eq!(incoming_status(vec![Completed]), IncomingStatus::Completed);

        let third = disposition_progress(vec![Completed, Read, Pending]);
        assert_eq!(third.percentage, 33);
        assert_eq!(
            incoming_status(vec![Completed, Read, Pending]),
            IncomingStatus::Disposed
        );
    }
}
