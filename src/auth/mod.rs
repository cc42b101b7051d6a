pub mod jwt;
pub mod password;

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use axum_extra::headers::{authorization::Bearer, Authorization};
use axum_extra::TypedHeader;
use serde::{Deserialize, Serialize};

use crate::{
    error::{AppError, AppResult},
    state::AppState,
};

pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_SECRETARY: &str = "secretary";
pub const ROLE_MANAGER: &str = "manager";
pub const ROLE_STAFF: &str = "staff";
pub const ROLES: &[&str] = &[ROLE_ADMIN, ROLE_SECRETARY, ROLE_MANAGER, ROLE_STAFF];

pub fn is_valid_role(role: &str) -> bool {
    ROLES.contains(&role)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    pub user_id: uuid::Uuid,
    pub username: String,
    pub role: String,
}

impl AuthenticatedUser {
    pub fn is_admin(&self) -> bool {
        self.role == ROLE_ADMIN
    }

    pub fn has_any_role(&self, roles: &[&str]) -> bool {
        roles.contains(&self.role.as_str())
    }

    /// Rejects with 403 unless the caller holds one of `roles`. Admins always pass.
    pub fn require_any_role(&self, roles: &[&str]) -> AppResult<()> {
        if self.is_admin() || self.has_any_role(roles) {
            Ok(())
        } else {
            Err(AppError::forbidden())
        }
    }

    pub fn can_register_letters(&self) -> bool {
        self.is_admin() || self.role == ROLE_SECRETARY
    }

    pub fn can_dispose(&self) -> bool {
        self.is_admin() || self.role == ROLE_MANAGER
    }
}

#[async_trait]
impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| AppError::unauthorized())?;

        let claims = state
            .jwt
            .verify_token(bearer.token())
            .map_err(|_| AppError::unauthorized())?;

        Ok(AuthenticatedUser {
            user_id: claims.sub,
            username: claims.username,
            role: claims.role,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(role: &str) -> AuthenticatedUser {
        AuthenticatedUser {
            user_id: uuid::Uuid::new_v4(),
            username: "u".into(),
            role: role.into(),
        }
    }

    #[test]
    fn admin_passes_every_role_gate() {
        assert!(user(ROLE_ADMIN).require_any_role(&[ROLE_SECRETARY]).is_ok());
        assert!(user(ROLE_ADMIN).can_dispose());
        assert!(user(ROLE_ADMIN).can_register_letters());
    }

    #[test]
    fn staff_is_rejected_with_forbidden() {
        let err = user(ROLE_STAFF)
            .require_any_role(&[ROLE_SECRETARY, ROLE_MANAGER])
            .unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::FORBIDDEN);
        assert!(!user(ROLE_STAFF).can_dispose());
    }

    #[test]
    fn unknown_roles_are_invalid() {
        assert!(is_valid_role("secretary"));
        assert!(!is_valid_role("root"));
    }
}
