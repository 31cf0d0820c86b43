use crate::entities::user::{self, Role};
use crate::error::{ApiError, ApiResult};

/// Outcome of an authorization guard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Granted,
    Denied(&'static str),
}

impl Access {
    #[cfg(test)]
    pub fn is_granted(&self) -> bool {
        matches!(self, Access::Granted)
    }

    pub fn into_result(self) -> ApiResult<()> {
        match self {
            Access::Granted => Ok(()),
            Access::Denied(reason) => Err(ApiError::Forbidden(reason.to_string())),
        }
    }
}

/// Gate for every `/admin` route. Evaluated before any handler logic.
pub fn admin_gate(requester: &user::Model) -> Access {
    if requester.role == Role::Admin {
        Access::Granted
    } else {
        Access::Denied("Unauthorized. Admin access required.")
    }
}

/// Admins may not change their own role.
pub fn can_change_role(requester: &user::Model, target_id: i64) -> Access {
    if requester.id == target_id {
        Access::Denied("Cannot modify your own role")
    } else {
        Access::Granted
    }
}

/// Admins may not delete their own account.
pub fn can_delete_user(requester: &user::Model, target_id: i64) -> Access {
    if requester.id == target_id {
        Access::Denied("Cannot delete yourself")
    } else {
        Access::Granted
    }
}
