//! Authentication of clients at initialisation.

use attestor_core::{
    auth::{AuthenticatedUserData, AuthenticationRequest},
    ErrorCode, RpcError,
};
use tracing::debug;

use crate::config::AuthProperties;

/// Checks the token a client sent with `init`.
///
/// Returns the verified user when authentication is enabled, `None` when it
/// is disabled.
pub fn authenticate(
    config: &AuthProperties,
    auth: Option<&AuthenticationRequest>,
    now: u64,
) -> Result<Option<AuthenticatedUserData>, RpcError> {
    if !config.enabled {
        return Ok(None);
    }

    let auth = auth.ok_or_else(|| {
        RpcError::new(
            ErrorCode::AuthenticationFailed,
            "Authentication is required by this attestor",
        )
    })?;
    let user = auth
        .verify(&config.issuers, now)
        .map_err(|err| RpcError::new(ErrorCode::AuthenticationFailed, err.to_string()))?;

    debug!(user_id = %user.id, "client authenticated");
    Ok(Some(user.clone()))
}
