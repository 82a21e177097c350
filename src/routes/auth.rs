use actix_web::http::header;
use actix_web::{HttpRequest, HttpResponse};
use sqlx::SqlitePool;

use super::ErrorResponse;
use crate::database::{self as db, Identity};

/// Who may reach the execution engine
#[derive(Debug, Clone, Copy, Default)]
pub struct AuthPolicy {
    pub require_active_subscription: bool,
}

fn bearer_token(req: &HttpRequest) -> Option<&str> {
    let value = req.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then_some(token)
}

/// Resolves the caller and checks it against `policy`.
/// On rejection, the error response to send back is returned instead.
pub(super) async fn authorize(
    req: &HttpRequest,
    pool: &SqlitePool,
    policy: &AuthPolicy,
) -> Result<Identity, HttpResponse> {
    let Some(token) = bearer_token(req) else {
        return Err(unauthorized());
    };

    let identity = match db::find_identity(pool, token).await {
        Ok(Some(identity)) => identity,
        Ok(None) => {
            log::info!("Rejected request with unknown token");
            return Err(unauthorized());
        }
        Err(e) => {
            log::error!("Failed to look up identity: {e}");
            return Err(HttpResponse::InternalServerError().json(ErrorResponse {
                reason: "ERR_EXTERNAL",
                code: 5,
            }));
        }
    };

    if !identity.may_execute(policy.require_active_subscription) {
        log::info!(
            "Identity {} ({}) is not permitted to execute code",
            identity.name,
            identity.role.as_str()
        );
        return Err(HttpResponse::Forbidden().json(ErrorResponse {
            reason: "ERR_FORBIDDEN",
            code: 8,
        }));
    }

    Ok(identity)
}

fn unauthorized() -> HttpResponse {
    HttpResponse::Unauthorized().json(ErrorResponse {
        reason: "ERR_UNAUTHORIZED",
        code: 7,
    })
}
