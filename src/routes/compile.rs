use actix_web::{HttpRequest, HttpResponse, Responder, get, post, web};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use super::{AuthPolicy, ErrorResponse, ErrorResponseWithMessage, authorize};
use crate::sandbox::{Engine, EngineError, Language};
use crate::validator::{CompileRequest, ValidationError, validate};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CompileResponse {
    pub output: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LanguageInfo {
    pub name: Language,
    pub compiled: bool,
    /// Whether a toolchain pipeline is configured for it on this host
    pub wired: bool,
}

#[post("/api/compile")]
pub async fn compile_handler(
    req: HttpRequest,
    pool: web::Data<SqlitePool>,
    policy: web::Data<AuthPolicy>,
    engine: web::Data<Engine>,
    body: web::Json<CompileRequest>,
) -> impl Responder {
    let identity = match authorize(&req, &pool, &policy).await {
        Ok(identity) => identity,
        Err(response) => return response,
    };

    let request = match validate(body.into_inner()) {
        Ok(request) => request,
        Err(ValidationError::UnsupportedLanguage(name)) => {
            log::info!("Rejected submission in unsupported language {name:?}");
            return HttpResponse::NotFound().json(ErrorResponseWithMessage {
                reason: "ERR_NOT_FOUND",
                code: 3,
                message: format!("Language {name:?} is not supported"),
            });
        }
        Err(ValidationError::MissingSource) => {
            return HttpResponse::BadRequest().json(ErrorResponseWithMessage {
                reason: "ERR_INVALID_ARGUMENT",
                code: 1,
                message: "Missing field `code`".to_string(),
            });
        }
    };

    log::debug!(
        "{} submitted {} bytes of {}",
        identity.name,
        request.source_code.len(),
        request.language
    );

    match engine.execute(&request).await {
        Ok(result) => HttpResponse::Ok().json(CompileResponse {
            output: result.output,
        }),
        Err(e @ EngineError::UnwiredLanguage(_)) => {
            log::error!("Cannot execute submission: {e}");
            HttpResponse::InternalServerError().json(ErrorResponseWithMessage {
                reason: "ERR_INTERNAL",
                code: 6,
                message: e.to_string(),
            })
        }
        Err(EngineError::Closed) => HttpResponse::ServiceUnavailable().json(ErrorResponse {
            reason: "ERR_INTERNAL",
            code: 6,
        }),
    }
}

#[get("/api/compile/languages")]
pub async fn languages_handler(engine: web::Data<Engine>) -> impl Responder {
    let toolchain = engine.toolchain();
    let languages: Vec<LanguageInfo> = Language::ALL
        .iter()
        .map(|&name| LanguageInfo {
            name,
            compiled: toolchain.is_compiled(name),
            wired: toolchain.is_wired(name),
        })
        .collect();

    HttpResponse::Ok().json(languages)
}
