use serde::{Deserialize, Serialize};

use crate::sandbox::{ExecutionRequest, Language};

/// Body of `POST /api/compile` as sent by the editor
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct CompileRequest {
    pub language: Option<String>,
    pub code: Option<String>,
    pub input: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("unsupported language `{0}`")]
    UnsupportedLanguage(String),
    #[error("missing source code")]
    MissingSource,
}

/// Normalizes a raw request. Nothing is executed or written before this succeeds.
pub fn validate(request: CompileRequest) -> Result<ExecutionRequest, ValidationError> {
    let name = request.language.unwrap_or_default();
    let language =
        Language::from_name(&name).ok_or(ValidationError::UnsupportedLanguage(name))?;
    let source_code = request.code.ok_or(ValidationError::MissingSource)?;

    Ok(ExecutionRequest {
        language,
        source_code,
        stdin: request.input.unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn raw(language: Option<&str>, code: Option<&str>, input: Option<&str>) -> CompileRequest {
        CompileRequest {
            language: language.map(str::to_string),
            code: code.map(str::to_string),
            input: input.map(str::to_string),
        }
    }

    #[test]
    fn test_valid_request() {
        let request = validate(raw(Some("python"), Some("print('hi')"), Some("1\n"))).unwrap();
        assert_eq!(
            request,
            ExecutionRequest {
                language: Language::Python,
                source_code: "print('hi')".to_string(),
                stdin: "1\n".to_string(),
            }
        );
    }

    #[test]
    fn test_input_defaults_to_empty() {
        let request = validate(raw(Some("cpp"), Some(""), None)).unwrap();
        assert_eq!(request.stdin, "");
        assert_eq!(request.source_code, "");
    }

    #[test]
    fn test_unsupported_or_missing_language() {
        assert_eq!(
            validate(raw(Some("ruby"), Some("puts 1"), None)).unwrap_err(),
            ValidationError::UnsupportedLanguage("ruby".to_string())
        );
        assert_eq!(
            validate(raw(None, Some("x"), None)).unwrap_err(),
            ValidationError::UnsupportedLanguage(String::new())
        );
    }

    #[test]
    fn test_missing_source() {
        assert_eq!(
            validate(raw(Some("java"), None, Some("x"))).unwrap_err(),
            ValidationError::MissingSource
        );
    }

    #[test]
    fn test_language_is_checked_first() {
        assert!(matches!(
            validate(CompileRequest::default()),
            Err(ValidationError::UnsupportedLanguage(_))
        ));
    }
}
