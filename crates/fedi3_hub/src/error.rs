/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use fedi3_protocol::{ErrorCode, RpcErrorBody};
use thiserror::Error;

/// Caller-facing errors. Everything else travels as a plain `anyhow::Error`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Must be logged in: {0}")]
    Session(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not allowed: {0}")]
    Permissions(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),
}

impl ApiError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Session(_) => ErrorCode::SessionError,
            Self::Validation(_) => ErrorCode::ValidationError,
            Self::NotFound(_) => ErrorCode::NotFoundError,
            Self::Permissions(_) => ErrorCode::PermissionsError,
            Self::Configuration(_) => ErrorCode::ConfigurationError,
            Self::RateLimit(_) => ErrorCode::RateLimitError,
        }
    }

    pub fn to_rpc(&self) -> RpcErrorBody {
        let code = self.code();
        RpcErrorBody {
            code: code.rpc_code(),
            error: code.as_str().to_string(),
            message: self.to_string(),
        }
    }
}

/// Finds the `ApiError` in an error chain, if any.
pub fn api_error_of(err: &anyhow::Error) -> Option<&ApiError> {
    err.chain().find_map(|e| e.downcast_ref::<ApiError>())
}

pub fn error_code_of(err: &anyhow::Error) -> Option<ErrorCode> {
    api_error_of(err).map(|e| e.code())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn code_survives_context() {
        let res: anyhow::Result<()> = Err(ApiError::NotFound("db".to_string()).into());
        let err = res.context("load database").unwrap_err();
        assert_eq!(error_code_of(&err), Some(ErrorCode::NotFoundError));
    }

    #[test]
    fn rpc_body_uses_stable_code() {
        let body = ApiError::Validation("bad username".to_string()).to_rpc();
        assert_eq!(body.error, "validation-error");
        assert_eq!(body.code, ErrorCode::ValidationError.rpc_code());
        assert!(body.message.contains("bad username"));
    }

    #[test]
    fn plain_errors_have_no_code() {
        let err = anyhow::anyhow!("disk on fire");
        assert!(error_code_of(&err).is_none());
    }
}
