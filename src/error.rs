use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};

use crate::lifecycle::OrderStatus;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("validation error: {0}")]
    ValidationError(#[from] validator::ValidationErrors),

    #[error("provided id is not a valid ObjectId")]
    InvalidId,

    #[error("{0} is required")]
    MissingField(&'static str),

    #[error("unrecognized order status {0:?}")]
    InvalidStatus(String),

    #[error("date must be an RFC 3339 timestamp")]
    InvalidDate,

    #[error("cannot transition order from {from} to {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0} already in use")]
    Conflict(&'static str),

    #[error("You have no permission to access this resource")]
    Forbidden,

    #[error("User is deactivated")]
    Deactivated,

    #[error("{0}")]
    Unauthorized(UnauthorizedType),

    #[error("{0}")]
    PasswordHashError(#[from] password_hash::Error),

    #[error("{0}")]
    DatabaseError(#[from] mongodb::error::Error),

    #[error("{0}")]
    JWTError(#[from] jsonwebtoken::errors::Error),

    #[error("{0}")]
    BSONSerError(#[from] bson::ser::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum UnauthorizedType {
    #[error("Wrong email or password")]
    WrongEmailOrPassword,

    #[error("Invalid access token")]
    InvalidAccessToken,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorJson {
    error: String,
    details: String,
}

impl From<Error> for ErrorJson {
    fn from(err: Error) -> Self {
        Self {
            error: err.to_string_variant(),
            details: err.to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        tracing::error!("error: {:?}", self);
        let status = match self {
            Self::ValidationError(..)
            | Self::InvalidId
            | Self::MissingField(..)
            | Self::InvalidStatus(..)
            | Self::InvalidDate
            | Self::InvalidTransition { .. } => StatusCode::BAD_REQUEST,
            Self::Unauthorized(..) => StatusCode::UNAUTHORIZED,
            Self::Forbidden | Self::Deactivated => StatusCode::FORBIDDEN,
            Self::NotFound(..) => StatusCode::NOT_FOUND,
            Self::Conflict(..) => StatusCode::CONFLICT,
            Self::PasswordHashError(..)
            | Self::DatabaseError(..)
            | Self::JWTError(..)
            | Self::BSONSerError(..) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // internal errors keep their message out of the response body
        let error = if status == StatusCode::INTERNAL_SERVER_ERROR {
            ErrorJson {
                error: "Internal".to_string(),
                details: "unexpected server error".to_string(),
            }
        } else {
            ErrorJson::from(self)
        };

        (status, Json(error)).into_response()
    }
}

impl Error {
    pub fn to_string_variant(&self) -> String {
        macro_rules! match_var {
            ($id:ident !) => {
                Self::$id
            };
            ($id:ident (..)) => {
                Self::$id(..)
            };
            ($id:ident {..}) => {
                Self::$id { .. }
            };
        }

        macro_rules! variant {
            ($($name:ident $tt:tt),+) => {
                match self {
                    $(
                        match_var!($name $tt) => {
                            stringify!($name)
                       }
                    )+
                }
            };
        }

        variant! {
            ValidationError(..),
            InvalidId!,
            MissingField(..),
            InvalidStatus(..),
            InvalidDate!,
            InvalidTransition{..},
            NotFound(..),
            Conflict(..),
            Forbidden!,
            Deactivated!,
            Unauthorized(..),
            PasswordHashError(..),
            DatabaseError(..),
            JWTError(..),
            BSONSerError(..)
        }
        .to_string()
    }
}

impl From<axum::extract::rejection::PathRejection> for Error {
    fn from(_value: axum::extract::rejection::PathRejection) -> Self {
        Self::NotFound("resource")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::OrderStatus;

    #[test]
    fn test_invalid_transition_names_pair() {
        let err = Error::InvalidTransition {
            from: OrderStatus::Delivered,
            to: OrderStatus::New,
        };

        assert_eq!(err.to_string(), "cannot transition order from delivered to new");
        assert_eq!(err.to_string_variant(), "InvalidTransition");
    }
}
