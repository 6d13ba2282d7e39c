use jsonwebtoken::TokenData;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::{error::Error, util::ObjectIdString};

use super::auth::{UserModel, UserRole};

#[derive(Clone)]
pub struct JwtState {
    validation: jsonwebtoken::Validation,
    header: jsonwebtoken::Header,

    encoding_key: jsonwebtoken::EncodingKey,
    decoding_key: jsonwebtoken::DecodingKey,
}

impl JwtState {
    pub fn new(secret: &[u8]) -> Self {
        let header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256);
        let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256);
        // expiry is checked manually so an expired token still decodes
        validation.validate_exp = false;

        Self {
            header,
            validation,

            encoding_key: jsonwebtoken::EncodingKey::from_secret(secret),
            decoding_key: jsonwebtoken::DecodingKey::from_secret(secret),
        }
    }

    pub fn new_from_env() -> Self {
        let secret_key = std::env::var("JWT_SECRET_KEY")
            .expect("Cannot retrieve JWT_SECRET_KEY from environment variable.");

        Self::new(secret_key.as_bytes())
    }
}

pub fn current_timestamp() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

#[derive(Serialize, Deserialize, Debug)]
pub struct AccessTokenClaims {
    pub sub: ObjectIdString,
    pub role: UserRole,
    pub exp: i64,
}

impl AccessTokenClaims {
    pub fn is_expired(&self) -> bool {
        self.exp < current_timestamp().unix_timestamp()
    }
}

pub struct GenerateAccessTokenResponse {
    pub expired_at: OffsetDateTime,
    pub token: String,
}

pub fn generate_access_token(
    jwt_state: &JwtState,
    user: &UserModel,
) -> Result<GenerateAccessTokenResponse, Error> {
    let expired_at = current_timestamp() + Duration::hours(12);
    let token = generate_access_token_with_exp(jwt_state, user, expired_at.unix_timestamp())?;

    Ok(GenerateAccessTokenResponse { expired_at, token })
}

pub fn generate_access_token_with_exp(
    jwt_state: &JwtState,
    user: &UserModel,
    exp: i64,
) -> Result<String, Error> {
    jsonwebtoken::encode(
        &jwt_state.header,
        &AccessTokenClaims {
            sub: user.id.into(),
            role: user.role,
            exp,
        },
        &jwt_state.encoding_key,
    )
    .map_err(Into::into)
}

pub fn decode_access_token(
    jwt_state: &JwtState,
    token: &str,
) -> Result<TokenData<AccessTokenClaims>, Error> {
    jsonwebtoken::decode(token, &jwt_state.decoding_key, &jwt_state.validation).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use bson::oid::ObjectId;

    use super::*;

    fn user_model(role: UserRole) -> UserModel {
        UserModel {
            id: ObjectId::new(),
            email: Some("user@example.com".to_string()),
            phone: None,
            full_name: "".to_string(),
            password: None,
            role,
            is_active: true,
            created_at: bson::DateTime::now(),
            updated_at: bson::DateTime::now(),
        }
    }

    #[test]
    pub fn test_access_token() {
        let jwt = JwtState::new(b"test-secret");
        let user = user_model(UserRole::Dispatcher);

        let token = generate_access_token(&jwt, &user).unwrap().token;

        let token = decode_access_token(&jwt, &token).unwrap();
        assert_eq!(token.claims.sub, user.id);
        assert_eq!(token.claims.role, user.role);
        assert!(!token.claims.is_expired());
    }

    #[test]
    pub fn test_expired_access_token_decodes() {
        let jwt = JwtState::new(b"test-secret");
        let user = user_model(UserRole::Courier);

        let token = generate_access_token_with_exp(
            &jwt,
            &user,
            (current_timestamp() + Duration::seconds(-1)).unix_timestamp(),
        )
        .unwrap();

        let token = decode_access_token(&jwt, &token).unwrap();
        assert!(token.claims.is_expired());
    }

    #[test]
    pub fn test_wrong_secret_rejected() {
        let jwt = JwtState::new(b"test-secret");
        let other = JwtState::new(b"other-secret");
        let user = user_model(UserRole::Admin);

        let token = generate_access_token(&jwt, &user).unwrap().token;

        assert!(decode_access_token(&other, &token).is_err());
    }

    #[test]
    pub fn test_role_claim_is_lowercase() {
        let jwt = JwtState::new(b"test-secret");
        let token = generate_access_token(&jwt, &user_model(UserRole::Admin))
            .unwrap()
            .token;

        let claims = decode_access_token(&jwt, &token).unwrap().claims;
        assert_eq!(serde_json::to_value(claims.role).unwrap(), "admin");
    }
}
