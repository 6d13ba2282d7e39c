use argon2::Argon2;
use axum::{
    extract::{FromRef, FromRequestParts, State},
    headers::{authorization::Bearer, Authorization},
    http::{request::Parts, StatusCode},
    Json, RequestPartsExt, TypedHeader,
};
use bson::oid::ObjectId;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use validator::Validate;

use crate::{
    error::{Error, UnauthorizedType},
    mongo_ext::Collection,
    util::{hash_password, verify_password, FormattedDateTime, ObjectIdString},
};

use super::{
    courier::{CourierCollection, CourierResponse},
    token::{decode_access_token, generate_access_token, JwtState},
};

#[derive(Clone)]
pub struct UserCollection(pub Collection<UserModel>);

impl std::ops::Deref for UserCollection {
    type Target = Collection<UserModel>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UserModel {
    #[serde(rename = "_id")]
    pub id: ObjectId,

    // absent values must stay out of the document entirely, a stored null
    // would still be caught by the sparse unique indexes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,

    #[serde(default)]
    pub full_name: String,

    /// Argon2 hash; courier-only records created without a login have none.
    pub password: Option<String>,

    pub role: UserRole,
    pub is_active: bool,

    pub created_at: bson::DateTime,
    pub updated_at: bson::DateTime,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    #[default]
    Dispatcher,
    Courier,
}

impl UserRole {
    /// Admin and dispatcher share all write privileges on orders and couriers.
    pub fn is_privileged(&self) -> bool {
        matches!(self, Self::Admin | Self::Dispatcher)
    }
}

/// Identity decoded from the bearer token, without touching the database.
#[derive(Debug, Clone, Copy)]
pub struct UserAccess {
    pub id: ObjectId,
    pub role: UserRole,
}

impl UserAccess {
    pub fn from_token(jwt_state: &JwtState, token: &str) -> Result<Self, Error> {
        let token = decode_access_token(jwt_state, token)
            .map_err(|_| Error::Unauthorized(UnauthorizedType::InvalidAccessToken))?;

        if token.claims.is_expired() {
            return Err(Error::Unauthorized(UnauthorizedType::InvalidAccessToken));
        }

        Ok(Self {
            id: token.claims.sub.0,
            role: token.claims.role,
        })
    }

    pub fn require_privileged(&self) -> Result<(), Error> {
        match self.role.is_privileged() {
            true => Ok(()),
            false => Err(Error::Forbidden),
        }
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for UserAccess
where
    JwtState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Error;
    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(token)) = parts
            .extract::<TypedHeader<Authorization<Bearer>>>()
            .await
            .map_err(|_| Error::Unauthorized(UnauthorizedType::InvalidAccessToken))?;

        let jwt = JwtState::from_ref(state);

        Self::from_token(&jwt, token.token())
    }
}

impl UserModel {
    pub async fn from_id(
        id: ObjectId,
        UserCollection(users): &UserCollection,
    ) -> Result<Self, Error> {
        users
            .get_one_by_id(id)
            .await?
            .ok_or(Error::Unauthorized(UnauthorizedType::InvalidAccessToken))
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for UserModel
where
    JwtState: FromRef<S>,
    UserCollection: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Error;
    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let access = parts.extract_with_state::<UserAccess, _>(state).await?;
        let users = UserCollection::from_ref(state);
        Self::from_id(access.id, &users).await
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserResponse {
    pub id: ObjectIdString,

    pub email: Option<String>,
    pub phone: Option<String>,
    pub full_name: String,
    pub role: UserRole,
    pub is_active: bool,

    pub created_at: FormattedDateTime,
    pub updated_at: FormattedDateTime,
}

impl From<UserModel> for UserResponse {
    fn from(value: UserModel) -> Self {
        Self {
            id: value.id.into(),
            email: value.email,
            phone: value.phone,
            full_name: value.full_name,
            role: value.role,
            is_active: value.is_active,

            created_at: value.created_at.into(),
            updated_at: value.updated_at.into(),
        }
    }
}

/// Fields for a user insert, shared by registration and courier creation.
pub struct NewUser {
    pub email: Option<String>,
    pub phone: Option<String>,
    pub full_name: String,
    pub password: Option<String>,
    pub role: UserRole,
}

pub async fn insert_user(
    users: &UserCollection,
    argon: &Argon2<'_>,
    new: NewUser,
) -> Result<UserModel, Error> {
    let email = new
        .email
        .map(|it| it.trim().to_lowercase())
        .filter(|it| !it.is_empty());
    let phone = new
        .phone
        .map(|it| it.trim().to_string())
        .filter(|it| !it.is_empty());

    if let Some(email) = &email {
        let count = users
            .count_documents(bson::doc! { "email": email }, None)
            .await?;
        if count > 0 {
            return Err(Error::Conflict("email"));
        }
    }

    if let Some(phone) = &phone {
        let count = users
            .count_documents(bson::doc! { "phone": phone }, None)
            .await?;
        if count > 0 {
            return Err(Error::Conflict("phone"));
        }
    }

    let model = UserModel {
        id: ObjectId::new(),
        email,
        phone,
        full_name: new.full_name.trim().to_string(),
        password: new
            .password
            .map(|it| hash_password(argon, &it))
            .transpose()?,
        role: new.role,
        is_active: true,
        created_at: OffsetDateTime::now_utc().into(),
        updated_at: OffsetDateTime::now_utc().into(),
    };
    users.insert_one(&model, None).await?;

    Ok(model)
}

#[derive(Validate, Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    #[validate(email)]
    pub email: String,

    #[validate(length(min = 8, max = 64))]
    pub password: String,

    #[serde(default)]
    pub role: UserRole,

    #[serde(default)]
    pub full_name: String,

    #[serde(default)]
    pub phone: String,

    pub courier: Option<RegisterCourierRequest>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RegisterCourierRequest {
    pub vehicle_type: Option<super::courier::VehicleType>,
    pub city: Option<String>,
    pub rating: Option<f64>,
    pub is_available: Option<bool>,
    pub notes: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RegisterResponse {
    pub user: UserResponse,
    pub courier: Option<CourierResponse>,
    pub token: String,
}

pub async fn register(
    State(users): State<UserCollection>,
    State(couriers): State<CourierCollection>,
    State(jwt_state): State<JwtState>,
    State(argon): State<Argon2<'static>>,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<RegisterResponse>), Error> {
    request.validate()?;

    let user = insert_user(
        &users,
        &argon,
        NewUser {
            email: Some(request.email),
            phone: Some(request.phone),
            full_name: request.full_name,
            password: Some(request.password),
            role: request.role,
        },
    )
    .await?;

    let courier = match (&request.courier, user.role) {
        (Some(profile), UserRole::Courier) => {
            let model = super::courier::insert_profile(
                &couriers,
                user.id,
                super::courier::NewProfile {
                    vehicle_type: profile.vehicle_type.unwrap_or_default(),
                    city: profile.city.clone().unwrap_or_default(),
                    rating: profile.rating.unwrap_or(0.0),
                    is_available: profile.is_available.unwrap_or(true),
                    notes: profile.notes.clone().unwrap_or_default(),
                },
            )
            .await?;

            Some(CourierResponse::new(model, user.clone().into()))
        }
        _ => None,
    };

    let token = generate_access_token(&jwt_state, &user)?;

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            user: user.into(),
            courier,
            token: token.token,
        }),
    ))
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoginResponse {
    pub user: UserResponse,
    pub token: String,
}

pub async fn login(
    State(users): State<UserCollection>,
    State(jwt_state): State<JwtState>,
    State(argon): State<Argon2<'static>>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, Error> {
    let email = request.email.trim().to_lowercase();

    let user = users.find_one(bson::doc! { "email": email }, None).await?;

    // same rejection for unknown email, passwordless record and wrong password
    let user = match user {
        Some(user)
            if user
                .password
                .as_deref()
                .map(|hashed| verify_password(&argon, &request.password, hashed))
                .unwrap_or(false) =>
        {
            user
        }
        _ => return Err(Error::Unauthorized(UnauthorizedType::WrongEmailOrPassword)),
    };

    if !user.is_active {
        return Err(Error::Deactivated);
    }

    let token = generate_access_token(&jwt_state, &user)?;

    Ok(Json(LoginResponse {
        user: user.into(),
        token: token.token,
    }))
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MeResponse {
    pub user: UserResponse,
    pub courier: Option<CourierResponse>,
}

pub async fn me(
    State(couriers): State<CourierCollection>,
    user: UserModel,
) -> Result<Json<MeResponse>, Error> {
    let courier = match user.role {
        UserRole::Courier => super::courier::find_by_user(&couriers, user.id)
            .await?
            .map(|model| CourierResponse::new(model, user.clone().into())),
        UserRole::Admin | UserRole::Dispatcher => None,
    };

    Ok(Json(MeResponse {
        user: user.into(),
        courier,
    }))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use axum::{extract::FromRequestParts, Json};
    use bson::oid::ObjectId;

    use crate::{
        api::v1::tests::bootstrap,
        error::{Error, UnauthorizedType},
    };

    use super::{UserModel, UserRole};

    fn register_request(email: &str) -> super::RegisterRequest {
        super::RegisterRequest {
            email: email.to_string(),
            password: "password".to_string(),
            role: UserRole::Dispatcher,
            full_name: "Test Dispatcher".to_string(),
            phone: String::new(),
            courier: None,
        }
    }

    #[test]
    fn test_absent_contact_fields_stay_out_of_the_document() {
        let model = UserModel {
            id: ObjectId::new(),
            email: None,
            phone: None,
            full_name: "No Contact".to_string(),
            password: None,
            role: UserRole::Courier,
            is_active: true,
            created_at: bson::DateTime::now(),
            updated_at: bson::DateTime::now(),
        };

        let doc = bson::to_document(&model).unwrap();
        assert!(!doc.contains_key("email"));
        assert!(!doc.contains_key("phone"));

        let roundtrip: UserModel = bson::from_document(doc).unwrap();
        assert_eq!(roundtrip, model);
    }

    #[tokio::test]
    #[ignore = "requires MongoDB"]
    async fn test_users_without_phone_can_coexist() {
        let bootstrap = bootstrap().await;

        // the unique phone index must only apply to users that have one
        for email in ["nophone-a@test.com", "nophone-b@test.com"] {
            let _ = super::register(
                bootstrap.user_collection(),
                bootstrap.courier_collection(),
                bootstrap.jwt_state(),
                bootstrap.argon(),
                Json(register_request(email)),
            )
            .await
            .unwrap();
        }
    }

    #[tokio::test]
    #[ignore = "requires MongoDB"]
    async fn test_register_and_login() {
        let bootstrap = bootstrap().await;

        let _ = super::register(
            bootstrap.user_collection(),
            bootstrap.courier_collection(),
            bootstrap.jwt_state(),
            bootstrap.argon(),
            Json(register_request("new@test.com")),
        )
        .await
        .unwrap();

        let Json(login) = super::login(
            bootstrap.user_collection(),
            bootstrap.jwt_state(),
            bootstrap.argon(),
            Json(super::LoginRequest {
                email: "new@test.com".to_string(),
                password: "password".to_string(),
            }),
        )
        .await
        .unwrap();

        let access =
            super::UserAccess::from_token(&bootstrap.app_state.jwt_state, &login.token).unwrap();
        assert_eq!(access.id, login.user.id.0);
        assert_eq!(access.role, UserRole::Dispatcher);

        let err = super::login(
            bootstrap.user_collection(),
            bootstrap.jwt_state(),
            bootstrap.argon(),
            Json(super::LoginRequest {
                email: "new@test.com".to_string(),
                password: "wrongpassword".to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert_matches!(
            err,
            Error::Unauthorized(UnauthorizedType::WrongEmailOrPassword)
        );
    }

    #[tokio::test]
    #[ignore = "requires MongoDB"]
    async fn test_unique_email() {
        let bootstrap = bootstrap().await;

        let _ = super::register(
            bootstrap.user_collection(),
            bootstrap.courier_collection(),
            bootstrap.jwt_state(),
            bootstrap.argon(),
            Json(register_request("dup@test.com")),
        )
        .await
        .unwrap();

        let err = super::register(
            bootstrap.user_collection(),
            bootstrap.courier_collection(),
            bootstrap.jwt_state(),
            bootstrap.argon(),
            Json(register_request("dup@test.com")),
        )
        .await
        .unwrap_err();
        assert_matches!(err, Error::Conflict("email"));
    }

    #[tokio::test]
    #[ignore = "requires MongoDB"]
    async fn test_register_courier_creates_profile() {
        let bootstrap = bootstrap().await;

        let mut request = register_request("courier@test.com");
        request.role = UserRole::Courier;
        request.courier = Some(super::RegisterCourierRequest {
            vehicle_type: Some(crate::api::v1::courier::VehicleType::Bike),
            city: Some("Riga".to_string()),
            rating: Some(7.0),
            is_available: None,
            notes: None,
        });

        let (_, Json(response)) = super::register(
            bootstrap.user_collection(),
            bootstrap.courier_collection(),
            bootstrap.jwt_state(),
            bootstrap.argon(),
            Json(request),
        )
        .await
        .unwrap();

        let courier = response.courier.expect("courier profile should be created");
        assert_eq!(courier.city, "Riga");
        // out-of-range input clamps instead of failing
        assert_eq!(courier.rating, 5.0);
    }

    #[tokio::test]
    #[ignore = "requires MongoDB"]
    async fn test_deactivated_user_cannot_login() {
        let bootstrap = bootstrap().await;

        let (_, Json(registered)) = super::register(
            bootstrap.user_collection(),
            bootstrap.courier_collection(),
            bootstrap.jwt_state(),
            bootstrap.argon(),
            Json(register_request("inactive@test.com")),
        )
        .await
        .unwrap();

        bootstrap
            .app_state
            .user_collection
            .update_one_by_id(
                registered.user.id.0,
                bson::doc! { "$set": { "is_active": false } },
            )
            .await
            .unwrap();

        let err = super::login(
            bootstrap.user_collection(),
            bootstrap.jwt_state(),
            bootstrap.argon(),
            Json(super::LoginRequest {
                email: "inactive@test.com".to_string(),
                password: "password".to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert_matches!(err, Error::Deactivated);
    }

    #[tokio::test]
    #[ignore = "requires MongoDB"]
    async fn test_user_access_extractor() {
        let bootstrap = bootstrap().await;

        let (mut parts, _) = axum::http::request::Request::get("http://localhost")
            .header(
                "Authorization",
                format!("Bearer {}", bootstrap.user_token()),
            )
            .body(())
            .unwrap()
            .into_parts();

        let user = super::UserAccess::from_request_parts(&mut parts, &bootstrap.app_state)
            .await
            .unwrap();

        assert_eq!(user.id, bootstrap.user_id());
    }

    #[tokio::test]
    #[ignore = "requires MongoDB"]
    async fn test_user_access_expired_token() {
        let bootstrap = bootstrap().await;

        let token = super::super::token::generate_access_token_with_exp(
            &bootstrap.app_state.jwt_state,
            &bootstrap.user_model,
            0,
        )
        .unwrap();

        let (mut parts, _) = axum::http::request::Request::get("http://localhost")
            .header("Authorization", format!("Bearer {}", token))
            .body(())
            .unwrap()
            .into_parts();

        let err = super::UserAccess::from_request_parts(&mut parts, &bootstrap.app_state)
            .await
            .unwrap_err();
        assert_matches!(
            err,
            Error::Unauthorized(UnauthorizedType::InvalidAccessToken)
        );
    }
}
