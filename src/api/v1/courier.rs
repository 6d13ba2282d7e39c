use std::collections::HashMap;

use argon2::Argon2;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use bson::oid::ObjectId;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tap::TapFallible;
use time::OffsetDateTime;

use crate::{
    error::Error,
    mongo_ext::Collection,
    util::{FormattedDateTime, ObjectIdString, Pagination, PathObjectId, SortDir},
};

use super::auth::{UserAccess, UserCollection, UserModel, UserResponse, UserRole};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VehicleType {
    Car,
    Bike,
    Foot,
    Scooter,
    #[default]
    Other,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CourierModel {
    #[serde(rename = "_id")]
    pub id: ObjectId,

    /// 1:1 link to the users collection, unique.
    pub user_id: ObjectId,

    pub city: String,
    pub is_available: bool,
    pub rating: f64,
    pub vehicle_type: VehicleType,
    pub notes: String,

    pub created_at: bson::DateTime,
    pub updated_at: bson::DateTime,
}

#[derive(Clone)]
pub struct CourierCollection(pub Collection<CourierModel>);

impl std::ops::Deref for CourierCollection {
    type Target = Collection<CourierModel>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CourierResponse {
    pub id: ObjectIdString,

    pub city: String,
    pub is_available: bool,
    pub rating: f64,
    pub vehicle_type: VehicleType,
    pub notes: String,

    pub user: UserResponse,

    pub created_at: FormattedDateTime,
    pub updated_at: FormattedDateTime,
}

impl CourierResponse {
    pub fn new(model: CourierModel, user: UserResponse) -> Self {
        Self {
            id: model.id.into(),
            city: model.city,
            is_available: model.is_available,
            rating: model.rating,
            vehicle_type: model.vehicle_type,
            notes: model.notes,
            user,
            created_at: model.created_at.into(),
            updated_at: model.updated_at.into(),
        }
    }
}

pub fn clamp_rating(rating: f64) -> f64 {
    rating.clamp(0.0, 5.0)
}

pub async fn find_by_user(
    couriers: &CourierCollection,
    user_id: ObjectId,
) -> Result<Option<CourierModel>, Error> {
    couriers
        .find_one(bson::doc! { "user_id": user_id }, None)
        .await
        .map_err(Into::into)
}

pub struct NewProfile {
    pub vehicle_type: VehicleType,
    pub city: String,
    pub rating: f64,
    pub is_available: bool,
    pub notes: String,
}

pub async fn insert_profile(
    couriers: &CourierCollection,
    user_id: ObjectId,
    profile: NewProfile,
) -> Result<CourierModel, Error> {
    if find_by_user(couriers, user_id).await?.is_some() {
        return Err(Error::Conflict("courier profile"));
    }

    let model = CourierModel {
        id: ObjectId::new(),
        user_id,
        city: profile.city,
        is_available: profile.is_available,
        rating: clamp_rating(profile.rating),
        vehicle_type: profile.vehicle_type,
        notes: profile.notes,
        created_at: OffsetDateTime::now_utc().into(),
        updated_at: OffsetDateTime::now_utc().into(),
    };
    couriers.insert_one(&model, None).await?;

    Ok(model)
}

async fn load_response(
    couriers: &CourierCollection,
    users: &UserCollection,
    id: ObjectId,
) -> Result<CourierResponse, Error> {
    let model = couriers
        .get_one_by_id(id)
        .await?
        .ok_or(Error::NotFound("courier"))?;

    let user = users
        .get_one_by_id(model.user_id)
        .await?
        .ok_or(Error::NotFound("user"))?;

    Ok(CourierResponse::new(model, user.into()))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum SortField {
    #[default]
    CreatedAt,
    Rating,
    FullName,
    City,
    IsAvailable,
}

// unknown values fall back to createdAt instead of failing
fn sort_field(sort_by: Option<&str>) -> SortField {
    match sort_by {
        Some("rating") => SortField::Rating,
        Some("fullName") => SortField::FullName,
        Some("city") => SortField::City,
        Some("isAvailable") => SortField::IsAvailable,
        _ => SortField::CreatedAt,
    }
}

fn sort_dir(sort_dir: Option<&str>) -> SortDir {
    match sort_dir {
        Some("asc") => SortDir::Asc,
        _ => SortDir::Desc,
    }
}

/// In-memory tail of the courier listing: free-text filter over the joined
/// user, stable sort (ties keep insertion order), then pagination.
fn filter_sort_page(
    mut rows: Vec<(CourierModel, UserModel)>,
    q: Option<&str>,
    field: SortField,
    dir: SortDir,
    pagination: Pagination,
) -> (Vec<(CourierModel, UserModel)>, u64) {
    if let Some(q) = q.map(str::trim).filter(|it| !it.is_empty()) {
        let q = q.to_lowercase();
        rows.retain(|(_, user)| {
            user.full_name.to_lowercase().contains(&q)
                || user
                    .phone
                    .as_deref()
                    .map(|phone| phone.to_lowercase().contains(&q))
                    .unwrap_or(false)
        });
    }

    rows.sort_by(|(a, a_user), (b, b_user)| {
        let ordering = match field {
            SortField::CreatedAt => a.created_at.cmp(&b.created_at),
            SortField::Rating => a.rating.total_cmp(&b.rating),
            SortField::FullName => a_user.full_name.cmp(&b_user.full_name),
            SortField::City => a.city.cmp(&b.city),
            SortField::IsAvailable => a.is_available.cmp(&b.is_available),
        };

        match dir {
            SortDir::Asc => ordering,
            SortDir::Desc => ordering.reverse(),
        }
    });

    let total = rows.len() as u64;
    let (_, limit) = pagination.normalize();
    let items = rows
        .into_iter()
        .skip(pagination.skip() as usize)
        .take(limit as usize)
        .collect();

    (items, total)
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub q: Option<String>,
    pub city: Option<String>,
    pub is_available: Option<bool>,
    pub rating_from: Option<f64>,
    pub rating_to: Option<f64>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
    pub sort_by: Option<String>,
    pub sort_dir: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ListResponse {
    pub items: Vec<CourierResponse>,
    pub total: u64,
    pub page: i64,
    pub limit: i64,
}

pub async fn index(
    State(couriers): State<CourierCollection>,
    State(users): State<UserCollection>,
    _user: UserAccess,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse>, Error> {
    let mut filter = bson::doc! {};
    if let Some(city) = query.city.as_deref().filter(|it| !it.is_empty()) {
        filter.insert("city", city);
    }
    if let Some(is_available) = query.is_available {
        filter.insert("is_available", is_available);
    }
    let mut rating = bson::doc! {};
    if let Some(from) = query.rating_from {
        rating.insert("$gte", from);
    }
    if let Some(to) = query.rating_to {
        rating.insert("$lte", to);
    }
    if !rating.is_empty() {
        filter.insert("rating", rating);
    }

    let models = couriers.find_all(filter, None).await?;

    let ids = models.iter().map(|it| it.user_id).collect::<Vec<_>>();
    let mut user_map: HashMap<ObjectId, UserModel> = users
        .find_all(bson::doc! { "_id": { "$in": ids } }, None)
        .await?
        .into_iter()
        .map(|it| (it.id, it))
        .collect();

    let rows = models
        .into_iter()
        .filter_map(|model| user_map.remove(&model.user_id).map(|user| (model, user)))
        .collect::<Vec<_>>();

    let pagination = Pagination {
        page: query.page,
        limit: query.limit,
    };
    let (page, limit) = pagination.normalize();

    let (items, total) = filter_sort_page(
        rows,
        query.q.as_deref(),
        sort_field(query.sort_by.as_deref()),
        sort_dir(query.sort_dir.as_deref()),
        pagination,
    );

    Ok(Json(ListResponse {
        items: items
            .into_iter()
            .map(|(model, user)| CourierResponse::new(model, user.into()))
            .collect(),
        total,
        page,
        limit,
    }))
}

pub async fn show(
    State(couriers): State<CourierCollection>,
    State(users): State<UserCollection>,
    _user: UserAccess,
    PathObjectId(courier_id): PathObjectId,
) -> Result<Json<CourierResponse>, Error> {
    load_response(&couriers, &users, courier_id)
        .await
        .map(Json)
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequest {
    pub user_id: Option<String>,
    pub full_name: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,

    pub city: Option<String>,
    pub is_available: Option<bool>,
    pub rating: Option<f64>,
    pub vehicle_type: Option<VehicleType>,
    pub notes: Option<String>,
}

#[tracing::instrument(skip_all, fields(user = ?user))]
pub async fn create(
    State(couriers): State<CourierCollection>,
    State(users): State<UserCollection>,
    State(argon): State<Argon2<'static>>,
    user: UserAccess,
    Json(request): Json<CreateRequest>,
) -> Result<(StatusCode, Json<CourierResponse>), Error> {
    user.require_privileged()
        .tap_err(|_| tracing::debug!("tried creating courier as courier"))?;

    let linked_user = match &request.user_id {
        Some(user_id) => {
            let user_id = ObjectId::from_str(user_id).map_err(|_| Error::InvalidId)?;

            users
                .get_one_by_id(user_id)
                .await?
                .ok_or(Error::NotFound("user"))?
        }
        None => {
            let full_name = request
                .full_name
                .as_deref()
                .map(str::trim)
                .filter(|it| !it.is_empty())
                .ok_or(Error::MissingField("fullName"))?;
            let phone = request
                .phone
                .as_deref()
                .map(str::trim)
                .filter(|it| !it.is_empty())
                .ok_or(Error::MissingField("phone"))?;

            super::auth::insert_user(
                &users,
                &argon,
                super::auth::NewUser {
                    email: request.email.clone(),
                    phone: Some(phone.to_string()),
                    full_name: full_name.to_string(),
                    password: None,
                    role: UserRole::Courier,
                },
            )
            .await?
        }
    };

    let model = insert_profile(
        &couriers,
        linked_user.id,
        NewProfile {
            vehicle_type: request.vehicle_type.unwrap_or_default(),
            city: request.city.unwrap_or_default(),
            rating: request.rating.unwrap_or(0.0),
            is_available: request.is_available.unwrap_or(true),
            notes: request.notes.unwrap_or_default(),
        },
    )
    .await?;

    tracing::debug!("created courier {:?}", model.id);

    Ok((
        StatusCode::CREATED,
        Json(CourierResponse::new(model, linked_user.into())),
    ))
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UpdateUserRequest {
    pub full_name: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRequest {
    pub user: Option<UpdateUserRequest>,

    pub city: Option<String>,
    pub is_available: Option<bool>,
    pub rating: Option<f64>,
    pub vehicle_type: Option<VehicleType>,
    pub notes: Option<String>,
}

#[tracing::instrument(skip_all, fields(id = %courier_id, user = ?user))]
pub async fn update(
    State(couriers): State<CourierCollection>,
    State(users): State<UserCollection>,
    user: UserAccess,
    PathObjectId(courier_id): PathObjectId,
    Json(request): Json<UpdateRequest>,
) -> Result<Json<CourierResponse>, Error> {
    user.require_privileged()
        .tap_err(|_| tracing::debug!("tried updating courier as courier"))?;

    let courier = couriers
        .get_one_by_id(courier_id)
        .await?
        .ok_or(Error::NotFound("courier"))
        .tap_err(|_| tracing::debug!("tried updating non existing courier"))?;

    let linked_user = users
        .get_one_by_id(courier.user_id)
        .await?
        .ok_or(Error::NotFound("user"))?;

    let linked_user = match request.user {
        Some(patch) => {
            let mut updated = linked_user;

            if let Some(full_name) = patch.full_name.as_deref().map(str::trim) {
                if !full_name.is_empty() {
                    updated.full_name = full_name.to_string();
                }
            }
            if let Some(phone) = patch.phone.as_deref().map(str::trim) {
                if !phone.is_empty() {
                    let duplicate = users
                        .count_documents(
                            bson::doc! { "phone": phone, "_id": { "$ne": updated.id } },
                            None,
                        )
                        .await?;
                    if duplicate > 0 {
                        return Err(Error::Conflict("phone"));
                    }
                    updated.phone = Some(phone.to_string());
                }
            }
            if let Some(email) = patch.email.as_deref() {
                let email = email.trim().to_lowercase();
                if !email.is_empty() {
                    let duplicate = users
                        .count_documents(
                            bson::doc! { "email": &email, "_id": { "$ne": updated.id } },
                            None,
                        )
                        .await?;
                    if duplicate > 0 {
                        return Err(Error::Conflict("email"));
                    }
                    updated.email = Some(email);
                }
            }

            updated.updated_at = OffsetDateTime::now_utc().into();
            users
                .update_one_by_id(
                    updated.id,
                    bson::doc! { "$set": bson::to_document(&updated)? },
                )
                .await?;

            updated
        }
        None => linked_user,
    };

    let courier = CourierModel {
        city: request.city.unwrap_or(courier.city),
        is_available: request.is_available.unwrap_or(courier.is_available),
        rating: request.rating.map(clamp_rating).unwrap_or(courier.rating),
        vehicle_type: request.vehicle_type.unwrap_or(courier.vehicle_type),
        notes: request.notes.unwrap_or(courier.notes),

        id: courier.id,
        user_id: courier.user_id,
        created_at: courier.created_at,
        updated_at: OffsetDateTime::now_utc().into(),
    };

    couriers
        .update_one_by_id(
            courier_id,
            bson::doc! { "$set": bson::to_document(&courier)? },
        )
        .await?;

    Ok(Json(CourierResponse::new(courier, linked_user.into())))
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct DeleteQuery {
    pub hard: Option<bool>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DeleteResponse {
    pub id: ObjectIdString,
    pub deleted: bool,
    pub mode: String,
    pub user_deactivated: bool,
}

#[tracing::instrument(skip_all, fields(id = %courier_id, user = ?user))]
pub async fn delete(
    State(couriers): State<CourierCollection>,
    State(users): State<UserCollection>,
    user: UserAccess,
    PathObjectId(courier_id): PathObjectId,
    Query(query): Query<DeleteQuery>,
) -> Result<Json<DeleteResponse>, Error> {
    user.require_privileged()
        .tap_err(|_| tracing::debug!("tried deleting courier as courier"))?;

    let courier = couriers
        .get_one_by_id(courier_id)
        .await?
        .ok_or(Error::NotFound("courier"))
        .tap_err(|_| tracing::debug!("tried deleting non existing courier"))?;

    let hard = query.hard.unwrap_or(false);

    if hard {
        // the courier document goes away but the user stays for audit history
        couriers.delete_one_by_id(courier.id).await?;
    } else {
        couriers
            .update_one_by_id(courier.id, bson::doc! { "$set": { "is_available": false } })
            .await?;
    }

    users
        .update_one_by_id(courier.user_id, bson::doc! { "$set": { "is_active": false } })
        .await?;

    Ok(Json(DeleteResponse {
        id: courier_id.into(),
        deleted: true,
        mode: if hard { "hard" } else { "soft" }.to_string(),
        user_deactivated: true,
    }))
}
