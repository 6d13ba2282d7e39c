use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use bson::oid::ObjectId;
use serde::{Deserialize, Serialize};
use tap::TapFallible;
use time::OffsetDateTime;
use validator::Validate;

use crate::{
    error::Error,
    lifecycle::{can_transition, OrderStatus},
    mongo_ext::Collection,
    util::{parse_rfc3339, FormattedDateTime, ObjectIdString, Pagination, PathObjectId, SortDir},
};

use super::{
    auth::{UserAccess, UserCollection, UserResponse, UserRole},
    courier::{CourierCollection, CourierResponse},
};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OrderModel {
    #[serde(rename = "_id")]
    pub id: ObjectId,

    pub number: String,
    pub customer_name: String,
    pub customer_phone: String,
    pub address_from: String,
    pub address_to: String,
    pub price: f64,

    pub status: OrderStatus,
    pub courier_id: Option<ObjectId>,
    pub created_by: ObjectId,

    pub notes: String,

    pub created_at: bson::DateTime,
    pub updated_at: bson::DateTime,
}

#[derive(Clone)]
pub struct OrderCollection(pub Collection<OrderModel>);

impl std::ops::Deref for OrderCollection {
    type Target = Collection<OrderModel>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub id: ObjectIdString,

    pub number: String,
    pub customer_name: String,
    pub customer_phone: String,
    pub address_from: String,
    pub address_to: String,
    pub price: f64,

    pub status: OrderStatus,
    pub courier: Option<CourierResponse>,
    pub created_by: Option<UserResponse>,

    pub notes: String,

    pub created_at: FormattedDateTime,
    pub updated_at: FormattedDateTime,
}

impl OrderResponse {
    fn new(
        order: OrderModel,
        courier: Option<CourierResponse>,
        created_by: Option<UserResponse>,
    ) -> Self {
        Self {
            id: order.id.into(),
            number: order.number,
            customer_name: order.customer_name,
            customer_phone: order.customer_phone,
            address_from: order.address_from,
            address_to: order.address_to,
            price: order.price,
            status: order.status,
            courier,
            created_by,
            notes: order.notes,
            created_at: order.created_at.into(),
            updated_at: order.updated_at.into(),
        }
    }
}

/// Resolves the caller's visibility scope: couriers only ever see orders
/// assigned to their own courier profile, privileged roles see everything.
pub async fn caller_scope(
    user: &UserAccess,
    couriers: &CourierCollection,
) -> Result<Option<ObjectId>, Error> {
    match user.role {
        UserRole::Courier => {
            let courier = super::courier::find_by_user(couriers, user.id)
                .await?
                .ok_or(Error::Forbidden)
                .tap_err(|_| tracing::debug!("courier user without courier profile"))?;

            Ok(Some(courier.id))
        }
        UserRole::Admin | UserRole::Dispatcher => Ok(None),
    }
}

/// Joins courier and creator documents into order responses with two batched
/// lookups instead of a query per order.
async fn resolve_many(
    orders: Vec<OrderModel>,
    couriers: &CourierCollection,
    users: &UserCollection,
) -> Result<Vec<OrderResponse>, Error> {
    let courier_ids = orders
        .iter()
        .filter_map(|it| it.courier_id)
        .collect::<HashSet<_>>();

    let courier_map: HashMap<ObjectId, super::courier::CourierModel> = couriers
        .find_all(
            bson::doc! { "_id": { "$in": courier_ids.into_iter().collect::<Vec<_>>() } },
            None,
        )
        .await?
        .into_iter()
        .map(|it| (it.id, it))
        .collect();

    let user_ids = orders
        .iter()
        .map(|it| it.created_by)
        .chain(courier_map.values().map(|it| it.user_id))
        .collect::<HashSet<_>>();

    let user_map: HashMap<ObjectId, super::auth::UserModel> = users
        .find_all(
            bson::doc! { "_id": { "$in": user_ids.into_iter().collect::<Vec<_>>() } },
            None,
        )
        .await?
        .into_iter()
        .map(|it| (it.id, it))
        .collect();

    let responses = orders
        .into_iter()
        .map(|order| {
            let courier = order
                .courier_id
                .and_then(|id| courier_map.get(&id))
                .and_then(|model| {
                    user_map
                        .get(&model.user_id)
                        .map(|user| CourierResponse::new(model.clone(), user.clone().into()))
                });
            let created_by = user_map
                .get(&order.created_by)
                .map(|user| UserResponse::from(user.clone()));

            OrderResponse::new(order, courier, created_by)
        })
        .collect();

    Ok(responses)
}

async fn resolve_one(
    order: OrderModel,
    couriers: &CourierCollection,
    users: &UserCollection,
) -> Result<OrderResponse, Error> {
    let mut resolved = resolve_many(vec![order], couriers, users).await?;

    // resolve_many returns exactly as many items as it was given
    Ok(resolved.remove(0))
}

// unknown values fall back to createdAt instead of failing
fn sort_field(sort_by: Option<&str>) -> &'static str {
    match sort_by {
        Some("price") => "price",
        Some("status") => "status",
        Some("number") => "number",
        Some("customerName") => "customer_name",
        _ => "created_at",
    }
}

fn sort_dir(sort_dir: Option<&str>) -> SortDir {
    match sort_dir {
        Some("asc") => SortDir::Asc,
        _ => SortDir::Desc,
    }
}

fn date_range_filter(
    created_from: Option<&str>,
    created_to: Option<&str>,
) -> Result<Option<bson::Document>, Error> {
    let mut range = bson::doc! {};
    if let Some(from) = created_from {
        range.insert("$gte", bson::DateTime::from(parse_rfc3339(from)?));
    }
    if let Some(to) = created_to {
        range.insert("$lte", bson::DateTime::from(parse_rfc3339(to)?));
    }

    Ok((!range.is_empty()).then_some(range))
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub q: Option<String>,
    pub status: Option<String>,
    pub courier_id: Option<String>,
    pub created_from: Option<String>,
    pub created_to: Option<String>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
    pub sort_by: Option<String>,
    pub sort_dir: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ListResponse {
    pub items: Vec<OrderResponse>,
    pub total: u64,
    pub page: i64,
    pub limit: i64,
}

pub async fn index(
    State(orders): State<OrderCollection>,
    State(couriers): State<CourierCollection>,
    State(users): State<UserCollection>,
    user: UserAccess,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse>, Error> {
    let scope = caller_scope(&user, &couriers).await?;

    let mut filter = bson::doc! {};

    match scope {
        Some(own_courier) => {
            filter.insert("courier_id", own_courier);
        }
        None => {
            if let Some(courier_id) = query.courier_id.as_deref().filter(|it| !it.is_empty()) {
                let courier_id = ObjectId::from_str(courier_id).map_err(|_| Error::InvalidId)?;
                filter.insert("courier_id", courier_id);
            }
        }
    }

    if let Some(status) = query.status.as_deref().filter(|it| !it.is_empty()) {
        let status = OrderStatus::from_str(status)
            .map_err(|_| Error::InvalidStatus(status.to_string()))?;
        filter.insert("status", status.as_str());
    }

    if let Some(q) = query.q.as_deref().map(str::trim).filter(|it| !it.is_empty()) {
        let pattern = regex::escape(q);
        filter.insert(
            "$or",
            vec![
                bson::doc! { "number": { "$regex": &pattern, "$options": "i" } },
                bson::doc! { "customer_name": { "$regex": &pattern, "$options": "i" } },
            ],
        );
    }

    if let Some(range) = date_range_filter(
        query.created_from.as_deref(),
        query.created_to.as_deref(),
    )? {
        filter.insert("created_at", range);
    }

    let pagination = Pagination {
        page: query.page,
        limit: query.limit,
    };
    let (page, limit) = pagination.normalize();

    let total = orders.count_documents(filter.clone(), None).await?;

    let field = sort_field(query.sort_by.as_deref());
    let dir = sort_dir(query.sort_dir.as_deref());
    // _id ascending breaks ties by insertion order
    let mut sort = bson::Document::new();
    sort.insert(field, dir.order());
    sort.insert("_id", 1);

    let options = mongodb::options::FindOptions::builder()
        .sort(sort)
        .skip(pagination.skip() as u64)
        .limit(limit)
        .build();

    let models = orders.find_all(filter, options).await?;
    let items = resolve_many(models, &couriers, &users).await?;

    Ok(Json(ListResponse {
        items,
        total,
        page,
        limit,
    }))
}

/// Per-status buckets, zero-filled so every status is always present in the
/// response even when nothing matched.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct StatusBuckets<T> {
    pub new: T,
    pub assigned: T,
    pub picked_up: T,
    pub delivered: T,
    pub canceled: T,
}

impl<T> StatusBuckets<T> {
    fn get_mut(&mut self, status: OrderStatus) -> &mut T {
        match status {
            OrderStatus::New => &mut self.new,
            OrderStatus::Assigned => &mut self.assigned,
            OrderStatus::PickedUp => &mut self.picked_up,
            OrderStatus::Delivered => &mut self.delivered,
            OrderStatus::Canceled => &mut self.canceled,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CourierBucket {
    pub courier_id: Option<ObjectIdString>,
    pub name: Option<String>,
    pub count: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub total: u64,
    pub by_status: StatusBuckets<u64>,
    pub by_status_price: StatusBuckets<f64>,
    pub by_courier: Vec<CourierBucket>,
}

struct Stats {
    total: u64,
    by_status: StatusBuckets<u64>,
    by_status_price: StatusBuckets<f64>,
    /// Count per courier, descending; unassigned orders land in the `None`
    /// bucket. Ties keep first-appearance order.
    courier_counts: Vec<(Option<ObjectId>, u64)>,
}

fn aggregate_stats(orders: &[OrderModel]) -> Stats {
    let mut by_status = StatusBuckets::<u64>::default();
    let mut by_status_price = StatusBuckets::<f64>::default();

    let mut courier_counts: Vec<(Option<ObjectId>, u64)> = vec![];
    let mut courier_index: HashMap<Option<ObjectId>, usize> = HashMap::new();

    for order in orders {
        *by_status.get_mut(order.status) += 1;
        *by_status_price.get_mut(order.status) += order.price;

        match courier_index.get(&order.courier_id) {
            Some(&index) => courier_counts[index].1 += 1,
            None => {
                courier_index.insert(order.courier_id, courier_counts.len());
                courier_counts.push((order.courier_id, 1));
            }
        }
    }

    courier_counts.sort_by(|a, b| b.1.cmp(&a.1));

    Stats {
        total: orders.len() as u64,
        by_status,
        by_status_price,
        courier_counts,
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct StatsQuery {
    pub created_from: Option<String>,
    pub created_to: Option<String>,
}

pub async fn stats(
    State(orders): State<OrderCollection>,
    State(couriers): State<CourierCollection>,
    State(users): State<UserCollection>,
    user: UserAccess,
    Query(query): Query<StatsQuery>,
) -> Result<Json<StatsResponse>, Error> {
    let scope = caller_scope(&user, &couriers).await?;

    let mut filter = bson::doc! {};
    if let Some(own_courier) = scope {
        filter.insert("courier_id", own_courier);
    }
    if let Some(range) = date_range_filter(
        query.created_from.as_deref(),
        query.created_to.as_deref(),
    )? {
        filter.insert("created_at", range);
    }

    let models = orders.find_all(filter, None).await?;
    let stats = aggregate_stats(&models);

    // join display names into the leaderboard
    let courier_ids = stats
        .courier_counts
        .iter()
        .filter_map(|(id, _)| *id)
        .collect::<Vec<_>>();
    let courier_map: HashMap<ObjectId, super::courier::CourierModel> = couriers
        .find_all(bson::doc! { "_id": { "$in": courier_ids } }, None)
        .await?
        .into_iter()
        .map(|it| (it.id, it))
        .collect();
    let user_ids = courier_map
        .values()
        .map(|it| it.user_id)
        .collect::<Vec<_>>();
    let user_map: HashMap<ObjectId, super::auth::UserModel> = users
        .find_all(bson::doc! { "_id": { "$in": user_ids } }, None)
        .await?
        .into_iter()
        .map(|it| (it.id, it))
        .collect();

    let by_courier = stats
        .courier_counts
        .into_iter()
        .map(|(courier_id, count)| CourierBucket {
            courier_id: courier_id.map(Into::into),
            name: courier_id
                .and_then(|id| courier_map.get(&id))
                .and_then(|courier| user_map.get(&courier.user_id))
                .map(|user| user.full_name.clone()),
            count,
        })
        .collect();

    Ok(Json(StatsResponse {
        total: stats.total,
        by_status: stats.by_status,
        by_status_price: stats.by_status_price,
        by_courier,
    }))
}

pub async fn show(
    State(orders): State<OrderCollection>,
    State(couriers): State<CourierCollection>,
    State(users): State<UserCollection>,
    user: UserAccess,
    PathObjectId(order_id): PathObjectId,
) -> Result<Json<OrderResponse>, Error> {
    let scope = caller_scope(&user, &couriers).await?;

    let order = orders
        .get_one_by_id(order_id)
        .await?
        .ok_or(Error::NotFound("order"))?;

    if let Some(own_courier) = scope {
        if order.courier_id != Some(own_courier) {
            return Err(Error::Forbidden)
                .tap_err(|_| tracing::debug!("courier tried reading an order not assigned to them"));
        }
    }

    resolve_one(order, &couriers, &users).await.map(Json)
}

#[derive(Validate, Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequest {
    #[validate(length(min = 1, max = 64))]
    pub number: String,

    #[validate(length(min = 1, max = 124))]
    pub customer_name: String,

    #[validate(length(min = 1, max = 32))]
    pub customer_phone: String,

    #[validate(length(min = 1))]
    pub address_from: String,

    #[validate(length(min = 1))]
    pub address_to: String,

    #[validate(range(min = 0.0))]
    pub price: f64,

    pub courier_id: Option<String>,
    pub notes: Option<String>,
}

#[tracing::instrument(skip_all, fields(user = ?user))]
pub async fn create(
    State(orders): State<OrderCollection>,
    State(couriers): State<CourierCollection>,
    State(users): State<UserCollection>,
    user: UserAccess,
    Json(request): Json<CreateRequest>,
) -> Result<(StatusCode, Json<OrderResponse>), Error> {
    user.require_privileged()
        .tap_err(|_| tracing::debug!("tried creating order as courier"))?;
    request.validate()?;

    let count = orders
        .count_documents(bson::doc! { "number": &request.number }, None)
        .await?;
    if count > 0 {
        return Err(Error::Conflict("order number"));
    }

    let courier_id = match request.courier_id.as_deref().filter(|it| !it.is_empty()) {
        Some(courier_id) => {
            let courier_id = ObjectId::from_str(courier_id).map_err(|_| Error::InvalidId)?;
            couriers
                .get_one_by_id(courier_id)
                .await?
                .ok_or(Error::NotFound("courier"))?;

            Some(courier_id)
        }
        None => None,
    };

    let model = OrderModel {
        id: ObjectId::new(),
        number: request.number,
        customer_name: request.customer_name,
        customer_phone: request.customer_phone,
        address_from: request.address_from,
        address_to: request.address_to,
        price: request.price,
        // an order born with a courier starts out assigned
        status: match courier_id {
            Some(_) => OrderStatus::Assigned,
            None => OrderStatus::New,
        },
        courier_id,
        created_by: user.id,
        notes: request.notes.unwrap_or_default(),
        created_at: OffsetDateTime::now_utc().into(),
        updated_at: OffsetDateTime::now_utc().into(),
    };

    tracing::debug!("creating order {:?}", model.number);
    orders.insert_one(&model, None).await?;

    let response = resolve_one(model, &couriers, &users).await?;

    Ok((StatusCode::CREATED, Json(response)))
}

#[derive(Validate, Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRequest {
    #[validate(length(min = 1, max = 64))]
    pub number: Option<String>,

    #[validate(length(min = 1, max = 124))]
    pub customer_name: Option<String>,

    pub customer_phone: Option<String>,
    pub address_from: Option<String>,
    pub address_to: Option<String>,

    #[validate(range(min = 0.0))]
    pub price: Option<f64>,

    pub notes: Option<String>,
}

#[tracing::instrument(skip_all, fields(id = %order_id, user = ?user))]
pub async fn update(
    State(orders): State<OrderCollection>,
    State(couriers): State<CourierCollection>,
    State(users): State<UserCollection>,
    user: UserAccess,
    PathObjectId(order_id): PathObjectId,
    Json(request): Json<UpdateRequest>,
) -> Result<Json<OrderResponse>, Error> {
    user.require_privileged()
        .tap_err(|_| tracing::debug!("tried updating order as courier"))?;
    request.validate()?;

    let order = orders
        .get_one_by_id(order_id)
        .await?
        .ok_or(Error::NotFound("order"))
        .tap_err(|_| tracing::debug!("tried updating non existing order"))?;

    if let Some(number) = &request.number {
        if number != &order.number {
            let count = orders
                .count_documents(bson::doc! { "number": number }, None)
                .await?;
            if count > 0 {
                return Err(Error::Conflict("order number"));
            }
        }
    }

    let order = OrderModel {
        number: request.number.unwrap_or(order.number),
        customer_name: request.customer_name.unwrap_or(order.customer_name),
        customer_phone: request.customer_phone.unwrap_or(order.customer_phone),
        address_from: request.address_from.unwrap_or(order.address_from),
        address_to: request.address_to.unwrap_or(order.address_to),
        price: request.price.unwrap_or(order.price),
        notes: request.notes.unwrap_or(order.notes),

        // status and assignment are only reachable through their endpoints
        id: order.id,
        status: order.status,
        courier_id: order.courier_id,
        created_by: order.created_by,
        created_at: order.created_at,
        updated_at: OffsetDateTime::now_utc().into(),
    };

    orders
        .update_one_by_id(order_id, bson::doc! { "$set": bson::to_document(&order)? })
        .await?;

    resolve_one(order, &couriers, &users).await.map(Json)
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AssignRequest {
    pub courier_id: Option<String>,
}

#[tracing::instrument(skip_all, fields(id = %order_id, user = ?user))]
pub async fn assign(
    State(orders): State<OrderCollection>,
    State(couriers): State<CourierCollection>,
    State(users): State<UserCollection>,
    user: UserAccess,
    PathObjectId(order_id): PathObjectId,
    Json(request): Json<AssignRequest>,
) -> Result<Json<OrderResponse>, Error> {
    user.require_privileged()
        .tap_err(|_| tracing::debug!("tried assigning order as courier"))?;

    let mut order = orders
        .get_one_by_id(order_id)
        .await?
        .ok_or(Error::NotFound("order"))
        .tap_err(|_| tracing::debug!("tried assigning non existing order"))?;

    match request.courier_id.as_deref().filter(|it| !it.is_empty()) {
        None => {
            // clearing the assignment never touches status
            order.courier_id = None;
        }
        Some(courier_id) => {
            let courier_id = ObjectId::from_str(courier_id).map_err(|_| Error::InvalidId)?;
            couriers
                .get_one_by_id(courier_id)
                .await?
                .ok_or(Error::NotFound("courier"))?;

            order.courier_id = Some(courier_id);

            // auto-advance applies from `new` only; reassigning an order in
            // any later state leaves its status alone
            if order.status == OrderStatus::New {
                order.status = OrderStatus::Assigned;
            }
        }
    }

    order.updated_at = OffsetDateTime::now_utc().into();

    orders
        .update_one_by_id(order_id, bson::doc! { "$set": bson::to_document(&order)? })
        .await?;

    resolve_one(order, &couriers, &users).await.map(Json)
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ChangeStatusRequest {
    pub status: String,
}

#[tracing::instrument(skip_all, fields(id = %order_id, user = ?user))]
pub async fn change_status(
    State(orders): State<OrderCollection>,
    State(couriers): State<CourierCollection>,
    State(users): State<UserCollection>,
    user: UserAccess,
    PathObjectId(order_id): PathObjectId,
    Json(request): Json<ChangeStatusRequest>,
) -> Result<Json<OrderResponse>, Error> {
    let target = OrderStatus::from_str(&request.status)
        .map_err(|_| Error::InvalidStatus(request.status.clone()))?;

    let mut order = orders
        .get_one_by_id(order_id)
        .await?
        .ok_or(Error::NotFound("order"))?;

    let owns_order = match user.role {
        UserRole::Courier => {
            let courier = super::courier::find_by_user(&couriers, user.id)
                .await?
                .ok_or(Error::Forbidden)?;

            if order.courier_id != Some(courier.id) {
                return Err(Error::Forbidden).tap_err(|_| {
                    tracing::debug!("courier tried changing status of an order not assigned to them")
                });
            }

            true
        }
        UserRole::Admin | UserRole::Dispatcher => false,
    };

    if !can_transition(user.role, owns_order, order.status, target) {
        return Err(Error::InvalidTransition {
            from: order.status,
            to: target,
        });
    }

    order.status = target;
    order.updated_at = OffsetDateTime::now_utc().into();

    orders
        .update_one_by_id(order_id, bson::doc! { "$set": bson::to_document(&order)? })
        .await?;

    resolve_one(order, &couriers, &users).await.map(Json)
}
