use axum::extract::FromRef;

use crate::api::v1::{
    auth::UserCollection, courier::CourierCollection, order::OrderCollection, token::JwtState,
};
use crate::migrate::MigrationCollection;

#[derive(FromRef, Clone)]
pub struct AppState {
    pub argon: argon2::Argon2<'static>,
    pub jwt_state: JwtState,

    pub mongo_client: mongodb::Client,
    pub migrate_collection: MigrationCollection,
    pub user_collection: UserCollection,
    pub courier_collection: CourierCollection,
    pub order_collection: OrderCollection,
}

impl AppState {
    pub async fn new(
        mongo_url: &str,
        database_name: &str,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let argon = argon2::Argon2::default();
        let jwt_state = JwtState::new_from_env();

        let mongo_client_opt = mongodb::options::ClientOptions::parse(mongo_url).await?;
        let mongo_client = mongodb::Client::with_options(mongo_client_opt)?;

        let db = mongo_client.database(database_name);
        Ok(Self {
            argon,
            jwt_state,

            mongo_client,
            migrate_collection: MigrationCollection(db.collection("migrations").into()),
            user_collection: UserCollection(db.collection("users").into()),
            courier_collection: CourierCollection(db.collection("couriers").into()),
            order_collection: OrderCollection(db.collection("orders").into()),
        })
    }

    pub async fn new_from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let mongodb_url = &std::env::var("MONGODB_URI")
            .expect("Cannot retrieve MONGODB_URI from environment variable.");

        Self::new(mongodb_url, "dispatch").await
    }
}
