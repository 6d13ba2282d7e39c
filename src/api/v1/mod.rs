pub mod auth;
pub mod courier;
pub mod order;
pub mod status;
pub mod token;

#[cfg(test)]
mod tests {
    use argon2::Argon2;
    use axum::extract::State;
    use bson::oid::ObjectId;

    use crate::app::AppState;

    use super::{
        auth::{UserAccess, UserCollection, UserModel, UserRole},
        courier::CourierCollection,
        order::OrderCollection,
        token::JwtState,
    };

    #[allow(dead_code)]
    pub struct Bootstrap {
        pub user_model: UserModel,
        pub user_password: String,
        pub app_state: AppState,
    }

    impl Bootstrap {
        pub fn user_collection(&self) -> State<UserCollection> {
            State(self.app_state.user_collection.clone())
        }

        pub fn courier_collection(&self) -> State<CourierCollection> {
            State(self.app_state.courier_collection.clone())
        }

        pub fn order_collection(&self) -> State<OrderCollection> {
            State(self.app_state.order_collection.clone())
        }

        pub fn jwt_state(&self) -> State<JwtState> {
            State(self.app_state.jwt_state.clone())
        }

        pub fn argon(&self) -> State<Argon2<'static>> {
            State(self.app_state.argon.clone())
        }

        pub fn user_token(&self) -> String {
            super::token::generate_access_token(&self.app_state.jwt_state, &self.user_model)
                .unwrap()
                .token
        }

        pub fn user_access(&self) -> UserAccess {
            UserAccess::from_token(&self.app_state.jwt_state, &self.user_token()).unwrap()
        }

        pub fn user_id(&self) -> ObjectId {
            self.user_model.id
        }

        pub async fn derive(&self, email: &str, password: &str, role: UserRole) -> Bootstrap {
            let user = create_user(&self.app_state, email, password, role).await;

            Bootstrap {
                user_model: user,
                user_password: password.to_string(),
                app_state: self.app_state.clone(),
            }
        }

        /// A courier login with its profile already in place.
        pub async fn derive_courier(&self, email: &str) -> CourierBootstrap {
            let inner = self.derive(email, "password", UserRole::Courier).await;

            let profile = super::courier::insert_profile(
                &self.app_state.courier_collection,
                inner.user_model.id,
                super::courier::NewProfile {
                    vehicle_type: Default::default(),
                    city: "Riga".to_string(),
                    rating: 4.0,
                    is_available: true,
                    notes: String::new(),
                },
            )
            .await
            .unwrap();

            CourierBootstrap {
                inner,
                courier_id: profile.id,
            }
        }
    }

    pub struct CourierBootstrap {
        pub inner: Bootstrap,
        courier_id: ObjectId,
    }

    impl CourierBootstrap {
        pub fn courier_id(&self) -> ObjectId {
            self.courier_id
        }

        pub fn user_access(&self) -> UserAccess {
            self.inner.user_access()
        }
    }

    pub async fn create_user(
        app: &AppState,
        email: &str,
        password: &str,
        role: UserRole,
    ) -> UserModel {
        super::auth::insert_user(
            &app.user_collection,
            &app.argon,
            super::auth::NewUser {
                email: Some(email.to_string()),
                phone: None,
                full_name: email.split('@').next().unwrap_or(email).to_string(),
                password: Some(password.to_string()),
                role,
            },
        )
        .await
        .unwrap()
    }

    // every run gets its own database so tests never see each other's data
    pub async fn bootstrap() -> Bootstrap {
        dotenvy::dotenv().ok();
        let mongodb_url = &std::env::var("MONGODB_URI")
            .expect("Cannot retrieve MONGODB_URI from environment variable.");

        let database_name = format!("dispatch-test-{}", ObjectId::new());
        let app_state = AppState::new(mongodb_url, &database_name).await.unwrap();
        app_state.run_migration().await.unwrap();

        let password = "password";
        let user = create_user(&app_state, "admin@example.com", password, UserRole::Admin).await;

        Bootstrap {
            user_model: user,
            user_password: password.to_string(),
            app_state,
        }
    }
}
