use std::collections::HashSet;

use bson::oid::ObjectId;
use mongodb::{options::IndexOptions, IndexModel};
use serde::{Deserialize, Serialize};

use crate::{app::AppState, mongo_ext::Collection};

#[derive(Serialize, Deserialize)]
pub struct MigrateModel {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub version: i64,
}

#[derive(Clone)]
pub struct MigrationCollection(pub Collection<MigrateModel>);

impl std::ops::Deref for MigrationCollection {
    type Target = Collection<MigrateModel>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl MigrationCollection {
    pub async fn insert_version(&self, version: i64) -> Result<(), mongodb::error::Error> {
        self.insert_one(
            MigrateModel {
                id: ObjectId::new(),
                version,
            },
            None,
        )
        .await
        .map(|_| ())
    }
}

fn unique() -> IndexOptions {
    IndexOptions::builder().unique(true).build()
}

fn unique_sparse() -> IndexOptions {
    IndexOptions::builder().unique(true).sparse(true).build()
}

impl AppState {
    async fn v1_migrate(&self) -> Result<(), mongodb::error::Error> {
        self.migrate_collection
            .create_index(
                IndexModel::builder()
                    .keys(bson::doc! { "version": 1 })
                    .options(unique())
                    .build(),
                None,
            )
            .await?;

        // email and phone are optional, sparse keeps absent values out of the
        // uniqueness check
        self.user_collection
            .create_index(
                IndexModel::builder()
                    .keys(bson::doc! { "email": 1 })
                    .options(unique_sparse())
                    .build(),
                None,
            )
            .await?;

        self.user_collection
            .create_index(
                IndexModel::builder()
                    .keys(bson::doc! { "phone": 1 })
                    .options(unique_sparse())
                    .build(),
                None,
            )
            .await?;

        self.courier_collection
            .create_index(
                IndexModel::builder()
                    .keys(bson::doc! { "user_id": 1 })
                    .options(unique())
                    .build(),
                None,
            )
            .await?;

        self.order_collection
            .create_index(
                IndexModel::builder()
                    .keys(bson::doc! { "number": 1 })
                    .options(unique())
                    .build(),
                None,
            )
            .await?;

        Ok(())
    }

    async fn get_all_migration(&self) -> Result<Vec<MigrateModel>, mongodb::error::Error> {
        let mut cursor = self.migrate_collection.find(None, None).await?;

        let mut vec = vec![];

        while cursor.advance().await? {
            vec.push(cursor.deserialize_current()?);
        }

        Ok(vec)
    }

    pub async fn run_migration(&self) -> Result<(), mongodb::error::Error> {
        let migration: HashSet<i64> = self
            .get_all_migration()
            .await?
            .into_iter()
            .map(|it| it.version)
            .collect();

        macro_rules! migrate {
            ($version:expr, $fun:ident) => {
                if let None = migration.get(&$version) {
                    tracing::debug!("running migration version {}", $version);
                    self.$fun().await?;
                    self.migrate_collection.insert_version($version).await?;
                }
            };
        }

        migrate!(1, v1_migrate);

        Ok(())
    }
}
