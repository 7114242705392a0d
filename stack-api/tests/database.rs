use std::time::Duration;

use reqwest::StatusCode;

use stack_api::database::Database;
use stack_api::server::HEALTHY_SUMMARY;

use crate::common::*;

mod common;

// These need a running postgres, described by the same DB_* variables the
// service reads. They pass vacuously when DB_HOST is unset.

#[tokio::test]
async fn connects_to_a_provisioned_database() {
    let Some(config) = provisioned_database() else {
        return;
    };

    let database = Database::connect(&config).await.unwrap();
    database.ping().await.unwrap();
    database.close().await;
}

#[tokio::test]
async fn healthy_database_turns_health_and_readiness_green() {
    let Some(config) = provisioned_database() else {
        return;
    };
    let database = Database::connect(&config).await.unwrap();
    let server = ServerHandle::with_database(config, database).await;

    // a few monitor rounds
    tokio::time::sleep(Duration::from_millis(300)).await;

    let health = server.get("/health").await;
    assert_eq!(health.status(), StatusCode::OK);
    assert_eq!(health.text().await.unwrap(), HEALTHY_SUMMARY);

    assert_eq!(server.get("/_readiness").await.status(), StatusCode::OK);
}
