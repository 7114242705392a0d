use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use envconfig::Envconfig;
use once_cell::sync::Lazy;
use tokio::net::TcpListener;
use tokio::sync::Notify;

use stack_api::config::Config;
use stack_api::database::Database;
use stack_api::server::serve;
use stack_common::metrics::detached_recorder;

/// Points at a port nothing listens on, with short timeouts and a fast
/// monitor so an outage is observed quickly.
pub static UNREACHABLE_DATABASE: Lazy<Config> = Lazy::new(|| {
    let env: HashMap<String, String> = [
        ("BIND_HOST", "127.0.0.1"),
        ("BIND_PORT", "0"),
        ("DB_HOST", "127.0.0.1"),
        ("DB_PORT", "1"),
        ("DB_CONNECT_TIMEOUT_MS", "200"),
        ("DB_QUERY_TIMEOUT_MS", "200"),
        ("DB_MONITOR_INTERVAL_MS", "50"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_owned(), v.to_owned()))
    .collect();
    Config::init_from_hashmap(&env).unwrap()
});

/// Settings of a database provisioned by the environment (as the CI test
/// runner does), or `None` when `DB_HOST` is unset and no database is
/// expected.
pub fn provisioned_database() -> Option<Config> {
    std::env::var("DB_HOST").ok()?;
    let mut env: HashMap<String, String> = std::env::vars().collect();
    for (key, value) in [
        ("BIND_HOST", "127.0.0.1"),
        ("BIND_PORT", "0"),
        ("DB_MONITOR_INTERVAL_MS", "50"),
    ] {
        drop(env.insert(key.to_owned(), value.to_owned()));
    }
    Some(Config::init_from_hashmap(&env).unwrap())
}

pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: Arc<Notify>,
}

impl ServerHandle {
    pub async fn for_config(config: Config) -> ServerHandle {
        let database = Database::lazy(&config).unwrap();
        Self::with_database(config, database).await
    }

    pub async fn with_database(config: Config, database: Database) -> ServerHandle {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let notify = Arc::new(Notify::new());
        let shutdown = notify.clone();

        tokio::spawn(async move {
            serve(config, database, detached_recorder(), listener, async move {
                notify.notified().await
            })
            .await
        });
        ServerHandle { addr, shutdown }
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        reqwest::Client::new()
            .get(format!("http://{:?}{}", self.addr, path))
            .send()
            .await
            .expect("failed to send request")
    }

    pub fn stop(&self) {
        self.shutdown.notify_one()
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown.notify_one()
    }
}
