use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use secrecy::{ExposeSecret, SecretString};
use tokio::task::JoinHandle;

use crate::error::{Error, ErrorDetails};
use crate::settings::{SettingsSnapshot, SettingsStore};

pub const SETTINGS_KEY: &str = "genguard:settings";
pub const SETTINGS_UPDATES_CHANNEL: &str = "genguard:settings:updates";
/// Last version handed out to any replica
pub const SETTINGS_VERSION_KEY: &str = "genguard:settings:version";
/// Version of the snapshot stored under [`SETTINGS_KEY`]
pub const SETTINGS_COMMITTED_VERSION_KEY: &str = "genguard:settings:committed_version";
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Shares governance settings between gateway replicas: the latest snapshot is kept under
/// [`SETTINGS_KEY`] and every committed update is fanned out on [`SETTINGS_UPDATES_CHANNEL`].
/// Versions are handed out by Redis so concurrent writers on different replicas never commit
/// the same one.
#[derive(Clone)]
pub struct SettingsSync {
    client: redis::Client,
    conn: MultiplexedConnection,
    allocate_version_script: Script,
    publish_script: Script,
}

fn allocate_version_script() -> Script {
    Script::new(
        r#"
        local version = redis.call('INCR', KEYS[1])
        local floor = tonumber(ARGV[1])
        if version < floor then
            redis.call('SET', KEYS[1], floor)
            version = floor
        end
        return version
        "#,
    )
}

fn publish_script() -> Script {
    Script::new(
        r#"
        local committed = tonumber(redis.call('GET', KEYS[2]) or '0')
        local version = tonumber(ARGV[2])
        if version <= committed then
            return 0
        end
        redis.call('SET', KEYS[1], ARGV[1])
        redis.call('SET', KEYS[2], ARGV[2])
        redis.call('PUBLISH', ARGV[3], ARGV[1])
        return 1
        "#,
    )
}

fn store_unavailable(context: &str, e: redis::RedisError) -> Error {
    Error::new(ErrorDetails::StoreUnavailable {
        message: format!("{context}: {e}"),
    })
}

impl SettingsSync {
    pub async fn connect(url: &SecretString) -> Result<Self, Error> {
        let client = redis::Client::open(url.expose_secret()).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to create Redis client: {e}"),
            })
        })?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| store_unavailable("Failed to connect to Redis", e))?;
        Ok(Self {
            client,
            conn,
            allocate_version_script: allocate_version_script(),
            publish_script: publish_script(),
        })
    }

    /// Install the persisted snapshot if it is newer than what `store` holds.
    pub async fn load_into(&self, store: &SettingsStore) -> Result<bool, Error> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn
            .get(SETTINGS_KEY)
            .await
            .map_err(|e| store_unavailable("Failed to read settings from Redis", e))?;
        let Some(json) = json else {
            tracing::info!("No persisted governance settings in Redis; using local configuration");
            return Ok(false);
        };
        apply_payload(&json, store)
    }

    /// Reserve the version for the next local write. Never below `floor`.
    pub async fn allocate_version(&self, floor: u64) -> Result<u64, Error> {
        let mut conn = self.conn.clone();
        self.allocate_version_script
            .key(SETTINGS_VERSION_KEY)
            .arg(floor)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| store_unavailable("Failed to allocate a settings version", e))
    }

    /// Persist `snapshot` and notify the other replicas, unless Redis already holds a newer one.
    pub async fn publish(&self, snapshot: &SettingsSnapshot) -> Result<(), Error> {
        let json = serde_json::to_string(snapshot).map_err(|e| {
            Error::new(ErrorDetails::Serialization {
                message: format!("Failed to serialize settings snapshot: {e}"),
            })
        })?;
        let mut conn = self.conn.clone();
        let stored: i64 = self
            .publish_script
            .key(SETTINGS_KEY)
            .key(SETTINGS_COMMITTED_VERSION_KEY)
            .arg(&json)
            .arg(snapshot.version)
            .arg(SETTINGS_UPDATES_CHANNEL)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| store_unavailable("Failed to persist settings to Redis", e))?;
        if stored == 0 {
            tracing::info!(
                version = snapshot.version,
                "Skipped persisting settings: Redis already holds a newer snapshot"
            );
        } else {
            tracing::debug!(version = snapshot.version, "Published governance settings");
        }
        Ok(())
    }

    /// Apply settings published by other replicas until the process exits. Reconnects after
    /// [`RECONNECT_DELAY`] whenever the subscription drops.
    pub fn spawn_listener(&self, store: Arc<SettingsStore>) -> JoinHandle<()> {
        let client = self.client.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = listen(&client, &store).await {
                    tracing::error!("Settings subscription failed: {e}");
                } else {
                    tracing::warn!("Settings subscription closed");
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        })
    }
}

async fn listen(client: &redis::Client, store: &SettingsStore) -> Result<(), Error> {
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .map_err(|e| store_unavailable("Failed to connect to Redis for pub/sub", e))?;
    pubsub
        .subscribe(SETTINGS_UPDATES_CHANNEL)
        .await
        .map_err(|e| store_unavailable("Failed to subscribe to settings updates", e))?;
    tracing::info!("Subscribed to `{SETTINGS_UPDATES_CHANNEL}`");

    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!("Failed to decode settings update: {e}");
                continue;
            }
        };
        // Bad payloads are logged on construction; keep listening.
        let _ = apply_payload(&payload, store);
    }
    Ok(())
}

fn apply_payload(payload: &str, store: &SettingsStore) -> Result<bool, Error> {
    let snapshot: SettingsSnapshot = serde_json::from_str(payload).map_err(|e| {
        Error::new(ErrorDetails::Serialization {
            message: format!("Failed to parse settings snapshot from Redis: {e}"),
        })
    })?;
    store.apply_remote(snapshot)
}
