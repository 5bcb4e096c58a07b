//! Store facade: typed access to the two singleton documents.
//!
//! Both singletons live under `_id = "global"`, `Config` in `configs` and
//! `Plan` in `plans`. Plan writes are compare-and-swap on `version`;
//! change-stream watchers reconnect forever on transport errors.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use mongodb::bson::doc;
use mongodb::change_stream::event::ChangeStreamEvent;
use mongodb::options::FullDocumentType;
use mongodb::{Client, Collection, Database};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::model::{Config, Plan};

const WATCH_ERROR_RECOVERY_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("configuration not found; apply one first with 'wsomgr apply'")]
    NotConfigured,

    #[error("connection string '{0}' does not name a database")]
    NoDatabase(String),

    #[error("store error: {0}")]
    Store(#[from] mongodb::error::Error),
}

/// Typed access to the shared document store.
pub struct Repository {
    db: Database,
}

impl Repository {
    /// `connection_string` must carry a default database, e.g.
    /// `mongodb://localhost/wso`.
    pub async fn connect(connection_string: &str) -> Result<Self, RepositoryError> {
        let client = Client::with_uri_str(connection_string).await?;
        let db = client
            .default_database()
            .ok_or_else(|| RepositoryError::NoDatabase(connection_string.to_string()))?;
        Ok(Self { db })
    }

    fn configs(&self) -> Collection<Config> {
        self.db.collection("configs")
    }

    fn plans(&self) -> Collection<Plan> {
        self.db.collection("plans")
    }

    /// The config singleton; absent means the operator never configured
    /// the deployment, which is fatal at startup.
    pub async fn get_config(&self) -> Result<Config, RepositoryError> {
        self.configs()
            .find_one(doc! { "_id": "global" })
            .await?
            .ok_or(RepositoryError::NotConfigured)
    }

    /// The plan singleton; absent yields the empty version-0 plan.
    pub async fn get_plan(&self) -> Result<Plan, RepositoryError> {
        Ok(self
            .plans()
            .find_one(doc! { "_id": "global" })
            .await?
            .unwrap_or_default())
    }

    /// Compare-and-swap write: succeeds only while the stored version is
    /// still `plan.version - 1` (or the singleton does not exist yet).
    /// Exactly one of any set of racing writers sees `true`; losers must
    /// reload from the watch stream and retry.
    pub async fn save_plan(&self, plan: &Plan) -> Result<bool, RepositoryError> {
        let filter = doc! { "_id": "global", "version": plan.version - 1 };
        let result = self.plans().replace_one(filter, plan).upsert(true).await?;
        Ok(result.modified_count > 0 || result.upserted_id.is_some())
    }

    /// Replace the config singleton whole. Only the admin tool calls this.
    pub async fn save_config(&self, config: &Config) -> Result<(), RepositoryError> {
        self.configs()
            .replace_one(doc! { "_id": "global" }, config)
            .upsert(true)
            .await?;
        Ok(())
    }

    /// Full config documents, one per store update, forever.
    pub fn watch_config(self: &Arc<Self>) -> mpsc::Receiver<Config> {
        self.spawn_watch("configs")
    }

    /// Full plan documents, one per store update, forever.
    pub fn watch_plan(self: &Arc<Self>) -> mpsc::Receiver<Plan> {
        self.spawn_watch("plans")
    }

    /// Consume a collection's change stream into a channel. Transport
    /// errors are swallowed here: log, back off, reopen. The stream never
    /// terminates on its own.
    fn spawn_watch<T>(self: &Arc<Self>, collection: &'static str) -> mpsc::Receiver<T>
    where
        T: DeserializeOwned + Unpin + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::channel(8);
        let repository = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let coll = repository.db.collection::<T>(collection);
                match coll
                    .watch()
                    .full_document(FullDocumentType::Required)
                    .await
                {
                    Ok(mut stream) => {
                        debug!(collection, "change stream opened");
                        while let Some(event) = stream.next().await {
                            match event {
                                Ok(ChangeStreamEvent {
                                    full_document: Some(document),
                                    ..
                                }) => {
                                    if tx.send(document).await.is_err() {
                                        return;
                                    }
                                }
                                Ok(_) => continue,
                                Err(error) => {
                                    warn!(collection, %error, "change stream failed");
                                    break;
                                }
                            }
                        }
                        warn!(collection, "change stream ended");
                    }
                    Err(error) => {
                        warn!(collection, %error, "could not open change stream");
                    }
                }
                tokio::time::sleep(WATCH_ERROR_RECOVERY_INTERVAL).await;
            }
        });
        rx
    }
}
