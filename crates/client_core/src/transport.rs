//! HTTP and WebSocket adapters for the reference server.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::{Category, CategoryId, Item, ItemId},
    error::{ApiError, ApiException},
    protocol::{ChangeEvent, ChangeFilter, SetActiveRequest},
};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::{ChangeFeed, FeedSubscription, RemoteStore, SubscriptionHandle};

pub struct HttpRemoteStore {
    http: Client,
    server_url: String,
}

impl HttpRemoteStore {
    pub fn new(server_url: &str) -> Self {
        Self::with_client(Client::new(), server_url)
    }

    pub fn with_client(http: Client, server_url: &str) -> Self {
        Self {
            http,
            server_url: server_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

/// Turns a non-success response into an error, keeping the server's
/// [`ApiError`] when the body carries one.
async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return response
            .json()
            .await
            .with_context(|| format!("invalid response body ({status})"));
    }
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiError>(&body) {
        Ok(api_error) => Err(anyhow!(ApiException::from(api_error))),
        Err(_) => Err(anyhow!("server responded with {status}: {body}")),
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn list_categories(&self) -> Result<Vec<Category>> {
        let response = self
            .http
            .get(format!("{}/categories", self.server_url))
            .send()
            .await
            .context("failed to request categories")?;
        decode(response).await
    }

    async fn fetch_items(&self, category_id: CategoryId) -> Result<Vec<Item>> {
        let response = self
            .http
            .get(format!("{}/categories/{}/items", self.server_url, category_id.0))
            .send()
            .await
            .with_context(|| format!("failed to request items of category {category_id}"))?;
        decode(response).await
    }

    async fn deactivate_all(&self, category_id: CategoryId) -> Result<Vec<Item>> {
        let response = self
            .http
            .post(format!(
                "{}/categories/{}/deactivate",
                self.server_url, category_id.0
            ))
            .send()
            .await
            .with_context(|| format!("failed to deactivate items of category {category_id}"))?;
        decode(response).await
    }

    async fn set_active(&self, item_id: ItemId, active: bool) -> Result<Item> {
        let response = self
            .http
            .post(format!("{}/items/{}/active", self.server_url, item_id.0))
            .json(&SetActiveRequest { active })
            .send()
            .await
            .with_context(|| format!("failed to write active flag of item {item_id}"))?;
        decode(response).await
    }
}

/// Change feed over the server's `/ws` endpoint; one socket per subscription.
pub struct WsChangeFeed {
    ws_base: Url,
    next_handle: AtomicU64,
    readers: Mutex<HashMap<SubscriptionHandle, JoinHandle<()>>>,
}

impl WsChangeFeed {
    pub fn new(server_url: &str) -> Result<Self> {
        let mut ws_base = Url::parse(server_url)
            .with_context(|| format!("invalid server url: {server_url}"))?;
        let scheme = match ws_base.scheme() {
            "http" => "ws",
            "https" => "wss",
            "ws" | "wss" => "",
            other => return Err(anyhow!("unsupported server url scheme: {other}")),
        };
        if !scheme.is_empty() && ws_base.set_scheme(scheme).is_err() {
            return Err(anyhow!("cannot derive websocket url from {server_url}"));
        }
        Ok(Self {
            ws_base,
            next_handle: AtomicU64::new(1),
            readers: Mutex::new(HashMap::new()),
        })
    }

    fn subscription_url(&self, filter: ChangeFilter) -> Result<Url> {
        let mut url = self
            .ws_base
            .join("ws")
            .context("failed to build websocket url")?;
        url.query_pairs_mut()
            .append_pair("category_id", &filter.category_id.0.to_string());
        Ok(url)
    }
}

#[async_trait]
impl ChangeFeed for WsChangeFeed {
    async fn subscribe(&self, filter: ChangeFilter) -> Result<FeedSubscription> {
        let url = self.subscription_url(filter)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect websocket: {url}"))?;
        let (_, mut ws_reader) = ws_stream.split();

        let handle = SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let (tx, events) = mpsc::unbounded_channel();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ChangeEvent>(&text) {
                        Ok(event) if filter.matches(&event) => {
                            if tx.send(event).is_err() {
                                break;
                            }
                        }
                        Ok(event) => {
                            debug!(
                                item_id = ?event.item_id().map(|id| id.0),
                                "dropping change event for another category"
                            );
                        }
                        Err(error) => warn!(%error, "invalid change event frame"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(error) => {
                        warn!(%error, "change feed socket failed");
                        break;
                    }
                }
            }
            debug!(handle = handle.0, "change feed reader finished");
        });

        self.readers.lock().await.insert(handle, reader);
        info!(
            handle = handle.0,
            category_id = filter.category_id.0,
            "subscribed to change feed"
        );
        Ok(FeedSubscription { handle, events })
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
        match self.readers.lock().await.remove(&handle) {
            Some(reader) => {
                reader.abort();
                debug!(handle = handle.0, "unsubscribed from change feed");
            }
            None => debug!(handle = handle.0, "unsubscribe for unknown handle"),
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
