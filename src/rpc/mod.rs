//! Request/reply API for views.
//!
//! Routes live under `$GRAVITY.<domain>.API.SNAPSHOT`:
//!
//! - `VIEW.CREATE`: `{subscriber, collection}` -> the created view;
//! - `VIEW.DELETE`: `{id}` -> `{id}`;
//! - `VIEW.PULL`: `{id, lastKey, afterLastKey}` -> `{id, count}`.
//!
//! Failures are answered with `{"error": {"code", "message"}}`.

mod client;
pub mod messages;

pub use client::SnapshotClient;

use crate::error::{Result, SnapshotError};
use crate::transport::{EventTransport, Message, RequestHandler, Subscription};
use crate::views::ViewManager;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use messages::{
    CreateViewReply, CreateViewRequest, DeleteViewReply, DeleteViewRequest, ErrorBody, ErrorReply,
    PullViewReply, PullViewRequest,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn, Span};

/// Subject prefix of the view API.
pub fn api_prefix(domain: &str) -> String {
    format!("$GRAVITY.{}.API.SNAPSHOT", domain)
}

/// Serves the view API on a transport.
pub struct SnapshotRpc {
    prefix: String,
    views: Arc<ViewManager>,
    transport: Arc<dyn EventTransport>,
    subscriptions: Mutex<Vec<Subscription>>,
    span: Span,
}

impl SnapshotRpc {
    pub fn new(domain: &str, views: Arc<ViewManager>, transport: Arc<dyn EventTransport>, span: Span) -> Self {
        Self {
            prefix: api_prefix(domain),
            views,
            transport,
            subscriptions: Mutex::new(Vec::new()),
            span,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Register the routes. Calling it again replaces earlier registrations.
    pub fn register(&self) -> Result<()> {
        let mut subscriptions = self.subscriptions.lock();
        subscriptions.clear();

        let routes: [(&str, fn(&ViewManager, &[u8]) -> Vec<u8>); 3] = [
            ("VIEW.CREATE", create_view),
            ("VIEW.DELETE", delete_view),
            ("VIEW.PULL", pull_view),
        ];

        for (route, handle) in routes {
            let subject = format!("{}.{}", self.prefix, route);
            let views = Arc::clone(&self.views);
            let span = self.span.clone();

            let handler: RequestHandler = Arc::new(move |msg: &Message| {
                let _enter = span.enter();
                debug!(subject = %msg.subject, size = msg.data.len(), "View API request");
                handle(&views, &msg.data)
            });

            subscriptions.push(self.transport.serve(&subject, handler)?);
        }

        info!(parent: &self.span, prefix = %self.prefix, "View API registered");
        Ok(())
    }

    pub fn stop(&self) {
        self.subscriptions.lock().clear();
    }
}

fn parse<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    serde_json::from_slice(data).map_err(|e| SnapshotError::Deserialization(e.to_string()))
}

/// Run an operation and encode its outcome as a reply body.
fn respond<Req, Rep, F>(data: &[u8], op: F) -> Vec<u8>
where
    Req: DeserializeOwned,
    Rep: Serialize,
    F: FnOnce(Req) -> Result<Rep>,
{
    let body = parse(data).and_then(op).and_then(|reply| Ok(serde_json::to_vec(&reply)?));

    match body {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "View API request failed");
            encode_error(ErrorBody::from(&e))
        }
    }
}

fn encode_error(error: ErrorBody) -> Vec<u8> {
    // An ErrorReply is strings and an integer, which always serialize
    serde_json::to_vec(&ErrorReply { error }).unwrap_or_default()
}

fn create_view(views: &ViewManager, data: &[u8]) -> Vec<u8> {
    respond(data, |req: CreateViewRequest| {
        if req.collection.is_empty() {
            return Err(SnapshotError::InvalidOperation("collection is required".into()));
        }

        let view = views.create_view(&req.subscriber, &req.collection);
        Ok(CreateViewReply {
            id: view.id,
            subscriber: view.subscriber,
            collection: view.collection,
            created_at: view.created_at,
        })
    })
}

fn delete_view(views: &ViewManager, data: &[u8]) -> Vec<u8> {
    respond(data, |req: DeleteViewRequest| {
        views.delete_view(&req.id);
        Ok(DeleteViewReply { id: req.id })
    })
}

fn pull_view(views: &ViewManager, data: &[u8]) -> Vec<u8> {
    respond(data, |req: PullViewRequest| {
        let last_key = STANDARD
            .decode(&req.last_key)
            .map_err(|e| SnapshotError::InvalidOperation(format!("lastKey: {}", e)))?;

        let count = views.pull(&req.id, &last_key, req.after_last_key)?;
        Ok(PullViewReply {
            id: req.id,
            count: count as u64,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, SnapshotStore};
    use crate::transport::MemoryBroker;
    use serde_json::{json, Value as Json};

    fn setup() -> (SnapshotRpc, MemoryBroker) {
        let broker = MemoryBroker::new();
        let store: Arc<dyn SnapshotStore> = Arc::new(MemoryStore::new());
        let transport: Arc<dyn EventTransport> = Arc::new(broker.clone());
        let views = Arc::new(ViewManager::new("gravity", store, Arc::clone(&transport), 100, Span::none()));

        let rpc = SnapshotRpc::new("gravity", views, transport, Span::none());
        rpc.register().unwrap();
        (rpc, broker)
    }

    fn call(broker: &MemoryBroker, route: &str, body: Json) -> Json {
        let subject = format!("$GRAVITY.gravity.API.SNAPSHOT.{}", route);
        let reply = broker.request(&subject, serde_json::to_vec(&body).unwrap()).unwrap();
        serde_json::from_slice(&reply).unwrap()
    }

    #[test]
    fn test_create_and_pull() {
        let (_rpc, broker) = setup();

        let created = call(&broker, "VIEW.CREATE", json!({"subscriber": "s1", "collection": "users"}));
        let id = created["id"].as_str().unwrap().to_string();
        assert_eq!(created["collection"], "users");
        assert!(created["createdAt"].is_string());

        let pulled = call(&broker, "VIEW.PULL", json!({"id": id, "lastKey": "", "afterLastKey": false}));
        assert_eq!(pulled, json!({"id": id, "count": 0}));

        let deleted = call(&broker, "VIEW.DELETE", json!({"id": id}));
        assert_eq!(deleted, json!({"id": id}));

        let gone = call(&broker, "VIEW.PULL", json!({"id": id}));
        assert_eq!(gone, json!({"error": {"code": 44404, "message": "Not found view"}}));
    }

    #[test]
    fn test_malformed_requests() {
        let (_rpc, broker) = setup();

        let reply = broker
            .request("$GRAVITY.gravity.API.SNAPSHOT.VIEW.CREATE", b"{not json".to_vec())
            .unwrap();
        let reply: Json = serde_json::from_slice(&reply).unwrap();
        assert_eq!(reply["error"]["code"], 44400);

        let bad_key = call(&broker, "VIEW.PULL", json!({"id": "x", "lastKey": "***"}));
        assert_eq!(bad_key["error"]["code"], 44400);

        let no_collection = call(&broker, "VIEW.CREATE", json!({"subscriber": "s", "collection": ""}));
        assert_eq!(no_collection["error"]["code"], 44400);
    }

    #[test]
    fn test_stop_unregisters() {
        let (rpc, broker) = setup();
        rpc.stop();

        assert!(matches!(
            broker.request("$GRAVITY.gravity.API.SNAPSHOT.VIEW.CREATE", b"{}".to_vec()),
            Err(SnapshotError::NoResponder(_))
        ));
    }
}
