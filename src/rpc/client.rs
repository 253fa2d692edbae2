//! Typed caller of the view API.

use super::api_prefix;
use super::messages::{
    CreateViewReply, CreateViewRequest, DeleteViewReply, DeleteViewRequest, PullViewReply,
    PullViewRequest, Reply, CODE_NOT_FOUND,
};
use crate::error::{Result, SnapshotError};
use crate::transport::EventTransport;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

/// Client for the view API of one domain.
pub struct SnapshotClient {
    prefix: String,
    transport: Arc<dyn EventTransport>,
}

impl SnapshotClient {
    pub fn new(domain: &str, transport: Arc<dyn EventTransport>) -> Self {
        Self {
            prefix: api_prefix(domain),
            transport,
        }
    }

    pub fn create_view(&self, subscriber: &str, collection: &str) -> Result<CreateViewReply> {
        self.call(
            "VIEW.CREATE",
            &CreateViewRequest {
                subscriber: subscriber.to_string(),
                collection: collection.to_string(),
            },
        )
    }

    pub fn delete_view(&self, id: &str) -> Result<DeleteViewReply> {
        self.call("VIEW.DELETE", &DeleteViewRequest { id: id.to_string() })
    }

    /// Ask the service to publish the next batch of a view. Returns the
    /// number of records published to the view stream.
    pub fn pull_view(&self, id: &str, last_key: &[u8], after_last_key: bool) -> Result<u64> {
        let reply: PullViewReply = self.call(
            "VIEW.PULL",
            &PullViewRequest {
                id: id.to_string(),
                last_key: STANDARD.encode(last_key),
                after_last_key,
            },
        )?;
        Ok(reply.count)
    }

    fn call<Req: Serialize, Rep: DeserializeOwned>(&self, route: &str, request: &Req) -> Result<Rep> {
        let subject = format!("{}.{}", self.prefix, route);
        let reply = self.transport.request(&subject, serde_json::to_vec(request)?)?;

        match serde_json::from_slice::<Reply<Rep>>(&reply)? {
            Reply::Ok(rep) => Ok(rep),
            Reply::Error(err) if err.error.code == CODE_NOT_FOUND => {
                Err(SnapshotError::ViewNotFound(err.error.message))
            }
            Reply::Error(err) => Err(SnapshotError::InvalidOperation(format!(
                "{} ({})",
                err.error.message, err.error.code
            ))),
        }
    }
}
