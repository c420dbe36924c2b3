//! Typed views over the handful of CDP events the page session consumes.

use serde::Deserialize;

use crate::dispatcher::CdpEvent;

pub const REQUEST_WILL_BE_SENT: &str = "Network.requestWillBeSent";
pub const LOADING_FINISHED: &str = "Network.loadingFinished";
pub const LOADING_FAILED: &str = "Network.loadingFailed";

/// Events that feed network-idle tracking.
pub const NETWORK_EVENTS: [&str; 3] = [REQUEST_WILL_BE_SENT, LOADING_FINISHED, LOADING_FAILED];

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NetworkEvent {
    RequestWillBeSent { request_id: String },
    LoadingFinished { request_id: String },
    LoadingFailed { request_id: String },
}

#[derive(Deserialize)]
struct RequestIdParams {
    #[serde(rename = "requestId")]
    request_id: String,
}

impl NetworkEvent {
    /// Decodes the event if it is one of the tracked network notifications.
    pub fn from_event(event: &CdpEvent) -> Option<Self> {
        let params = RequestIdParams::deserialize(&event.params).ok()?;
        let request_id = params.request_id;
        match event.method.as_str() {
            REQUEST_WILL_BE_SENT => Some(NetworkEvent::RequestWillBeSent { request_id }),
            LOADING_FINISHED => Some(NetworkEvent::LoadingFinished { request_id }),
            LOADING_FAILED => Some(NetworkEvent::LoadingFailed { request_id }),
            _ => None,
        }
    }

    pub fn request_id(&self) -> &str {
        match self {
            NetworkEvent::RequestWillBeSent { request_id }
            | NetworkEvent::LoadingFinished { request_id }
            | NetworkEvent::LoadingFailed { request_id } => request_id,
        }
    }
}
