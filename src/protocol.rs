//! Inspector relay wire protocol types.
//!
//! ## Spec summary
//! - Frames are newline-free, one-message-per-frame JSON objects sharing the
//!   envelope `{type: string, ...}`.
//! - [`Message`] is the tagged sum of every frame kind the relay consumes or
//!   produces; it is decoded once at the socket boundary.  Frames whose type
//!   or payload shape the relay does not recognize are still relayed verbatim
//!   to the other peers, so decoding here is classification, not validation.
//! - [`NetworkRequestRecord`] is one observed HTTP(S) request/response
//!   lifecycle, addressable only by its `id`; repeated lifecycle events for
//!   the same `id` merge field-wise into one record.
//! - Server status never crosses the wire to peers; see
//!   [`status`](crate::status).

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Stable identity of a network request.
///
/// Instrumentation layers commonly use `Date.now()`-style numeric ids, but
/// string ids appear as well, so both spellings are accepted and preserved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    Text(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::Text(s) => write!(f, "{s}"),
        }
    }
}

/// Lifecycle phase carried by a `NETWORK_EVENT` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NetworkEventType {
    RequestStarted,
    RequestCompleted,
    RequestFailed,
    RequestAborted,
    RequestPending,
    ClearNetworkHistory,
}

/// One HTTP(S) request/response lifecycle observed by the instrumented app.
///
/// Every field except `id` is optional: a record starts sparse on
/// `REQUEST_STARTED` and fills in as completion events merge into it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRequestRecord {
    pub id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<f64>,
}

impl NetworkRequestRecord {
    /// Field-wise merge: fields present in `update` overwrite, fields absent
    /// from `update` are preserved.
    pub fn merge_from(&mut self, update: NetworkRequestRecord) {
        if update.method.is_some() {
            self.method = update.method;
        }
        if update.url.is_some() {
            self.url = update.url;
        }
        if update.status.is_some() {
            self.status = update.status;
        }
        if update.headers.is_some() {
            self.headers = update.headers;
        }
        if update.request_body.is_some() {
            self.request_body = update.request_body;
        }
        if update.response_body.is_some() {
            self.response_body = update.response_body;
        }
        if update.start_time.is_some() {
            self.start_time = update.start_time;
        }
        if update.end_time.is_some() {
            self.end_time = update.end_time;
        }
    }
}

/// Sortable attribute of a [`NetworkRequestRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortField {
    Id,
    Method,
    Url,
    Status,
    StartTime,
    EndTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

/// Field/direction pair governing history query order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: SortField,
    pub direction: SortDirection,
}

impl Default for SortSpec {
    /// Newest first.
    fn default() -> Self {
        SortSpec {
            field: SortField::StartTime,
            direction: SortDirection::Desc,
        }
    }
}

/// Partial sort reconfiguration carried by a `NETWORK_SORT` frame.
/// A missing component leaves the current value unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<SortField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<SortDirection>,
}

/// Every frame kind the relay consumes or produces.
///
/// Storage frames (`STORAGE_DATA`, `UPDATE_VALUE`, `DELETE_VALUE`,
/// `CLEAR_ALL_STORAGE`) have no relay-side effect; they are enumerated here
/// so the dispatch layer can name them, but the relay forwards the original
/// frame bytes rather than re-encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    /// Relay → peer: ask the producer to resend its full key/value snapshot.
    GetStorage,
    /// Full storage snapshot, relayed verbatim.
    StorageData { data: Vec<Value> },
    /// Single key/value update, relayed verbatim.
    UpdateValue { data: Value },
    /// Single key deletion, relayed verbatim.
    DeleteValue { data: Value },
    /// Wipe-everything command, relayed verbatim.
    ClearAllStorage,
    /// Network lifecycle event; applied to the history store, then relayed.
    NetworkEvent {
        #[serde(rename = "eventType")]
        event_type: NetworkEventType,
        data: Value,
    },
    /// Relay → peer: bootstrap or refresh snapshot of the history store.
    NetworkHistory { data: Vec<NetworkRequestRecord> },
    /// Updates the default sort spec; not itself relayed.
    NetworkSort { data: SortUpdate },
    /// Inspector asking producers to resend; relayed as `REQUEST_REFRESH`.
    NetworkRefresh,
    /// Relay → peer: prompt producers to resend their current requests.
    RequestRefresh,
}

impl Message {
    /// Serialize to a single wire frame.
    ///
    /// These types only fail to serialize if a payload `Value` contains a
    /// non-string map key, which the decode path cannot produce.
    pub fn to_frame(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
