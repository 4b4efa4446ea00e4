//! Live feed protocol (JSON lines)

use crate::session::{EndReason, Row, SessionSnapshot, SessionState};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    Ping,
    GetStatus,
    GetRows { params: GetRowsParams },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetRowsParams {
    /// Skip this many delivered rows.
    pub since: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Pong,
    Status { data: StatusData },
    Rows { data: RowsData },
    Target { data: TargetData },
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusData {
    pub state: SessionState,
    pub target: Option<String>,
    pub pid: Option<u32>,
    pub delivered: usize,
    pub pending: usize,
    pub end_reason: Option<EndReason>,
    pub last_error: Option<String>,
}

impl From<&SessionSnapshot> for StatusData {
    fn from(snapshot: &SessionSnapshot) -> Self {
        StatusData {
            state: snapshot.state,
            target: snapshot.target.as_ref().map(|t| t.label.clone()),
            pid: snapshot.target.as_ref().map(|t| t.pid),
            delivered: snapshot.rows.len(),
            pending: snapshot.pending,
            end_reason: snapshot.end_reason,
            last_error: snapshot.last_error.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowsData {
    /// Index of the first row in this batch within the session.
    pub offset: usize,
    pub rows: Vec<Row>,
    #[serde(default)]
    pub is_final: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetData {
    pub label: String,
}
