//! The message contract between tab owners and the Manager (§4.5, §6):
//! three request topics (`create`, `command`, `close`) and three
//! reply/notification topics (`created`, `reply`, `event`).

use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::error::CdpError;
use crate::types::{BrowserContextId, OwnerId, SessionId, TargetId};

/// Options a caller may supply when creating a tab (§6 "create request:
/// owner, options").
#[derive(Debug, Clone, Default)]
pub struct TabOptions {
    pub initial_url: Option<String>,
}

/// What a successful `create` resolves to.
#[derive(Debug, Clone)]
pub struct CreatedInfo {
    pub session: SessionId,
    pub target: TargetId,
    pub context: BrowserContextId,
}

pub(crate) struct CreateRequest {
    pub owner: OwnerId,
    pub options: TabOptions,
    pub reply: oneshot::Sender<Result<CreatedInfo, CdpError>>,
    /// Channel the Manager forwards this owner's events/replies on. Passed
    /// in by the caller rather than created by the Manager so the owner can
    /// start listening before `create` resolves.
    pub owner_tx: mpsc::Sender<OwnerMessage>,
}

pub(crate) struct CommandRequest {
    pub owner: OwnerId,
    pub session: SessionId,
    pub method: String,
    pub params: Value,
    pub timeout: Duration,
    pub reply: oneshot::Sender<Result<Value, CdpError>>,
}

pub(crate) struct CloseRequest {
    pub session: SessionId,
}

/// A notification forwarded from the Manager to a tab owner. Only `Event`
/// travels this path in steady state; it exists as an enum so the owner's
/// single receiver can in principle carry other manager-initiated pushes
/// later without changing the channel type.
#[derive(Debug, Clone)]
pub enum OwnerMessage {
    Event {
        method: String,
        params: Value,
        session: SessionId,
    },
}
