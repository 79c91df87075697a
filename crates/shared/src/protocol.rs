use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::{CommandKind, StateMatch};

/// Header telling the application which port its asynchronous reply goes to.
pub const ANSWER_PORT_HEADER: &str = "X-Answer-Port";
/// Optional header overriding the reply host; defaults to the sender address.
pub const ANSWER_HOST_HEADER: &str = "X-Answer-Host";

pub const COMMAND_ROUTE: &str = "/command";
pub const RESPONSE_ROUTE: &str = "/response";
pub const READY_ROUTE: &str = "/readystatus";
pub const READY_BODY: &str = "ready";

pub const RESULT_OK: &str = "OK";

/// JSON body POSTed to an application's `/command` endpoint. The callback
/// address travels out-of-band in the answer headers, never in the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub id: CommandKind,
    pub data: Map<String, Value>,
    pub entry_state: StateMatch,
    pub exit_state: StateMatch,
}

impl CommandRequest {
    pub fn new(
        id: CommandKind,
        data: Map<String, Value>,
        entry_state: StateMatch,
        exit_state: StateMatch,
    ) -> Self {
        Self {
            id,
            data,
            entry_state,
            exit_state,
        }
    }
}

/// Asynchronous reply POSTed back by an application. `appname` is the routing
/// key and is mandatory; everything beyond `result` is opaque payload kept
/// verbatim for the registered handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandReply {
    pub appname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl CommandReply {
    pub fn is_success(&self) -> bool {
        self.result.as_deref() == Some(RESULT_OK)
    }
}
