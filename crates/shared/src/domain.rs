use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::UnknownState;

/// Per-node lifecycle state. Every node of the apparatus tree, group or
/// application, carries exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FsmState {
    None,
    Initial,
    Configured,
    Running,
}

impl FsmState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Initial => "INITIAL",
            Self::Configured => "CONFIGURED",
            Self::Running => "RUNNING",
        }
    }
}

impl fmt::Display for FsmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FsmState {
    type Err = UnknownState;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "NONE" => Ok(Self::None),
            "INITIAL" => Ok(Self::Initial),
            "CONFIGURED" => Ok(Self::Configured),
            "RUNNING" => Ok(Self::Running),
            other => Err(UnknownState(other.to_string())),
        }
    }
}

/// A state requirement carried on the wire: either a concrete state or the
/// `"ANY"` wildcard, which accepts every state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateMatch {
    Any,
    State(FsmState),
}

impl StateMatch {
    pub fn accepts(self, state: FsmState) -> bool {
        match self {
            Self::Any => true,
            Self::State(required) => required == state,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Any => "ANY",
            Self::State(state) => state.as_str(),
        }
    }
}

impl fmt::Display for StateMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StateMatch {
    type Err = UnknownState;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        if raw == "ANY" {
            return Ok(Self::Any);
        }
        raw.parse().map(Self::State)
    }
}

impl Serialize for StateMatch {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for StateMatch {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Entry and exit states of one lifecycle command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub entry: FsmState,
    pub exit: FsmState,
}

impl Transition {
    pub const fn new(entry: FsmState, exit: FsmState) -> Self {
        Self { entry, exit }
    }
}

/// The closed set of lifecycle commands. Transition gating is data carried by
/// the kind, not logic spread over call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Boot,
    Init,
    Conf,
    Start,
    Pause,
    Resume,
    Stop,
    Scrap,
    Terminate,
}

impl CommandKind {
    pub const fn transition(self) -> Transition {
        match self {
            Self::Boot | Self::Init => Transition::new(FsmState::None, FsmState::Initial),
            Self::Conf => Transition::new(FsmState::Initial, FsmState::Configured),
            Self::Start => Transition::new(FsmState::Configured, FsmState::Running),
            Self::Pause | Self::Resume => Transition::new(FsmState::Running, FsmState::Running),
            Self::Stop => Transition::new(FsmState::Running, FsmState::Configured),
            Self::Scrap => Transition::new(FsmState::Configured, FsmState::Initial),
            Self::Terminate => Transition::new(FsmState::Initial, FsmState::None),
        }
    }

    /// Boot and terminate are handled by the process manager (spawn/kill plus
    /// a liveness check), not by a command/reply round trip.
    pub const fn via_process_manager(self) -> bool {
        matches!(self, Self::Boot | Self::Terminate)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Boot => "boot",
            Self::Init => "init",
            Self::Conf => "conf",
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Stop => "stop",
            Self::Scrap => "scrap",
            Self::Terminate => "terminate",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Addressing metadata for one controlled application. Owned by the process
/// manager; supervisors only hold shared references to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppDescriptor {
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl AppDescriptor {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table_matches_lifecycle() {
        let cases = [
            (CommandKind::Boot, FsmState::None, FsmState::Initial),
            (CommandKind::Init, FsmState::None, FsmState::Initial),
            (CommandKind::Conf, FsmState::Initial, FsmState::Configured),
            (CommandKind::Start, FsmState::Configured, FsmState::Running),
            (CommandKind::Pause, FsmState::Running, FsmState::Running),
            (CommandKind::Resume, FsmState::Running, FsmState::Running),
            (CommandKind::Stop, FsmState::Running, FsmState::Configured),
            (CommandKind::Scrap, FsmState::Configured, FsmState::Initial),
            (CommandKind::Terminate, FsmState::Initial, FsmState::None),
        ];
        for (kind, entry, exit) in cases {
            let transition = kind.transition();
            assert_eq!(transition.entry, entry, "entry state for {kind}");
            assert_eq!(transition.exit, exit, "exit state for {kind}");
        }
    }

    #[test]
    fn only_boot_and_terminate_go_through_the_process_manager() {
        assert!(CommandKind::Boot.via_process_manager());
        assert!(CommandKind::Terminate.via_process_manager());
        assert!(!CommandKind::Init.via_process_manager());
        assert!(!CommandKind::Stop.via_process_manager());
    }

    #[test]
    fn wildcard_accepts_every_state() {
        for state in [
            FsmState::None,
            FsmState::Initial,
            FsmState::Configured,
            FsmState::Running,
        ] {
            assert!(StateMatch::Any.accepts(state));
        }
        assert!(StateMatch::State(FsmState::Running).accepts(FsmState::Running));
        assert!(!StateMatch::State(FsmState::Running).accepts(FsmState::Initial));
    }

    #[test]
    fn state_match_parses_wire_literals() {
        assert_eq!("ANY".parse::<StateMatch>().expect("any"), StateMatch::Any);
        assert_eq!(
            "CONFIGURED".parse::<StateMatch>().expect("configured"),
            StateMatch::State(FsmState::Configured)
        );
        assert!("configured".parse::<StateMatch>().is_err());
    }
}
