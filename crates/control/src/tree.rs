use std::{collections::HashSet, sync::Arc, time::Duration};

use futures::future::join_all;
use listener::ResponseListener;
use serde::Serialize;
use serde_json::{Map, Value};
use shared::{
    domain::{AppDescriptor, CommandKind, FsmState, StateMatch},
    error::CommandError,
    protocol::CommandReply,
};
use supervisor::AppSupervisor;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{config::ApparatusConfig, process::ProcessManager};

/// Stable index into the apparatus arena. Parent and child links are ids,
/// never owning handles, so navigation both ways stays cycle-free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Group,
    Application,
}

enum NodeBackend {
    Group,
    Application {
        desc: Arc<AppDescriptor>,
        supervisor: Option<AppSupervisor>,
    },
}

pub struct Node {
    name: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    state: FsmState,
    last_result: Option<String>,
    last_reply: Option<CommandReply>,
    backend: NodeBackend,
}

impl Node {
    fn group(name: String, parent: Option<NodeId>) -> Self {
        Self {
            name,
            parent,
            children: Vec::new(),
            state: FsmState::None,
            last_result: None,
            last_reply: None,
            backend: NodeBackend::Group,
        }
    }

    fn application(name: String, parent: NodeId, desc: Arc<AppDescriptor>) -> Self {
        Self {
            name,
            parent: Some(parent),
            children: Vec::new(),
            state: FsmState::None,
            last_result: None,
            last_reply: None,
            backend: NodeBackend::Application {
                desc,
                supervisor: None,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> FsmState {
        self.state
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn kind(&self) -> NodeKind {
        match self.backend {
            NodeBackend::Group => NodeKind::Group,
            NodeBackend::Application { .. } => NodeKind::Application,
        }
    }

    pub fn last_reply(&self) -> Option<&CommandReply> {
        self.last_reply.as_ref()
    }

    fn descriptor(&self) -> Option<&Arc<AppDescriptor>> {
        match &self.backend {
            NodeBackend::Application { desc, .. } => Some(desc),
            NodeBackend::Group => None,
        }
    }

    fn supervisor_mut(&mut self) -> Option<&mut AppSupervisor> {
        match &mut self.backend {
            NodeBackend::Application { supervisor, .. } => supervisor.as_mut(),
            NodeBackend::Group => None,
        }
    }

    fn attach_supervisor(&mut self, sup: AppSupervisor) {
        if let NodeBackend::Application { supervisor, .. } = &mut self.backend {
            *supervisor = Some(sup);
        }
    }

    fn take_supervisor(&mut self) -> Option<AppSupervisor> {
        match &mut self.backend {
            NodeBackend::Application { supervisor, .. } => supervisor.take(),
            NodeBackend::Group => None,
        }
    }

    async fn collect_reply(&mut self, wait: Duration) -> Result<CommandReply, CommandError> {
        match &mut self.backend {
            NodeBackend::Application {
                supervisor: Some(sup),
                ..
            } => sup.check_response(wait).await,
            _ => Err(CommandError::NoResponse {
                app: self.name.clone(),
                command: "-".to_string(),
            }),
        }
    }
}

#[derive(Debug, Error)]
#[error("unknown node path '{0}'")]
pub struct UnknownPath(pub String);

#[derive(Debug, Error)]
#[error("invalid transition: '{command}' requires entry state {required}; out of step: {offenders:?}")]
pub struct InvalidTransition {
    pub command: CommandKind,
    pub required: FsmState,
    pub offenders: Vec<String>,
}

/// The nodes a single dispatch targets: one subtree, with its application
/// leaves singled out for the network phase.
#[derive(Debug, Clone)]
pub struct Selection {
    nodes: Vec<NodeId>,
    leaves: Vec<NodeId>,
}

impl Selection {
    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandOutcome {
    Success,
    Partial,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transport,
    Timeout,
    Rejected,
    Skipped,
    NotBooted,
    NotAlive,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeFailure {
    pub node: String,
    pub kind: FailureKind,
    pub detail: String,
}

/// Aggregate result of one subtree dispatch. Per-leaf failures never escape
/// past this boundary; callers read one coarse outcome plus the named
/// failures.
#[derive(Debug, Clone, Serialize)]
pub struct BroadcastReport {
    pub command: CommandKind,
    pub ok: Vec<String>,
    pub failed: Vec<NodeFailure>,
}

impl BroadcastReport {
    fn new(command: CommandKind) -> Self {
        Self {
            command,
            ok: Vec::new(),
            failed: Vec::new(),
        }
    }

    pub fn all_ok(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn outcome(&self) -> CommandOutcome {
        if self.failed.is_empty() {
            CommandOutcome::Success
        } else if self.ok.is_empty() {
            CommandOutcome::Failure
        } else {
            CommandOutcome::Partial
        }
    }

    fn fail(&mut self, node: String, kind: FailureKind, detail: impl Into<String>) {
        self.failed.push(NodeFailure {
            node,
            kind,
            detail: detail.into(),
        });
    }
}

/// Serializable snapshot of one node and everything below it.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub name: String,
    pub kind: NodeKind,
    pub state: FsmState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_result: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<NodeStatus>,
}

/// The whole controlled tree, stored as an arena with the apparatus root at
/// index zero. Built once from configuration; only state transitions mutate
/// it afterwards.
pub struct Apparatus {
    id: String,
    nodes: Vec<Node>,
}

impl Apparatus {
    pub fn from_config(config: &ApparatusConfig) -> Self {
        let root = NodeId(0);
        let mut nodes = vec![Node::group(config.apparatus_id.clone(), None)];
        for subsystem in &config.subsystems {
            let group = NodeId(nodes.len());
            nodes.push(Node::group(subsystem.name.clone(), Some(root)));
            nodes[root.0].children.push(group);
            for app in &subsystem.apps {
                let leaf = NodeId(nodes.len());
                let desc = Arc::new(AppDescriptor::new(
                    app.name.clone(),
                    app.host.clone(),
                    app.port,
                ));
                nodes.push(Node::application(app.name.clone(), group, desc));
                nodes[group.0].children.push(leaf);
            }
        }
        Self {
            id: config.apparatus_id.clone(),
            nodes,
        }
    }

    pub fn apparatus_id(&self) -> &str {
        &self.id
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .position(|node| node.name == name)
            .map(NodeId)
    }

    /// Resolves a `/`-separated path to the subtree it names. `None`, the
    /// empty path and the bare apparatus id all select the whole tree; the
    /// apparatus id is also accepted as an optional leading segment.
    pub fn select(&self, path: Option<&str>) -> Result<Selection, UnknownPath> {
        let root = NodeId(0);
        let target = match path {
            None => root,
            Some(raw) => {
                let trimmed = raw.trim().trim_matches('/');
                if trimmed.is_empty() || trimmed == self.id {
                    root
                } else {
                    let mut current = root;
                    let mut segments = trimmed.split('/').peekable();
                    if segments.peek() == Some(&self.id.as_str()) {
                        segments.next();
                    }
                    for segment in segments {
                        current = self.nodes[current.0]
                            .children
                            .iter()
                            .copied()
                            .find(|child| self.nodes[child.0].name == segment)
                            .ok_or_else(|| UnknownPath(raw.to_string()))?;
                    }
                    current
                }
            }
        };
        let (nodes, leaves) = self.collect_subtree(target);
        Ok(Selection { nodes, leaves })
    }

    /// All-or-nothing gate: every targeted node, group or application, must
    /// sit in the command's entry state or the whole dispatch is refused
    /// before any network activity.
    pub fn gate(&self, selection: &Selection, command: CommandKind) -> Result<(), InvalidTransition> {
        let required = command.transition().entry;
        let offenders: Vec<String> = selection
            .nodes
            .iter()
            .filter(|id| self.nodes[id.0].state != required)
            .map(|id| {
                let node = &self.nodes[id.0];
                format!("{} ({})", node.name, node.state)
            })
            .collect();
        if offenders.is_empty() {
            Ok(())
        } else {
            Err(InvalidTransition {
                command,
                required,
                offenders,
            })
        }
    }

    /// Sends `command` to every targeted leaf, then waits for all replies
    /// under one timeout budget shared across the subtree. Sends never wait
    /// for replies, so one slow application cannot serialize the others.
    /// Without `force` a failed send stops the send phase and the remaining
    /// leaves are reported as skipped; with `force` every leaf still receives
    /// the command.
    pub async fn broadcast(
        &mut self,
        selection: &Selection,
        command: CommandKind,
        data: Map<String, Value>,
        wait: Duration,
        force: bool,
    ) -> BroadcastReport {
        let transition = command.transition();
        let entry = StateMatch::State(transition.entry);
        let exit = StateMatch::State(transition.exit);
        let mut report = BroadcastReport::new(command);

        let mut sent: HashSet<NodeId> = HashSet::new();
        let mut skipped_from = None;
        for (pos, &leaf) in selection.leaves.iter().enumerate() {
            let node = &mut self.nodes[leaf.0];
            let name = node.name.clone();
            let Some(sup) = node.supervisor_mut() else {
                report.fail(name, FailureKind::NotBooted, "no supervisor; boot first");
                if !force {
                    skipped_from = Some(pos + 1);
                    break;
                }
                continue;
            };
            match sup.send_command(command, data.clone(), entry, exit).await {
                Ok(()) => {
                    sent.insert(leaf);
                }
                Err(err) => {
                    warn!(node = %name, error = %err, "command send failed");
                    report.fail(name, FailureKind::Transport, err.to_string());
                    if !force {
                        skipped_from = Some(pos + 1);
                        break;
                    }
                }
            }
        }
        if let Some(from) = skipped_from {
            for &leaf in &selection.leaves[from..] {
                report.fail(
                    self.nodes[leaf.0].name.clone(),
                    FailureKind::Skipped,
                    format!("not attempted after an earlier '{command}' failure"),
                );
            }
        }

        let waits = self
            .nodes
            .iter_mut()
            .enumerate()
            .filter(|(index, _)| sent.contains(&NodeId(*index)))
            .map(|(index, node)| async move { (NodeId(index), node.collect_reply(wait).await) });
        let results = join_all(waits).await;

        for (id, outcome) in results {
            let node = &mut self.nodes[id.0];
            match outcome {
                Ok(reply) if reply.is_success() => {
                    node.state = transition.exit;
                    node.last_result = reply.result.clone();
                    node.last_reply = Some(reply);
                    report.ok.push(node.name.clone());
                }
                Ok(reply) => {
                    let detail = reply
                        .result
                        .clone()
                        .unwrap_or_else(|| "reply carried no result".to_string());
                    node.last_result = reply.result.clone();
                    node.last_reply = Some(reply);
                    report.fail(node.name.clone(), FailureKind::Rejected, detail);
                }
                Err(err) => {
                    let kind = if err.is_timeout() {
                        FailureKind::Timeout
                    } else {
                        FailureKind::Transport
                    };
                    node.last_result = Some(format!("{kind:?}").to_lowercase());
                    report.fail(node.name.clone(), kind, err.to_string());
                }
            }
        }

        self.roll_up_groups(selection, transition.exit, &report);
        if report.all_ok() {
            info!(command = %command, leaves = selection.leaves.len(), "broadcast complete");
        } else {
            warn!(command = %command, failed = report.failed.len(), "broadcast finished with failures");
        }
        report
    }

    /// Boot delegates to the process manager's spawn and liveness semantics
    /// instead of a command round trip. Each application that comes up alive
    /// gets its supervisor registered and moves to INITIAL.
    pub async fn boot(
        &mut self,
        selection: &Selection,
        pm: &dyn ProcessManager,
        listener: &Arc<ResponseListener>,
        timeout: Duration,
        answer_host: Option<&str>,
        proxy: Option<&str>,
    ) -> BroadcastReport {
        let mut report = BroadcastReport::new(CommandKind::Boot);
        let descriptors: Vec<Arc<AppDescriptor>> = selection
            .leaves
            .iter()
            .filter_map(|id| self.nodes[id.0].descriptor().cloned())
            .collect();

        if let Err(err) = pm.boot(&descriptors, timeout).await {
            error!(error = %err, "process manager boot failed");
            for &leaf in &selection.leaves {
                report.fail(
                    self.nodes[leaf.0].name.clone(),
                    FailureKind::NotAlive,
                    err.to_string(),
                );
            }
            return report;
        }

        for &leaf in &selection.leaves {
            let name = self.nodes[leaf.0].name.clone();
            if !pm.is_alive(&name).await {
                report.fail(name, FailureKind::NotAlive, "not alive after boot");
                continue;
            }
            let Some(desc) = self.nodes[leaf.0].descriptor().cloned() else {
                continue;
            };
            match AppSupervisor::new(
                desc,
                listener.clone(),
                answer_host.map(str::to_string),
                proxy.map(str::to_string),
            )
            .await
            {
                Ok(sup) => {
                    let node = &mut self.nodes[leaf.0];
                    node.attach_supervisor(sup);
                    node.state = FsmState::Initial;
                    report.ok.push(name);
                }
                Err(err) => {
                    report.fail(name, FailureKind::Transport, err.to_string());
                }
            }
        }

        self.roll_up_groups(selection, FsmState::Initial, &report);
        report
    }

    /// Terminate is the process-manager mirror of boot: kill, confirm the
    /// process is gone, release the listener registration, drop back to NONE.
    pub async fn terminate_apps(
        &mut self,
        selection: &Selection,
        pm: &dyn ProcessManager,
    ) -> BroadcastReport {
        let mut report = BroadcastReport::new(CommandKind::Terminate);
        if let Err(err) = pm.terminate().await {
            error!(error = %err, "process manager terminate failed");
            for &leaf in &selection.leaves {
                report.fail(
                    self.nodes[leaf.0].name.clone(),
                    FailureKind::NotAlive,
                    err.to_string(),
                );
            }
            return report;
        }

        for &leaf in &selection.leaves {
            let name = self.nodes[leaf.0].name.clone();
            if pm.is_alive(&name).await {
                report.fail(name, FailureKind::NotAlive, "still alive after terminate");
                continue;
            }
            if let Some(sup) = self.nodes[leaf.0].take_supervisor() {
                sup.terminate().await;
            }
            self.nodes[leaf.0].state = FsmState::None;
            report.ok.push(name);
        }

        self.roll_up_groups(selection, FsmState::None, &report);
        report
    }

    pub fn status(&self) -> NodeStatus {
        self.node_status(NodeId(0))
    }

    fn node_status(&self, id: NodeId) -> NodeStatus {
        let node = &self.nodes[id.0];
        NodeStatus {
            name: node.name.clone(),
            kind: node.kind(),
            state: node.state,
            last_result: node.last_result.clone(),
            children: node
                .children
                .iter()
                .map(|&child| self.node_status(child))
                .collect(),
        }
    }

    fn collect_subtree(&self, root: NodeId) -> (Vec<NodeId>, Vec<NodeId>) {
        let mut nodes = Vec::new();
        let mut leaves = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            nodes.push(id);
            let node = &self.nodes[id.0];
            match node.backend {
                NodeBackend::Application { .. } => leaves.push(id),
                NodeBackend::Group => {
                    for &child in node.children.iter().rev() {
                        stack.push(child);
                    }
                }
            }
        }
        (nodes, leaves)
    }

    /// A group follows the command only when every application below it
    /// reported success; a partial subtree leaves the group where it was.
    fn roll_up_groups(&mut self, selection: &Selection, exit: FsmState, report: &BroadcastReport) {
        let ok: HashSet<&str> = report.ok.iter().map(String::as_str).collect();
        let mut moves = Vec::new();
        for &id in &selection.nodes {
            if self.nodes[id.0].kind() != NodeKind::Group {
                continue;
            }
            let (_, leaves) = self.collect_subtree(id);
            let all_ok = leaves
                .iter()
                .all(|leaf| ok.contains(self.nodes[leaf.0].name.as_str()));
            if all_ok {
                moves.push(id);
            }
        }
        for id in moves {
            self.nodes[id.0].state = exit;
        }
    }

    #[cfg(test)]
    pub(crate) fn force_states(&mut self, state: FsmState) {
        for node in &mut self.nodes {
            node.state = state;
        }
    }
}

#[cfg(test)]
#[path = "tests/tree_tests.rs"]
mod tests;
