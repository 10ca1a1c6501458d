//! Immutable process graph: activities (nodes) and transitions (edges).
//!
//! Graphs are consumed pre-built from an external provider; this module only
//! defines their shape and id-based lookups. Activity behavior is a closed
//! tagged enum dispatched by the interpreter, not a class hierarchy.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ActivityKind
// ---------------------------------------------------------------------------

/// The behavior tag of an activity node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActivityKind {
    /// Invoke a registered delegate handler by key.
    Task {
        handler: String,
        /// When true the task runs on a job-executor worker via a persisted
        /// async-continuation job instead of inline in the caller's unit of
        /// work.
        #[serde(default)]
        asynchronous: bool,
    },
    /// Spawn one concurrent child per outgoing transition.
    ParallelFork,
    /// Recombine the concurrent children of the enclosing scope.
    ParallelJoin,
    /// Wait state: the execution parks here until the event fires.
    Event { event: EventKind },
    /// Nested scope running its own activity graph fragment.
    SubProcess { start_activity: String },
    /// Terminates this path of control.
    End,
}

/// What an event activity waits for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// An external signal delivered by name or execution id.
    Signal { name: String },
    /// A durable timer job firing `delay_secs` after arrival.
    Timer { delay_secs: u64 },
}

// ---------------------------------------------------------------------------
// Activity / Transition
// ---------------------------------------------------------------------------

/// A node of the process graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    /// Unique within the definition (e.g. "approve-order").
    pub id: String,
    /// Human-readable name.
    pub name: String,
    pub kind: ActivityKind,
    /// Outgoing transition ids in document order.
    #[serde(default)]
    pub outgoing: Vec<String>,
    /// Error-boundary redirect: when a delegate raises a business error the
    /// interpreter takes this transition instead of propagating.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_transition: Option<String>,
}

/// An edge of the process graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub id: String,
    pub source: String,
    pub target: String,
    /// Optional guard expression; the transition is only taken when it
    /// evaluates to true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<String>,
}

// ---------------------------------------------------------------------------
// ProcessDefinition
// ---------------------------------------------------------------------------

/// An immutable, fully-resolved process graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    /// Stable lookup key (e.g. "order-fulfilment").
    pub key: String,
    pub name: String,
    /// Activity the root execution starts at.
    pub initial_activity: String,
    pub activities: HashMap<String, Activity>,
    pub transitions: HashMap<String, Transition>,
}

impl ProcessDefinition {
    pub fn activity(&self, id: &str) -> Option<&Activity> {
        self.activities.get(id)
    }

    pub fn transition(&self, id: &str) -> Option<&Transition> {
        self.transitions.get(id)
    }
}

// ---------------------------------------------------------------------------
// ProcessDefinitionBuilder
// ---------------------------------------------------------------------------

/// Convenience builder for assembling definitions in code (used heavily by
/// tests; real deployments feed pre-parsed graphs through the provider).
pub struct ProcessDefinitionBuilder {
    key: String,
    name: String,
    initial_activity: Option<String>,
    activities: HashMap<String, Activity>,
    transitions: HashMap<String, Transition>,
}

impl ProcessDefinitionBuilder {
    pub fn new(key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            name: key.clone(),
            key,
            initial_activity: None,
            activities: HashMap::new(),
            transitions: HashMap::new(),
        }
    }

    /// Add an activity. The first activity added becomes the initial one
    /// unless `initial` is called.
    pub fn activity(mut self, id: impl Into<String>, kind: ActivityKind) -> Self {
        let id = id.into();
        if self.initial_activity.is_none() {
            self.initial_activity = Some(id.clone());
        }
        self.activities.insert(
            id.clone(),
            Activity {
                name: id.clone(),
                id,
                kind,
                outgoing: Vec::new(),
                error_transition: None,
            },
        );
        self
    }

    /// Override the initial activity.
    pub fn initial(mut self, id: impl Into<String>) -> Self {
        self.initial_activity = Some(id.into());
        self
    }

    /// Add a transition and register it on its source activity's outgoing
    /// list in call order.
    pub fn transition(
        mut self,
        id: impl Into<String>,
        source: &str,
        target: &str,
        guard: Option<&str>,
    ) -> Self {
        let id = id.into();
        self.transitions.insert(
            id.clone(),
            Transition {
                id: id.clone(),
                source: source.to_string(),
                target: target.to_string(),
                guard: guard.map(str::to_string),
            },
        );
        if let Some(activity) = self.activities.get_mut(source) {
            activity.outgoing.push(id);
        }
        self
    }

    /// Declare an error-boundary transition on `activity_id`.
    pub fn error_transition(
        mut self,
        activity_id: &str,
        transition_id: impl Into<String>,
        target: &str,
    ) -> Self {
        let transition_id = transition_id.into();
        self.transitions.insert(
            transition_id.clone(),
            Transition {
                id: transition_id.clone(),
                source: activity_id.to_string(),
                target: target.to_string(),
                guard: None,
            },
        );
        if let Some(activity) = self.activities.get_mut(activity_id) {
            activity.error_transition = Some(transition_id);
        }
        self
    }

    pub fn build(self) -> ProcessDefinition {
        ProcessDefinition {
            key: self.key,
            name: self.name,
            initial_activity: self.initial_activity.unwrap_or_default(),
            activities: self.activities,
            transitions: self.transitions,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_wires_outgoing_in_call_order() {
        let def = ProcessDefinitionBuilder::new("p")
            .activity("start", ActivityKind::Task {
                handler: "noop".to_string(),
                asynchronous: false,
            })
            .activity("end", ActivityKind::End)
            .transition("t1", "start", "end", None)
            .transition("t2", "start", "end", Some("amount > 100"))
            .build();

        assert_eq!(def.initial_activity, "start");
        let start = def.activity("start").unwrap();
        assert_eq!(start.outgoing, vec!["t1", "t2"]);
        assert_eq!(
            def.transition("t2").unwrap().guard.as_deref(),
            Some("amount > 100")
        );
    }

    #[test]
    fn builder_registers_error_boundary() {
        let def = ProcessDefinitionBuilder::new("p")
            .activity("work", ActivityKind::Task {
                handler: "risky".to_string(),
                asynchronous: false,
            })
            .activity("compensate", ActivityKind::End)
            .error_transition("work", "on-error", "compensate")
            .build();

        let work = def.activity("work").unwrap();
        assert_eq!(work.error_transition.as_deref(), Some("on-error"));
        assert_eq!(def.transition("on-error").unwrap().target, "compensate");
    }

    #[test]
    fn activity_kind_serde_is_snake_case_tagged() {
        let kind = ActivityKind::Event {
            event: EventKind::Signal {
                name: "go".to_string(),
            },
        };
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["type"], "event");
        assert_eq!(json["event"]["type"], "signal");

        let back: ActivityKind = serde_json::from_value(json).unwrap();
        assert_eq!(back, kind);
    }
}
