//! Scheduler extender wire types
//!
//! JSON shapes exchanged with kube-scheduler's HTTP extender `filter` verb.
//! Only the fields the admission gate needs are modelled; candidate nodes
//! are echoed back untouched when a pod is admitted.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Node, Pod};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};

use super::gate::AdmissionDecision;

/// Candidate nodes sent in full when the extender is not node-cache capable
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct NodeItems {
    #[serde(default)]
    pub items: Vec<Node>,
}

/// Request body of the `filter` verb
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ExtenderArgs {
    pub pod: Pod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<NodeItems>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodenames: Option<Vec<String>>,
}

impl ExtenderArgs {
    /// Names of every candidate node, whichever form the scheduler sent
    pub fn candidate_names(&self) -> Vec<String> {
        match (&self.nodenames, &self.nodes) {
            (Some(names), _) => names.clone(),
            (None, Some(nodes)) => nodes.items.iter().map(|n| n.name_any()).collect(),
            (None, None) => Vec::new(),
        }
    }
}

/// Response body of the `filter` verb
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExtenderFilterResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<NodeItems>,
    #[serde(
        default,
        rename = "nodenames",
        skip_serializing_if = "Option::is_none"
    )]
    pub node_names: Option<Vec<String>>,
    /// Nodes that failed and may become feasible through preemption
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub failed_nodes: BTreeMap<String, String>,
    /// Nodes that failed and preemption cannot fix
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub failed_and_unresolvable_nodes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl ExtenderFilterResult {
    /// Translate an admission decision into a filter answer.
    ///
    /// Admission passes every candidate through unchanged. A rejection marks
    /// every candidate unresolvable so the scheduler does not try to preempt
    /// other pods to make room.
    pub fn from_decision(args: &ExtenderArgs, decision: &AdmissionDecision) -> Self {
        match decision {
            AdmissionDecision::Admit => Self {
                nodes: args.nodes.clone(),
                node_names: args.nodenames.clone(),
                ..Default::default()
            },
            AdmissionDecision::RejectNoPreempt(reason) => Self {
                nodes: args.nodes.as_ref().map(|_| NodeItems::default()),
                node_names: args.nodenames.as_ref().map(|_| Vec::new()),
                failed_and_unresolvable_nodes: args
                    .candidate_names()
                    .into_iter()
                    .map(|name| (name, reason.clone()))
                    .collect(),
                ..Default::default()
            },
        }
    }

    /// A request the extender could not evaluate
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn args(value: serde_json::Value) -> ExtenderArgs {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_parses_node_cache_capable_request() {
        let args = args(json!({
            "pod": {
                "metadata": { "name": "render-0", "namespace": "batch" },
                "spec": { "containers": [], "priority": 40 }
            },
            "nodenames": ["n1", "n2"]
        }));

        assert_eq!(args.pod.spec.as_ref().and_then(|s| s.priority), Some(40));
        assert_eq!(args.candidate_names(), vec!["n1", "n2"]);
    }

    #[test]
    fn test_candidate_names_from_full_nodes() {
        let args = args(json!({
            "pod": { "metadata": { "name": "p" } },
            "nodes": { "items": [
                { "metadata": { "name": "n1" } },
                { "metadata": { "name": "n2" } }
            ]}
        }));

        assert_eq!(args.candidate_names(), vec!["n1", "n2"]);
    }

    #[test]
    fn test_rejection_marks_every_node_unresolvable() {
        let args = args(json!({
            "pod": { "metadata": { "name": "p" } },
            "nodenames": ["n1", "n2"]
        }));
        let decision = AdmissionDecision::RejectNoPreempt("priority 40 is below carbon index 80".into());

        let result = ExtenderFilterResult::from_decision(&args, &decision);
        let body = serde_json::to_value(&result).unwrap();

        assert_eq!(body["nodenames"], json!([]));
        assert_eq!(
            body["failedAndUnresolvableNodes"]["n1"],
            "priority 40 is below carbon index 80"
        );
        assert!(body.get("failedNodes").is_none());
        assert!(body.get("error").is_none());
    }

    #[test]
    fn test_admission_passes_candidates_through() {
        let args = args(json!({
            "pod": { "metadata": { "name": "p" } },
            "nodenames": ["n1"]
        }));

        let result = ExtenderFilterResult::from_decision(&args, &AdmissionDecision::Admit);

        assert_eq!(result.node_names, Some(vec!["n1".to_string()]));
        assert!(result.failed_and_unresolvable_nodes.is_empty());
    }

    #[test]
    fn test_error_result_serializes_message() {
        let body = serde_json::to_value(ExtenderFilterResult::error("bad pod")).unwrap();
        assert_eq!(body, json!({ "error": "bad pod" }));
    }
}
