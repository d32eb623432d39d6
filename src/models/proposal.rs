// Workflow proposals
// Staged changes awaiting approval, keyed by approval domain

//! # Proposals and Approval Domains
//!
//! A proposal holds field changes that must not reach the live object until an
//! approval quorum is reached. Each approval action covers a set of fields; the
//! normalized, comma-joined set is the proposal's **domain key**. Independent
//! domains on the same object get independent proposals, while two mutations on
//! the same domain share one.
//!
//! The **proposal hash** is a SHA-256 over the canonical JSON of the changes.
//! Assignments remember the hash they approved; a changed hash later means the
//! approval no longer applies.
//!
//! ## Rust Learning Notes:
//!
//! `serde_json::Map` is a `BTreeMap` by default but becomes insertion-ordered when
//! any crate in the build enables `preserve_order`. [`canonical_json`] rebuilds
//! every object with sorted keys so the hash never depends on that feature.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProposalState {
    Draft,
    Submitted,
    Applied,
    Rejected,
    Superseded,
}

impl ProposalState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProposalState::Applied | ProposalState::Rejected | ProposalState::Superseded
        )
    }

    pub fn non_terminal() -> [ProposalState; 2] {
        [ProposalState::Draft, ProposalState::Submitted]
    }
}

/// Changes pending approval for one (object, domain)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowProposal {
    pub id: String,
    pub org_id: String,
    pub object_id: String,
    pub object_type: String,
    pub domain_key: String,
    pub state: ProposalState,
    pub changes: Map<String, Value>,
    pub proposed_hash: String,
    #[serde(default)]
    pub approved_hash: Option<String>,
    /// Bumped every time the changes are edited
    pub revision: i64,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub submitted_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowProposal {
    /// Create a draft proposal with its content hash
    pub fn new(
        org_id: &str,
        object_id: &str,
        object_type: &str,
        domain_key: &str,
        changes: Map<String, Value>,
    ) -> Result<Self> {
        let now = Utc::now();
        let proposed_hash = compute_proposal_hash(&changes)?;
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            org_id: org_id.to_string(),
            object_id: object_id.to_string(),
            object_type: object_type.to_string(),
            domain_key: domain_key.to_string(),
            state: ProposalState::Draft,
            changes,
            proposed_hash,
            approved_hash: None,
            revision: 1,
            submitted_at: None,
            submitted_by: None,
            created_at: now,
            updated_at: now,
        })
    }
}

/// Trim, drop empties, sort and dedupe a field list
pub fn normalize_fields(fields: &[String]) -> Vec<String> {
    fields
        .iter()
        .map(|f| f.trim())
        .filter(|f| !f.is_empty())
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Stable identifier for a set of gated fields
pub fn domain_key(fields: &[String]) -> String {
    normalize_fields(fields).join(",")
}

/// Copy of `value` with every object's keys in sorted order
pub fn canonical_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            Value::Object(
                keys.into_iter()
                    .map(|k| (k.clone(), canonical_json(&map[k])))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical_json).collect()),
        other => other.clone(),
    }
}

/// Hex SHA-256 of the canonical JSON encoding of the changes
pub fn compute_proposal_hash(changes: &Map<String, Value>) -> Result<String> {
    let encoded = serde_json::to_vec(&canonical_json(&Value::Object(changes.clone())))?;
    Ok(hex::encode(Sha256::digest(&encoded)))
}

/// Subset of `changes` that touches the given fields
pub fn filter_changes_for_domain(changes: &Map<String, Value>, fields: &[String]) -> Map<String, Value> {
    if changes.is_empty() {
        return Map::new();
    }
    normalize_fields(fields)
        .into_iter()
        .filter_map(|field| changes.get(&field).map(|value| (field, value.clone())))
        .collect()
}

/// Changes that fall into one approval domain
#[derive(Debug, Clone, PartialEq)]
pub struct DomainChanges {
    pub domain_key: String,
    pub fields: Vec<String>,
    pub changes: Map<String, Value>,
}

/// Split changes across domains, keeping domain order and skipping untouched domains
pub fn split_changes_by_domains(changes: &Map<String, Value>, domains: &[Vec<String>]) -> Vec<DomainChanges> {
    domains
        .iter()
        .filter_map(|domain| {
            let fields = normalize_fields(domain);
            let scoped = filter_changes_for_domain(changes, &fields);
            if scoped.is_empty() {
                None
            } else {
                Some(DomainChanges {
                    domain_key: fields.join(","),
                    fields,
                    changes: scoped,
                })
            }
        })
        .collect()
}

/// Domain changes for a definition's approval domains
///
/// A definition without approval domains treats every changed key as one domain.
pub fn domain_changes_for_domains(changes: &Map<String, Value>, domains: &[Vec<String>]) -> Vec<DomainChanges> {
    if changes.is_empty() {
        return Vec::new();
    }
    if domains.is_empty() {
        let fields: Vec<String> = normalize_fields(&changes.keys().cloned().collect::<Vec<_>>());
        return vec![DomainChanges {
            domain_key: fields.join(","),
            fields,
            changes: changes.clone(),
        }];
    }
    split_changes_by_domains(changes, domains)
}
