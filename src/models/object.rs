// Domain objects that workflows act on
// Capability traits replace reflective field lookup for selector matching

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Objects that carry tag assignments
pub trait HasTags {
    fn tag_ids(&self) -> Vec<String>;
}

/// Objects that belong to groups
pub trait HasGroups {
    fn group_ids(&self) -> Vec<String>;
}

/// The view of a domain object the engine needs
///
/// Selector matching asks for capabilities through `as_tagged` / `as_grouped`
/// rather than looking fields up by name. An object type without tags simply
/// returns `None` and fails any tag selector.
pub trait DomainObject: Send + Sync {
    fn id(&self) -> &str;
    fn object_type(&self) -> &str;

    /// JSON representation exposed to expressions as `object`
    fn to_value(&self) -> Value;

    fn as_tagged(&self) -> Option<&dyn HasTags> {
        None
    }

    fn as_grouped(&self) -> Option<&dyn HasGroups> {
        None
    }
}

/// A generic domain object stored as a JSON field map
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowObject {
    pub id: String,
    pub object_type: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    /// `None` means the object type has no tag capability at all
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    /// `None` means the object type has no group capability at all
    #[serde(default)]
    pub groups: Option<Vec<String>>,
}

impl WorkflowObject {
    pub fn new(object_type: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            object_type: object_type.into(),
            data,
            tags: None,
            groups: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = Some(tags);
        self
    }

    pub fn with_groups(mut self, groups: Vec<String>) -> Self {
        self.groups = Some(groups);
        self
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }

    /// Overwrite fields with the given values
    pub fn apply_changes(&mut self, changes: &Map<String, Value>) {
        for (field, value) in changes {
            self.data.insert(field.clone(), value.clone());
        }
    }
}

impl HasTags for WorkflowObject {
    fn tag_ids(&self) -> Vec<String> {
        self.tags.clone().unwrap_or_default()
    }
}

impl HasGroups for WorkflowObject {
    fn group_ids(&self) -> Vec<String> {
        self.groups.clone().unwrap_or_default()
    }
}

impl DomainObject for WorkflowObject {
    fn id(&self) -> &str {
        &self.id
    }

    fn object_type(&self) -> &str {
        &self.object_type
    }

    fn to_value(&self) -> Value {
        let mut map = self.data.clone();
        map.insert("id".to_string(), Value::String(self.id.clone()));
        if let Some(tags) = &self.tags {
            map.insert("tags".to_string(), Value::from(tags.clone()));
        }
        Value::Object(map)
    }

    fn as_tagged(&self) -> Option<&dyn HasTags> {
        self.tags.as_ref().map(|_| self as &dyn HasTags)
    }

    fn as_grouped(&self) -> Option<&dyn HasGroups> {
        self.groups.as_ref().map(|_| self as &dyn HasGroups)
    }
}

/// Link between a workflow instance and the concrete object it runs against
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObjectRef {
    pub id: String,
    pub org_id: String,
    pub instance_id: String,
    pub object_id: String,
    pub object_type: String,
    pub created_at: DateTime<Utc>,
}

impl ObjectRef {
    pub fn new(org_id: &str, instance_id: &str, object: &dyn DomainObject) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            org_id: org_id.to_string(),
            instance_id: instance_id.to_string(),
            object_id: object.id().to_string(),
            object_type: object.object_type().to_string(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn create_test_object() -> WorkflowObject {
        let data = json!({ "status": "draft", "title": "Policy" });
        WorkflowObject::new("Policy", data.as_object().cloned().unwrap()).with_id("pol-1")
    }

    #[test]
    fn test_capabilities_follow_optional_fields() {
        let object = create_test_object();
        assert!(object.as_tagged().is_none());
        assert!(object.as_grouped().is_none());

        let tagged = object.with_tags(vec!["tag-1".into()]);
        assert_eq!(tagged.as_tagged().unwrap().tag_ids(), vec!["tag-1".to_string()]);
    }

    #[test]
    fn test_to_value_includes_id() {
        let value = create_test_object().to_value();
        assert_eq!(value["id"], "pol-1");
        assert_eq!(value["status"], "draft");
    }

    #[test]
    fn test_apply_changes() {
        let mut object = create_test_object();
        let changes = json!({ "status": "approved" }).as_object().cloned().unwrap();
        object.apply_changes(&changes);
        assert_eq!(object.field("status"), Some(&json!("approved")));
        assert_eq!(object.field("title"), Some(&json!("Policy")));
    }
}
