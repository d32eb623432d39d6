// Caller identity
// Organization and user scoping for every engine operation

use serde::{Deserialize, Serialize};

use crate::{Result, WorkflowError};

/// The identity an operation runs as
///
/// Every engine entry point takes a `CallerContext`. The organization id scopes all
/// storage reads and writes; the user id is recorded as the actor. `bypass` marks
/// privileged internal writes (applying approved proposals, field-update actions)
/// that skip workflow gating on the live object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerContext {
    org_id: Option<String>,
    user_id: Option<String>,
    #[serde(default)]
    bypass: bool,
}

impl CallerContext {
    pub fn new(org_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            org_id: Some(org_id.into()),
            user_id: Some(user_id.into()),
            bypass: false,
        }
    }

    /// Internal identity used by background handlers and the reconciler
    pub fn system(org_id: impl Into<String>) -> Self {
        Self {
            org_id: Some(org_id.into()),
            user_id: None,
            bypass: true,
        }
    }

    /// An identity with nothing set, mostly useful to exercise the error paths
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn org_id(&self) -> Result<&str> {
        self.org_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or(WorkflowError::MissingOrganization)
    }

    pub fn user_id(&self) -> Result<&str> {
        self.user_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or(WorkflowError::MissingUser)
    }

    /// The acting user if there is one
    pub fn user_id_opt(&self) -> Option<&str> {
        self.user_id.as_deref().filter(|id| !id.is_empty())
    }

    pub fn is_bypass(&self) -> bool {
        self.bypass
    }

    /// Same identity with workflow gating bypassed
    pub fn with_bypass(&self) -> Self {
        Self {
            bypass: true,
            ..self.clone()
        }
    }

    /// Same organization acting as another user
    pub fn as_user(&self, user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_identity_is_an_error() {
        let caller = CallerContext::anonymous();
        assert!(matches!(caller.org_id(), Err(WorkflowError::MissingOrganization)));
        assert!(matches!(caller.user_id(), Err(WorkflowError::MissingUser)));
    }

    #[test]
    fn test_system_context_bypasses() {
        let caller = CallerContext::system("org-1");
        assert_eq!(caller.org_id().unwrap(), "org-1");
        assert!(caller.user_id_opt().is_none());
        assert!(caller.is_bypass());
    }

    #[test]
    fn test_with_bypass_keeps_identity() {
        let caller = CallerContext::new("org-1", "alice").with_bypass();
        assert_eq!(caller.user_id().unwrap(), "alice");
        assert!(caller.is_bypass());
        assert_eq!(caller.as_user("bob").user_id().unwrap(), "bob");
    }
}
