//! Process checks
//!
//! Chrome-side message managers may ask the process behind their transport
//! whether it holds a permission, contains an app, or has an app status. The
//! checks themselves belong to the embedder; this module only defines the
//! seam and two simple implementations.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Installation status of an app
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppStatus {
    NotInstalled,
    Installed,
    Privileged,
    Certified,
}

/// Answers capability questions about the process behind a transport
pub trait ProcessChecker: Send + Sync {
    fn check_permission(&self, permission: &str) -> bool;
    fn check_manifest_url(&self, manifest_url: &str) -> bool;
    fn check_app_has_permission(&self, permission: &str) -> bool;
    fn check_app_has_status(&self, status: AppStatus) -> bool;
}

/// Every check passes (same-process transports)
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAllChecker;

impl ProcessChecker for AllowAllChecker {
    fn check_permission(&self, _permission: &str) -> bool {
        true
    }

    fn check_manifest_url(&self, _manifest_url: &str) -> bool {
        true
    }

    fn check_app_has_permission(&self, _permission: &str) -> bool {
        true
    }

    fn check_app_has_status(&self, _status: AppStatus) -> bool {
        true
    }
}

/// Checker backed by explicit grants
#[derive(Debug, Default, Clone)]
pub struct GrantedProcessChecker {
    permissions: HashSet<String>,
    manifests: HashSet<String>,
    app_permissions: HashSet<String>,
    app_status: Option<AppStatus>,
}

impl GrantedProcessChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant_permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.insert(permission.into());
        self
    }

    pub fn contain_app(mut self, manifest_url: impl Into<String>) -> Self {
        self.manifests.insert(manifest_url.into());
        self
    }

    pub fn grant_app_permission(mut self, permission: impl Into<String>) -> Self {
        self.app_permissions.insert(permission.into());
        self
    }

    pub fn with_app_status(mut self, status: AppStatus) -> Self {
        self.app_status = Some(status);
        self
    }
}

impl ProcessChecker for GrantedProcessChecker {
    fn check_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }

    fn check_manifest_url(&self, manifest_url: &str) -> bool {
        self.manifests.contains(manifest_url)
    }

    fn check_app_has_permission(&self, permission: &str) -> bool {
        self.app_permissions.contains(permission)
    }

    fn check_app_has_status(&self, status: AppStatus) -> bool {
        self.app_status == Some(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_granted_checker() {
        let checker = GrantedProcessChecker::new()
            .grant_permission("camera")
            .contain_app("app://mail/manifest.webapp")
            .with_app_status(AppStatus::Privileged);

        assert!(checker.check_permission("camera"));
        assert!(!checker.check_permission("geolocation"));
        assert!(checker.check_manifest_url("app://mail/manifest.webapp"));
        assert!(!checker.check_app_has_permission("camera"));
        assert!(checker.check_app_has_status(AppStatus::Privileged));
        assert!(!checker.check_app_has_status(AppStatus::Certified));
    }
}
