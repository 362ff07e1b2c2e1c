//! The `AdharPlatform` custom resource.
//!
//! One object per cluster describes the desired platform. The controller
//! manager reconciles it and flips `status.repositoriesCreated` once the
//! GitOps repositories are populated, which is the readiness marker the
//! local pipeline waits on.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::{CustomResource, CustomResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::config::GlobalSettings;

/// Namespace holding the platform object.
pub const PLATFORM_NAMESPACE: &str = "adhar-system";

/// Name of the platform object.
pub const PLATFORM_NAME: &str = "adhar";

/// Annotation recording when provisioning started (RFC 3339).
pub const PROVISIONING_STARTED_ANNOTATION: &str = "platform.adhar.io/provisioning-started-at";

/// Desired platform state.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "platform.adhar.io",
    version = "v1alpha1",
    kind = "AdharPlatform",
    plural = "adharplatforms",
    shortname = "ap"
)]
#[kube(namespaced)]
#[kube(status = "AdharPlatformStatus")]
#[kube(printcolumn = r#"{"name":"Domain","type":"string","jsonPath":".spec.domain"}"#)]
#[kube(printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.repositoriesCreated"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct AdharPlatformSpec {
    /// Base domain for ingress hosts.
    pub domain: String,

    /// Host port for HTTP ingress.
    pub http_port: u16,

    /// Host port for HTTPS ingress.
    pub https_port: u16,

    /// Organisation owning the GitOps repositories.
    pub git_organization: String,

    /// Git server admin user.
    pub git_admin_user: String,

    /// Core services to bootstrap, with optional chart versions.
    #[serde(default)]
    pub core_services: BTreeMap<String, Option<String>>,

    /// PEM certificate served by the ingress controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_certificate: Option<String>,
}

impl AdharPlatformSpec {
    /// Spec derived from the global settings.
    #[must_use]
    pub fn from_settings(settings: &GlobalSettings) -> Self {
        Self {
            domain: settings.domain.clone(),
            http_port: settings.http_port,
            https_port: settings.https_port,
            git_organization: settings.git.organization.clone(),
            git_admin_user: settings.git.admin_user.clone(),
            core_services: BTreeMap::new(),
            tls_certificate: None,
        }
    }
}

/// Observed platform state.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AdharPlatformStatus {
    /// GitOps repositories exist and are populated.
    #[serde(default)]
    pub repositories_created: bool,

    /// Current reconcile phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    /// Last reconcile message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// When the platform last reported ready (RFC 3339).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_at: Option<String>,
}

impl AdharPlatform {
    /// Platform object named [`PLATFORM_NAME`] in [`PLATFORM_NAMESPACE`],
    /// stamped with the provisioning start time.
    #[must_use]
    pub fn for_settings(settings: &GlobalSettings, started_at: DateTime<Utc>) -> Self {
        let mut platform = Self::new(PLATFORM_NAME, AdharPlatformSpec::from_settings(settings));
        platform.metadata.namespace = Some(PLATFORM_NAMESPACE.to_string());
        platform.metadata.annotations = Some(BTreeMap::from([(
            PROVISIONING_STARTED_ANNOTATION.to_string(),
            started_at.to_rfc3339(),
        )]));
        platform
    }

    /// Provisioning start time, if annotated.
    #[must_use]
    pub fn provisioning_started_at(&self) -> Option<DateTime<Utc>> {
        self.metadata
            .annotations
            .as_ref()?
            .get(PROVISIONING_STARTED_ANNOTATION)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
    }

    /// Whether the readiness marker is set.
    #[must_use]
    pub fn repositories_created(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.repositories_created)
    }
}

/// CRD manifest as YAML.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn crd_yaml() -> Result<String, serde_yaml::Error> {
    serde_yaml::to_string(&AdharPlatform::crd())
}
