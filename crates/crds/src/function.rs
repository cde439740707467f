//! Function CRD
//!
//! A serverless function managed by the controller. The controller treats the
//! spec as an opaque payload handed to the worker runtime.

use std::collections::BTreeMap;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ListMeta;
use kube::{CustomResource, CustomResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Human readable description attached to the registered resource type.
pub const FUNCTION_DESCRIPTION: &str = "Kubeless: Manage serverless functions in Kubernetes";

/// Annotation carrying [`FUNCTION_DESCRIPTION`] on the CRD object.
pub const DESCRIPTION_ANNOTATION: &str = "kubeless.io/description";

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "kubeless.io",
    version = "v1",
    kind = "Function",
    plural = "functions",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct FunctionSpec {
    /// Entry point, usually `<file>.<function>`
    #[serde(default)]
    pub handler: String,

    /// Function source code
    #[serde(default)]
    pub function: String,

    /// Language runtime (e.g. `python2.7`, `nodejs6`)
    #[serde(default)]
    pub runtime: String,

    /// Trigger type: `HTTP` or `PubSub`
    #[serde(default, rename = "type")]
    pub trigger_type: String,

    /// Topic to subscribe to for `PubSub` functions
    #[serde(default)]
    pub topic: String,

    /// Dependency manifest for the runtime
    #[serde(default)]
    pub deps: String,
}

/// List envelope returned by `GET .../functions`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FunctionList {
    /// List metadata; `resource_version` is the watch cursor for the list
    #[serde(default)]
    pub metadata: ListMeta,

    /// Functions present at the time of the list
    #[serde(default)]
    pub items: Vec<Function>,
}

/// Builds the CRD registered at controller startup.
#[must_use]
pub fn function_crd() -> CustomResourceDefinition {
    let mut crd = Function::crd();
    crd.metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(DESCRIPTION_ANNOTATION.to_string(), FUNCTION_DESCRIPTION.to_string());
    crd
}
