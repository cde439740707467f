//! Kubeless CRD Definitions
//!
//! The single custom resource tracked by the function controller, plus the
//! list envelope the API server returns when listing it.

pub mod function;

pub use function::*;
pub use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
