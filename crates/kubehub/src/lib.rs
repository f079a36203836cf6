//! Intent kubehub: cluster wiring for IntentDeployment (store, watch, CRD export)

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use intent_core::IntentDeployment;
use kube::{Client, CustomResourceExt};

mod store;

pub use store::KubeStore;

/// Client from the ambient kubeconfig or in-cluster service account.
pub async fn client() -> Result<Client> {
    Client::try_default().await.context("building kube client")
}

/// CustomResourceDefinition for IntentDeployment as YAML.
pub fn crd_yaml() -> Result<String> {
    serde_yaml::to_string(&IntentDeployment::crd()).context("serializing CRD")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crd_yaml_names_group_and_status_subresource() {
        let y = crd_yaml().unwrap();
        assert!(y.contains("name: intentdeployments.tna.tna.ai"));
        assert!(y.contains("shortNames"));
        assert!(y.contains("status: {}"));
    }
}
