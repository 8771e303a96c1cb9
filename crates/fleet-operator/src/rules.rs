//! Access to ResourceSyncRule objects
//!
//! Rules marked for deletion are reported as absent: once deletion starts,
//! every cluster should lose the rule's controller, whether the request came
//! from the rule watch or from a cluster joining.

use async_trait::async_trait;
use fleet_common::crd::ResourceSyncRule;
use fleet_common::Result;
use kube::api::ListParams;
use kube::{Api, Client};

#[cfg(test)]
use mockall::automock;

/// Read access to the rule store
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RuleSource: Send + Sync {
    /// Rule with this name, `None` if absent or being deleted
    async fn get(&self, name: &str) -> Result<Option<ResourceSyncRule>>;

    /// Every live rule
    async fn list(&self) -> Result<Vec<ResourceSyncRule>>;
}

/// Rule store backed by the control-plane API server
pub struct KubeRuleSource {
    api: Api<ResourceSyncRule>,
}

impl KubeRuleSource {
    /// Read cluster-scoped rules through `client`
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

fn is_live(rule: &ResourceSyncRule) -> bool {
    rule.metadata.deletion_timestamp.is_none()
}

#[async_trait]
impl RuleSource for KubeRuleSource {
    async fn get(&self, name: &str) -> Result<Option<ResourceSyncRule>> {
        Ok(self.api.get_opt(name).await?.filter(is_live))
    }

    async fn list(&self) -> Result<Vec<ResourceSyncRule>> {
        let rules = self.api.list(&ListParams::default()).await?;
        Ok(rules.items.into_iter().filter(is_live).collect())
    }
}
