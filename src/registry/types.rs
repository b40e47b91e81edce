//! Registry wire types.

use crate::node::NodeRecord;
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// What a node must rebuild before carrying on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BootstrapType {
    Provider,
    Pipe,
    PipeAndProvider,
    /// Pipe reset, restarted only after the bootstrap wait.
    PipeWithDelay,
    PipeAndProviderWithDelay,
    /// Wipe local corruption, then rebuild pipe and provider.
    CorruptionRecovery,
    None,
}

impl BootstrapType {
    pub fn resets_pipe(&self) -> bool {
        matches!(
            self,
            Self::Pipe
                | Self::PipeAndProvider
                | Self::PipeWithDelay
                | Self::PipeAndProviderWithDelay
                | Self::CorruptionRecovery
        )
    }

    pub fn resets_provider(&self) -> bool {
        matches!(
            self,
            Self::Provider | Self::PipeAndProvider | Self::PipeAndProviderWithDelay | Self::CorruptionRecovery
        )
    }

    pub fn is_delayed(&self) -> bool {
        matches!(self, Self::PipeWithDelay | Self::PipeAndProviderWithDelay)
    }
}

impl fmt::Display for BootstrapType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Provider => "PROVIDER",
            Self::Pipe => "PIPE",
            Self::PipeAndProvider => "PIPE_AND_PROVIDER",
            Self::PipeWithDelay => "PIPE_WITH_DELAY",
            Self::PipeAndProviderWithDelay => "PIPE_AND_PROVIDER_WITH_DELAY",
            Self::CorruptionRecovery => "CORRUPTION_RECOVERY",
            Self::None => "NONE",
        };
        f.write_str(name)
    }
}

/// Answer to a registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryResponse {
    /// Chain to follow, ending at the cloud.
    pub requested_to_follow: Vec<Url>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_type: Option<BootstrapType>,
}

impl RegistryResponse {
    pub fn new(requested_to_follow: Vec<Url>) -> Self {
        Self {
            requested_to_follow,
            bootstrap_type: None,
        }
    }

    pub fn with_bootstrap(mut self, bootstrap: Option<BootstrapType>) -> Self {
        self.bootstrap_type = bootstrap;
        self
    }
}

/// Fleet snapshot: the cloud as root, every registered node beneath it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSummary {
    pub root: NodeRecord,
    pub followers: Vec<NodeRecord>,
}
