//! Network artifact loading.

use std::path::Path;
use std::str::FromStr;

use ethers::types::Address;
use eyre::{bail, Result, WrapErr};
use serde::Deserialize;

/// Deployment description for one network: where the keep factory lives and
/// how to reach a node. Produced by the contract deployment tooling; fields
/// this client does not use are ignored on purpose, so one artifact can
/// serve other tools too.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkArtifact {
    pub chain_id: u64,
    #[serde(default)]
    pub rpc: Option<String>,
    /// Indirection for the RPC URL: the name of an environment variable to
    /// read it from, so artifacts can be committed without provider
    /// credentials in them.
    #[serde(default)]
    pub rpc_env_var: Option<String>,
    pub keep_factory: String,
    pub start_block: u64,
    #[serde(default)]
    pub sanctioned_applications: Vec<String>,
}

impl NetworkArtifact {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("cannot read network artifact {}", path.display()))?;
        let artifact: NetworkArtifact = serde_json::from_str(&raw)
            .wrap_err_with(|| format!("network artifact {} is not valid", path.display()))?;
        artifact.check()?;
        Ok(artifact)
    }

    fn check(&self) -> Result<()> {
        if self.keep_factory.trim().is_empty() {
            bail!("network artifact has no keepFactory address");
        }
        if self.start_block == 0 {
            tracing::warn!(
                "startBlock 0 in the network artifact means every log scan walks the whole chain"
            );
        }
        Ok(())
    }

    /// Picks the RPC URL. The most specific source wins: an explicit CLI
    /// value, then the `KEEP_CLIENT_RPC_URL` environment variable, then
    /// whatever variable the artifact points at, and last the URL embedded
    /// in the artifact itself.
    pub fn rpc_url(&self, cli_override: Option<String>) -> Result<String> {
        if let Some(url) = cli_override {
            return Ok(url);
        }
        if let Ok(url) = std::env::var("KEEP_CLIENT_RPC_URL") {
            return Ok(url);
        }
        if let Some(variable) = &self.rpc_env_var {
            if let Ok(url) = std::env::var(variable) {
                return Ok(url);
            }
        }
        if let Some(url) = &self.rpc {
            return Ok(url.clone());
        }
        bail!(
            "could not determine an RPC URL; give --rpc-url, export KEEP_CLIENT_RPC_URL, \
             or put rpc/rpcEnvVar into the network artifact"
        );
    }

    pub fn keep_factory_address(&self) -> Result<Address> {
        Address::from_str(&self.keep_factory)
            .wrap_err_with(|| format!("keepFactory '{}' is not an address", self.keep_factory))
    }

    pub fn sanctioned_application_addresses(&self) -> Result<Vec<Address>> {
        self.sanctioned_applications
            .iter()
            .map(|raw| {
                Address::from_str(raw).wrap_err_with(|| {
                    format!("sanctioned application '{raw}' is not an address")
                })
            })
            .collect()
    }
}
