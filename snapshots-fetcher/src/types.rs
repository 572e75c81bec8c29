//! Wire types of the content server protocol.
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu, ensure};

/// A record of one entity having been published on a content server.
///
/// Produced by a remote server and immutable once yielded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteDeployment {
    /// Id of the deployed entity, also the content address of the entity file.
    pub entity_id: String,
    /// Type of the deployed entity.
    pub entity_type: String,
    /// Server-local sequence number of the deployment.
    ///
    /// Monotonic per server, but not unique: several deployments may share a timestamp.
    pub local_timestamp: u64,
    /// Opaque ordered authentication chain.
    pub auth_chain: Vec<serde_json::Value>,
    /// Pointers the deployment was published under.
    #[serde(default)]
    pub pointers: Vec<String>,
}

/// Reasons for which a deployment payload is rejected.
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum InvalidDeployment {
    #[snafu(display("Malformed deployment"))]
    Malformed { source: serde_json::Error },
    #[snafu(display("Deployment has an empty {field}"))]
    EmptyField { field: &'static str },
}

impl RemoteDeployment {
    /// Parses and validates a deployment from a JSON value.
    ///
    /// `entityId` and `entityType` must be non-empty strings, `localTimestamp` a
    /// non-negative integer and `authChain` an array.
    pub fn from_value(value: serde_json::Value) -> Result<Self, InvalidDeployment> {
        let deployment: Self = serde_json::from_value(value).context(MalformedSnafu)?;
        deployment.validate()?;
        Ok(deployment)
    }

    /// Parses and validates a deployment from a single JSON document.
    pub fn from_json(json: &str) -> Result<Self, InvalidDeployment> {
        let deployment: Self = serde_json::from_str(json).context(MalformedSnafu)?;
        deployment.validate()?;
        Ok(deployment)
    }

    fn validate(&self) -> Result<(), InvalidDeployment> {
        ensure!(
            !self.entity_id.is_empty(),
            EmptyFieldSnafu { field: "entityId" }
        );
        ensure!(
            !self.entity_type.is_empty(),
            EmptyFieldSnafu {
                field: "entityType"
            }
        );
        Ok(())
    }
}

/// An entity as resolved from a server's `/deployments` endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityManifest {
    /// Id of the entity.
    pub entity_id: String,
    /// Type of the entity.
    pub entity_type: String,
    /// Files referenced by the entity. Absent is treated as empty.
    #[serde(default)]
    pub content: Vec<ContentMapping>,
    /// Opaque audit information.
    #[serde(default)]
    pub audit_info: serde_json::Value,
}

/// A logical file name mapped to the content address of its bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentMapping {
    /// Logical file name within the entity.
    pub file: String,
    /// Content address of the file.
    pub hash: String,
}

/// Descriptor of a server's current bulk snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotDescriptor {
    /// Content address of the snapshot file.
    pub hash: String,
    /// Highest deployment timestamp contained in the snapshot.
    pub last_included_deployment_timestamp: u64,
}

/// One page of the `/pointer-changes` feed.
///
/// Deltas are kept as raw values so a single malformed entry does not reject the page.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct PointerChangesPage {
    #[serde(default)]
    pub(crate) deltas: Vec<serde_json::Value>,
    #[serde(default)]
    pub(crate) pagination: Option<Pagination>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Pagination {
    #[serde(default)]
    pub(crate) next: Option<String>,
}

/// Response of the `/deployments` endpoint.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct DeploymentsResponse {
    #[serde(default)]
    pub(crate) deployments: Vec<EntityManifest>,
}
