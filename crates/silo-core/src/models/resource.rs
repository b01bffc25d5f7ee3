use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::models::call::CallId;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Repository,
    Importer,
    Distributor,
    Consumer,
    ContentUnit,
}

impl ResourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Repository => "repository",
            Self::Importer => "importer",
            Self::Distributor => "distributor",
            Self::Consumer => "consumer",
            Self::ContentUnit => "content_unit",
        }
    }
}

impl std::str::FromStr for ResourceType {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "repository" => Ok(Self::Repository),
            "importer" => Ok(Self::Importer),
            "distributor" => Ok(Self::Distributor),
            "consumer" => Ok(Self::Consumer),
            "content_unit" => Ok(Self::ContentUnit),
            _ => Err(()),
        }
    }
}

impl Display for ResourceType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceOperation {
    Create,
    Read,
    Update,
    Delete,
}

impl ResourceOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl std::str::FromStr for ResourceOperation {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "create" => Ok(Self::Create),
            "read" => Ok(Self::Read),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            _ => Err(()),
        }
    }
}

impl Display for ResourceOperation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared resource operations for a call: resource type -> resource id ->
/// operation. Fixed at request creation; the conflict detector only ever
/// reads these declarations, never the call's actual behavior.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceSet {
    entries: BTreeMap<ResourceType, BTreeMap<String, ResourceOperation>>,
}

impl ResourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(
        &mut self,
        resource_type: ResourceType,
        resource_id: impl Into<String>,
        operation: ResourceOperation,
    ) -> &mut Self {
        self.entries
            .entry(resource_type)
            .or_default()
            .insert(resource_id.into(), operation);
        self
    }

    pub fn creates(&mut self, resource_type: ResourceType, resource_id: impl Into<String>) -> &mut Self {
        self.declare(resource_type, resource_id, ResourceOperation::Create)
    }

    pub fn reads(&mut self, resource_type: ResourceType, resource_id: impl Into<String>) -> &mut Self {
        self.declare(resource_type, resource_id, ResourceOperation::Read)
    }

    pub fn updates(&mut self, resource_type: ResourceType, resource_id: impl Into<String>) -> &mut Self {
        self.declare(resource_type, resource_id, ResourceOperation::Update)
    }

    pub fn deletes(&mut self, resource_type: ResourceType, resource_id: impl Into<String>) -> &mut Self {
        self.declare(resource_type, resource_id, ResourceOperation::Delete)
    }

    pub fn operation_for(&self, resource_type: ResourceType, resource_id: &str) -> Option<ResourceOperation> {
        self.entries
            .get(&resource_type)
            .and_then(|ids| ids.get(resource_id))
            .copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ResourceType, &str, ResourceOperation)> {
        self.entries.iter().flat_map(|(resource_type, ids)| {
            ids.iter()
                .map(|(id, operation)| (*resource_type, id.as_str(), *operation))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeMap::len).sum()
    }
}

/// One resource-level explanation for a postponement or rejection.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ConflictReason {
    pub call_id: CallId,
    pub resource_type: ResourceType,
    pub resource_id: String,
    pub held: ResourceOperation,
    pub requested: ResourceOperation,
}

impl Display for ConflictReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "call {} holds {} on {} '{}', requested {} conflicts",
            self.call_id, self.held, self.resource_type, self.resource_id, self.requested
        )
    }
}
