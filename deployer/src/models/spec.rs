//! Rendered workload specifications

use serde_json::Value;

use crate::errors::DeployError;

/// A fully rendered task definition, read-only once parsed
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadSpec {
    family: String,
    document: Value,
}

impl WorkloadSpec {
    /// Wrap a rendered task definition document
    ///
    /// The document needs a string `family` and at least one entry in
    /// `containerDefinitions`.
    pub fn from_document(document: Value) -> Result<Self, DeployError> {
        let family = document
            .get("family")
            .and_then(Value::as_str)
            .filter(|f| !f.is_empty())
            .ok_or_else(|| {
                DeployError::ConfigError(format!(
                    "task definition parameter `family` not found.\ntask definition:\n{}",
                    document
                ))
            })?
            .to_string();

        let has_containers = document
            .get("containerDefinitions")
            .and_then(Value::as_array)
            .is_some_and(|c| !c.is_empty());
        if !has_containers {
            return Err(DeployError::ConfigError(format!(
                "task definition `{}` has no `containerDefinitions`",
                family
            )));
        }

        Ok(Self { family, document })
    }

    pub fn family(&self) -> &str {
        &self.family
    }

    pub fn document(&self) -> &Value {
        &self.document
    }

    /// The container definitions, in declaration order
    pub fn containers(&self) -> &[Value] {
        self.document
            .get("containerDefinitions")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// `(name, value)` pairs of the first container's environment block
    ///
    /// `None` when the first container carries no environment at all.
    pub fn environment(&self) -> Option<Vec<(&str, &str)>> {
        let entries = self.containers().first()?.get("environment")?.as_array()?;
        Some(
            entries
                .iter()
                .filter_map(|entry| {
                    let name = entry.get("name")?.as_str()?;
                    let value = entry.get("value")?.as_str()?;
                    Some((name, value))
                })
                .collect(),
        )
    }
}
