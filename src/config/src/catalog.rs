// Copyright 2024 Zinc Labs Inc.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use std::{collections::HashMap, path::Path, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// A webhook reference: either a literal URL or an indirection through an
/// environment variable, resolved at delivery time (never persisted resolved).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WebhookConf {
    Value(String),
    FromEnv(String),
}

/// A single header reference, same value-or-env-var indirection as `WebhookConf`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeaderConf {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_from_env: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConf {
    pub num_retries: i32,
    pub retry_interval_seconds: i64,
    pub timeout_seconds: f64,
    pub tolerance_seconds: i64,
}

impl Default for RetryConf {
    fn default() -> Self {
        Self {
            num_retries: 3,
            retry_interval_seconds: 60,
            timeout_seconds: 60.0,
            tolerance_seconds: 21600,
        }
    }
}

/// One entry of the external trigger-definition catalog (§9.3 of SPEC_FULL.md).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronTriggerDefinition {
    pub name: String,
    pub schedule: String,
    pub webhook_conf: WebhookConf,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    #[serde(default)]
    pub header_conf: Vec<HeaderConf>,
    #[serde(default)]
    pub retry_conf: RetryConf,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub paused: bool,
}

/// In-memory snapshot of the trigger catalog, reloadable from a JSON file.
/// Stands in for the external catalog collaborator the distilled spec treats
/// as out of scope.
pub struct TriggerCatalog {
    triggers: arc_swap::ArcSwap<HashMap<String, CronTriggerDefinition>>,
}

impl TriggerCatalog {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let map = read_catalog_file(path.as_ref())?;
        Ok(Self {
            triggers: arc_swap::ArcSwap::from_pointee(map),
        })
    }

    pub fn empty() -> Self {
        Self {
            triggers: arc_swap::ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Cheap `Arc` clone of the current snapshot; callers should take one
    /// snapshot per loop iteration rather than querying per-lookup.
    pub fn snapshot(&self) -> Arc<HashMap<String, CronTriggerDefinition>> {
        self.triggers.load_full()
    }

    pub fn reload(&self, path: impl AsRef<Path>) -> Result<()> {
        let map = read_catalog_file(path.as_ref())?;
        self.triggers.store(Arc::new(map));
        Ok(())
    }

    #[cfg(test)]
    pub fn from_map(map: HashMap<String, CronTriggerDefinition>) -> Self {
        Self {
            triggers: arc_swap::ArcSwap::from_pointee(map),
        }
    }
}

fn read_catalog_file(path: &Path) -> Result<HashMap<String, CronTriggerDefinition>> {
    if !path.exists() {
        log::warn!(
            "[CATALOG] {} does not exist, starting with an empty catalog",
            path.display()
        );
        return Ok(HashMap::new());
    }
    let raw = std::fs::read_to_string(path)?;
    let entries: Vec<CronTriggerDefinition> = serde_json::from_str(&raw)?;
    let mut map = HashMap::with_capacity(entries.len());
    for entry in entries {
        if map.insert(entry.name.clone(), entry).is_some() {
            return Err(Error::CatalogLoad(format!(
                "duplicate trigger name in catalog file: {}",
                path.display()
            )));
        }
    }
    Ok(map)
}
