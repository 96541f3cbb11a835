use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::migration::{MigrationUnit, Operation, Version};

/// A unit as written in a definition file, before identity and hash are attached.
#[derive(Debug, Clone, Deserialize)]
pub struct UnitSpec {
    pub name: String,
    pub forward: Operation,
    #[serde(default)]
    pub reverse: Option<Operation>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BasicFile {
    pub version: Version,
    pub units: Vec<UnitSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateFile {
    pub slug: String,
    pub version: Version,
    #[serde(default = "active_default")]
    pub active: bool,
    #[serde(default)]
    pub required_modules: Vec<String>,
    #[serde(default)]
    pub optional_modules: Vec<String>,
    #[serde(default)]
    pub config: BTreeMap<String, serde_json::Value>,
    pub units: Vec<UnitSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModuleFile {
    pub slug: String,
    pub version: Version,
    #[serde(default = "active_default")]
    pub active: bool,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub conflicts: Vec<String>,
    pub units: Vec<UnitSpec>,
}

fn active_default() -> bool {
    true
}

/// Organization-category template: a versioned bundle defining a tenant's base schema.
#[derive(Debug, Clone, Serialize)]
pub struct TemplateDef {
    pub slug: String,
    pub version: Version,
    pub active: bool,
    pub required_modules: Vec<String>,
    pub optional_modules: Vec<String>,
    pub config: BTreeMap<String, serde_json::Value>,
    #[serde(skip)]
    pub units: Vec<MigrationUnit>,
}

impl TemplateDef {
    pub fn allows_module(&self, slug: &str) -> bool {
        self.required_modules.iter().any(|m| m == slug)
            || self.optional_modules.iter().any(|m| m == slug)
    }
}

/// Optional feature bundle with declared dependencies and conflicts.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleDef {
    pub slug: String,
    pub version: Version,
    pub active: bool,
    pub dependencies: Vec<String>,
    pub conflicts: Vec<String>,
    #[serde(skip)]
    pub units: Vec<MigrationUnit>,
}
