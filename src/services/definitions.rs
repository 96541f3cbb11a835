//! Template/Module Definition Store backed by a directory of JSON files:
//!
//! ```text
//! <dir>/basic.json
//! <dir>/templates/*.json
//! <dir>/modules/*.json
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::models::definition::{BasicFile, ModuleDef, ModuleFile, TemplateDef, TemplateFile, UnitSpec};
use crate::models::migration::{Layer, MigrationUnit, UnitId, Version};

pub const BASIC_OWNER: &str = "basic";

#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{} problem(s) in definitions: {}", .0.len(), .0.join("; "))]
    Invalid(Vec<String>),
}

/// Validated, hashed definitions: the Basic layer, every template version,
/// and every module.
#[derive(Debug, Clone, Default)]
pub struct DefinitionSet {
    pub basic_version: Version,
    pub basic: Vec<MigrationUnit>,
    pub templates: BTreeMap<(String, Version), TemplateDef>,
    pub modules: BTreeMap<String, ModuleDef>,
}

fn units(layer: Layer, owner: &str, version: &Version, specs: Vec<UnitSpec>) -> Vec<MigrationUnit> {
    specs
        .into_iter()
        .map(|u| {
            MigrationUnit::new(
                UnitId { layer, owner: owner.to_string(), name: u.name },
                version.clone(),
                u.forward,
                u.reverse,
            )
        })
        .collect()
}

fn unit_problems(owner: &str, specs: &[UnitSpec], problems: &mut Vec<String>) {
    let mut seen = BTreeSet::new();
    for u in specs {
        if u.name.trim().is_empty() {
            problems.push(format!("{owner}: unit with empty name"));
        }
        if !seen.insert(u.name.as_str()) {
            problems.push(format!("{owner}: duplicate unit name '{}'", u.name));
        }
        if u.forward.is_empty() {
            problems.push(format!("{owner}/{}: empty forward operation", u.name));
        }
    }
}

impl DefinitionSet {
    /// Builds and validates a set from parsed files. Every problem found is
    /// reported, not just the first.
    pub fn from_files(
        basic: BasicFile,
        templates: Vec<TemplateFile>,
        modules: Vec<ModuleFile>,
    ) -> Result<Self, DefinitionError> {
        let mut problems = Vec::new();

        unit_problems(BASIC_OWNER, &basic.units, &mut problems);

        let module_slugs: BTreeSet<&str> = modules.iter().map(|m| m.slug.as_str()).collect();
        let mut seen_modules = BTreeSet::new();
        for m in &modules {
            if !seen_modules.insert(m.slug.as_str()) {
                problems.push(format!("module '{}' is defined more than once", m.slug));
            }
            unit_problems(&m.slug, &m.units, &mut problems);
            for dep in &m.dependencies {
                if dep == &m.slug {
                    problems.push(format!("module '{}' depends on itself", m.slug));
                } else if !module_slugs.contains(dep.as_str()) {
                    problems.push(format!("module '{}' depends on unknown module '{dep}'", m.slug));
                }
            }
            for c in &m.conflicts {
                if c == &m.slug {
                    problems.push(format!("module '{}' conflicts with itself", m.slug));
                } else if !module_slugs.contains(c.as_str()) {
                    problems.push(format!("module '{}' conflicts with unknown module '{c}'", m.slug));
                }
            }
        }

        let mut seen_templates = BTreeSet::new();
        for t in &templates {
            let owner = format!("{}@{}", t.slug, t.version);
            if !seen_templates.insert((t.slug.as_str(), t.version.clone())) {
                problems.push(format!("template {owner} is defined more than once"));
            }
            unit_problems(&owner, &t.units, &mut problems);
            for m in t.required_modules.iter().chain(&t.optional_modules) {
                if !module_slugs.contains(m.as_str()) {
                    problems.push(format!("template {owner} references unknown module '{m}'"));
                }
            }
        }

        if !problems.is_empty() {
            return Err(DefinitionError::Invalid(problems));
        }

        let basic_units = units(Layer::Basic, BASIC_OWNER, &basic.version, basic.units);
        let templates = templates
            .into_iter()
            .map(|t| {
                let def = TemplateDef {
                    units: units(Layer::Template, &t.slug, &t.version, t.units),
                    slug: t.slug,
                    version: t.version,
                    active: t.active,
                    required_modules: t.required_modules,
                    optional_modules: t.optional_modules,
                    config: t.config,
                };
                ((def.slug.clone(), def.version.clone()), def)
            })
            .collect();
        let modules = modules
            .into_iter()
            .map(|m| {
                let def = ModuleDef {
                    units: units(Layer::Module, &m.slug, &m.version, m.units),
                    slug: m.slug,
                    version: m.version,
                    active: m.active,
                    dependencies: m.dependencies,
                    conflicts: m.conflicts,
                };
                (def.slug.clone(), def)
            })
            .collect();

        Ok(Self {
            basic_version: basic.version,
            basic: basic_units,
            templates,
            modules,
        })
    }

    /// Reads `basic.json`, `templates/*.json` and `modules/*.json` under `dir`.
    pub async fn load_dir(dir: impl AsRef<Path>) -> Result<Self, DefinitionError> {
        let dir = dir.as_ref();
        let basic: BasicFile = read_json(&dir.join("basic.json")).await?;
        let mut templates = Vec::new();
        for path in json_files(&dir.join("templates")).await? {
            templates.push(read_json::<TemplateFile>(&path).await?);
        }
        let mut modules = Vec::new();
        for path in json_files(&dir.join("modules")).await? {
            modules.push(read_json::<ModuleFile>(&path).await?);
        }
        let set = Self::from_files(basic, templates, modules)?;
        tracing::info!(
            dir = %dir.display(),
            templates = set.templates.len(),
            modules = set.modules.len(),
            basic_units = set.basic.len(),
            "Definitions loaded"
        );
        Ok(set)
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, DefinitionError> {
    let bytes = tokio::fs::read(path).await.map_err(|source| DefinitionError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| DefinitionError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// `*.json` files of a directory in name order. A missing directory is empty.
async fn json_files(dir: &Path) -> Result<Vec<PathBuf>, DefinitionError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => return Err(DefinitionError::Io { path: dir.to_path_buf(), source }),
    };
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|source| DefinitionError::Io {
        path: dir.to_path_buf(),
        source,
    })? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn module(slug: &str, deps: &[&str], conflicts: &[&str]) -> ModuleFile {
        serde_json::from_value(json!({
            "slug": slug,
            "version": "1.0.0",
            "dependencies": deps,
            "conflicts": conflicts,
            "units": [{ "name": "001", "forward": { "kind": "sql", "sql": "SELECT 1" } }]
        }))
        .unwrap()
    }

    fn basic() -> BasicFile {
        serde_json::from_value(json!({
            "version": "1.0.0",
            "units": [{ "name": "001_extensions", "forward": { "kind": "sql", "sql": "SELECT 1" } }]
        }))
        .unwrap()
    }

    #[test]
    fn reports_every_problem() {
        let template: TemplateFile = serde_json::from_value(json!({
            "slug": "party",
            "version": "1.0.0",
            "required_modules": ["ghost"],
            "units": [
                { "name": "001", "forward": { "kind": "sql", "sql": "SELECT 1" } },
                { "name": "001", "forward": { "kind": "sql", "sql": "  " } }
            ]
        }))
        .unwrap();
        let err = DefinitionSet::from_files(
            basic(),
            vec![template],
            vec![module("a", &["a"], &["missing"])],
        )
        .unwrap_err();
        let DefinitionError::Invalid(problems) = err else { panic!("expected Invalid") };
        assert_eq!(problems.len(), 5, "{problems:?}");
    }

    #[test]
    fn units_carry_owner_and_version() {
        let set = DefinitionSet::from_files(basic(), vec![], vec![module("finance", &[], &[])]).unwrap();
        let unit = &set.modules["finance"].units[0];
        assert_eq!(unit.id.to_string(), "module/finance/001");
        assert_eq!(unit.version, Version::new(1, 0, 0));
        assert_eq!(set.basic[0].id.owner, BASIC_OWNER);
    }

    #[tokio::test]
    async fn loads_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("basic.json"), serde_json::to_vec(&json!({
            "version": "1.0.0",
            "units": [{ "name": "001", "forward": { "kind": "sql", "sql": "SELECT 1" } }]
        })).unwrap()).unwrap();
        std::fs::create_dir(dir.path().join("modules")).unwrap();
        std::fs::write(dir.path().join("modules/finance.json"), serde_json::to_vec(&json!({
            "slug": "finance",
            "version": "2.1.0",
            "units": []
        })).unwrap()).unwrap();
        std::fs::write(dir.path().join("modules/README.md"), b"ignored").unwrap();

        let set = DefinitionSet::load_dir(dir.path()).await.unwrap();
        assert_eq!(set.modules["finance"].version, Version::new(2, 1, 0));
        assert!(set.templates.is_empty());
    }
}
