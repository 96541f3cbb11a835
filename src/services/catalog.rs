use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{EngineError, EngineResult};
use crate::models::custom::CustomStatus;
use crate::models::definition::{ModuleDef, TemplateDef};
use crate::models::migration::{MigrationUnit, Version};
use crate::models::tenant::TenantId;
use crate::services::definitions::DefinitionSet;
use crate::services::store::ControlStore;

/// What to ask the catalog for. Each variant maps to one layer.
#[derive(Debug, Clone, Copy)]
pub enum UnitQuery<'a> {
    Basic,
    /// `version: None` selects the newest active version of the slug.
    Template { slug: &'a str, version: Option<&'a Version> },
    /// Each module's units in its own order, modules in the order given.
    Modules(&'a [String]),
    /// Approved, not yet applied custom requests of the tenant, oldest first.
    Custom(&'a TenantId),
}

/// Read-only view of the desired state: ordered units per layer and per
/// template/module identity. Definitions can be swapped at runtime.
pub struct LayerCatalog {
    defs: RwLock<Arc<DefinitionSet>>,
    store: Arc<dyn ControlStore>,
}

impl LayerCatalog {
    pub fn new(defs: DefinitionSet, store: Arc<dyn ControlStore>) -> Self {
        Self {
            defs: RwLock::new(Arc::new(defs)),
            store,
        }
    }

    pub fn definitions(&self) -> Arc<DefinitionSet> {
        self.defs.read().clone()
    }

    pub fn reload(&self, defs: DefinitionSet) {
        tracing::info!(
            templates = defs.templates.len(),
            modules = defs.modules.len(),
            "Catalog reloaded"
        );
        *self.defs.write() = Arc::new(defs);
    }

    pub async fn units_for(&self, query: UnitQuery<'_>) -> EngineResult<Vec<MigrationUnit>> {
        match query {
            UnitQuery::Basic => Ok(self.definitions().basic.clone()),
            UnitQuery::Template { slug, version } => Ok(self.template(slug, version)?.units),
            UnitQuery::Modules(slugs) => {
                let mut units = Vec::new();
                for slug in slugs {
                    units.extend(self.module(slug)?.units);
                }
                Ok(units)
            }
            UnitQuery::Custom(tenant) => Ok(self
                .store
                .custom_requests(tenant, Some(CustomStatus::Approved))
                .await?
                .iter()
                .map(|r| r.to_unit())
                .collect()),
        }
    }

    /// An active template. Deactivated versions are treated as absent.
    pub fn template(&self, slug: &str, version: Option<&Version>) -> EngineResult<TemplateDef> {
        let defs = self.definitions();
        let found = match version {
            Some(v) => defs
                .templates
                .get(&(slug.to_string(), v.clone()))
                .filter(|t| t.active),
            None => defs
                .templates
                .values()
                .filter(|t| t.slug == slug && t.active)
                .max_by(|a, b| a.version.cmp(&b.version)),
        };
        found.cloned().ok_or_else(|| EngineError::UnknownTemplate {
            slug: slug.to_string(),
            version: version.cloned(),
        })
    }

    /// Any template version, active or not. Used to verify and replay what a
    /// tenant already has.
    pub fn recorded_template(&self, slug: &str, version: &Version) -> EngineResult<TemplateDef> {
        self.definitions()
            .templates
            .get(&(slug.to_string(), version.clone()))
            .cloned()
            .ok_or_else(|| EngineError::UnknownTemplate {
                slug: slug.to_string(),
                version: Some(version.clone()),
            })
    }

    pub fn module(&self, slug: &str) -> EngineResult<ModuleDef> {
        self.definitions()
            .modules
            .get(slug)
            .filter(|m| m.active)
            .cloned()
            .ok_or_else(|| EngineError::UnknownModule(slug.to_string()))
    }

    pub fn templates(&self) -> Vec<TemplateDef> {
        self.definitions().templates.values().cloned().collect()
    }

    pub fn modules(&self) -> Vec<ModuleDef> {
        self.definitions().modules.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryControlStore;
    use crate::models::custom::CustomMigrationRequest;
    use crate::models::definition::{BasicFile, ModuleFile, TemplateFile};
    use crate::models::migration::{Layer, Operation};
    use serde_json::json;

    fn defs() -> DefinitionSet {
        let basic: BasicFile = serde_json::from_value(json!({
            "version": "1.0.0",
            "units": [{ "name": "001", "forward": { "kind": "sql", "sql": "SELECT 1" } }]
        }))
        .unwrap();
        let t = |version: &str, active: bool| -> TemplateFile {
            serde_json::from_value(json!({
                "slug": "party",
                "version": version,
                "active": active,
                "units": [{ "name": "001", "forward": { "kind": "sql", "sql": "SELECT 1" } }]
            }))
            .unwrap()
        };
        let m: ModuleFile = serde_json::from_value(json!({
            "slug": "finance",
            "version": "1.0.0",
            "active": false,
            "units": []
        }))
        .unwrap();
        DefinitionSet::from_files(basic, vec![t("1.0.0", true), t("1.1.0", true), t("2.0.0", false)], vec![m])
            .unwrap()
    }

    #[tokio::test]
    async fn newest_active_template_wins() {
        let catalog = LayerCatalog::new(defs(), Arc::new(MemoryControlStore::new()));
        assert_eq!(catalog.template("party", None).unwrap().version, Version::new(1, 1, 0));
        let v2 = Version::new(2, 0, 0);
        assert!(matches!(
            catalog.units_for(UnitQuery::Template { slug: "party", version: Some(&v2) }).await,
            Err(EngineError::UnknownTemplate { .. })
        ));
        assert!(catalog.recorded_template("party", &v2).is_ok());
    }

    #[tokio::test]
    async fn inactive_module_is_unknown() {
        let catalog = LayerCatalog::new(defs(), Arc::new(MemoryControlStore::new()));
        let slugs = vec!["finance".to_string()];
        assert!(matches!(
            catalog.units_for(UnitQuery::Modules(&slugs)).await,
            Err(EngineError::UnknownModule(m)) if m == "finance"
        ));
    }

    #[tokio::test]
    async fn custom_units_are_approved_requests_only() {
        let store = Arc::new(MemoryControlStore::new());
        let t = TenantId::parse("T1").unwrap();
        let pending = CustomMigrationRequest::new(t.clone(), "ops", Operation::sql("SELECT 1"), None, "p");
        let mut approved = CustomMigrationRequest::new(t.clone(), "ops", Operation::sql("SELECT 2"), None, "a");
        approved.status = CustomStatus::Approved;
        store.insert_custom_request(&pending).await.unwrap();
        store.insert_custom_request(&approved).await.unwrap();

        let catalog = LayerCatalog::new(defs(), store);
        let units = catalog.units_for(UnitQuery::Custom(&t)).await.unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].id.layer, Layer::Custom);
        assert_eq!(units[0].id.owner, approved.id.to_string());
    }

    #[tokio::test]
    async fn reload_swaps_the_definition_set() {
        let catalog = LayerCatalog::new(defs(), Arc::new(MemoryControlStore::new()));
        let before = catalog.definitions();

        let basic: BasicFile = serde_json::from_value(json!({ "version": "2.0.0", "units": [] })).unwrap();
        catalog.reload(DefinitionSet::from_files(basic, vec![], vec![]).unwrap());

        assert!(catalog.templates().is_empty());
        assert!(matches!(catalog.template("party", None), Err(EngineError::UnknownTemplate { .. })));
        // Holders of the previous set keep a consistent view.
        assert_eq!(before.templates.len(), 3);
    }
}
