use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::models::custom::{Approver, CustomMigrationRequest, CustomStatus};
use crate::models::migration::Operation;
use crate::models::tenant::{TenantId, TenantStatus};
use crate::services::store::ControlStore;

pub const DEFAULT_DESTRUCTIVE_KEYWORDS: &[&str] =
    &["DROP TABLE", "DROP DATABASE", "DROP SCHEMA", "TRUNCATE", "DROP COLUMN"];

/// Denylist of destructive phrases. A request whose forward operation matches
/// any of them can only be approved by an elevated approver.
#[derive(Debug, Clone)]
pub struct DestructivePolicy {
    keywords: Vec<String>,
}

impl Default for DestructivePolicy {
    fn default() -> Self {
        Self::new(DEFAULT_DESTRUCTIVE_KEYWORDS.iter().copied())
    }
}

fn normalize(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase()
}

/// Replaces `--` and (nested) `/* */` comments outside quoted text with
/// `filler`.
fn strip_comments(sql: &str, filler: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut quote: Option<char> = None;
    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            out.push(c);
            if c == q {
                quote = None;
            }
            continue;
        }
        match (c, chars.peek().copied()) {
            ('\'' | '"', _) => {
                quote = Some(c);
                out.push(c);
            }
            ('-', Some('-')) => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        break;
                    }
                }
                out.push_str(filler);
                out.push('\n');
            }
            ('/', Some('*')) => {
                chars.next();
                let mut depth = 1;
                while depth > 0 {
                    match chars.next() {
                        Some('*') if chars.peek() == Some(&'/') => {
                            chars.next();
                            depth -= 1;
                        }
                        Some('/') if chars.peek() == Some(&'*') => {
                            chars.next();
                            depth += 1;
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
                out.push_str(filler);
            }
            _ => out.push(c),
        }
    }
    out
}

/// True for predicates that hold for every row: `TRUE`, `NOT FALSE`, `x = x`,
/// or any of those joined by `OR`.
fn always_true(predicate: &str) -> bool {
    predicate.split(" OR ").any(|term| {
        let term: String = term.chars().filter(|c| !c.is_whitespace() && *c != '(' && *c != ')').collect();
        if term == "TRUE" || term == "NOTFALSE" {
            return true;
        }
        match term.split_once('=') {
            Some((left, right)) => !left.is_empty() && left == right,
            None => false,
        }
    })
}

/// A `DELETE`/`UPDATE` statement limited by a `WHERE` clause that can be false.
fn bounded(statement: &str) -> bool {
    match statement.split_once(" WHERE ") {
        None => false,
        Some((_, predicate)) => {
            let predicate = predicate.split(" RETURNING ").next().unwrap_or(predicate);
            !always_true(predicate)
        }
    }
}

impl DestructivePolicy {
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            keywords: keywords
                .into_iter()
                .map(|k| normalize(k.as_ref()))
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    /// Phrases the operation matches, in denylist order, each once.
    ///
    /// Comments count both as whitespace and as nothing, so neither
    /// `DROP/**/TABLE` nor `DR/**/OP TABLE` slips through.
    pub fn matches(&self, op: &Operation) -> Vec<String> {
        let statements: Vec<String> = op
            .to_sql()
            .iter()
            .flat_map(|sql| [strip_comments(sql, " "), strip_comments(sql, "")])
            .flat_map(|sql| sql.split(';').map(normalize).collect::<Vec<_>>())
            .filter(|s| !s.is_empty())
            .collect();

        let mut matched: Vec<String> = self
            .keywords
            .iter()
            .filter(|k| statements.iter().any(|s| s.contains(k.as_str())))
            .cloned()
            .collect();

        if statements.iter().any(|s| s.contains("DELETE FROM") && !bounded(s)) {
            matched.push("DELETE FROM without WHERE".into());
        }
        if statements
            .iter()
            .any(|s| s.starts_with("UPDATE ") && s.contains(" SET ") && !bounded(s))
        {
            matched.push("UPDATE without WHERE".into());
        }
        matched.dedup();
        matched
    }
}

/// Request, review and approval of tenant-specific changes. Applying an
/// approved request belongs to the orchestrator.
pub struct CustomWorkflow {
    store: Arc<dyn ControlStore>,
    policy: DestructivePolicy,
}

impl CustomWorkflow {
    pub fn new(store: Arc<dyn ControlStore>, policy: DestructivePolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &DestructivePolicy {
        &self.policy
    }

    pub async fn request(
        &self,
        tenant: &TenantId,
        requester: &str,
        forward: Operation,
        reverse: Option<Operation>,
        description: &str,
    ) -> EngineResult<CustomMigrationRequest> {
        let state = self
            .store
            .tenant(tenant)
            .await?
            .ok_or_else(|| EngineError::UnknownTenant(tenant.clone()))?;
        if state.status == TenantStatus::Archived {
            return Err(EngineError::InvalidRequest(format!("tenant '{tenant}' is archived")));
        }
        if forward.is_empty() {
            return Err(EngineError::InvalidRequest("forward operation is empty".into()));
        }

        let request = CustomMigrationRequest::new(tenant.clone(), requester, forward, reverse, description);
        self.store.insert_custom_request(&request).await?;
        tracing::info!(
            tenant = %tenant,
            request = %request.id,
            requester = requester,
            "Custom migration requested"
        );
        Ok(request)
    }

    pub async fn get(&self, id: Uuid) -> EngineResult<CustomMigrationRequest> {
        self.store
            .custom_request(id)
            .await?
            .ok_or(EngineError::UnknownRequest(id))
    }

    pub async fn list(
        &self,
        tenant: &TenantId,
        status: Option<CustomStatus>,
    ) -> EngineResult<Vec<CustomMigrationRequest>> {
        Ok(self.store.custom_requests(tenant, status).await?)
    }

    pub async fn approve(&self, id: Uuid, approver: &Approver) -> EngineResult<CustomMigrationRequest> {
        let mut request = self.get(id).await?;
        transition(&request, CustomStatus::Approved)?;

        let matched = self.policy.matches(&request.forward);
        if !matched.is_empty() && !approver.is_elevated() {
            tracing::warn!(
                request = %id,
                approver = %approver.id,
                matched = ?matched,
                "Destructive custom migration needs elevated approval"
            );
            return Err(EngineError::ElevatedApprovalRequired { request: Some(id), matched });
        }

        request.status = CustomStatus::Approved;
        request.approver = Some(approver.id.clone());
        request.decided_at = Some(Utc::now());
        self.store.save_custom_request(&request).await?;
        tracing::info!(tenant = %request.tenant, request = %id, approver = %approver.id, "Custom migration approved");
        Ok(request)
    }

    pub async fn reject(&self, id: Uuid, approver: &Approver, reason: &str) -> EngineResult<CustomMigrationRequest> {
        let mut request = self.get(id).await?;
        transition(&request, CustomStatus::Rejected)?;

        request.status = CustomStatus::Rejected;
        request.approver = Some(approver.id.clone());
        request.decision_note = Some(reason.to_string());
        request.decided_at = Some(Utc::now());
        self.store.save_custom_request(&request).await?;
        tracing::info!(tenant = %request.tenant, request = %id, approver = %approver.id, "Custom migration rejected");
        Ok(request)
    }
}

pub(crate) fn transition(request: &CustomMigrationRequest, to: CustomStatus) -> EngineResult<()> {
    if request.status.can_transition_to(to) {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition {
            entity: "custom migration",
            from: request.status.to_string(),
            to: to.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryControlStore;
    use crate::models::migration::SchemaChange;
    use crate::models::tenant::TenantState;

    #[test]
    fn keyword_matching_ignores_case_and_spacing() {
        let policy = DestructivePolicy::default();
        assert_eq!(policy.matches(&Operation::sql("drop   table\n members")), vec!["DROP TABLE"]);
        assert_eq!(policy.matches(&Operation::sql("truncate donations")), vec!["TRUNCATE"]);
        assert!(policy.matches(&Operation::sql("CREATE TABLE t (id INT)")).is_empty());
        let structured = Operation::structured(vec![SchemaChange::DropColumn {
            table: "members".into(),
            column: "ward".into(),
        }]);
        assert_eq!(policy.matches(&structured), vec!["DROP COLUMN"]);
    }

    #[test]
    fn unbounded_dml_is_destructive() {
        let policy = DestructivePolicy::default();
        assert_eq!(
            policy.matches(&Operation::sql("DELETE FROM members")),
            vec!["DELETE FROM without WHERE"]
        );
        assert!(policy.matches(&Operation::sql("DELETE FROM members WHERE id = 1")).is_empty());
        assert_eq!(
            policy.matches(&Operation::sql("update members set ward = 1")),
            vec!["UPDATE without WHERE"]
        );
        assert!(policy
            .matches(&Operation::sql("UPDATE members SET ward = 1 WHERE id = 2; SELECT 1"))
            .is_empty());
    }

    #[test]
    fn comments_do_not_hide_destructive_statements() {
        let policy = DestructivePolicy::default();
        for sql in [
            "DROP/**/TABLE members",
            "DR/**/OP TABLE members",
            "drop -- old data\ntable members",
            "DROP /* outer /* inner */ still comment */ TABLE members",
        ] {
            assert_eq!(policy.matches(&Operation::sql(sql)), vec!["DROP TABLE"], "{sql}");
        }
        // comment markers inside literals are text
        assert_eq!(
            policy.matches(&Operation::sql("SELECT '--'; DROP TABLE members")),
            vec!["DROP TABLE"]
        );
        assert!(policy
            .matches(&Operation::sql("UPDATE members SET note = '/* x' WHERE id = 1"))
            .is_empty());
        assert!(policy.matches(&Operation::sql("-- DROP TABLE members\nSELECT 1")).is_empty());
    }

    #[test]
    fn always_true_where_is_unbounded() {
        let policy = DestructivePolicy::default();
        for sql in [
            "DELETE FROM members WHERE TRUE",
            "DELETE FROM members WHERE 1=1",
            "DELETE FROM members WHERE 1 = 1 RETURNING id",
            "DELETE FROM members WHERE (id = id)",
            "DELETE FROM members WHERE id = 7 OR 'a' = 'a'",
            "DELETE FROM members WHERE NOT FALSE",
            "DELETE FROM members /* all */ WHERE/**/true",
        ] {
            assert_eq!(policy.matches(&Operation::sql(sql)), vec!["DELETE FROM without WHERE"], "{sql}");
        }
        assert_eq!(
            policy.matches(&Operation::sql("UPDATE members SET ward = 1 WHERE 1=1")),
            vec!["UPDATE without WHERE"]
        );
        assert!(policy.matches(&Operation::sql("DELETE FROM members WHERE id >= id")).is_empty());
        assert!(policy.matches(&Operation::sql("DELETE FROM members WHERE ward = 3")).is_empty());
    }

    async fn workflow() -> (CustomWorkflow, TenantId) {
        let store = Arc::new(MemoryControlStore::new());
        let t = TenantId::parse("T1").unwrap();
        store.insert_tenant(&TenantState::new(t.clone())).await.unwrap();
        (CustomWorkflow::new(store, DestructivePolicy::default()), t)
    }

    #[tokio::test]
    async fn destructive_request_needs_elevated_approver() {
        let (wf, t) = workflow().await;
        let req = wf
            .request(&t, "alice", Operation::sql("DROP TABLE scratch"), None, "cleanup")
            .await
            .unwrap();

        let err = wf.approve(req.id, &Approver::standard("bob")).await.unwrap_err();
        assert!(matches!(err, EngineError::ElevatedApprovalRequired { ref matched, .. } if matched == &["DROP TABLE"]));
        assert_eq!(wf.get(req.id).await.unwrap().status, CustomStatus::Pending);

        let approved = wf.approve(req.id, &Approver::elevated("root")).await.unwrap();
        assert_eq!(approved.status, CustomStatus::Approved);
        assert_eq!(approved.approver.as_deref(), Some("root"));
    }

    #[tokio::test]
    async fn decisions_only_on_pending_requests() {
        let (wf, t) = workflow().await;
        let req = wf
            .request(&t, "alice", Operation::sql("CREATE INDEX a ON members (id)"), None, "index")
            .await
            .unwrap();
        wf.reject(req.id, &Approver::standard("bob"), "not needed").await.unwrap();

        let err = wf.approve(req.id, &Approver::elevated("root")).await.unwrap_err();
        assert_eq!(err.code(), "invalid_transition");
        assert_eq!(wf.list(&t, Some(CustomStatus::Rejected)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn requests_need_a_known_tenant_and_a_body() {
        let (wf, t) = workflow().await;
        let unknown = TenantId::parse("T9").unwrap();
        assert_eq!(
            wf.request(&unknown, "a", Operation::sql("SELECT 1"), None, "").await.unwrap_err().code(),
            "unknown_tenant"
        );
        assert_eq!(
            wf.request(&t, "a", Operation::sql("  "), None, "").await.unwrap_err().code(),
            "invalid_request"
        );
    }
}
