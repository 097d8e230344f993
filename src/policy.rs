//! DDL for tenant row-level security and the application role.
//!
//! Every name and value here comes from configuration and goes through
//! [`quote_identifier`] / [`quote_literal`].

use crate::config::{Credentials, ScopeConfig};
use crate::quote::{quote_identifier, quote_literal};

/// Row-level policy restricting a table to the tenant in the scope variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantPolicy {
    /// Table name parts, e.g. `["app", "products"]`.
    pub table: Vec<String>,
    /// Tenant column compared against the scope variable.
    pub column: String,
    pub name: String,
}

impl TenantPolicy {
    /// Policy named `<table>_tenant_isolation`.
    pub fn new(table: &str, column: &str) -> Self {
        let table: Vec<String> = table.split('.').map(str::to_string).collect();
        let name = format!(
            "{}_tenant_isolation",
            table.last().map(String::as_str).unwrap_or_default()
        );
        Self {
            table,
            column: column.to_string(),
            name,
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// `col = current_setting('<schema.field>', true)::uuid`
    pub fn predicate(&self, scope: &ScopeConfig) -> String {
        format!(
            "{} = current_setting({}, true)::uuid",
            quote_identifier(&[self.column.as_str()]),
            quote_literal(&scope.variable_name())
        )
    }

    /// Statements enabling and forcing the policy, in execution order.
    pub fn statements(&self, scope: &ScopeConfig) -> Vec<String> {
        let table = quote_identifier(&self.table);
        let predicate = self.predicate(scope);
        vec![
            format!("ALTER TABLE {table} ENABLE ROW LEVEL SECURITY"),
            format!("ALTER TABLE {table} FORCE ROW LEVEL SECURITY"),
            format!(
                "CREATE POLICY {} ON {table} USING ({predicate}) WITH CHECK ({predicate})",
                quote_identifier(&[self.name.as_str()])
            ),
        ]
    }

    /// Statements undoing [`TenantPolicy::statements`].
    pub fn drop_statements(&self) -> Vec<String> {
        let table = quote_identifier(&self.table);
        vec![
            format!(
                "DROP POLICY IF EXISTS {} ON {table}",
                quote_identifier(&[self.name.as_str()])
            ),
            format!("ALTER TABLE {table} NO FORCE ROW LEVEL SECURITY"),
            format!("ALTER TABLE {table} DISABLE ROW LEVEL SECURITY"),
        ]
    }
}

/// Create the login role the application connects as and grant it DML on
/// every table of `schema`, present and future.
pub fn grant_app_user(database: &str, schema: &str, credentials: &Credentials) -> Vec<String> {
    let user = quote_identifier(&[credentials.username.as_str()]);
    let schema = quote_identifier(&[schema]);
    vec![
        format!(
            "CREATE USER {user} WITH LOGIN PASSWORD {}",
            quote_literal(&credentials.password)
        ),
        format!(
            "GRANT CONNECT, TEMP ON DATABASE {} TO {user}",
            quote_identifier(&[database])
        ),
        format!("GRANT USAGE ON SCHEMA {schema} TO {user}"),
        format!("GRANT SELECT, INSERT, UPDATE, DELETE ON ALL TABLES IN SCHEMA {schema} TO {user}"),
        format!(
            "ALTER DEFAULT PRIVILEGES IN SCHEMA {schema} GRANT SELECT, INSERT, UPDATE, DELETE ON TABLES TO {user}"
        ),
    ]
}

/// Hand everything the application role owns to `owner` and drop the role.
pub fn drop_app_user(username: &str, owner: &str) -> Vec<String> {
    let user = quote_identifier(&[username]);
    vec![
        format!(
            "REASSIGN OWNED BY {user} TO {}",
            quote_identifier(&[owner])
        ),
        format!("DROP OWNED BY {user} CASCADE"),
        format!("DROP USER IF EXISTS {user}"),
    ]
}
