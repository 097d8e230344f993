use anyhow::{Context as _, Result, bail};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tenantdb::{
    AppConfig, Context, PgConnectionPool, ScopeConfig, TenantId, TenantPolicy,
    TenantTransactionManager, init_tracing, quote_identifier, quote_literal,
};

#[derive(Parser)]
#[command(name = "tenantdb-tool")]
#[command(about = "Developer tooling for tenant-scoped PostgreSQL transactions")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print row-level security DDL for a tenant table
    Policy {
        /// Table, optionally schema-qualified (`app.products`)
        #[arg(long)]
        table: String,
        /// Tenant column
        #[arg(long)]
        column: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value = "app")]
        schema: String,
        #[arg(long, default_value = "current_organization")]
        field: String,
    },
    /// Print a quoted literal or identifier
    Quote {
        #[command(subcommand)]
        target: QuoteTarget,
    },
    /// Check nested scope restoration against the configured database
    Probe {
        #[arg(long, default_value = "TENANTDB_")]
        prefix: String,
    },
}

#[derive(Subcommand)]
enum QuoteTarget {
    Literal { value: String },
    /// Dotted identifier, e.g. `app.current_organization`
    Ident { value: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("tenantdb=info");
    let cli = Cli::parse();

    match cli.command {
        Command::Policy {
            table,
            column,
            name,
            schema,
            field,
        } => {
            let scope = ScopeConfig::new(&schema, &field);
            scope.validate()?;

            let mut policy = TenantPolicy::new(&table, &column);
            if let Some(name) = name {
                policy = policy.named(&name);
            }
            for statement in policy.statements(&scope) {
                println!("{statement};");
            }
            Ok(())
        }
        Command::Quote { target } => {
            match target {
                QuoteTarget::Literal { value } => println!("{}", quote_literal(&value)),
                QuoteTarget::Ident { value } => {
                    let parts: Vec<&str> = value.split('.').collect();
                    println!("{}", quote_identifier(&parts));
                }
            }
            Ok(())
        }
        Command::Probe { prefix } => probe(&prefix).await,
    }
}

async fn probe(prefix: &str) -> Result<()> {
    let config = AppConfig::from_env(prefix).context("failed to load configuration")?;
    let pool = PgConnectionPool::connect(&config.database)
        .await
        .with_context(|| format!("failed to connect to {}", config.database.to_url()))?;
    let manager = TenantTransactionManager::new(Arc::new(pool.clone()), config.scope.clone())?;

    let outer = TenantId::new();
    let inner = TenantId::new();
    let read = format!(
        "SELECT current_setting({}, true)",
        quote_literal(&config.scope.variable_name())
    );

    let cx = Context::background().with_tenant(outer);
    let (seen_inner, seen_after) = manager
        .run_in_transaction(&cx, |cx, tx| {
            let manager = &manager;
            let read = read.clone();
            async move {
                let nested = cx.with_tenant(inner);
                let read_inner = read.clone();
                let seen_inner = manager
                    .run_in_transaction(&nested, |_cx, tx| async move {
                        tx.query_text(&read_inner).await
                    })
                    .await?;
                let seen_after = tx.query_text(&read).await?;
                Ok((seen_inner, seen_after))
            }
        })
        .await?;

    pool.close().await;

    println!("outer tenant:  {outer}");
    println!("inner tenant:  {inner}");
    println!("inside nested: {}", seen_inner.as_deref().unwrap_or("<null>"));
    println!("after nested:  {}", seen_after.as_deref().unwrap_or("<null>"));

    if seen_after.as_deref() != Some(outer.to_string().as_str()) {
        bail!("outer tenant binding was not restored after the nested scope");
    }
    println!("ok: outer binding restored");
    Ok(())
}
