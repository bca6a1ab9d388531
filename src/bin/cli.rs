use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tokio::task::JoinHandle;

use dual_control::app::AppState;
use dual_control::config::AppConfig;
use dual_control::models::user::ProvisionUserRequest;
use dual_control::services::EscalationSweeper;

#[derive(Parser, Debug)]
#[command(author, version, about = "dual-control administration tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply pending migrations
    MigrateRun,
    /// Show migration status against the current database
    MigrateStatus,
    /// Provision a user account
    CreateUser {
        username: String,
        #[arg(long)]
        full_name: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    /// Grant a role to a user, both given by name
    AssignRole { username: String, role: String },
    /// Deactivate a user; they keep their history but lose all authority
    DeactivateUser { username: String },
    /// Run one escalation pass over overdue workflows
    SweepOnce,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if dotenv().is_err() {
        let crate_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(crate_env);
    }
    tracing_subscriber::fmt().with_target(false).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::MigrateRun => {
            let pool = get_pool().await?;
            let migrator = get_migrator().await?;
            migrator.run(&pool).await?;
            println!("Migrations applied");
        }
        Commands::MigrateStatus => {
            let pool = get_pool().await?;
            let migrator = get_migrator().await?;
            print_status(&pool, &migrator).await?;
        }
        Commands::CreateUser {
            username,
            full_name,
            email,
            password,
        } => {
            let (state, listener) = get_state().await?;
            let user = state
                .auth
                .provision_user(ProvisionUserRequest {
                    username,
                    full_name,
                    email,
                    password,
                })
                .await?;
            println!("Created user {} ({})", user.username, user.id);
            finish(state, listener).await?;
        }
        Commands::AssignRole { username, role } => {
            let (state, listener) = get_state().await?;
            let user = state
                .auth
                .get_user_by_username(&username)
                .await?
                .with_context(|| format!("no user named {username}"))?;
            let role = state
                .rbac
                .get_role_by_name(&role)
                .await?
                .with_context(|| format!("no role named {role}"))?;
            state.rbac.assign_role_to_user(user.id, role.id, user.id).await?;
            println!("Assigned {} to {}", role.name, user.username);
            finish(state, listener).await?;
        }
        Commands::DeactivateUser { username } => {
            let (state, listener) = get_state().await?;
            let user = state
                .auth
                .get_user_by_username(&username)
                .await?
                .with_context(|| format!("no user named {username}"))?;
            state.auth.deactivate_user(user.id, None).await?;
            println!("Deactivated {}", user.username);
            finish(state, listener).await?;
        }
        Commands::SweepOnce => {
            let (state, listener) = get_state().await?;
            let interval = state.config.sweep_interval.unwrap_or(Duration::from_secs(300));
            let result = EscalationSweeper::new(state.workflows.clone(), interval).run_once().await?;
            println!("{}", result.message);
            for id in &result.escalated_workflow_ids {
                println!("  {id}");
            }
            finish(state, listener).await?;
        }
    }

    Ok(())
}

async fn get_pool() -> anyhow::Result<SqlitePool> {
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL not set")?;
    SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to database")
}

async fn get_state() -> anyhow::Result<(AppState, JoinHandle<()>)> {
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL not set")?;
    let pool = dual_control::db::init(&database_url).await?;
    let config = AppConfig::from_env()?;
    Ok(AppState::bootstrap_with_listener(pool, config)?)
}

/// Drops the state so the audit listener sees the bus close, then waits for
/// it to persist what was emitted.
async fn finish(state: AppState, listener: JoinHandle<()>) -> anyhow::Result<()> {
    drop(state);
    listener.await.context("audit listener panicked")
}

async fn print_status(pool: &SqlitePool, migrator: &sqlx::migrate::Migrator) -> anyhow::Result<()> {
    let has_table = sqlx::query("SELECT name FROM sqlite_master WHERE type='table' AND name='_sqlx_migrations'")
        .fetch_optional(pool)
        .await?;
    let applied_versions: HashSet<i64> = if has_table.is_some() {
        let rows = sqlx::query("SELECT version FROM _sqlx_migrations WHERE success = 1")
            .fetch_all(pool)
            .await?;
        rows.iter().filter_map(|row| row.try_get::<i64, _>("version").ok()).collect()
    } else {
        HashSet::new()
    };

    println!("{:<8} {:<20} {}", "Status", "Version", "Name");
    for migration in migrator.iter() {
        let status = if applied_versions.contains(&migration.version) {
            "applied"
        } else {
            "pending"
        };
        let desc = migration.description.as_ref().trim();
        let name = if desc.is_empty() { "unknown" } else { desc };
        println!("{:<8} {:<20} {}", status, migration.version, name);
    }

    Ok(())
}

async fn get_migrator() -> anyhow::Result<sqlx::migrate::Migrator> {
    let local = Path::new("./migrations");
    let migrator_path = if local.exists() {
        local.to_path_buf()
    } else {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations")
    };

    let display = migrator_path.display().to_string();
    sqlx::migrate::Migrator::new(migrator_path)
        .await
        .with_context(|| format!("failed to load migrations from {display}"))
}
