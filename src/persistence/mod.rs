//! Persistence Layer
//!
//! SQLite storage for trade records via sqlx, plus an in-memory store with
//! the same `TradeStore` contract.
//!
//! # Database Schema
//!
//! ## Trades Table
//! - id: autoincrement trade ID
//! - symbol, quantity, requested_entry_price, stop_loss, target, strategy_id
//! - entry_order_id: broker order ID of the entry leg (unique, opaque text)
//! - entry_order_status: PENDING | COMPLETED | REJECTED | CANCELLED
//! - entry_fill_price / entry_fill_time: broker-confirmed fill
//! - exit_order_id / exit_order_status / exit_fill_price / exit_fill_time / exit_reason
//! - position_state: ENTRY_PENDING | ENTRY_FILLED | EXIT_PENDING | EXIT_FILLED | CANCELLED
//! - created_at / updated_at

pub mod memory;
pub mod models;
pub mod repository;

pub use memory::InMemoryTradeStore;
pub use repository::SqliteTradeStore;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::ConnectOptions;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// Database connection pool
pub type DbPool = SqlitePool;

/// Database initialization error
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Database connection error: {0}")]
    ConnectionError(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    MigrationError(String),
}

/// Open the pool and create the schema.
///
/// `database_url` is a sqlx SQLite URL such as `sqlite://data/tradegate.db`
/// or `sqlite::memory:`.
pub async fn init_database(database_url: &str) -> Result<DbPool, DatabaseError> {
    init_database_with(&DatabaseConfig {
        url: database_url.to_string(),
        ..DatabaseConfig::default()
    })
    .await
}

pub async fn init_database_with(config: &DatabaseConfig) -> Result<DbPool, DatabaseError> {
    info!("Initializing database: {}", config.url);

    if let Some(db_path) = config.url.strip_prefix("sqlite://") {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DatabaseError::ConnectionError(sqlx::Error::Configuration(Box::new(e)))
                })?;
            }
        }
    }

    let options = SqliteConnectOptions::from_str(&config.url)?.create_if_missing(true);
    let options = if config.log_queries {
        options.log_statements(tracing::log::LevelFilter::Debug)
    } else {
        options.disable_statement_logging()
    };

    // An in-memory database lives per connection, so keep a single one.
    let max_connections = if config.url.contains(":memory:") {
        1
    } else {
        config.max_connections
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;

    info!("Database initialized");

    Ok(pool)
}

async fn run_migrations(pool: &DbPool) -> Result<(), DatabaseError> {
    info!("Running database migrations...");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS trades (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            symbol TEXT NOT NULL,
            quantity INTEGER NOT NULL CHECK(quantity >= 0),
            requested_entry_price REAL NOT NULL,
            stop_loss REAL NOT NULL,
            target REAL,
            strategy_id TEXT NOT NULL DEFAULT '',
            entry_order_id TEXT NOT NULL UNIQUE,
            entry_order_status TEXT NOT NULL
                CHECK(entry_order_status IN ('PENDING', 'COMPLETED', 'REJECTED', 'CANCELLED')),
            entry_fill_price REAL,
            entry_fill_time DATETIME,
            exit_order_id TEXT,
            exit_order_status TEXT
                CHECK(exit_order_status IS NULL
                      OR exit_order_status IN ('PENDING', 'COMPLETED', 'REJECTED', 'CANCELLED')),
            exit_fill_price REAL,
            exit_fill_time DATETIME,
            exit_reason TEXT,
            position_state TEXT NOT NULL
                CHECK(position_state IN ('ENTRY_PENDING', 'ENTRY_FILLED', 'EXIT_PENDING', 'EXIT_FILLED', 'CANCELLED')),
            created_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| DatabaseError::MigrationError(format!("Failed to create trades table: {}", e)))?;

    for (name, ddl) in [
        (
            "idx_trades_position_state",
            "CREATE INDEX IF NOT EXISTS idx_trades_position_state ON trades(position_state)",
        ),
        (
            "idx_trades_exit_order_id",
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_trades_exit_order_id \
             ON trades(exit_order_id) WHERE exit_order_id IS NOT NULL",
        ),
        (
            "idx_trades_exit_fill_time",
            "CREATE INDEX IF NOT EXISTS idx_trades_exit_fill_time ON trades(exit_fill_time)",
        ),
    ] {
        sqlx::query(ddl).execute(pool).await.map_err(|e| {
            DatabaseError::MigrationError(format!("Failed to create index {}: {}", name, e))
        })?;
    }

    info!("Database migrations completed");

    Ok(())
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Database URL (e.g., "sqlite://data/tradegate.db")
    pub url: String,

    /// Maximum number of connections in the pool
    pub max_connections: u32,

    /// Log every statement at debug level
    pub log_queries: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://data/tradegate.db".to_string(),
            max_connections: 5,
            log_queries: cfg!(debug_assertions),
        }
    }
}

impl DatabaseConfig {
    /// Pool settings from the environment; the URL comes from the gatekeeper config.
    pub fn from_env(url: impl Into<String>) -> Self {
        let max_connections = std::env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5);

        let log_queries = std::env::var("DATABASE_LOG_QUERIES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(cfg!(debug_assertions));

        Self {
            url: url.into(),
            max_connections,
            log_queries,
        }
    }
}
