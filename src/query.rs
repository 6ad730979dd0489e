use std::future::Future;
use std::time::Duration;

use log::debug;

use crate::{driver_mysql, driver_postgres};
use crate::errors::QueryError;
use crate::models::enums::{DatabasePool, DatabaseType, StatementKind};
use crate::models::structs::QueryResult;

/// Result of [`run`](crate::connection::OpenConnection::run).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StatementOutcome {
    Rows(QueryResult),
    Affected(u64),
}

impl DatabasePool {
    pub fn engine(&self) -> DatabaseType {
        match self {
            DatabasePool::MySQL(_) => DatabaseType::MySQL,
            DatabasePool::PostgreSQL(_) => DatabaseType::PostgreSQL,
        }
    }

    pub async fn ping(&self) -> Result<(), String> {
        match self {
            DatabasePool::MySQL(pool) => driver_mysql::ping(pool).await.map_err(|e| e.to_string()),
            DatabasePool::PostgreSQL(pool) => {
                pool.ping().await.map_err(|e| driver_postgres::describe(&e))
            }
        }
    }

    pub async fn query(&self, sql: &str) -> Result<QueryResult, String> {
        match self {
            DatabasePool::MySQL(pool) => driver_mysql::query(pool, sql).await.map_err(|e| e.to_string()),
            DatabasePool::PostgreSQL(pool) => {
                pool.query(sql).await.map_err(|e| driver_postgres::describe(&e))
            }
        }
    }

    pub async fn exec(&self, sql: &str) -> Result<u64, String> {
        match self {
            DatabasePool::MySQL(pool) => driver_mysql::exec(pool, sql).await.map_err(|e| e.to_string()),
            DatabasePool::PostgreSQL(pool) => {
                pool.exec(sql).await.map_err(|e| driver_postgres::describe(&e))
            }
        }
    }

    pub async fn close(&self) {
        match self {
            DatabasePool::MySQL(pool) => pool.close().await,
            DatabasePool::PostgreSQL(pool) => pool.close().await,
        }
    }
}

/// Run `fut` with a deadline, mapping both failure modes to [`QueryError`].
pub async fn with_deadline<T>(
    deadline: Duration,
    fut: impl Future<Output = Result<T, String>>,
) -> Result<T, QueryError> {
    match tokio::time::timeout(deadline, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(QueryError::Database(e)),
        Err(_) => {
            debug!("Operation exceeded {:?}", deadline);
            Err(QueryError::Timeout(deadline))
        }
    }
}

/// Whether `sql` produces a result set. Leading comments and whitespace are
/// skipped; anything unrecognised is a command.
pub fn classify(sql: &str) -> StatementKind {
    let keyword: String = strip_leading_comments(sql)
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_uppercase();
    match keyword.as_str() {
        "SELECT" | "SHOW" | "DESC" | "DESCRIBE" | "EXPLAIN" | "WITH" | "VALUES" | "TABLE" => {
            StatementKind::Rows
        }
        _ => StatementKind::Command,
    }
}

fn strip_leading_comments(sql: &str) -> &str {
    let mut rest = sql.trim_start();
    loop {
        if let Some(after) = rest.strip_prefix("--").or_else(|| rest.strip_prefix('#')) {
            rest = after.split_once('\n').map(|(_, tail)| tail).unwrap_or("").trim_start();
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.split_once("*/").map(|(_, tail)| tail).unwrap_or("").trim_start();
        } else {
            return rest;
        }
    }
}

/// Catalog statement for the listing shown after connecting.
pub fn catalog_statement(engine: DatabaseType, has_database: bool) -> &'static str {
    match (engine, has_database) {
        (DatabaseType::MySQL, false) => "SHOW DATABASES",
        (DatabaseType::MySQL, true) => "SHOW TABLES",
        (DatabaseType::PostgreSQL, _) => {
            "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = 'public' AND table_type = 'BASE TABLE' \
             ORDER BY table_name"
        }
    }
}

/// Backtick-quote a MySQL identifier.
pub fn quote_mysql_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(classify("select 1"), StatementKind::Rows);
        assert_eq!(classify("  SHOW TABLES"), StatementKind::Rows);
        assert_eq!(classify("-- note\nWITH x AS (SELECT 1) SELECT * FROM x"), StatementKind::Rows);
        assert_eq!(classify("/* hint */ describe users"), StatementKind::Rows);
        assert_eq!(classify("# mysql comment\nexplain select 1"), StatementKind::Rows);
        assert_eq!(classify("UPDATE t SET a = 1"), StatementKind::Command);
        assert_eq!(classify("insert into t values (1)"), StatementKind::Command);
        assert_eq!(classify(""), StatementKind::Command);
        assert_eq!(classify("/* unterminated"), StatementKind::Command);
    }

    #[test]
    fn test_catalog_statement() {
        assert_eq!(catalog_statement(DatabaseType::MySQL, false), "SHOW DATABASES");
        assert_eq!(catalog_statement(DatabaseType::MySQL, true), "SHOW TABLES");
        assert!(catalog_statement(DatabaseType::PostgreSQL, false).contains("'public'"));
    }

    #[test]
    fn test_quote_mysql_identifier() {
        assert_eq!(quote_mysql_identifier("shop"), "`shop`");
        assert_eq!(quote_mysql_identifier("we`ird"), "`we``ird`");
    }

    #[tokio::test]
    async fn test_with_deadline_maps_errors() {
        let ok = with_deadline(Duration::from_secs(1), async { Ok::<_, String>(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        let failed = with_deadline(Duration::from_secs(1), async { Err::<(), _>("boom".to_string()) }).await;
        assert!(matches!(failed, Err(QueryError::Database(msg)) if msg == "boom"));

        let slow = with_deadline(Duration::from_millis(20), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, String>(())
        })
        .await;
        assert!(matches!(slow, Err(QueryError::Timeout(_))));
    }
}
