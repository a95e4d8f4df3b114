//! Idempotent MySQL schema initializer.
//!
//! CREATE TABLE IF NOT EXISTS plus guarded CREATE INDEX: MySQL has no
//! CREATE INDEX IF NOT EXISTS, so each index is checked against
//! information_schema first. Safe to run on every startup.

use anyhow::Result;
use sqlx::MySqlPool;

const TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS processed_emails (
        id BIGINT NOT NULL PRIMARY KEY AUTO_INCREMENT,
        token VARCHAR(255) NOT NULL UNIQUE,
        hospital_name VARCHAR(255),
        email_date DATETIME,
        processed_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
    ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS negative_sentiments (
        id BIGINT NOT NULL PRIMARY KEY AUTO_INCREMENT,
        sentiment_id VARCHAR(255) NOT NULL,
        event_id BIGINT,
        hospital_name VARCHAR(255),
        title TEXT,
        source VARCHAR(255),
        content LONGTEXT,
        reason TEXT,
        severity VARCHAR(20) NOT NULL DEFAULT 'low',
        url TEXT,
        status VARCHAR(20) NOT NULL DEFAULT 'active',
        is_duplicate TINYINT(1) NOT NULL DEFAULT 0,
        dismissed_at DATETIME,
        insight_text LONGTEXT,
        insight_at DATETIME,
        processed_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
    ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS event_groups (
        id BIGINT NOT NULL PRIMARY KEY AUTO_INCREMENT,
        hospital_name VARCHAR(255) NOT NULL,
        fingerprint BIGINT UNSIGNED NOT NULL,
        event_url VARCHAR(1024),
        total_count BIGINT NOT NULL DEFAULT 1,
        last_title TEXT,
        last_reason TEXT,
        last_source VARCHAR(255),
        last_severity VARCHAR(20) NOT NULL DEFAULT 'low',
        last_sentiment_id VARCHAR(255),
        created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
        last_seen_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
    ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sentiment_feedback (
        id BIGINT NOT NULL PRIMARY KEY AUTO_INCREMENT,
        sentiment_id VARCHAR(255) NOT NULL,
        feedback_judgment TINYINT(1) NOT NULL,
        feedback_type VARCHAR(50),
        feedback_text TEXT,
        user_id VARCHAR(255),
        feedback_time DATETIME,
        created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
    ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS feedback_queue (
        id BIGINT NOT NULL PRIMARY KEY AUTO_INCREMENT,
        sentiment_id VARCHAR(255) NOT NULL,
        user_id VARCHAR(255),
        sent_time DATETIME,
        status VARCHAR(20) NOT NULL DEFAULT 'pending',
        created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
    ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS feedback_rules (
        id BIGINT NOT NULL PRIMARY KEY AUTO_INCREMENT,
        pattern TEXT NOT NULL,
        rule_type VARCHAR(20) NOT NULL DEFAULT 'keyword',
        action VARCHAR(20) NOT NULL DEFAULT 'suppress',
        confidence DOUBLE NOT NULL DEFAULT 0.5,
        enabled TINYINT(1) NOT NULL DEFAULT 1,
        source_feedback_id BIGINT,
        created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
    ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS suppress_keywords (
        id BIGINT NOT NULL PRIMARY KEY AUTO_INCREMENT,
        keyword VARCHAR(255) NOT NULL UNIQUE,
        created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
    ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4
    "#,
];

/// (table, index name, definition). event_url uses a 191-char prefix:
/// utf8mb4 at 1024 chars would exceed the InnoDB key-length limit.
const INDEXES: &[(&str, &str, &str)] = &[
    (
        "negative_sentiments",
        "idx_negative_sentiments_processed_at",
        "CREATE INDEX idx_negative_sentiments_processed_at ON negative_sentiments (processed_at)",
    ),
    (
        "negative_sentiments",
        "idx_negative_sentiments_status",
        "CREATE INDEX idx_negative_sentiments_status ON negative_sentiments (status)",
    ),
    (
        "negative_sentiments",
        "idx_negative_sentiments_hospital",
        "CREATE INDEX idx_negative_sentiments_hospital ON negative_sentiments (hospital_name)",
    ),
    (
        "negative_sentiments",
        "idx_negative_sentiments_sentiment_id",
        "CREATE INDEX idx_negative_sentiments_sentiment_id ON negative_sentiments (sentiment_id)",
    ),
    (
        "negative_sentiments",
        "idx_negative_sentiments_event_id",
        "CREATE INDEX idx_negative_sentiments_event_id ON negative_sentiments (event_id)",
    ),
    (
        "feedback_queue",
        "idx_feedback_queue_user_status",
        "CREATE INDEX idx_feedback_queue_user_status ON feedback_queue (user_id, status, sent_time)",
    ),
    (
        "event_groups",
        "idx_event_groups_hospital_time",
        "CREATE INDEX idx_event_groups_hospital_time ON event_groups (hospital_name, last_seen_at)",
    ),
    (
        "event_groups",
        "idx_event_groups_fingerprint",
        "CREATE INDEX idx_event_groups_fingerprint ON event_groups (fingerprint)",
    ),
    (
        "event_groups",
        "idx_event_groups_url",
        "CREATE INDEX idx_event_groups_url ON event_groups (event_url(191))",
    ),
];

/// Create all tables and indexes if missing.
pub async fn ensure_schema(pool: &MySqlPool) -> Result<()> {
    for ddl in TABLES {
        sqlx::query(ddl).execute(pool).await?;
    }

    for (table, index, ddl) in INDEXES {
        if !index_exists(pool, table, index).await? {
            sqlx::query(ddl).execute(pool).await?;
        }
    }

    Ok(())
}

async fn index_exists(pool: &MySqlPool, table: &str, index: &str) -> Result<bool> {
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM information_schema.statistics
        WHERE table_schema = DATABASE()
          AND table_name = ?
          AND index_name = ?
        "#,
    )
    .bind(table)
    .bind(index)
    .fetch_one(pool)
    .await?;
    Ok(count > 0)
}

/// Seed the admin suppress-keyword table from configuration, but only when
/// the table is empty so admin deletions survive restarts.
pub async fn seed_suppress_keywords(pool: &MySqlPool, keywords: &[String]) -> Result<()> {
    if keywords.is_empty() {
        return Ok(());
    }
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM suppress_keywords")
        .fetch_one(pool)
        .await?;
    if count > 0 {
        return Ok(());
    }
    for keyword in keywords {
        let trimmed = keyword.trim();
        if trimmed.is_empty() {
            continue;
        }
        sqlx::query("INSERT IGNORE INTO suppress_keywords (keyword) VALUES (?)")
            .bind(trimmed)
            .execute(pool)
            .await?;
    }
    Ok(())
}
