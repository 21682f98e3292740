use anyhow::Result;
use chrono::Utc;
use sqlx::Row;
use tracing::{info, warn};
use uuid::Uuid;

use logistis_platform::{ServiceConfig, connect_database};

/// Marks every open obligation whose deadline has passed as overdue.
/// Intended to run once a day from cron or a container scheduler.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "logistis_ops=info".to_string()),
        )
        .init();

    let config = ServiceConfig::worker_from_env()?;
    let pool = connect_database(&config.database_url, config.db_max_connections).await?;

    let today = Utc::now().date_naive();
    let mut tx = pool.begin().await?;

    let rows = sqlx::query(
        r#"
        UPDATE obligations o
        SET status = 'overdue', updated_at = NOW()
        FROM clients c, obligation_types t
        WHERE c.id = o.client_id
          AND t.id = o.obligation_type_id
          AND o.status IN ('pending', 'in_progress')
          AND o.deadline < $1
        RETURNING o.id, c.afm, t.code, o.deadline
        "#,
    )
    .bind(today)
    .fetch_all(&mut *tx)
    .await?;

    for row in &rows {
        let id: Uuid = row.try_get("id")?;
        let afm: String = row.try_get("afm")?;
        let code: String = row.try_get("code")?;
        let deadline: chrono::NaiveDate = row.try_get("deadline")?;
        warn!("obligation {id} ({code} for {afm}) overdue since {deadline}");
    }

    tx.commit().await?;
    info!("overdue sweep complete: {} obligations marked", rows.len());

    Ok(())
}
