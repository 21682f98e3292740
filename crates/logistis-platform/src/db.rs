use anyhow::Result;
use sqlx::{PgPool, postgres::PgPoolOptions};

pub async fn connect_database(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;

    Ok(pool)
}
