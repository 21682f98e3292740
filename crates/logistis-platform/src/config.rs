use anyhow::{Context, Result};

#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub database_url: String,
    pub http_addr: String,
    pub backup_dir: String,
    pub db_max_connections: u32,
}

impl ServiceConfig {
    pub fn from_env(default_http_addr: &str) -> Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL is required")?;
        let http_addr =
            std::env::var("HTTP_ADDR").unwrap_or_else(|_| default_http_addr.to_string());
        let backup_dir = std::env::var("BACKUP_DIR").unwrap_or_else(|_| "./backups".to_string());
        let db_max_connections =
            parse_max_connections(std::env::var("DB_MAX_CONNECTIONS").ok())?;

        Ok(Self {
            database_url,
            http_addr,
            backup_dir,
            db_max_connections,
        })
    }

    pub fn worker_from_env() -> Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL is required")?;
        let db_max_connections =
            parse_max_connections(std::env::var("DB_MAX_CONNECTIONS").ok())?;

        Ok(Self {
            database_url,
            http_addr: String::new(),
            backup_dir: String::new(),
            db_max_connections,
        })
    }
}

fn parse_max_connections(raw: Option<String>) -> Result<u32> {
    match raw {
        Some(value) => {
            let parsed: u32 = value
                .trim()
                .parse()
                .context("DB_MAX_CONNECTIONS must be a positive integer")?;
            if parsed == 0 {
                anyhow::bail!("DB_MAX_CONNECTIONS must be at least 1");
            }
            Ok(parsed)
        }
        None => Ok(10),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_connections_defaults_to_ten_and_rejects_junk() {
        assert_eq!(parse_max_connections(None).unwrap(), 10);
        assert_eq!(parse_max_connections(Some(" 25 ".to_string())).unwrap(), 25);
        assert!(parse_max_connections(Some("0".to_string())).is_err());
        assert!(parse_max_connections(Some("many".to_string())).is_err());
    }
}
