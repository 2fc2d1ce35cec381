use std::time::Duration;

use clap::Args;

use crate::postgresimpl::DEFAULT_TABLE;

#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    #[arg(long, env = "POSTGRES_HOST", default_value = "localhost")]
    pub postgres_host: String,

    #[arg(long, env = "POSTGRES_PORT", default_value_t = 5432)]
    pub postgres_port: u16,

    #[arg(long, env = "POSTGRES_USER", default_value = "postgres")]
    pub postgres_user: String,

    #[arg(long, env = "POSTGRES_PASSWORD", default_value = "postgres", hide_env_values = true)]
    pub postgres_password: String,

    #[arg(long, env = "POSTGRES_DB", default_value = "clientdb")]
    pub postgres_db: String,

    #[arg(long, env = "STORE_TABLE", default_value = DEFAULT_TABLE)]
    pub store_table: String,

    #[arg(long, env = "POSTGRES_CONNECT_TIMEOUT_SECS", default_value_t = 10)]
    pub postgres_connect_timeout_secs: u64,
}

impl StoreArgs {
    pub fn pg_config(&self) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.postgres_host)
            .port(self.postgres_port)
            .user(&self.postgres_user)
            .password(&self.postgres_password)
            .dbname(&self.postgres_db)
            .application_name("persistence-consumer")
            .connect_timeout(Duration::from_secs(self.postgres_connect_timeout_secs));
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        store: StoreArgs,
    }

    #[test]
    fn builds_a_connection_config() {
        let cli = Cli::try_parse_from([
            "consumer",
            "--postgres-host",
            "db.internal",
            "--postgres-port",
            "6543",
            "--postgres-db",
            "telemetry",
        ])
        .unwrap();
        let cfg = cli.store.pg_config();

        assert_eq!(cfg.get_ports(), &[6543]);
        assert_eq!(cfg.get_dbname(), Some("telemetry"));
        assert_eq!(
            cfg.get_hosts(),
            &[tokio_postgres::config::Host::Tcp("db.internal".to_string())]
        );
    }
}
