use clap::{ArgAction, Parser};
use sqlx::mysql::MySqlConnectOptions;

/// `MYSQL_READONLY` is only honoured when it is exactly `true`.
fn parse_switch(value: &str) -> Result<bool, String> {
    Ok(value == "true")
}

/// Connection settings, read once at startup. Flags win over environment.
#[derive(Parser, Debug, Clone)]
#[command(name = "mysql-stdio-server", version, about = "MySQL tool backend speaking JSON lines over stdio")]
pub struct Config {
    #[arg(long, env = "MYSQL_HOST", default_value = "localhost")]
    pub host: String,

    #[arg(long, env = "MYSQL_PORT", default_value_t = 3306)]
    pub port: u16,

    #[arg(long, env = "MYSQL_USER", default_value = "root")]
    pub user: String,

    #[arg(long, env = "MYSQL_PASSWORD", default_value = "", hide_env_values = true)]
    pub password: String,

    #[arg(long, env = "MYSQL_DATABASE", default_value = "test")]
    pub database: String,

    /// Restrict `query` to SELECT statements
    #[arg(
        long,
        env = "MYSQL_READONLY",
        action = ArgAction::Set,
        default_value = "false",
        value_parser = parse_switch
    )]
    pub readonly: bool,
}

impl Config {
    pub fn connect_options(&self) -> MySqlConnectOptions {
        MySqlConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.database)
    }

    /// One-line description safe for logs (no password).
    pub fn summary(&self) -> String {
        format!(
            "host={}, port={}, user={}, database={}, readonly={}",
            self.host, self.port, self.user, self.database, self.readonly
        )
    }
}
