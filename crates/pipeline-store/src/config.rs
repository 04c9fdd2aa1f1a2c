//! Connection configuration loaded from environment variables.
//! Follows the `DATABASE_URL` convention plus optional pool sizing.

use std::env;
use once_cell::sync::Lazy;
use dotenvy::dotenv;

// Lazily loads the .env file exactly once.
static DOTENV_LOADED: Lazy<()> = Lazy::new(|| {
    let _ = dotenv(); // ignore error if no .env file is present
});

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub url: String,
    pub min_connections: u32,
    pub max_connections: u32,
}

impl DbConfig {
    pub fn from_env() -> Self {
    // ensure .env has been loaded
    Lazy::force(&DOTENV_LOADED);
        let url = env::var("DATABASE_URL").expect("DATABASE_URL not set");
        let min_connections = env::var("DATABASE_MIN_CONNECTIONS").ok().and_then(|v| v.parse().ok()).unwrap_or(2);
        let max_connections = env::var("DATABASE_MAX_CONNECTIONS").ok().and_then(|v| v.parse().ok()).unwrap_or(16);
        Self { url, min_connections, max_connections }
    }
}

/// Forces early loading of .env from external applications, if desired.
pub fn init_dotenv() { Lazy::force(&DOTENV_LOADED); }
