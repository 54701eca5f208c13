use serde::Deserialize;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Listen host (default: 0.0.0.0)
    pub server_host: String,

    /// Listen port (default: 8080)
    pub server_port: u16,

    /// Static asset directory (default: ./assets)
    pub static_dir: String,

    /// Binary cache snapshot path (default: ./build/static_cache.bin)
    pub static_cache_file: String,

    /// URL prefix under which assets are served (default: /assets/)
    pub static_url_prefix: String,

    /// Environment: development, production, test
    pub environment: String,
}

impl Config {
    /// Load configuration from environment variables (with .env support).
    pub fn from_env() -> Self {
        // Load .env file if present (ignore errors if missing)
        let _ = dotenvy::dotenv();

        Config {
            server_host: std::env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            server_port: std::env::var("SERVER_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .unwrap_or(8080),
            static_dir: std::env::var("STATIC_DIR").unwrap_or_else(|_| "./assets".to_string()),
            static_cache_file: std::env::var("STATIC_CACHE_FILE")
                .unwrap_or_else(|_| "./build/static_cache.bin".to_string()),
            static_url_prefix: std::env::var("STATIC_URL_PREFIX")
                .unwrap_or_else(|_| "/assets/".to_string()),
            environment: std::env::var("ENVIRONMENT")
                .unwrap_or_else(|_| "development".to_string()),
        }
    }

    /// Check if running in development mode.
    pub fn is_dev(&self) -> bool {
        self.environment == "development"
    }

    /// Get the full server address.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}
