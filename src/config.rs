use std::{env, path::PathBuf};

pub const DEFAULT_GRAPH_API_BASE: &str = "https://graph.facebook.com/v21.0";
pub const DEFAULT_OPENAI_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub database_url: String,
    pub store: StoreBackend,
    pub media_storage_dir: PathBuf,
    pub public_base_url: String,
    pub graph_api_base: String,
    pub openai_api_key: String,
    pub openai_base_url: String,
    pub openai_model: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let port = env::var("PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(4000);
        let store = match env::var("STORE").unwrap_or_default().trim() {
            "memory" => StoreBackend::Memory,
            _ => StoreBackend::Postgres,
        };
        let public_base_url = env::var("API_PUBLIC_URL")
            .unwrap_or_else(|_| format!("http://localhost:{port}"))
            .trim_end_matches('/')
            .to_string();

        Self {
            port,
            database_url: resolve_database_url(),
            store,
            media_storage_dir: env::var("MEDIA_STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./media_uploads")),
            public_base_url,
            graph_api_base: env_or("GRAPH_API_BASE", DEFAULT_GRAPH_API_BASE),
            openai_api_key: env::var("OPENAI_API_KEY").unwrap_or_default(),
            openai_base_url: env_or("OPENAI_BASE_URL", DEFAULT_OPENAI_BASE),
            openai_model: env_or("OPENAI_MODEL", DEFAULT_OPENAI_MODEL),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 4000,
            database_url: String::new(),
            store: StoreBackend::Memory,
            media_storage_dir: PathBuf::from("./media_uploads"),
            public_base_url: "http://localhost:4000".to_string(),
            graph_api_base: DEFAULT_GRAPH_API_BASE.to_string(),
            openai_api_key: String::new(),
            openai_base_url: DEFAULT_OPENAI_BASE.to_string(),
            openai_model: DEFAULT_OPENAI_MODEL.to_string(),
        }
    }
}

fn env_or(key: &str, fallback: &str) -> String {
    env::var(key)
        .ok()
        .map(|v| v.trim().trim_end_matches('/').to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

fn resolve_database_url() -> String {
    if let Ok(url) = env::var("DATABASE_URL") {
        if !url.trim().is_empty() {
            return url;
        }
    }
    let host = env::var("POSTGRES_HOST")
        .or_else(|_| env::var("PGHOST"))
        .unwrap_or_else(|_| "localhost".to_string());
    let port = env::var("POSTGRES_PORT")
        .or_else(|_| env::var("PGPORT"))
        .unwrap_or_else(|_| "5432".to_string());
    let user = env::var("POSTGRES_USER")
        .or_else(|_| env::var("PGUSER"))
        .unwrap_or_else(|_| "postgres".to_string());
    let password = env::var("POSTGRES_PASSWORD")
        .or_else(|_| env::var("PGPASSWORD"))
        .unwrap_or_else(|_| "postgres".to_string());
    let db = env::var("POSTGRES_DB")
        .or_else(|_| env::var("PGDATABASE"))
        .unwrap_or_else(|_| "inbox".to_string());
    format!("postgres://{user}:{password}@{host}:{port}/{db}")
}
