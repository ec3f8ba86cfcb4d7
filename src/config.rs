use std::env;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub port: u16,
    pub database_url: String,
    /// Shared secret for verifying e-signature callbacks. Empty skips
    /// verification and is only acceptable in development.
    pub webhook_shared_secret: String,
    pub signwell_base_url: String,
    pub signwell_api_key: String,
    pub signwell_template_id: String,
    pub resend_api_key: String,
    pub email_from: String,
    pub cors_origins: Vec<String>,
    pub app_url: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            port: env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3000),
            database_url: env::var("DATABASE_URL").unwrap_or_else(|_| "slotbook.db".to_string()),
            webhook_shared_secret: env::var("WEBHOOK_SHARED_SECRET").unwrap_or_default(),
            signwell_base_url: env::var("SIGNWELL_BASE_URL")
                .unwrap_or_else(|_| "https://www.signwell.com/api/v1".to_string()),
            signwell_api_key: env::var("SIGNWELL_API_KEY").unwrap_or_default(),
            signwell_template_id: env::var("SIGNWELL_TEMPLATE_ID").unwrap_or_default(),
            resend_api_key: env::var("RESEND_API_KEY").unwrap_or_default(),
            email_from: env::var("EMAIL_FROM").unwrap_or_else(|_| "bookings@localhost".to_string()),
            cors_origins: env::var("CORS_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            app_url: env::var("APP_URL").unwrap_or_else(|_| "http://localhost:3000".to_string()),
        }
    }
}
