use anyhow::{Context, Result};
use dotenvy::dotenv;
use secrecy::Secret;
use serde::Deserialize;
use std::env;

/// Service configuration, built once at startup.
///
/// Gateway credentials are required: a missing secret is a startup error,
/// never a per-request one.
#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub daraja: DarajaConfig,
    pub reconciliation: ReconciliationConfig,
    pub service_name: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Deserialize, Clone, Debug)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub db_name: String,
}

/// M-Pesa Daraja gateway settings.
#[derive(Deserialize, Clone, Debug)]
pub struct DarajaConfig {
    /// Gateway base URL (sandbox or production).
    pub api_base_url: String,
    pub consumer_key: String,
    pub consumer_secret: Secret<String>,
    /// Merchant paybill/till shortcode.
    pub shortcode: String,
    /// Passkey used to derive the per-request STK password.
    pub passkey: Secret<String>,
    /// Public base URL the gateway posts callbacks to.
    pub callback_base_url: String,
    /// Shared secret embedded in the callback URL path; the callback
    /// receiver rejects requests that do not carry it.
    pub callback_token: Secret<String>,
    /// Timeout for each outbound gateway call, in seconds.
    pub http_timeout_secs: u64,
}

#[derive(Deserialize, Clone, Debug)]
pub struct ReconciliationConfig {
    pub enabled: bool,
    /// Seconds between sweeps.
    pub interval_secs: u64,
    /// How long an attempt may stay pending before the sweeper queries the
    /// gateway for its outcome.
    pub pending_deadline_secs: i64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let host = env::var("PAYMENT_SERVICE_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("PAYMENT_SERVICE_PORT")
            .unwrap_or_else(|_| "3003".to_string())
            .parse()?;

        let db_url =
            env::var("PAYMENT_DATABASE_URL").context("PAYMENT_DATABASE_URL must be set")?;
        let db_name =
            env::var("PAYMENT_DATABASE_NAME").unwrap_or_else(|_| "payment_db".to_string());

        let api_base_url = env::var("MPESA_API_BASE_URL")
            .unwrap_or_else(|_| "https://sandbox.safaricom.co.ke".to_string());
        let consumer_key = env::var("MPESA_CONSUMER_KEY").context("MPESA_CONSUMER_KEY must be set")?;
        let consumer_secret =
            env::var("MPESA_CONSUMER_SECRET").context("MPESA_CONSUMER_SECRET must be set")?;
        let shortcode = env::var("MPESA_SHORTCODE").context("MPESA_SHORTCODE must be set")?;
        let passkey = env::var("MPESA_PASSKEY").context("MPESA_PASSKEY must be set")?;
        let callback_base_url =
            env::var("MPESA_CALLBACK_BASE_URL").context("MPESA_CALLBACK_BASE_URL must be set")?;
        let callback_token =
            env::var("MPESA_CALLBACK_TOKEN").context("MPESA_CALLBACK_TOKEN must be set")?;
        let http_timeout_secs = env::var("MPESA_HTTP_TIMEOUT_SECS")
            .unwrap_or_else(|_| "8".to_string())
            .parse()?;

        let reconciliation_enabled = env::var("RECONCILIATION_ENABLED")
            .unwrap_or_else(|_| "true".to_string())
            .parse()
            .unwrap_or(true);
        let interval_secs = env::var("RECONCILIATION_INTERVAL_SECS")
            .unwrap_or_else(|_| "60".to_string())
            .parse()?;
        let pending_deadline_secs = env::var("RECONCILIATION_PENDING_DEADLINE_SECS")
            .unwrap_or_else(|_| "300".to_string())
            .parse()?;

        Ok(Self {
            server: ServerConfig { host, port },
            database: DatabaseConfig {
                url: Secret::new(db_url),
                db_name,
            },
            daraja: DarajaConfig {
                api_base_url,
                consumer_key,
                consumer_secret: Secret::new(consumer_secret),
                shortcode,
                passkey: Secret::new(passkey),
                callback_base_url,
                callback_token: Secret::new(callback_token),
                http_timeout_secs,
            },
            reconciliation: ReconciliationConfig {
                enabled: reconciliation_enabled,
                interval_secs,
                pending_deadline_secs,
            },
            service_name: "payment-service".to_string(),
        })
    }
}

impl DarajaConfig {
    /// Full callback URL registered with each STK push, carrying the shared
    /// secret as its final path segment.
    pub fn callback_url(&self) -> String {
        use secrecy::ExposeSecret;
        format!(
            "{}/payments/mpesa/callback/{}",
            self.callback_base_url.trim_end_matches('/'),
            self.callback_token.expose_secret()
        )
    }
}
