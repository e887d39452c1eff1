//! PostcardMania API configuration, read from the environment.

/// Fixed return address stamped on every order.
#[derive(Debug, Clone)]
pub struct ReturnAddressConfig {
    pub company: String,
    pub first_name: String,
    pub last_name: String,
    pub address: String,
    pub address2: String,
    pub city: String,
    pub state: String,
    pub zip: String,
}

impl ReturnAddressConfig {
    fn from_env() -> Self {
        Self {
            company: env_or("PCM_RETURN_COMPANY", "Positive Postcards"),
            first_name: env_or("PCM_RETURN_FIRST_NAME", ""),
            last_name: env_or("PCM_RETURN_LAST_NAME", ""),
            address: env_or("PCM_RETURN_ADDRESS", "123 Main St"),
            address2: env_or("PCM_RETURN_ADDRESS2", ""),
            city: env_or("PCM_RETURN_CITY", "Clearwater"),
            state: env_or("PCM_RETURN_STATE", "FL"),
            zip: env_or("PCM_RETURN_ZIP", "33765"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PcmConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    /// Optional sub-account reference passed at login.
    pub child_ref_nbr: Option<String>,
    pub return_address: ReturnAddressConfig,
}

impl PcmConfig {
    pub fn from_env() -> Self {
        let config = Self {
            base_url: env_or("PCM_BASE_URL", "https://v3.pcmintegrations.com"),
            api_key: std::env::var("PCM_API_KEY").ok().filter(|v| !v.is_empty()),
            api_secret: std::env::var("PCM_API_SECRET").ok().filter(|v| !v.is_empty()),
            child_ref_nbr: std::env::var("PCM_CHILD_REF_NBR").ok().filter(|v| !v.is_empty()),
            return_address: ReturnAddressConfig::from_env(),
        };

        if config.is_configured() {
            tracing::info!("PostcardMania service configured");
        } else {
            tracing::warn!(
                "PCM_API_KEY / PCM_API_SECRET not set; postcard fulfillment runs in demo mode"
            );
        }

        config
    }

    /// Without credentials, every operation short-circuits into a demo
    /// response so the surrounding system stays usable.
    pub fn is_configured(&self) -> bool {
        self.api_key.is_some() && self.api_secret.is_some()
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
