//! Credential & endpoint context.
//!
//! Validates the setup fields of an instance, applies the certificate policy
//! to a shared HTTP client and checks the endpoint once. The resulting
//! context is immutable and read-only shared by the ledger client and the
//! feeds of that instance. Secrets stay inside it and are only exposed when a
//! request is built.

use reqwest::{Certificate, Client, Url};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{InstanceConfig, Secret, SyncSettings};
use crate::error::{Result, SyncError};

const AKAHU_APP_PREFIX: &str = "app_token_";
const AKAHU_TOKEN_PREFIX: &str = "Bearer user_token";

/// Certificate policy for the ledger endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsMode {
    /// Standard system trust chain
    Validate,
    /// No peer verification
    SkipValidation,
    /// Only the supplied PEM certificate is trusted
    Pinned(String),
}

impl TlsMode {
    /// Resolve the policy from setup fields. Skipping takes precedence over a
    /// supplied certificate; a blank certificate counts as none.
    pub fn from_setup(skip_validate_cert: bool, cert: Option<&str>) -> Self {
        if skip_validate_cert {
            return TlsMode::SkipValidation;
        }
        match cert.map(str::trim) {
            Some(pem) if !pem.is_empty() => TlsMode::Pinned(pem.to_string()),
            _ => TlsMode::Validate,
        }
    }
}

/// Akahu app id and user token.
#[derive(Debug, Clone)]
pub struct AkahuCredentials {
    pub app_id: String,
    pub auth_token: Secret,
}

/// Validated, immutable per-instance bundle.
#[derive(Debug)]
pub struct CredentialContext {
    instance_id: String,
    endpoint: Url,
    password: Secret,
    encrypt_password: Secret,
    file: String,
    tls: TlsMode,
    unit: String,
    prefix: String,
    akahu: Option<AkahuCredentials>,
    client: Client,
    request_timeout: Duration,
}

impl CredentialContext {
    /// Identity of an instance: lowercased endpoint and file.
    pub fn instance_id_for(endpoint: &str, file: &str) -> String {
        format!("{}_{}", endpoint.to_lowercase(), file.to_lowercase())
    }

    /// Validate fields and build the shared client. No network access.
    pub fn build(config: &InstanceConfig, settings: &SyncSettings) -> Result<Self> {
        let endpoint = parse_endpoint(&config.endpoint)?;

        if config.file.trim().is_empty() {
            return Err(SyncError::Unknown("file must not be empty".to_string()));
        }

        let akahu = match (&config.akahu_app_id, &config.akahu_auth_token) {
            (None, None) => None,
            (Some(app_id), Some(token)) => {
                if !app_id.starts_with(AKAHU_APP_PREFIX) {
                    return Err(SyncError::Unknown(format!(
                        "akahu_app_id must start with {}",
                        AKAHU_APP_PREFIX
                    )));
                }
                if !token.expose().starts_with(AKAHU_TOKEN_PREFIX) {
                    return Err(SyncError::Unknown(format!(
                        "akahu_auth_token must start with {}",
                        AKAHU_TOKEN_PREFIX
                    )));
                }
                Some(AkahuCredentials {
                    app_id: app_id.clone(),
                    auth_token: token.clone(),
                })
            }
            _ => {
                return Err(SyncError::Unknown(
                    "akahu_app_id and akahu_auth_token must be set together".to_string(),
                ))
            }
        };

        let tls = TlsMode::from_setup(config.skip_validate_cert, config.cert.as_deref());
        let client = build_client(&tls, settings)?;

        Ok(Self {
            instance_id: Self::instance_id_for(&config.endpoint, &config.file),
            endpoint,
            password: config.password.clone(),
            encrypt_password: config.encrypt_password.clone(),
            file: config.file.clone(),
            tls,
            unit: config.unit.clone(),
            prefix: config.prefix.clone(),
            akahu,
            client,
            request_timeout: settings.request_timeout(),
        })
    }

    /// Build the context and confirm the endpoint answers.
    pub async fn validate(config: &InstanceConfig, settings: &SyncSettings) -> Result<Arc<Self>> {
        let context = Self::build(config, settings)?;
        context.check_endpoint().await?;
        info!(
            instance_id = %context.instance_id,
            tls = ?context.tls_kind(),
            "Endpoint validated"
        );
        Ok(Arc::new(context))
    }

    /// One request against the endpoint root. Any HTTP answer counts as reachable.
    pub async fn check_endpoint(&self) -> Result<()> {
        debug!(endpoint = %self.endpoint, "Probing endpoint");
        let response = self
            .client
            .get(self.endpoint.clone())
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| SyncError::from_reqwest(&e))?;
        debug!(status = %response.status(), "Endpoint answered");
        Ok(())
    }

    /// Join a path onto the endpoint.
    pub fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.endpoint.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// `host:port file`, the display title of the instance.
    pub fn title(&self) -> String {
        let host = self.endpoint.host_str().unwrap_or_default();
        let port = self
            .endpoint
            .port_or_known_default()
            .map(|p| p.to_string())
            .unwrap_or_default();
        format!("{}:{} {}", host, port, self.file)
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn password(&self) -> &Secret {
        &self.password
    }

    pub fn encrypt_password(&self) -> &Secret {
        &self.encrypt_password
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn akahu(&self) -> Option<&AkahuCredentials> {
        self.akahu.as_ref()
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// TLS policy without certificate contents, for logging.
    pub fn tls_kind(&self) -> &'static str {
        match self.tls {
            TlsMode::Validate => "validate",
            TlsMode::SkipValidation => "skip",
            TlsMode::Pinned(_) => "pinned",
        }
    }
}

fn parse_endpoint(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim())
        .map_err(|e| SyncError::Unknown(format!("endpoint is not a valid URL: {}", e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(SyncError::Unknown(format!(
            "endpoint scheme must be http or https, got {}",
            url.scheme()
        )));
    }
    if url.host_str().is_none() {
        return Err(SyncError::Unknown("endpoint has no host".to_string()));
    }
    Ok(url)
}

fn build_client(tls: &TlsMode, settings: &SyncSettings) -> Result<Client> {
    let mut builder = Client::builder()
        .connect_timeout(settings.connect_timeout())
        .timeout(settings.request_timeout())
        .user_agent(concat!("ledger-sync/", env!("CARGO_PKG_VERSION")));

    match tls {
        TlsMode::Validate => {}
        TlsMode::SkipValidation => {
            builder = builder.danger_accept_invalid_certs(true);
        }
        TlsMode::Pinned(pem) => {
            if !pem.contains("-----BEGIN CERTIFICATE-----") {
                return Err(SyncError::Cert(
                    "Pinned certificate is not a PEM certificate".to_string(),
                ));
            }
            let cert = Certificate::from_pem(pem.as_bytes())
                .map_err(|e| SyncError::Cert(format!("Pinned certificate is invalid: {}", e)))?;
            builder = builder
                .tls_built_in_root_certs(false)
                .add_root_certificate(cert);
        }
    }

    builder.build().map_err(|e| match tls {
        TlsMode::Pinned(_) => SyncError::Cert(format!("Pinned certificate could not be loaded: {}", e)),
        _ => SyncError::Unknown(format!("Failed to build HTTP client: {}", e)),
    })
}
