//! Fiscal-document provider gateway.
//!
//! [`GatewayAdapter`] picks a [`Provider`] from the issuer's
//! [`GatewayConfig`] on every emission: the local stub when nothing real is
//! configured, or one of the HTTP providers.

pub mod config;
mod http;
mod stub;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{instrument, warn};

use shopdesk_fiscal::EmissionPayload;

pub use config::{CertificateError, GatewayConfig, GatewayConfigService, NewGatewayConfig};
pub use http::HttpProvider;
pub use stub::StubProvider;

use crate::cipher::{CipherError, SecretCipher};
use crate::config::ProviderSettings;
use crate::storage::{ArtifactContent, ArtifactStore, StoredArtifact};

#[derive(Debug, Error)]
pub enum EmissionError {
    #[error("unknown fiscal provider {0:?}")]
    UnknownProvider(String),

    /// Network failure, timeout or non-success provider response.
    #[error("provider error: {0}")]
    Provider(String),

    #[error("certificate error: {0}")]
    Cipher(#[from] CipherError),

    #[error("provider is not configured: {0}")]
    MissingConfig(String),

    /// The job payload could not be decoded.
    #[error("invalid emission payload: {0}")]
    Payload(String),
}

impl EmissionError {
    /// Only provider failures are worth retrying; everything else will fail
    /// the same way next time.
    pub fn is_transient(&self) -> bool {
        matches!(self, EmissionError::Provider(_))
    }
}

/// Normalized result of a successful emission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmissionReceipt {
    pub assigned_number: String,
    pub status: String,
    pub pdf: Option<StoredArtifact>,
    pub xml: Option<StoredArtifact>,
    pub raw_response: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    FocusNfe,
    PlugNotas,
}

impl core::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ProviderKind::FocusNfe => f.write_str("focusnfe"),
            ProviderKind::PlugNotas => f.write_str("plugnotas"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Stub,
    Http(ProviderKind),
}

impl Provider {
    /// Resolve the `gateway_configs.provider` column (case-insensitive).
    pub fn select(name: Option<&str>) -> Result<Self, EmissionError> {
        let normalized = name.map(|n| n.trim().to_lowercase()).unwrap_or_default();
        match normalized.as_str() {
            "" | "stub" | "local" | "manual" => Ok(Provider::Stub),
            "focusnfe" | "focus" | "focus_nfe" => Ok(Provider::Http(ProviderKind::FocusNfe)),
            "plugnotas" | "plug_notas" => Ok(Provider::Http(ProviderKind::PlugNotas)),
            _ => Err(EmissionError::UnknownProvider(
                name.unwrap_or_default().to_string(),
            )),
        }
    }
}

/// Anything that can turn a payload into an emitted document.
#[async_trait]
pub trait Emitter: Send + Sync {
    async fn emit(
        &self,
        payload: &EmissionPayload,
        config: Option<&GatewayConfig>,
    ) -> Result<EmissionReceipt, EmissionError>;
}

pub struct GatewayAdapter {
    stub: StubProvider,
    http: HttpProvider,
}

impl GatewayAdapter {
    pub fn new(stub: StubProvider, http: HttpProvider) -> Self {
        Self { stub, http }
    }

    pub fn from_settings(
        settings: &ProviderSettings,
        artifacts: Arc<dyn ArtifactStore>,
        cipher: Option<Arc<SecretCipher>>,
    ) -> Result<Self, EmissionError> {
        let stub = StubProvider::new(settings.stub_delay, artifacts.clone());
        let http = HttpProvider::new(
            settings.base_url.clone(),
            settings.api_key.clone(),
            settings.timeout,
            artifacts,
            cipher,
        )?;
        Ok(Self::new(stub, http))
    }
}

#[async_trait]
impl Emitter for GatewayAdapter {
    #[instrument(
        skip(self, payload, config),
        fields(invoice_id = %payload.invoice_id, number = %payload.invoice_number),
        err
    )]
    async fn emit(
        &self,
        payload: &EmissionPayload,
        config: Option<&GatewayConfig>,
    ) -> Result<EmissionReceipt, EmissionError> {
        match Provider::select(config.and_then(|c| c.provider.as_deref()))? {
            Provider::Stub => self.stub.emit(payload).await,
            Provider::Http(kind) => self.http.emit(kind, payload, config).await,
        }
    }
}

/// File name used for an invoice's artifact of the given extension.
pub(crate) fn artifact_name(payload: &EmissionPayload, extension: &str) -> String {
    format!("nota_{}.{}", payload.invoice_number, extension)
}

/// Persist an artifact without letting a storage failure fail the emission.
pub(crate) async fn save_best_effort(
    store: &dyn ArtifactStore,
    content: ArtifactContent,
    name: &str,
) -> Option<StoredArtifact> {
    match store.save(content, name).await {
        Ok(stored) => Some(stored),
        Err(e) => {
            warn!(artifact = name, error = %e, "artifact save failed, continuing without it");
            None
        }
    }
}
