//! Per-issuer provider configuration and certificate handling.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, instrument};

use shopdesk_core::CompanyId;

use crate::StoreError;
use crate::cipher::{CipherError, SecretCipher};
use crate::store::GatewayConfigStore;

/// A row of `gateway_configs`.
///
/// `certificate` only ever holds [`SecretCipher`] output.
#[derive(Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub id: i64,
    pub company_id: CompanyId,
    pub provider: Option<String>,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub certificate: Option<Vec<u8>>,
    pub certificate_password: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl core::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("GatewayConfig")
            .field("id", &self.id)
            .field("company_id", &self.company_id)
            .field("provider", &self.provider)
            .field("api_key", &redact(&self.api_key))
            .field("api_secret", &redact(&self.api_secret))
            .field("certificate_len", &self.certificate.as_ref().map(Vec::len))
            .field("certificate_password", &redact(&self.certificate_password))
            .field("active", &self.active)
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Input for [`GatewayConfigStore::upsert`].
#[derive(Debug, Clone)]
pub struct NewGatewayConfig {
    pub company_id: CompanyId,
    pub provider: Option<String>,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
}

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error(transparent)]
    Cipher(#[from] CipherError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no certificate stored for company {0}")]
    Missing(CompanyId),
}

/// Encrypts certificates on the way in and decrypts them on the way out.
pub struct GatewayConfigService {
    store: Arc<dyn GatewayConfigStore>,
    cipher: Arc<SecretCipher>,
}

impl GatewayConfigService {
    pub fn new(store: Arc<dyn GatewayConfigStore>, cipher: Arc<SecretCipher>) -> Self {
        Self { store, cipher }
    }

    pub async fn active_for(
        &self,
        company_id: CompanyId,
    ) -> Result<Option<GatewayConfig>, StoreError> {
        self.store.active_for(company_id).await
    }

    #[instrument(skip(self, certificate_base64, password), fields(company_id = %company_id), err)]
    pub async fn store_certificate(
        &self,
        company_id: CompanyId,
        certificate_base64: &str,
        password: Option<String>,
    ) -> Result<(), CertificateError> {
        let sealed = self.cipher.encrypt(certificate_base64)?;
        self.store
            .set_certificate(company_id, sealed, password)
            .await?;
        info!(company_id = %company_id, "certificate stored");
        Ok(())
    }

    /// Returns the certificate as base64.
    #[instrument(skip(self), fields(company_id = %company_id), err)]
    pub async fn download_certificate(
        &self,
        company_id: CompanyId,
    ) -> Result<String, CertificateError> {
        let sealed = self
            .store
            .active_for(company_id)
            .await?
            .and_then(|c| c.certificate)
            .ok_or(CertificateError::Missing(company_id))?;
        Ok(self.cipher.decrypt(&sealed)?)
    }
}
