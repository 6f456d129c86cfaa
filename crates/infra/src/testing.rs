//! Shared fixtures for unit tests.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;

use shopdesk_core::{ClientId, CompanyId, InvoiceId, ServiceOrderId};
use shopdesk_fiscal::{
    ClientSnapshot, EmissionPayload, InvoiceComputer, LineItem, ServiceOrder, ServiceOrderStatus,
};

use crate::gateway::{EmissionReceipt, GatewayConfig};
use crate::storage::{
    ArtifactContent, ArtifactStore, StorageBackend, StorageError, StoredArtifact, validate_name,
};

/// Finalized order: 2 x 50.00 in parts plus 200.00 of labour, company 1,
/// client 9.
pub fn sample_order(id: i64) -> ServiceOrder {
    ServiceOrder {
        id: ServiceOrderId::new(id),
        company_id: CompanyId::new(1),
        client: ClientSnapshot {
            id: ClientId::new(9),
            name: "Oficina do Zé".to_string(),
            document: Some("12.345.678/0001-90".to_string()),
            email: Some("financeiro@oficinadoze.com.br".to_string()),
            address: Some("Rua das Flores, 100".to_string()),
        },
        status: ServiceOrderStatus::Finalized,
        recorded_total: Decimal::new(30000, 2),
        products: vec![LineItem::product(
            "Filtro de óleo",
            Decimal::from(2),
            Decimal::new(5000, 2),
        )],
        services: vec![LineItem::service(
            "Troca de óleo",
            Decimal::ONE,
            Decimal::new(20000, 2),
        )],
        invoice_id: None,
    }
}

/// Payload of invoice 000001 for [`sample_order`].
pub fn sample_payload() -> EmissionPayload {
    let order = sample_order(42);
    let new = InvoiceComputer::default()
        .prepare(&order, None, None, Utc::now())
        .expect("sample order is finalized");
    EmissionPayload::build(InvoiceId::new(1), &new, &order)
}

pub fn sample_receipt() -> EmissionReceipt {
    EmissionReceipt {
        assigned_number: "123456789".to_string(),
        status: "autorizado".to_string(),
        pdf: Some(StoredArtifact {
            backend: StorageBackend::Local,
            location: "/tmp/nfe/nota_000001.pdf".to_string(),
        }),
        xml: None,
        raw_response: serde_json::json!({ "numero": "123456789" }),
    }
}

pub fn sample_gateway_config() -> GatewayConfig {
    GatewayConfig {
        id: 1,
        company_id: CompanyId::new(1),
        provider: None,
        api_key: None,
        api_secret: None,
        certificate: None,
        certificate_password: None,
        active: true,
        created_at: Utc::now(),
    }
}

/// Keeps everything it is asked to save.
#[derive(Default)]
pub struct RecordingArtifactStore {
    saved: Mutex<Vec<(String, Vec<u8>)>>,
}

impl RecordingArtifactStore {
    pub fn saved(&self) -> Vec<(String, Vec<u8>)> {
        self.saved.lock().unwrap().clone()
    }
}

#[async_trait]
impl ArtifactStore for RecordingArtifactStore {
    fn backend(&self) -> StorageBackend {
        StorageBackend::Local
    }

    async fn save(
        &self,
        content: ArtifactContent,
        name: &str,
    ) -> Result<StoredArtifact, StorageError> {
        let name = validate_name(name)?.to_string();
        let bytes = content.into_bytes()?;
        self.saved.lock().unwrap().push((name.clone(), bytes));
        Ok(StoredArtifact {
            backend: StorageBackend::Local,
            location: format!("memory://{name}"),
        })
    }
}

/// Fails every save, like a full disk.
pub struct FailingArtifactStore;

#[async_trait]
impl ArtifactStore for FailingArtifactStore {
    fn backend(&self) -> StorageBackend {
        StorageBackend::Local
    }

    async fn save(
        &self,
        _content: ArtifactContent,
        _name: &str,
    ) -> Result<StoredArtifact, StorageError> {
        Err(StorageError::Io(std::io::Error::other("no space left on device")))
    }
}
