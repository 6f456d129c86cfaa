//! Local stand-in provider: no network, placeholder documents.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::json;
use tracing::info;

use shopdesk_fiscal::EmissionPayload;

use super::{EmissionError, EmissionReceipt, artifact_name, save_best_effort};
use crate::storage::{ArtifactContent, ArtifactStore};

/// Local stand-in for a fiscal provider. Makes no network calls.
pub struct StubProvider {
    delay: Duration,
    artifacts: Arc<dyn ArtifactStore>,
}

impl StubProvider {
    pub fn new(delay: Duration, artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self { delay, artifacts }
    }

    pub async fn emit(&self, payload: &EmissionPayload) -> Result<EmissionReceipt, EmissionError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let assigned_number = format!("{:09}", rand::thread_rng().gen_range(1..1_000_000_000u32));
        let pdf = placeholder_pdf(payload, &assigned_number);
        let xml = placeholder_xml(payload, &assigned_number);

        let pdf = save_best_effort(
            self.artifacts.as_ref(),
            ArtifactContent::Bytes(pdf),
            &artifact_name(payload, "pdf"),
        )
        .await;
        let xml = save_best_effort(
            self.artifacts.as_ref(),
            ArtifactContent::Bytes(xml.into_bytes()),
            &artifact_name(payload, "xml"),
        )
        .await;

        info!(
            invoice_id = %payload.invoice_id,
            assigned_number = %assigned_number,
            "stub provider emitted invoice"
        );

        Ok(EmissionReceipt {
            raw_response: json!({
                "provider": "stub",
                "numero": assigned_number,
                "status": "autorizado",
                "referencia": payload.invoice_number.to_string(),
            }),
            assigned_number,
            status: "autorizado".to_string(),
            pdf,
            xml,
        })
    }
}

fn placeholder_pdf(payload: &EmissionPayload, assigned_number: &str) -> Vec<u8> {
    format!(
        "%PDF-1.4\n% Nota fiscal simulada {} (ref. {})\n% Total {}\n%%EOF\n",
        assigned_number, payload.invoice_number, payload.amounts.total
    )
    .into_bytes()
}

fn placeholder_xml(payload: &EmissionPayload, assigned_number: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <nfse simulada=\"true\">\
         <numero>{}</numero>\
         <referencia>{}</referencia>\
         <dataEmissao>{}</dataEmissao>\
         <valorServicos>{}</valorServicos>\
         <valorTotal>{}</valorTotal>\
         </nfse>\n",
        assigned_number,
        payload.invoice_number,
        payload.issued_at.to_rfc3339(),
        payload.amounts.services,
        payload.amounts.total
    )
}
