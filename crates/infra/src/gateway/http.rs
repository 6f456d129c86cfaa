//! Real-provider emission over HTTPS (FocusNFe and PlugNotas).

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, RequestBuilder};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use shopdesk_fiscal::{EmissionPayload, LineItem};

use super::{
    EmissionError, EmissionReceipt, GatewayConfig, ProviderKind, artifact_name, save_best_effort,
};
use crate::cipher::{CipherError, SecretCipher};
use crate::storage::{ArtifactContent, ArtifactStore};

const ERROR_BODY_LIMIT: usize = 512;

/// Client for the real fiscal providers.
pub struct HttpProvider {
    client: Client,
    base_url: Option<String>,
    default_api_key: Option<String>,
    artifacts: Arc<dyn ArtifactStore>,
    cipher: Option<Arc<SecretCipher>>,
}

struct Credentials {
    api_key: String,
    api_secret: Option<String>,
    certificate: Option<(String, Option<String>)>,
}

/// Provider response reduced to what the pipeline keeps.
#[derive(Debug, PartialEq, Eq)]
struct Normalized {
    number: String,
    status: String,
    pdf_base64: Option<String>,
    xml_base64: Option<String>,
}

impl HttpProvider {
    pub fn new(
        base_url: Option<String>,
        default_api_key: Option<String>,
        timeout: Duration,
        artifacts: Arc<dyn ArtifactStore>,
        cipher: Option<Arc<SecretCipher>>,
    ) -> Result<Self, EmissionError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EmissionError::Provider(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.map(|u| u.trim_end_matches('/').to_string()),
            default_api_key,
            artifacts,
            cipher,
        })
    }

    pub async fn emit(
        &self,
        kind: ProviderKind,
        payload: &EmissionPayload,
        config: Option<&GatewayConfig>,
    ) -> Result<EmissionReceipt, EmissionError> {
        let base_url = self
            .base_url
            .as_deref()
            .ok_or_else(|| EmissionError::MissingConfig("FISCAL_PROVIDER_BASE_URL is not set".into()))?;
        let credentials = self.credentials(kind, config)?;

        let request = match kind {
            ProviderKind::FocusNfe => self
                .client
                .post(format!("{base_url}/v2/nfse"))
                .query(&[("ref", payload.invoice_id.to_string())])
                .basic_auth(&credentials.api_key, credentials.api_secret.as_deref())
                .json(&focus_body(payload, &credentials)),
            ProviderKind::PlugNotas => self
                .client
                .post(format!("{base_url}/nfse"))
                .header("x-api-key", &credentials.api_key)
                .json(&plugnotas_body(payload, &credentials)),
        };

        let raw = send(kind, request).await?;
        let normalized = normalize(kind, &raw)?;
        debug!(provider = %kind, number = %normalized.number, status = %normalized.status, "provider accepted invoice");

        let pdf = match normalized.pdf_base64 {
            Some(b64) => {
                save_best_effort(
                    self.artifacts.as_ref(),
                    ArtifactContent::Base64(b64),
                    &artifact_name(payload, "pdf"),
                )
                .await
            }
            None => None,
        };
        let xml = match normalized.xml_base64 {
            Some(b64) => {
                save_best_effort(
                    self.artifacts.as_ref(),
                    ArtifactContent::Base64(b64),
                    &artifact_name(payload, "xml"),
                )
                .await
            }
            None => None,
        };

        info!(
            provider = %kind,
            invoice_id = %payload.invoice_id,
            assigned_number = %normalized.number,
            "invoice emitted"
        );

        Ok(EmissionReceipt {
            assigned_number: normalized.number,
            status: normalized.status,
            pdf,
            xml,
            raw_response: raw,
        })
    }

    fn credentials(
        &self,
        kind: ProviderKind,
        config: Option<&GatewayConfig>,
    ) -> Result<Credentials, EmissionError> {
        let api_key = config
            .and_then(|c| c.api_key.clone())
            .or_else(|| self.default_api_key.clone())
            .ok_or_else(|| EmissionError::MissingConfig(format!("no api key for {kind}")))?;

        let certificate = match config.and_then(|c| c.certificate.as_deref()) {
            Some(sealed) => {
                let cipher = self.cipher.as_ref().ok_or(CipherError::MissingKey)?;
                let plain = cipher.decrypt(sealed)?;
                Some((plain, config.and_then(|c| c.certificate_password.clone())))
            }
            None => None,
        };

        Ok(Credentials {
            api_key,
            api_secret: config.and_then(|c| c.api_secret.clone()),
            certificate,
        })
    }
}

async fn send(kind: ProviderKind, request: RequestBuilder) -> Result<Value, EmissionError> {
    let response = request
        .send()
        .await
        .map_err(|e| EmissionError::Provider(format!("{kind} request failed: {e}")))?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| EmissionError::Provider(format!("{kind} response unreadable: {e}")))?;

    if !status.is_success() {
        let mut excerpt = body;
        if excerpt.len() > ERROR_BODY_LIMIT {
            let mut cut = ERROR_BODY_LIMIT;
            while !excerpt.is_char_boundary(cut) {
                cut -= 1;
            }
            excerpt.truncate(cut);
        }
        warn!(provider = %kind, status = %status, "provider rejected invoice");
        return Err(EmissionError::Provider(format!(
            "{kind} returned {status}: {excerpt}"
        )));
    }

    serde_json::from_str(&body)
        .map_err(|e| EmissionError::Provider(format!("{kind} returned invalid json: {e}")))
}

fn focus_body(payload: &EmissionPayload, credentials: &Credentials) -> Value {
    let a = &payload.amounts;
    let mut body = json!({
        "data_emissao": payload.issued_at.to_rfc3339(),
        "referencia": payload.invoice_number.to_string(),
        "tomador": {
            "cpf_cnpj": payload.client.document,
            "razao_social": payload.client.name,
            "email": payload.client.email,
            "endereco": payload.client.address,
        },
        "servico": {
            "discriminacao": discriminacao(payload),
            "valor_servicos": a.services,
            "valor_produtos": a.products,
            "base_calculo": a.base,
            "valor_iss": a.iss,
            "valor_pis": a.pis,
            "valor_cofins": a.cofins,
            "valor_icms": a.icms,
            "valor_total": a.total,
        },
        "itens": payload.lines().map(line_json).collect::<Vec<_>>(),
    });
    attach_certificate(&mut body, credentials);
    body
}

fn plugnotas_body(payload: &EmissionPayload, credentials: &Credentials) -> Value {
    let a = &payload.amounts;
    let mut document = json!({
        "idIntegracao": payload.invoice_id.to_string(),
        "numero": payload.invoice_number.to_string(),
        "dataEmissao": payload.issued_at.to_rfc3339(),
        "tomador": {
            "cpfCnpj": payload.client.document,
            "razaoSocial": payload.client.name,
            "email": payload.client.email,
            "endereco": payload.client.address,
        },
        "servico": [{
            "discriminacao": discriminacao(payload),
            "valor": {
                "servico": a.services,
                "baseCalculo": a.base,
            },
            "iss": { "valor": a.iss },
        }],
        "valores": {
            "produtos": a.products,
            "icms": a.icms,
            "pis": a.pis,
            "cofins": a.cofins,
            "totalImpostos": a.total_taxes,
            "total": a.total,
        },
        "observacoes": payload.notes,
    });
    attach_certificate(&mut document, credentials);
    Value::Array(vec![document])
}

fn line_json(line: &LineItem) -> Value {
    json!({
        "tipo": line.kind,
        "codigo": line.item_id,
        "descricao": line.description,
        "quantidade": line.quantity,
        "valor_unitario": line.unit_price,
        "valor_total": line.line_total,
    })
}

fn discriminacao(payload: &EmissionPayload) -> String {
    let lines: Vec<String> = payload
        .lines()
        .map(|l| format!("{} x{} = {}", l.description, l.quantity, l.line_total))
        .collect();
    match &payload.notes {
        Some(notes) if lines.is_empty() => notes.clone(),
        Some(notes) => format!("{notes}: {}", lines.join("; ")),
        None => lines.join("; "),
    }
}

fn attach_certificate(body: &mut Value, credentials: &Credentials) {
    if let (Some((file, password)), Some(obj)) = (&credentials.certificate, body.as_object_mut()) {
        obj.insert(
            "certificado".to_string(),
            json!({ "arquivo": file, "senha": password }),
        );
    }
}

/// Pull the document number, status and artifacts out of a provider reply.
fn normalize(kind: ProviderKind, raw: &Value) -> Result<Normalized, EmissionError> {
    // PlugNotas answers with `{ documents: [{ id, ... }], protocol }`.
    let doc = match kind {
        ProviderKind::PlugNotas => raw
            .get("documents")
            .and_then(Value::as_array)
            .and_then(|docs| docs.first())
            .unwrap_or(raw),
        ProviderKind::FocusNfe => raw,
    };

    let number = first_string(doc, &["numero", "numero_nfse", "numeroNfse", "id"])
        .or_else(|| first_string(raw, &["numero", "protocol"]))
        .ok_or_else(|| EmissionError::Provider(format!("{kind} response has no document number")))?;
    let status = first_string(doc, &["status", "situacao"])
        .or_else(|| first_string(raw, &["status", "message"]))
        .unwrap_or_else(|| "emitido".to_string());

    Ok(Normalized {
        number,
        status,
        pdf_base64: first_string(doc, &["pdf", "pdf_base64", "pdfBase64"]),
        xml_base64: first_string(doc, &["xml", "xml_base64", "xmlBase64"]),
    })
}

fn first_string(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match value.get(*k)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}
