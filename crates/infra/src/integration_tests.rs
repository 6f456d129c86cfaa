//! Integration tests for the emission pipeline.
//!
//! Tests: InvoiceService → JobQueue → Worker → GatewayAdapter → ArtifactStore
//!
//! The `postgres` module runs the same flow against a real database. Those
//! tests are ignored by default; run them with
//! `DATABASE_URL=... cargo test -p shopdesk-infra -- --ignored --test-threads=1`.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use shopdesk_core::{CompanyId, ServiceOrderId};
    use shopdesk_fiscal::{EmissionMode, EmissionStatus, HistoryStatus, InvoiceComputer};

    use crate::config::{ProviderSettings, WorkerSettings};
    use crate::gateway::{GatewayAdapter, NewGatewayConfig};
    use crate::jobs::{JobQueue, TickOutcome, Worker};
    use crate::memory::InMemoryBackend;
    use crate::service::InvoiceService;
    use crate::storage::LocalArtifactStore;
    use crate::store::GatewayConfigStore;
    use crate::testing::sample_order;

    fn stub_settings() -> ProviderSettings {
        ProviderSettings {
            base_url: None,
            api_key: None,
            timeout: Duration::from_secs(2),
            stub_delay: Duration::ZERO,
        }
    }

    fn worker_settings() -> WorkerSettings {
        WorkerSettings {
            poll_interval: Duration::from_millis(10),
            max_attempts: 3,
            backoff_base: Duration::ZERO,
            lease: Duration::from_secs(300),
        }
    }

    #[tokio::test]
    async fn generated_invoice_is_emitted_through_the_stub() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = Arc::new(LocalArtifactStore::new(dir.path()).await.unwrap());
        let backend = Arc::new(InMemoryBackend::new());
        backend.insert_order(sample_order(42));

        let service = InvoiceService::new(
            backend.clone(),
            artifacts.clone(),
            InvoiceComputer::default(),
            EmissionMode::Queued,
        );
        let gateway = Arc::new(GatewayAdapter::from_settings(&stub_settings(), artifacts.clone(), None).unwrap());
        let mut worker = Worker::new(backend.clone(), backend.clone(), gateway, &worker_settings());

        let issued = service.generate(ServiceOrderId::new(42)).await.unwrap();
        assert_eq!(worker.tick().await.unwrap(), TickOutcome::Emitted);

        let record = service.get(issued.record.id).await.unwrap().unwrap();
        assert_eq!(record.emission_status, EmissionStatus::Emitted);
        let external = record.external_number.unwrap();
        assert_eq!(external.len(), 9);
        assert!(external.bytes().all(|b| b.is_ascii_digit()));

        let pdf = record.artifacts.pdf.unwrap();
        assert!(pdf.ends_with("nota_000001.pdf"));
        assert!(dir.path().join("nota_000001.pdf").exists());
        assert!(dir.path().join("nota_000001.xml").exists());

        let statuses: Vec<_> = service
            .history(issued.record.id)
            .await
            .unwrap()
            .into_iter()
            .map(|h| h.status)
            .collect();
        assert_eq!(
            statuses,
            vec![HistoryStatus::Generated, HistoryStatus::Queued, HistoryStatus::Emitted]
        );
    }

    #[tokio::test]
    async fn unknown_provider_dead_letters_and_requeue_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = Arc::new(LocalArtifactStore::new(dir.path()).await.unwrap());
        let backend = Arc::new(InMemoryBackend::new());
        backend.insert_order(sample_order(42));
        backend
            .upsert(NewGatewayConfig {
                company_id: CompanyId::new(1),
                provider: Some("sefaz-direto".to_string()),
                api_key: None,
                api_secret: None,
            })
            .await
            .unwrap();

        let service = InvoiceService::new(
            backend.clone(),
            artifacts.clone(),
            InvoiceComputer::default(),
            EmissionMode::Queued,
        );
        let gateway = Arc::new(GatewayAdapter::from_settings(&stub_settings(), artifacts, None).unwrap());
        let mut worker = Worker::new(backend.clone(), backend.clone(), gateway, &worker_settings());

        let issued = service.generate(ServiceOrderId::new(42)).await.unwrap();
        assert_eq!(worker.tick().await.unwrap(), TickOutcome::DeadLettered);

        let letters = backend.list_dead_letters(10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].attempts, 1);
        assert!(letters[0].last_error.as_deref().unwrap().contains("sefaz-direto"));

        // Fix the configuration, then replay the dead letter.
        backend
            .upsert(NewGatewayConfig {
                company_id: CompanyId::new(1),
                provider: Some("stub".to_string()),
                api_key: None,
                api_secret: None,
            })
            .await
            .unwrap();
        backend.requeue_dead_letter(letters[0].id).await.unwrap();
        assert_eq!(worker.tick().await.unwrap(), TickOutcome::Emitted);

        let record = service.get(issued.record.id).await.unwrap().unwrap();
        assert_eq!(record.emission_status, EmissionStatus::Emitted);
        assert!(backend.list_dead_letters(10).await.unwrap().is_empty());
    }
}

#[cfg(test)]
mod postgres {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    use rust_decimal::Decimal;
    use shopdesk_core::{CompanyId, ServiceOrderId};
    use shopdesk_fiscal::{EmissionMode, EmissionStatus, HistoryStatus, InvoiceComputer};

    use crate::StoreError;
    use crate::gateway::NewGatewayConfig;
    use crate::jobs::JobQueue;
    use crate::postgres::PostgresBackend;
    use crate::store::{GatewayConfigStore, InvoiceStore};
    use crate::testing::{sample_payload, sample_receipt};

    async fn backend() -> PostgresBackend {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for ignored tests");
        let backend = PostgresBackend::connect(&url, 8).await.unwrap();
        backend.migrate().await.unwrap();
        backend
    }

    /// Insert a finalized order (2 x 50.00 parts, 200.00 labour).
    async fn finalized_order(backend: &PostgresBackend) -> ServiceOrderId {
        let pool = backend.pool();
        let client_id: i64 =
            sqlx::query_scalar("INSERT INTO clientes (nome, cpf_cnpj) VALUES ('Cliente Teste', '123.456.789-09') RETURNING id")
                .fetch_one(pool)
                .await
                .unwrap();
        let order_id: i64 = sqlx::query_scalar(
            "INSERT INTO ordens_servico (empresa_id, cliente_id, status, valor_total) VALUES (1, $1, 'finalizada', 300) RETURNING id",
        )
        .bind(client_id)
        .fetch_one(pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO os_produtos (os_id, descricao, quantidade, valor_unitario, valor_total) VALUES ($1, 'Filtro', 2, 50, 100)",
        )
        .bind(order_id)
        .execute(pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO os_servicos (os_id, descricao, quantidade, valor_unitario, valor_total) VALUES ($1, 'Mão de obra', 1, 200, 200)",
        )
        .bind(order_id)
        .execute(pool)
        .await
        .unwrap();
        ServiceOrderId::new(order_id)
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn issue_claim_and_complete_round_trip() {
        let backend = backend().await;
        let order_id = finalized_order(&backend).await;

        let issued = backend
            .issue(order_id, &InvoiceComputer::default(), EmissionMode::Queued)
            .await
            .unwrap();
        assert_eq!(issued.record.amounts.base, Decimal::from(300));
        assert_eq!(backend.get(issued.record.id).await.unwrap().unwrap(), issued.record);

        let err = backend
            .issue(order_id, &InvoiceComputer::default(), EmissionMode::Queued)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Domain(shopdesk_core::DomainError::DuplicateInvoice { .. })
        ));

        // Drain until our job shows up; other ignored tests may leave jobs behind.
        let job_id = issued.job_id.unwrap();
        let job = loop {
            let job = backend.claim_next().await.unwrap().expect("job was enqueued");
            if job.id == job_id {
                break job;
            }
        };
        backend.complete(&job, &sample_receipt()).await.unwrap();

        let record = backend.get(issued.record.id).await.unwrap().unwrap();
        assert_eq!(record.emission_status, EmissionStatus::Emitted);
        let statuses: Vec<_> = backend
            .history(issued.record.id)
            .await
            .unwrap()
            .into_iter()
            .map(|h| h.status)
            .collect();
        assert_eq!(
            statuses,
            vec![HistoryStatus::Generated, HistoryStatus::Queued, HistoryStatus::Emitted]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "requires DATABASE_URL"]
    async fn skip_locked_claims_are_exclusive() {
        let backend = Arc::new(backend().await);
        let order_id = finalized_order(&backend).await;
        let invoice = backend
            .issue(order_id, &InvoiceComputer::default(), EmissionMode::ManualSummary)
            .await
            .unwrap();
        let mut ours = HashSet::new();
        for _ in 0..40 {
            ours.insert(backend.enqueue(invoice.record.id, &sample_payload()).await.unwrap());
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let backend = backend.clone();
            handles.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(job) = backend.claim_next().await.unwrap() {
                    claimed.push(job.id);
                }
                claimed
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id), "job {id} claimed twice");
            }
        }
        assert!(ours.is_subset(&seen));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "requires DATABASE_URL"]
    async fn concurrent_issues_get_unique_gapless_numbers() {
        let backend = Arc::new(backend().await);
        let mut orders = Vec::new();
        for _ in 0..16 {
            orders.push(finalized_order(&backend).await);
        }

        let mut handles = Vec::new();
        for order_id in orders {
            let backend = backend.clone();
            handles.push(tokio::spawn(async move {
                backend
                    .issue(order_id, &InvoiceComputer::default(), EmissionMode::ManualSummary)
                    .await
                    .unwrap()
                    .record
                    .number
            }));
        }

        let mut numbers = HashSet::new();
        for handle in handles {
            let number = handle.await.unwrap();
            assert!(numbers.insert(number), "number {number} assigned twice");
        }
        assert_eq!(numbers.len(), 16);

        // Other tests may issue at the same time, so check the whole table.
        let (count, lowest, highest): (i64, i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), MIN(numero::BIGINT), MAX(numero::BIGINT) FROM notas_fiscais",
        )
        .fetch_one(backend.pool())
        .await
        .unwrap();
        assert_eq!(count, highest - lowest + 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "requires DATABASE_URL"]
    async fn concurrent_issues_for_one_order_yield_one_invoice() {
        let backend = Arc::new(backend().await);
        let order_id = finalized_order(&backend).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let backend = backend.clone();
            handles.push(tokio::spawn(async move {
                backend
                    .issue(order_id, &InvoiceComputer::default(), EmissionMode::Queued)
                    .await
            }));
        }

        let mut issued = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => issued += 1,
                Err(err) => assert!(
                    matches!(
                        err,
                        StoreError::Domain(shopdesk_core::DomainError::DuplicateInvoice { .. })
                    ),
                    "unexpected error: {err}"
                ),
            }
        }
        assert_eq!(issued, 1);

        let open: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM notas_fiscais WHERE os_id = $1 AND NOT cancelada",
        )
        .bind(order_id.get())
        .fetch_one(backend.pool())
        .await
        .unwrap();
        assert_eq!(open, 1);
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn stale_release_revokes_the_lease() {
        let backend = backend().await;
        let order_id = finalized_order(&backend).await;
        let invoice = backend
            .issue(order_id, &InvoiceComputer::default(), EmissionMode::ManualSummary)
            .await
            .unwrap();
        let job_id = backend.enqueue(invoice.record.id, &sample_payload()).await.unwrap();
        let crashed = loop {
            let job = backend.claim_next().await.unwrap().expect("job was enqueued");
            if job.id == job_id {
                break job;
            }
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(backend.release_stale(Duration::from_millis(10)).await.unwrap() >= 1);

        let err = backend
            .reschedule(&crashed, 1, "timeout", Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let reclaimed = loop {
            let job = backend.claim_next().await.unwrap().expect("job was released");
            if job.id == job_id {
                break job;
            }
        };
        let dlq = backend.move_to_dead_letter(&reclaimed, 5, "gave up").await.unwrap();
        assert!(backend.get_job(job_id).await.unwrap().is_none());
        assert!(backend.list_dead_letters(100).await.unwrap().iter().any(|d| d.id == dlq));
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn gateway_config_upsert_keeps_one_active_row() {
        let backend = backend().await;
        let company = CompanyId::new(9_000 + i64::from(rand::random::<u16>()));
        for provider in ["focusnfe", "plugnotas"] {
            backend
                .upsert(NewGatewayConfig {
                    company_id: company,
                    provider: Some(provider.to_string()),
                    api_key: Some("chave".to_string()),
                    api_secret: None,
                })
                .await
                .unwrap();
        }
        backend
            .set_certificate(company, vec![1, 2, 3], Some("senha".to_string()))
            .await
            .unwrap();

        let active = backend.active_for(company).await.unwrap().unwrap();
        assert_eq!(active.provider.as_deref(), Some("plugnotas"));
        assert_eq!(active.certificate, Some(vec![1, 2, 3]));
    }
}
