//! `InvoiceStore` over `notas_fiscais` and `notas_fiscais_historico`.

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use sqlx::PgConnection;
use sqlx::postgres::PgRow;
use tracing::{Span, debug, instrument};

use shopdesk_core::{ClientId, CompanyId, DomainError, InvoiceId, ServiceOrderId};
use shopdesk_fiscal::{
    ArtifactHandles, Cancellation, ClientSnapshot, EmissionMode, EmissionPayload, EmissionStatus,
    HistoryEntry, HistoryStatus, InvoiceAmounts, InvoiceComputer, InvoiceFilter, InvoiceNumber,
    InvoiceRecord, LineItem, LineKind, ServiceOrder,
};

use super::jobs::insert_job;
use super::{PostgresBackend, column, map_sqlx_error};
use crate::StoreError;
use crate::store::{InvoiceStore, IssuedInvoice, messages};

/// Advisory lock key serialising invoice numbering across processes.
const NUMBERING_LOCK_KEY: i64 = 0x4e46_4e55_4d45_524f;

const INVOICE_COLUMNS: &str = "id, numero, os_id, cliente_id, empresa_id, data_emissao, \
    valor_produtos, valor_servicos, valor_base, icms, iss, pis, cofins, total_impostos, \
    valor_total, observacoes, status_emissao, numero_externo, xml_path, pdf_path, html_path, \
    cancelada, data_cancelamento, motivo_cancelamento";

fn invoice_from_row(row: &PgRow) -> Result<InvoiceRecord, StoreError> {
    let numero: String = column(row, "numero")?;
    let status: String = column(row, "status_emissao")?;
    let canceled: bool = column(row, "cancelada")?;
    let cancellation = if canceled {
        let canceled_at: Option<DateTime<Utc>> = column(row, "data_cancelamento")?;
        let reason: Option<String> = column(row, "motivo_cancelamento")?;
        Some(Cancellation {
            reason: reason.unwrap_or_default(),
            canceled_at: canceled_at.unwrap_or(DateTime::<Utc>::MIN_UTC),
        })
    } else {
        None
    };

    Ok(InvoiceRecord {
        id: InvoiceId::new(column(row, "id")?),
        number: numero.parse()?,
        order_id: ServiceOrderId::new(column(row, "os_id")?),
        client_id: ClientId::new(column(row, "cliente_id")?),
        company_id: CompanyId::new(column(row, "empresa_id")?),
        issued_at: column(row, "data_emissao")?,
        amounts: InvoiceAmounts {
            products: column(row, "valor_produtos")?,
            services: column(row, "valor_servicos")?,
            base: column(row, "valor_base")?,
            icms: column(row, "icms")?,
            iss: column(row, "iss")?,
            pis: column(row, "pis")?,
            cofins: column(row, "cofins")?,
            total_taxes: column(row, "total_impostos")?,
            total: column(row, "valor_total")?,
        },
        notes: column(row, "observacoes")?,
        emission_status: status.parse()?,
        external_number: column(row, "numero_externo")?,
        artifacts: ArtifactHandles {
            pdf: column(row, "pdf_path")?,
            xml: column(row, "xml_path")?,
            html: column(row, "html_path")?,
        },
        cancellation,
    })
}

pub(super) async fn insert_history(
    conn: &mut PgConnection,
    invoice_id: InvoiceId,
    status: HistoryStatus,
    message: &str,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO notas_fiscais_historico (nota_fiscal_id, status, mensagem) VALUES ($1, $2, $3)",
    )
    .bind(invoice_id.get())
    .bind(status.as_db_str())
    .bind(message)
    .execute(conn)
    .await
    .map_err(|e| map_sqlx_error("insert_history", e))?;
    Ok(())
}

async fn load_lines(
    conn: &mut PgConnection,
    order_id: ServiceOrderId,
    kind: LineKind,
) -> Result<Vec<LineItem>, StoreError> {
    let sql = match kind {
        LineKind::Product => {
            "SELECT produto_id AS item_id, descricao, quantidade, valor_unitario, valor_total \
             FROM os_produtos WHERE os_id = $1 ORDER BY id"
        }
        LineKind::Service => {
            "SELECT servico_id AS item_id, descricao, quantidade, valor_unitario, valor_total \
             FROM os_servicos WHERE os_id = $1 ORDER BY id"
        }
    };
    let rows = sqlx::query(sql)
        .bind(order_id.get())
        .fetch_all(conn)
        .await
        .map_err(|e| map_sqlx_error("load_lines", e))?;

    rows.iter()
        .map(|row| {
            Ok(LineItem {
                kind,
                item_id: column(row, "item_id")?,
                description: column(row, "descricao")?,
                quantity: column(row, "quantidade")?,
                unit_price: column(row, "valor_unitario")?,
                line_total: column(row, "valor_total")?,
            })
        })
        .collect()
}

/// Read and row-lock the order with its client and lines.
async fn load_order(
    conn: &mut PgConnection,
    order_id: ServiceOrderId,
) -> Result<ServiceOrder, StoreError> {
    let row = sqlx::query(
        r#"
        SELECT os.id, os.empresa_id, os.status, os.valor_total, os.nota_fiscal_id,
               c.id AS cliente_id, c.nome, c.cpf_cnpj, c.email, c.endereco
        FROM ordens_servico os
        JOIN clientes c ON c.id = os.cliente_id
        WHERE os.id = $1
        FOR UPDATE OF os
        "#,
    )
    .bind(order_id.get())
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("load_order", e))?
    .ok_or_else(|| DomainError::not_found(format!("service order {order_id}")))?;

    let status: String = column(&row, "status")?;
    let invoice_id: Option<i64> = column(&row, "nota_fiscal_id")?;
    let client = ClientSnapshot {
        id: ClientId::new(column(&row, "cliente_id")?),
        name: column(&row, "nome")?,
        document: column(&row, "cpf_cnpj")?,
        email: column(&row, "email")?,
        address: column(&row, "endereco")?,
    };

    Ok(ServiceOrder {
        id: order_id,
        company_id: CompanyId::new(column(&row, "empresa_id")?),
        client,
        status: status.parse()?,
        recorded_total: column(&row, "valor_total")?,
        products: load_lines(conn, order_id, LineKind::Product).await?,
        services: load_lines(conn, order_id, LineKind::Service).await?,
        invoice_id: invoice_id.map(InvoiceId::new),
    })
}

#[async_trait]
impl InvoiceStore for PostgresBackend {
    #[instrument(skip(self, computer), fields(order_id = %order_id, mode = ?mode, invoice_id = tracing::field::Empty), err)]
    async fn issue(
        &self,
        order_id: ServiceOrderId,
        computer: &InvoiceComputer,
        mode: EmissionMode,
    ) -> Result<IssuedInvoice, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(NUMBERING_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("numbering_lock", e))?;

        let order = load_order(&mut tx, order_id).await?;
        let active: Option<i64> =
            sqlx::query_scalar("SELECT id FROM notas_fiscais WHERE os_id = $1 AND NOT cancelada")
                .bind(order_id.get())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("active_invoice", e))?;
        let highest: Option<i64> =
            sqlx::query_scalar("SELECT MAX(numero::BIGINT) FROM notas_fiscais")
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("highest_number", e))?;
        let highest = highest
            .map(|n| InvoiceNumber::from_sequence(u64::try_from(n).unwrap_or(0)))
            .transpose()?;

        // Postgres keeps microseconds; truncate so the returned record equals a re-read.
        let issued_at = Utc::now().trunc_subsecs(6);
        let new = computer.prepare(&order, active.map(InvoiceId::new), highest, issued_at)?;
        let record_status = EmissionStatus::initial_for(mode);

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO notas_fiscais (
                numero, os_id, cliente_id, empresa_id, data_emissao,
                valor_produtos, valor_servicos, valor_base, icms, iss, pis, cofins,
                total_impostos, valor_total, observacoes, status_emissao
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            RETURNING id
            "#,
        )
        .bind(new.number.to_string())
        .bind(new.order_id.get())
        .bind(new.client_id.get())
        .bind(new.company_id.get())
        .bind(new.issued_at)
        .bind(new.amounts.products)
        .bind(new.amounts.services)
        .bind(new.amounts.base)
        .bind(new.amounts.icms)
        .bind(new.amounts.iss)
        .bind(new.amounts.pis)
        .bind(new.amounts.cofins)
        .bind(new.amounts.total_taxes)
        .bind(new.amounts.total)
        .bind(new.notes.as_deref())
        .bind(record_status.as_db_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_invoice", e))?;
        let id = InvoiceId::new(id);
        Span::current().record("invoice_id", id.get());

        sqlx::query("UPDATE ordens_servico SET nota_fiscal_id = $1 WHERE id = $2")
            .bind(id.get())
            .bind(order_id.get())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("link_order", e))?;

        let payload = EmissionPayload::build(id, &new, &order);
        let record = InvoiceRecord::from_new(id, new, mode);
        insert_history(
            &mut tx,
            id,
            HistoryStatus::Generated,
            &messages::generated(record.number, order_id),
        )
        .await?;

        let job_id = match mode {
            EmissionMode::Queued => {
                let job_id = insert_job(&mut tx, id, &serde_json::to_value(&payload)?).await?;
                insert_history(&mut tx, id, HistoryStatus::Queued, &messages::queued()).await?;
                Some(job_id)
            }
            EmissionMode::ManualSummary => None,
        };

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;
        debug!(number = %record.number, "invoice generated");

        Ok(IssuedInvoice {
            record,
            payload,
            job_id,
        })
    }

    #[instrument(skip(self), fields(invoice_id = %id), err)]
    async fn get(&self, id: InvoiceId) -> Result<Option<InvoiceRecord>, StoreError> {
        let sql = format!("SELECT {INVOICE_COLUMNS} FROM notas_fiscais WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_invoice", e))?;
        row.as_ref().map(invoice_from_row).transpose()
    }

    #[instrument(skip(self, filter), fields(limit = filter.limit, offset = filter.offset), err)]
    async fn list(&self, filter: &InvoiceFilter) -> Result<Vec<InvoiceRecord>, StoreError> {
        let sql = format!(
            r#"
            SELECT {INVOICE_COLUMNS}
            FROM notas_fiscais
            WHERE ($1::timestamptz IS NULL OR data_emissao >= $1)
              AND ($2::timestamptz IS NULL OR data_emissao <= $2)
              AND ($3::bigint IS NULL OR cliente_id = $3)
              AND ($4 OR NOT cancelada)
            ORDER BY data_emissao DESC, id DESC
            LIMIT $5 OFFSET $6
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(filter.issued_from)
            .bind(filter.issued_to)
            .bind(filter.client_id.map(ClientId::get))
            .bind(filter.include_canceled)
            .bind(i64::from(filter.limit))
            .bind(i64::from(filter.offset))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_invoices", e))?;
        rows.iter().map(invoice_from_row).collect()
    }

    #[instrument(skip(self, reason), fields(invoice_id = %id), err)]
    async fn cancel(&self, id: InvoiceId, reason: &str) -> Result<InvoiceRecord, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let sql = format!("SELECT {INVOICE_COLUMNS} FROM notas_fiscais WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("lock_invoice", e))?
            .ok_or_else(|| DomainError::not_found(format!("invoice {id}")))?;
        let mut record = invoice_from_row(&row)?;
        record.cancel(reason, Utc::now().trunc_subsecs(6))?;
        let Some(cancellation) = record.cancellation.clone() else {
            return Err(DomainError::invariant("cancellation not recorded").into());
        };

        sqlx::query(
            "UPDATE notas_fiscais SET cancelada = TRUE, data_cancelamento = $2, motivo_cancelamento = $3 WHERE id = $1",
        )
        .bind(id.get())
        .bind(cancellation.canceled_at)
        .bind(&cancellation.reason)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("cancel_invoice", e))?;

        sqlx::query(
            "UPDATE ordens_servico SET nota_fiscal_id = NULL WHERE id = $1 AND nota_fiscal_id = $2",
        )
        .bind(record.order_id.get())
        .bind(id.get())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("unlink_order", e))?;

        insert_history(
            &mut tx,
            id,
            HistoryStatus::Canceled,
            &messages::canceled(&cancellation.reason),
        )
        .await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;
        Ok(record)
    }

    #[instrument(skip(self), fields(invoice_id = %id), err)]
    async fn history(&self, id: InvoiceId) -> Result<Vec<HistoryEntry>, StoreError> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM notas_fiscais WHERE id = $1)")
                .bind(id.get())
                .fetch_one(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("invoice_exists", e))?;
        if !exists {
            return Err(DomainError::not_found(format!("invoice {id}")).into());
        }

        let rows = sqlx::query(
            r#"
            SELECT id, nota_fiscal_id, status, mensagem, criado_em
            FROM notas_fiscais_historico
            WHERE nota_fiscal_id = $1
            ORDER BY criado_em ASC, id ASC
            "#,
        )
        .bind(id.get())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_history", e))?;

        rows.iter()
            .map(|row| {
                let status: String = column(row, "status")?;
                Ok(HistoryEntry {
                    id: column(row, "id")?,
                    invoice_id: InvoiceId::new(column(row, "nota_fiscal_id")?),
                    status: status.parse()?,
                    message: column(row, "mensagem")?,
                    created_at: column(row, "criado_em")?,
                })
            })
            .collect()
    }

    #[instrument(skip(self), fields(invoice_id = %id), err)]
    async fn attach_summary(&self, id: InvoiceId, location: &str) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let updated = sqlx::query("UPDATE notas_fiscais SET html_path = $2 WHERE id = $1")
            .bind(id.get())
            .bind(location)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("attach_summary", e))?;
        if updated.rows_affected() == 0 {
            return Err(DomainError::not_found(format!("invoice {id}")).into());
        }
        insert_history(
            &mut tx,
            id,
            HistoryStatus::ManualSummary,
            &messages::manual_summary(location),
        )
        .await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;
        Ok(())
    }
}
