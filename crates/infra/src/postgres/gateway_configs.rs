//! `GatewayConfigStore` over `gateway_configs`.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use tracing::instrument;

use shopdesk_core::CompanyId;

use super::{PostgresBackend, column, map_sqlx_error};
use crate::StoreError;
use crate::gateway::{GatewayConfig, NewGatewayConfig};
use crate::store::GatewayConfigStore;

const CONFIG_COLUMNS: &str = "id, empresa_id, provider, api_key, api_secret, certificado_a1, \
    certificado_senha, ativo, criado_em";

fn config_from_row(row: &PgRow) -> Result<GatewayConfig, StoreError> {
    Ok(GatewayConfig {
        id: column(row, "id")?,
        company_id: CompanyId::new(column(row, "empresa_id")?),
        provider: column(row, "provider")?,
        api_key: column(row, "api_key")?,
        api_secret: column(row, "api_secret")?,
        certificate: column(row, "certificado_a1")?,
        certificate_password: column(row, "certificado_senha")?,
        active: column(row, "ativo")?,
        created_at: column(row, "criado_em")?,
    })
}

#[async_trait]
impl GatewayConfigStore for PostgresBackend {
    #[instrument(skip(self), fields(company_id = %company_id), err)]
    async fn active_for(&self, company_id: CompanyId) -> Result<Option<GatewayConfig>, StoreError> {
        let sql = format!(
            "SELECT {CONFIG_COLUMNS} FROM gateway_configs WHERE empresa_id = $1 AND ativo \
             ORDER BY criado_em DESC, id DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(company_id.get())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("active_gateway_config", e))?;
        row.as_ref().map(config_from_row).transpose()
    }

    #[instrument(skip(self, config), fields(company_id = %config.company_id), err)]
    async fn upsert(&self, config: NewGatewayConfig) -> Result<GatewayConfig, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query("UPDATE gateway_configs SET ativo = FALSE WHERE empresa_id = $1 AND ativo")
            .bind(config.company_id.get())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("deactivate_gateway_configs", e))?;

        let sql = format!(
            "INSERT INTO gateway_configs (empresa_id, provider, api_key, api_secret, ativo) \
             VALUES ($1, $2, $3, $4, TRUE) RETURNING {CONFIG_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(config.company_id.get())
            .bind(config.provider.as_deref())
            .bind(config.api_key.as_deref())
            .bind(config.api_secret.as_deref())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_gateway_config", e))?;
        let created = config_from_row(&row)?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;
        Ok(created)
    }

    #[instrument(skip(self, sealed, password), fields(company_id = %company_id), err)]
    async fn set_certificate(
        &self,
        company_id: CompanyId,
        sealed: Vec<u8>,
        password: Option<String>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE gateway_configs
            SET certificado_a1 = $2, certificado_senha = $3
            WHERE id = (
                SELECT id FROM gateway_configs
                WHERE empresa_id = $1 AND ativo
                ORDER BY criado_em DESC, id DESC
                LIMIT 1
            )
            "#,
        )
        .bind(company_id.get())
        .bind(sealed)
        .bind(password)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_certificate", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(format!(
                "gateway config for company {company_id}"
            )));
        }
        Ok(())
    }
}
