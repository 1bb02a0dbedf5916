// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL storage backend.
//!
//! Sensitive columns (instance and operation parameters, binding kubeconfigs)
//! are encrypted at rest with AES-256-GCM. Optimistic updates compare the
//! `version` column in the UPDATE predicate and bump it in the same statement;
//! zero affected rows means a stale write.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};

use crate::encryption::Encryptor;
use crate::error::{BrokerError, LastError, Result};
use crate::model::{
    Binding, Instance, InstanceArchive, InstanceEvent, Operation, OperationState, OperationType,
    RuntimeState,
};
use crate::orchestration::{Orchestration, OrchestrationState, OrchestrationType};

use super::{
    Bindings, Events, InstanceFilter, Instances, InstancesArchived, OperationFilter, Operations,
    Orchestrations, Page, RuntimeStates, Storage,
};

/// Embedded schema migrations, applied at startup.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Storage backed by a PostgreSQL pool.
#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
    cipher: Encryptor,
}

impl PostgresStorage {
    /// Wrap a pool. The cipher key must already be validated by config loading.
    pub fn new(pool: PgPool, cipher: Encryptor) -> Self {
        Self { pool, cipher }
    }

    /// Run pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| BrokerError::Internal(format!("migration failed: {e}")))
    }

    fn instance_from_row(&self, row: &PgRow) -> Result<Instance> {
        let parameters_enc: String = row.try_get("parameters")?;
        let parameters = serde_json::from_str(&self.cipher.decrypt(&parameters_enc)?)?;
        Ok(Instance {
            instance_id: row.try_get("instance_id")?,
            runtime_id: row.try_get("runtime_id")?,
            global_account_id: row.try_get("global_account_id")?,
            subaccount_id: row.try_get("subaccount_id")?,
            service_id: row.try_get("service_id")?,
            service_plan_id: row.try_get("service_plan_id")?,
            platform_region: row.try_get("platform_region")?,
            provider_region: row.try_get("provider_region")?,
            dashboard_url: row.try_get("dashboard_url")?,
            parameters,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            expired_at: row.try_get("expired_at")?,
            version: row.try_get("version")?,
        })
    }

    fn operation_from_row(&self, row: &PgRow) -> Result<Operation> {
        let op_type: String = row.try_get("type")?;
        let state: String = row.try_get("state")?;
        let parameters_enc: String = row.try_get("parameters")?;
        let parameters = serde_json::from_str(&self.cipher.decrypt(&parameters_enc)?)?;
        let last_error: Option<serde_json::Value> = row.try_get("last_error")?;
        let last_error: Option<LastError> = match last_error {
            Some(v) => Some(serde_json::from_value(v)?),
            None => None,
        };
        Ok(Operation {
            operation_id: row.try_get("operation_id")?,
            instance_id: row.try_get("instance_id")?,
            op_type: OperationType::parse(&op_type)?,
            state: OperationState::parse(&state)?,
            description: row.try_get("description")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            orchestration_id: row.try_get("orchestration_id")?,
            provisioner_operation_id: row.try_get("provisioner_operation_id")?,
            runtime_id: row.try_get("runtime_id")?,
            finished_stages: row.try_get("finished_stages")?,
            last_step: row.try_get("last_step")?,
            parameters,
            kyma_template: row.try_get("kyma_template")?,
            details: row.try_get("data")?,
            last_error,
            version: row.try_get("version")?,
        })
    }

    fn binding_from_row(&self, row: &PgRow) -> Result<Binding> {
        let kubeconfig_enc: String = row.try_get("kubeconfig")?;
        Ok(Binding {
            binding_id: row.try_get("binding_id")?,
            instance_id: row.try_get("instance_id")?,
            created_at: row.try_get("created_at")?,
            expires_at: row.try_get("expires_at")?,
            kubeconfig: self.cipher.decrypt(&kubeconfig_enc)?,
            created_by: row.try_get("created_by")?,
            parameters_hash: row.try_get("parameters_hash")?,
        })
    }

    fn orchestration_from_row(&self, row: &PgRow) -> Result<Orchestration> {
        let ty: String = row.try_get("type")?;
        let state: String = row.try_get("state")?;
        let parameters: serde_json::Value = row.try_get("parameters")?;
        Ok(Orchestration {
            orchestration_id: row.try_get("orchestration_id")?,
            orchestration_type: OrchestrationType::parse(&ty)?,
            state: OrchestrationState::parse(&state)?,
            description: row.try_get("description")?,
            parameters: serde_json::from_value(parameters)?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl Storage for PostgresStorage {
    fn instances(&self) -> &dyn Instances {
        self
    }
    fn operations(&self) -> &dyn Operations {
        self
    }
    fn bindings(&self) -> &dyn Bindings {
        self
    }
    fn orchestrations(&self) -> &dyn Orchestrations {
        self
    }
    fn runtime_states(&self) -> &dyn RuntimeStates {
        self
    }
    fn instances_archived(&self) -> &dyn InstancesArchived {
        self
    }
    fn events(&self) -> &dyn Events {
        self
    }
}

const INSTANCE_COLUMNS: &str = "instance_id, runtime_id, global_account_id, subaccount_id, \
     service_id, service_plan_id, platform_region, provider_region, dashboard_url, \
     parameters, created_at, updated_at, expired_at, version";

#[async_trait]
impl Instances for PostgresStorage {
    async fn insert(&self, instance: Instance) -> Result<()> {
        let parameters = self
            .cipher
            .encrypt(&serde_json::to_string(&instance.parameters)?)?;
        sqlx::query(
            r#"
            INSERT INTO instances (instance_id, runtime_id, global_account_id, subaccount_id,
                service_id, service_plan_id, platform_region, provider_region, dashboard_url,
                parameters, created_at, updated_at, expired_at, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(&instance.instance_id)
        .bind(&instance.runtime_id)
        .bind(&instance.global_account_id)
        .bind(&instance.subaccount_id)
        .bind(&instance.service_id)
        .bind(&instance.service_plan_id)
        .bind(&instance.platform_region)
        .bind(&instance.provider_region)
        .bind(&instance.dashboard_url)
        .bind(&parameters)
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .bind(instance.expired_at)
        .bind(instance.version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, instance_id: &str) -> Result<Instance> {
        let row = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM instances WHERE instance_id = $1"
        ))
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BrokerError::NotFound {
            resource: "instance",
            id: instance_id.to_string(),
        })?;
        self.instance_from_row(&row)
    }

    async fn update(&self, mut instance: Instance) -> Result<Instance> {
        let parameters = self
            .cipher
            .encrypt(&serde_json::to_string(&instance.parameters)?)?;
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE instances
            SET runtime_id = $3, provider_region = $4, dashboard_url = $5, parameters = $6,
                expired_at = $7, updated_at = $8, version = version + 1
            WHERE instance_id = $1 AND version = $2
            "#,
        )
        .bind(&instance.instance_id)
        .bind(instance.version)
        .bind(&instance.runtime_id)
        .bind(&instance.provider_region)
        .bind(&instance.dashboard_url)
        .bind(&parameters)
        .bind(instance.expired_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Distinguish a stale version from a missing row.
            let exists: Option<i32> =
                sqlx::query_scalar("SELECT 1 FROM instances WHERE instance_id = $1")
                    .bind(&instance.instance_id)
                    .fetch_optional(&self.pool)
                    .await?;
            return Err(match exists {
                Some(_) => BrokerError::Conflict {
                    resource: "instance",
                    details: format!(
                        "{} version {} is stale",
                        instance.instance_id, instance.version
                    ),
                },
                None => BrokerError::NotFound {
                    resource: "instance",
                    id: instance.instance_id,
                },
            });
        }
        instance.version += 1;
        instance.updated_at = now;
        Ok(instance)
    }

    async fn delete(&self, instance_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM instances WHERE instance_id = $1")
            .bind(instance_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list(&self, filter: &InstanceFilter) -> Result<Page<Instance>> {
        fn apply<'a>(builder: &mut QueryBuilder<'a, Postgres>, filter: &'a InstanceFilter) {
            builder.push(" WHERE TRUE");
            if !filter.global_account_ids.is_empty() {
                builder
                    .push(" AND global_account_id = ANY(")
                    .push_bind(&filter.global_account_ids)
                    .push(")");
            }
            if !filter.subaccount_ids.is_empty() {
                builder
                    .push(" AND subaccount_id = ANY(")
                    .push_bind(&filter.subaccount_ids)
                    .push(")");
            }
            if !filter.plan_ids.is_empty() {
                builder
                    .push(" AND service_plan_id = ANY(")
                    .push_bind(&filter.plan_ids)
                    .push(")");
            }
            if filter.with_runtime_only {
                builder.push(" AND runtime_id IS NOT NULL");
            }
        }

        let mut count = QueryBuilder::new("SELECT COUNT(*) FROM instances");
        apply(&mut count, filter);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut query =
            QueryBuilder::new(format!("SELECT {INSTANCE_COLUMNS} FROM instances"));
        apply(&mut query, filter);
        query.push(" ORDER BY created_at DESC");
        if filter.page_size > 0 {
            query
                .push(" LIMIT ")
                .push_bind(filter.page_size as i64)
                .push(" OFFSET ")
                .push_bind(((filter.page.max(1) - 1) * filter.page_size) as i64);
        }

        let rows = query.build().fetch_all(&self.pool).await?;
        let items = rows
            .iter()
            .map(|r| self.instance_from_row(r))
            .collect::<Result<Vec<_>>>()?;
        Ok(Page {
            items,
            total_count: total as usize,
        })
    }
}

const OPERATION_COLUMNS: &str = "operation_id, instance_id, type, state, description, \
     created_at, updated_at, orchestration_id, provisioner_operation_id, runtime_id, \
     finished_stages, last_step, parameters, kyma_template, data, last_error, version";

#[async_trait]
impl Operations for PostgresStorage {
    async fn insert(&self, operation: Operation) -> Result<()> {
        let parameters = self
            .cipher
            .encrypt(&serde_json::to_string(&operation.parameters)?)?;
        let last_error = match &operation.last_error {
            Some(e) => Some(serde_json::to_value(e)?),
            None => None,
        };
        sqlx::query(
            r#"
            INSERT INTO operations (operation_id, instance_id, type, state, description,
                created_at, updated_at, orchestration_id, provisioner_operation_id, runtime_id,
                finished_stages, last_step, parameters, kyma_template, data, last_error, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(&operation.operation_id)
        .bind(&operation.instance_id)
        .bind(operation.op_type.as_str())
        .bind(operation.state.as_str())
        .bind(&operation.description)
        .bind(operation.created_at)
        .bind(operation.updated_at)
        .bind(&operation.orchestration_id)
        .bind(&operation.provisioner_operation_id)
        .bind(&operation.runtime_id)
        .bind(&operation.finished_stages)
        .bind(&operation.last_step)
        .bind(&parameters)
        .bind(&operation.kyma_template)
        .bind(&operation.details)
        .bind(last_error)
        .bind(operation.version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, operation_id: &str) -> Result<Operation> {
        let row = sqlx::query(&format!(
            "SELECT {OPERATION_COLUMNS} FROM operations WHERE operation_id = $1"
        ))
        .bind(operation_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BrokerError::NotFound {
            resource: "operation",
            id: operation_id.to_string(),
        })?;
        self.operation_from_row(&row)
    }

    async fn update(&self, mut operation: Operation) -> Result<Operation> {
        let parameters = self
            .cipher
            .encrypt(&serde_json::to_string(&operation.parameters)?)?;
        let last_error = match &operation.last_error {
            Some(e) => Some(serde_json::to_value(e)?),
            None => None,
        };
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE operations
            SET state = $3, description = $4, orchestration_id = $5,
                provisioner_operation_id = $6, runtime_id = $7, finished_stages = $8,
                last_step = $9, parameters = $10, kyma_template = $11, data = $12,
                last_error = $13, updated_at = $14, version = version + 1
            WHERE operation_id = $1 AND version = $2
            "#,
        )
        .bind(&operation.operation_id)
        .bind(operation.version)
        .bind(operation.state.as_str())
        .bind(&operation.description)
        .bind(&operation.orchestration_id)
        .bind(&operation.provisioner_operation_id)
        .bind(&operation.runtime_id)
        .bind(&operation.finished_stages)
        .bind(&operation.last_step)
        .bind(&parameters)
        .bind(&operation.kyma_template)
        .bind(&operation.details)
        .bind(last_error)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let exists: Option<i32> =
                sqlx::query_scalar("SELECT 1 FROM operations WHERE operation_id = $1")
                    .bind(&operation.operation_id)
                    .fetch_optional(&self.pool)
                    .await?;
            return Err(match exists {
                Some(_) => BrokerError::Conflict {
                    resource: "operation",
                    details: format!(
                        "{} version {} is stale",
                        operation.operation_id, operation.version
                    ),
                },
                None => BrokerError::NotFound {
                    resource: "operation",
                    id: operation.operation_id,
                },
            });
        }
        operation.version += 1;
        operation.updated_at = now;
        Ok(operation)
    }

    async fn list_not_finished_by_type(&self, op_type: OperationType) -> Result<Vec<Operation>> {
        let rows = sqlx::query(&format!(
            "SELECT {OPERATION_COLUMNS} FROM operations \
             WHERE type = $1 AND state IN ('pending', 'in_progress', 'retrying') \
             ORDER BY created_at ASC"
        ))
        .bind(op_type.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|r| self.operation_from_row(r)).collect()
    }

    async fn list_by_instance(&self, instance_id: &str) -> Result<Vec<Operation>> {
        let rows = sqlx::query(&format!(
            "SELECT {OPERATION_COLUMNS} FROM operations \
             WHERE instance_id = $1 ORDER BY created_at DESC"
        ))
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|r| self.operation_from_row(r)).collect()
    }

    async fn get_last_by_instance(&self, instance_id: &str) -> Result<Operation> {
        let row = sqlx::query(&format!(
            "SELECT {OPERATION_COLUMNS} FROM operations \
             WHERE instance_id = $1 ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BrokerError::NotFound {
            resource: "operation",
            id: instance_id.to_string(),
        })?;
        self.operation_from_row(&row)
    }

    async fn get_last_by_types(
        &self,
        instance_id: &str,
        types: &[OperationType],
    ) -> Result<Option<Operation>> {
        let type_names: Vec<&str> = types.iter().map(|t| t.as_str()).collect();
        let row = sqlx::query(&format!(
            "SELECT {OPERATION_COLUMNS} FROM operations \
             WHERE instance_id = $1 AND type = ANY($2) \
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(instance_id)
        .bind(&type_names)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| self.operation_from_row(&r)).transpose()
    }

    async fn list(&self, filter: &OperationFilter) -> Result<Page<Operation>> {
        let states: Vec<&str> = filter.states.iter().map(|s| s.as_str()).collect();
        let types: Vec<&str> = filter.types.iter().map(|t| t.as_str()).collect();

        let apply = |builder: &mut QueryBuilder<'_, Postgres>| {
            builder.push(" WHERE TRUE");
            if !states.is_empty() {
                builder
                    .push(" AND state = ANY(")
                    .push_bind(states.clone())
                    .push(")");
            }
            if !types.is_empty() {
                builder
                    .push(" AND type = ANY(")
                    .push_bind(types.clone())
                    .push(")");
            }
            if let Some(id) = &filter.orchestration_id {
                builder
                    .push(" AND orchestration_id = ")
                    .push_bind(id.clone());
            }
            if let Some(after) = filter.created_after {
                builder.push(" AND created_at >= ").push_bind(after);
            }
            if let Some(before) = filter.created_before {
                builder.push(" AND created_at < ").push_bind(before);
            }
        };

        let mut count = QueryBuilder::new("SELECT COUNT(*) FROM operations");
        apply(&mut count);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut query =
            QueryBuilder::new(format!("SELECT {OPERATION_COLUMNS} FROM operations"));
        apply(&mut query);
        query.push(" ORDER BY created_at DESC");
        if filter.page_size > 0 {
            query
                .push(" LIMIT ")
                .push_bind(filter.page_size as i64)
                .push(" OFFSET ")
                .push_bind(((filter.page.max(1) - 1) * filter.page_size) as i64);
        }

        let rows = query.build().fetch_all(&self.pool).await?;
        let items = rows
            .iter()
            .map(|r| self.operation_from_row(r))
            .collect::<Result<Vec<_>>>()?;
        Ok(Page {
            items,
            total_count: total as usize,
        })
    }
}

const BINDING_COLUMNS: &str =
    "binding_id, instance_id, created_at, expires_at, kubeconfig, created_by, parameters_hash";

#[async_trait]
impl Bindings for PostgresStorage {
    async fn insert_capped(&self, binding: Binding, max_bindings_count: usize) -> Result<()> {
        let kubeconfig = self.cipher.encrypt(&binding.kubeconfig)?;
        let mut tx = self.pool.begin().await?;

        // Lock the instance row so concurrent inserts serialize on the count.
        sqlx::query("SELECT 1 FROM instances WHERE instance_id = $1 FOR UPDATE")
            .bind(&binding.instance_id)
            .fetch_optional(&mut *tx)
            .await?;

        let live: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM bindings WHERE instance_id = $1 AND expires_at > NOW()",
        )
        .bind(&binding.instance_id)
        .fetch_one(&mut *tx)
        .await?;
        if live as usize >= max_bindings_count {
            return Err(BrokerError::Validation {
                field: "binding".into(),
                message: format!(
                    "maximum number of non expired bindings ({}) reached",
                    max_bindings_count
                ),
            });
        }

        sqlx::query(
            r#"
            INSERT INTO bindings (binding_id, instance_id, created_at, expires_at,
                kubeconfig, created_by, parameters_hash)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&binding.binding_id)
        .bind(&binding.instance_id)
        .bind(binding.created_at)
        .bind(binding.expires_at)
        .bind(&kubeconfig)
        .bind(&binding.created_by)
        .bind(&binding.parameters_hash)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, instance_id: &str, binding_id: &str) -> Result<Binding> {
        let row = sqlx::query(&format!(
            "SELECT {BINDING_COLUMNS} FROM bindings WHERE instance_id = $1 AND binding_id = $2"
        ))
        .bind(instance_id)
        .bind(binding_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BrokerError::NotFound {
            resource: "binding",
            id: binding_id.to_string(),
        })?;
        self.binding_from_row(&row)
    }

    async fn list_by_instance(&self, instance_id: &str) -> Result<Vec<Binding>> {
        let rows = sqlx::query(&format!(
            "SELECT {BINDING_COLUMNS} FROM bindings WHERE instance_id = $1 ORDER BY created_at ASC"
        ))
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|r| self.binding_from_row(r)).collect()
    }

    async fn delete(&self, instance_id: &str, binding_id: &str) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM bindings WHERE instance_id = $1 AND binding_id = $2")
                .bind(instance_id)
                .bind(binding_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }
}

const ORCHESTRATION_COLUMNS: &str =
    "orchestration_id, type, state, description, parameters, created_at, updated_at";

#[async_trait]
impl Orchestrations for PostgresStorage {
    async fn insert(&self, orchestration: Orchestration) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO orchestrations (orchestration_id, type, state, description,
                parameters, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&orchestration.orchestration_id)
        .bind(orchestration.orchestration_type.as_str())
        .bind(orchestration.state.as_str())
        .bind(&orchestration.description)
        .bind(serde_json::to_value(&orchestration.parameters)?)
        .bind(orchestration.created_at)
        .bind(orchestration.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, orchestration_id: &str) -> Result<Orchestration> {
        let row = sqlx::query(&format!(
            "SELECT {ORCHESTRATION_COLUMNS} FROM orchestrations WHERE orchestration_id = $1"
        ))
        .bind(orchestration_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BrokerError::NotFound {
            resource: "orchestration",
            id: orchestration_id.to_string(),
        })?;
        self.orchestration_from_row(&row)
    }

    async fn update(&self, mut orchestration: Orchestration) -> Result<Orchestration> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE orchestrations
            SET state = $2, description = $3, parameters = $4, updated_at = $5
            WHERE orchestration_id = $1
            "#,
        )
        .bind(&orchestration.orchestration_id)
        .bind(orchestration.state.as_str())
        .bind(&orchestration.description)
        .bind(serde_json::to_value(&orchestration.parameters)?)
        .bind(now)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(BrokerError::NotFound {
                resource: "orchestration",
                id: orchestration.orchestration_id,
            });
        }
        orchestration.updated_at = now;
        Ok(orchestration)
    }

    async fn list(&self) -> Result<Vec<Orchestration>> {
        let rows = sqlx::query(&format!(
            "SELECT {ORCHESTRATION_COLUMNS} FROM orchestrations ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|r| self.orchestration_from_row(r)).collect()
    }
}

#[async_trait]
impl RuntimeStates for PostgresStorage {
    async fn insert(&self, state: RuntimeState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO runtime_states (id, runtime_id, operation_id, created_at,
                cluster_config, kyma_config)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&state.id)
        .bind(&state.runtime_id)
        .bind(&state.operation_id)
        .bind(state.created_at)
        .bind(&state.cluster_config)
        .bind(&state.kyma_config)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_by_runtime(&self, runtime_id: &str) -> Result<Vec<RuntimeState>> {
        let rows = sqlx::query(
            r#"
            SELECT id, runtime_id, operation_id, created_at, cluster_config, kyma_config
            FROM runtime_states WHERE runtime_id = $1 ORDER BY created_at DESC
            "#,
        )
        .bind(runtime_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(RuntimeState {
                    id: row.try_get("id")?,
                    runtime_id: row.try_get("runtime_id")?,
                    operation_id: row.try_get("operation_id")?,
                    created_at: row.try_get("created_at")?,
                    cluster_config: row.try_get("cluster_config")?,
                    kyma_config: row.try_get("kyma_config")?,
                })
            })
            .collect()
    }

    async fn get_latest_by_runtime(&self, runtime_id: &str) -> Result<Option<RuntimeState>> {
        Ok(self.list_by_runtime(runtime_id).await?.into_iter().next())
    }

    async fn delete_older_than(
        &self,
        runtime_id: &str,
        boundary: DateTime<Utc>,
    ) -> Result<usize> {
        let result =
            sqlx::query("DELETE FROM runtime_states WHERE runtime_id = $1 AND created_at < $2")
                .bind(runtime_id)
                .bind(boundary)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() as usize)
    }
}

#[async_trait]
impl InstancesArchived for PostgresStorage {
    async fn insert(&self, archive: InstanceArchive) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO instances_archived (instance_id, snapshot, archived_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (instance_id) DO UPDATE
            SET snapshot = EXCLUDED.snapshot, archived_at = EXCLUDED.archived_at
            "#,
        )
        .bind(&archive.instance_id)
        .bind(&archive.snapshot)
        .bind(archive.archived_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, instance_id: &str) -> Result<InstanceArchive> {
        let row = sqlx::query(
            "SELECT instance_id, snapshot, archived_at FROM instances_archived \
             WHERE instance_id = $1",
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BrokerError::NotFound {
            resource: "archived instance",
            id: instance_id.to_string(),
        })?;
        Ok(InstanceArchive {
            instance_id: row.try_get("instance_id")?,
            snapshot: row.try_get("snapshot")?,
            archived_at: row.try_get("archived_at")?,
        })
    }
}

#[async_trait]
impl Events for PostgresStorage {
    async fn insert(&self, event: InstanceEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO events (id, instance_id, at, level, message)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&event.id)
        .bind(&event.instance_id)
        .bind(event.at)
        .bind(&event.level)
        .bind(&event.message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_by_instance(&self, instance_id: &str) -> Result<Vec<InstanceEvent>> {
        let rows = sqlx::query(
            "SELECT id, instance_id, at, level, message FROM events \
             WHERE instance_id = $1 ORDER BY at ASC",
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(InstanceEvent {
                    id: row.try_get("id")?,
                    instance_id: row.try_get("instance_id")?,
                    at: row.try_get("at")?,
                    level: row.try_get("level")?,
                    message: row.try_get("message")?,
                })
            })
            .collect()
    }
}
