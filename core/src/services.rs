/// Service registry: self-reported long-running processes owned by agents.
use crate::errors::{EngineError, EngineResult};
use crate::events::{self, EventKind, NewEvent};
use crate::model::{encode_json, Service, ServiceStatus};
use crate::store::{new_id, SqliteStore};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

const SERVICE_COLUMNS: &str = "s.id, s.agent_id, s.name, s.port, s.url, s.health_check_path, \
                               s.status, s.script, s.cwd, s.interpreter, s.args, s.env, \
                               s.metadata, s.created_at, s.last_updated_at, a.name AS agent_name";

/// Runtime fields for registering (or re-registering) a service.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertService {
    pub port: i64,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub health_check_path: Option<String>,
    pub script: String,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub interpreter: Option<String>,
    #[serde(default)]
    pub args: Option<String>,
    #[serde(default)]
    pub env: Option<serde_json::Value>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Listing filters. `exclude_agent_id` implements the include-own flag:
/// callers who do not want their own services back pass their id here.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceFilter {
    #[serde(default)]
    pub status: Option<ServiceStatus>,
    #[serde(default)]
    pub name_prefix: Option<String>,
    #[serde(default)]
    pub agent_id: Option<Uuid>,
    #[serde(default)]
    pub exclude_agent_id: Option<Uuid>,
}

pub struct ServiceRegistry {
    store: SqliteStore,
}

impl ServiceRegistry {
    pub fn new(store: SqliteStore) -> Self {
        Self { store }
    }

    /// Register a service, unique per `(agent, name)`. Re-registering
    /// replaces runtime fields but preserves identity and health status.
    pub async fn upsert(
        &self,
        agent_id: Uuid,
        name: &str,
        request: UpsertService,
    ) -> EngineResult<Service> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EngineError::Validation("service name is required".into()));
        }

        let mut tx = self.store.begin().await?;

        let owner: Option<String> = sqlx::query_scalar("SELECT name FROM agents WHERE id = ?1")
            .bind(agent_id.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        if owner.is_none() {
            return Err(EngineError::NotFound("agent", agent_id.to_string()));
        }

        let existing: Option<String> = sqlx::query_scalar(
            "SELECT id FROM services WHERE agent_id = ?1 AND name = ?2",
        )
        .bind(agent_id.to_string())
        .bind(name)
        .fetch_optional(&mut *tx)
        .await?;

        let now = Utc::now();
        let health_check_path = request.health_check_path.unwrap_or_else(|| "/health".to_string());
        let env = request.env.map(|v| serde_json::to_string(&v)).transpose()?;
        let metadata = encode_json(&request.metadata.unwrap_or(serde_json::Value::Null))?;

        let id = match existing {
            Some(id) => {
                sqlx::query(
                    "UPDATE services SET port = ?2, url = ?3, health_check_path = ?4, \
                                         script = ?5, cwd = ?6, interpreter = ?7, args = ?8, \
                                         env = ?9, metadata = ?10, last_updated_at = ?11 \
                     WHERE id = ?1",
                )
                .bind(&id)
                .bind(request.port)
                .bind(&request.url)
                .bind(&health_check_path)
                .bind(&request.script)
                .bind(&request.cwd)
                .bind(&request.interpreter)
                .bind(&request.args)
                .bind(&env)
                .bind(&metadata)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                id
            }
            None => {
                let id = new_id();
                sqlx::query(
                    "INSERT INTO services (id, agent_id, name, port, url, health_check_path, \
                                           status, script, cwd, interpreter, args, env, metadata, \
                                           created_at, last_updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)",
                )
                .bind(id.to_string())
                .bind(agent_id.to_string())
                .bind(name)
                .bind(request.port)
                .bind(&request.url)
                .bind(&health_check_path)
                .bind(ServiceStatus::Starting.to_string())
                .bind(&request.script)
                .bind(&request.cwd)
                .bind(&request.interpreter)
                .bind(&request.args)
                .bind(&env)
                .bind(&metadata)
                .bind(now)
                .execute(&mut *tx)
                .await?;

                events::record(
                    &mut tx,
                    NewEvent::new(EventKind::ServiceRegistered)
                        .agent(agent_id)
                        .new_value(name)
                        .metadata(json!({ "port": request.port })),
                )
                .await?;
                id.to_string()
            }
        };

        let row = sqlx::query(&format!(
            "SELECT {SERVICE_COLUMNS} FROM services s JOIN agents a ON a.id = s.agent_id \
             WHERE s.id = ?1"
        ))
        .bind(&id)
        .fetch_one(&mut *tx)
        .await?;
        let service = Service::from_row(&row)?;

        tx.commit().await?;
        Ok(service)
    }

    pub async fn get(&self, id: Uuid) -> EngineResult<Service> {
        let row = sqlx::query(&format!(
            "SELECT {SERVICE_COLUMNS} FROM services s JOIN agents a ON a.id = s.agent_id \
             WHERE s.id = ?1"
        ))
        .bind(id.to_string())
        .fetch_optional(self.store.pool())
        .await?;
        match row {
            Some(row) => Ok(Service::from_row(&row)?),
            None => Err(EngineError::NotFound("service", id.to_string())),
        }
    }

    /// Set health status, logging `service_status_change` only when the
    /// status actually changes.
    pub async fn update_status(&self, id: Uuid, status: ServiceStatus) -> EngineResult<Service> {
        let mut tx = self.store.begin().await?;
        let current = sqlx::query(&format!(
            "SELECT {SERVICE_COLUMNS} FROM services s JOIN agents a ON a.id = s.agent_id \
             WHERE s.id = ?1"
        ))
        .bind(id.to_string())
        .fetch_optional(&mut *tx)
        .await?;
        let Some(current) = current else {
            return Err(EngineError::NotFound("service", id.to_string()));
        };
        let current = Service::from_row(&current)?;

        if current.status == status {
            return Ok(current);
        }

        sqlx::query("UPDATE services SET status = ?2, last_updated_at = ?3 WHERE id = ?1")
            .bind(id.to_string())
            .bind(status.to_string())
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;

        events::record(
            &mut tx,
            NewEvent::new(EventKind::ServiceStatusChange)
                .agent(current.agent_id)
                .old_value(current.status.to_string())
                .new_value(status.to_string())
                .metadata(json!({ "service": current.name })),
        )
        .await?;
        tx.commit().await?;

        self.get(id).await
    }

    /// Remove a service. Only the owning agent may unregister.
    pub async fn unregister(&self, id: Uuid, agent_id: Uuid) -> EngineResult<()> {
        let service = self.get(id).await?;
        if service.agent_id != agent_id {
            return Err(EngineError::Unauthorized(
                "only the owning agent may unregister a service".into(),
            ));
        }

        let mut tx = self.store.begin().await?;
        sqlx::query("DELETE FROM services WHERE id = ?1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        events::record(
            &mut tx,
            NewEvent::new(EventKind::ServiceUnregistered)
                .agent(agent_id)
                .old_value(&service.name),
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Filtered listing, denormalized with the owner's name.
    pub async fn list(&self, filter: ServiceFilter) -> EngineResult<Vec<Service>> {
        let mut sql = format!(
            "SELECT {SERVICE_COLUMNS} FROM services s JOIN agents a ON a.id = s.agent_id"
        );
        let mut clauses: Vec<String> = Vec::new();
        let mut params: Vec<String> = Vec::new();

        if let Some(status) = filter.status {
            clauses.push("s.status = ?".into());
            params.push(status.to_string());
        }
        if let Some(prefix) = &filter.name_prefix {
            clauses.push("s.name LIKE ?".into());
            params.push(format!("{}%", prefix));
        }
        if let Some(agent_id) = filter.agent_id {
            clauses.push("s.agent_id = ?".into());
            params.push(agent_id.to_string());
        }
        if let Some(exclude) = filter.exclude_agent_id {
            clauses.push("s.agent_id != ?".into());
            params.push(exclude.to_string());
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY s.created_at ASC");

        let mut query = sqlx::query(&sql);
        for param in params {
            query = query.bind(param);
        }
        let rows = query.fetch_all(self.store.pool()).await?;
        rows.iter()
            .map(|row| Service::from_row(row).map_err(Into::into))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentRegistry, JoinRequest};
    use crate::events::{EventFilter, EventLog};

    struct Fixture {
        store: SqliteStore,
        services: ServiceRegistry,
        registry: AgentRegistry,
    }

    async fn fixture() -> Fixture {
        let store = SqliteStore::open_in_memory().await.unwrap();
        Fixture {
            services: ServiceRegistry::new(store.clone()),
            registry: AgentRegistry::new(store.clone()),
            store,
        }
    }

    fn dev_server() -> UpsertService {
        UpsertService {
            port: 3000,
            url: Some("http://localhost:3000".to_string()),
            health_check_path: None,
            script: "npm run dev".to_string(),
            cwd: Some("/srv/app".to_string()),
            interpreter: None,
            args: None,
            env: None,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn register_then_reregister_preserves_identity() {
        let fx = fixture().await;
        let agent = fx
            .registry
            .join(JoinRequest {
                name: "w1".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let first = fx
            .services
            .upsert(agent.id, "dev-server", dev_server())
            .await
            .unwrap();
        assert_eq!(first.status, ServiceStatus::Starting);
        assert_eq!(first.health_check_path, "/health");
        assert_eq!(first.agent_name.as_deref(), Some("w1"));

        let second = fx
            .services
            .upsert(
                agent.id,
                "dev-server",
                UpsertService {
                    port: 3001,
                    ..dev_server()
                },
            )
            .await
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.port, 3001);
        assert_eq!(second.status, first.status);

        // Only the initial registration logs an event.
        let log = EventLog::new(fx.store.clone());
        let events = log
            .list(EventFilter {
                event_type: Some("service_registered".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn identical_reupsert_is_a_noop_beyond_timestamps() {
        let fx = fixture().await;
        let agent = fx
            .registry
            .join(JoinRequest {
                name: "w1".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let first = fx
            .services
            .upsert(agent.id, "dev-server", dev_server())
            .await
            .unwrap();
        let second = fx
            .services
            .upsert(agent.id, "dev-server", dev_server())
            .await
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.port, first.port);
        assert_eq!(second.script, first.script);
        assert_eq!(second.status, first.status);
    }

    #[tokio::test]
    async fn status_change_events_fire_only_on_change() {
        let fx = fixture().await;
        let agent = fx
            .registry
            .join(JoinRequest {
                name: "w1".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let service = fx
            .services
            .upsert(agent.id, "dev-server", dev_server())
            .await
            .unwrap();

        fx.services
            .update_status(service.id, ServiceStatus::Healthy)
            .await
            .unwrap();
        fx.services
            .update_status(service.id, ServiceStatus::Healthy)
            .await
            .unwrap();

        let log = EventLog::new(fx.store.clone());
        let events = log
            .list(EventFilter {
                event_type: Some("service_status_change".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].old_value.as_deref(), Some("starting"));
        assert_eq!(events[0].new_value.as_deref(), Some("healthy"));
    }

    #[tokio::test]
    async fn unregister_is_owner_only() {
        let fx = fixture().await;
        let owner = fx
            .registry
            .join(JoinRequest {
                name: "owner".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let other = fx
            .registry
            .join(JoinRequest {
                name: "other".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let service = fx
            .services
            .upsert(owner.id, "dev-server", dev_server())
            .await
            .unwrap();

        let err = fx
            .services
            .unregister(service.id, other.id)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Unauthorized(_)));

        fx.services.unregister(service.id, owner.id).await.unwrap();
        assert!(matches!(
            fx.services.get(service.id).await.unwrap_err(),
            EngineError::NotFound(_, _)
        ));
    }

    #[tokio::test]
    async fn listing_filters() {
        let fx = fixture().await;
        let w1 = fx
            .registry
            .join(JoinRequest {
                name: "w1".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let w2 = fx
            .registry
            .join(JoinRequest {
                name: "w2".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        fx.services
            .upsert(w1.id, "dev-server", dev_server())
            .await
            .unwrap();
        let api = fx
            .services
            .upsert(w2.id, "api-gateway", dev_server())
            .await
            .unwrap();
        fx.services
            .update_status(api.id, ServiceStatus::Healthy)
            .await
            .unwrap();

        let all = fx.services.list(ServiceFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let healthy = fx
            .services
            .list(ServiceFilter {
                status: Some(ServiceStatus::Healthy),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].name, "api-gateway");

        let prefixed = fx
            .services
            .list(ServiceFilter {
                name_prefix: Some("dev".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(prefixed.len(), 1);

        let not_mine = fx
            .services
            .list(ServiceFilter {
                exclude_agent_id: Some(w1.id),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(not_mine.len(), 1);
        assert_eq!(not_mine[0].agent_id, w2.id);
    }

    #[tokio::test]
    async fn services_cascade_with_their_agent() {
        let fx = fixture().await;
        let agent = fx
            .registry
            .join(JoinRequest {
                name: "w1".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let service = fx
            .services
            .upsert(agent.id, "dev-server", dev_server())
            .await
            .unwrap();

        fx.registry.delete(agent.id).await.unwrap();
        assert!(matches!(
            fx.services.get(service.id).await.unwrap_err(),
            EngineError::NotFound(_, _)
        ));
    }
}
