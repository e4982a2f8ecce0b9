//! Read-only access to the three external stores the indexer draws from:
//! Codebase Intelligence (symbols, dependency edges), Architect (service
//! map, domain entities), and Contract Engine (contracts). Each is
//! fetched through its own fallible call so a failure in one never
//! blocks the others — the build pipeline records failures in an
//! `errors` list instead of aborting.

use async_trait::async_trait;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::fleet::ServiceDefinition;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("source store unreachable: {0}")]
    Unreachable(#[from] rusqlite::Error),
    #[error("source store returned malformed data: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolDef {
    /// `file::symbol`, matching the dependency-edge store's own format.
    pub id: String,
    pub file_path: String,
    pub name: String,
    /// e.g. `class`, `interface`, `type`, `function`.
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyEdge {
    /// `file::symbol` on both ends, store-native format — translation to
    /// graph node IDs (`symbol::file::symbol`) happens in the builder.
    pub source: String,
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEntity {
    pub id: String,
    pub name: String,
    pub owner_service: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contract {
    pub contract_id: String,
    pub service_name: String,
    /// OpenAPI `paths` object, parsed for `(method, path)` pairs when
    /// deriving endpoint nodes.
    pub openapi_paths: serde_json::Value,
    /// AsyncAPI `channels` object, parsed for event names.
    pub asyncapi_channels: serde_json::Value,
}

#[async_trait]
pub trait SourceStores: Send + Sync {
    async fn load_symbols(&self) -> Result<Vec<SymbolDef>, StoreError>;
    async fn load_dependency_edges(&self) -> Result<Vec<DependencyEdge>, StoreError>;
    async fn load_service_map(&self) -> Result<Vec<ServiceDefinition>, StoreError>;
    async fn load_domain_entities(&self) -> Result<Vec<DomainEntity>, StoreError>;
    async fn load_contracts(&self) -> Result<Vec<Contract>, StoreError>;
}

/// Reads three sibling SQLite databases. Each database is opened
/// read-only and only for the duration of one call — these reads are
/// short and synchronous, matching the state store's own I/O model.
pub struct SqliteSourceStores {
    pub codebase_db: std::path::PathBuf,
    pub architect_db: std::path::PathBuf,
    pub contract_db: std::path::PathBuf,
}

impl SqliteSourceStores {
    pub fn new(codebase_db: impl AsRef<Path>, architect_db: impl AsRef<Path>, contract_db: impl AsRef<Path>) -> Self {
        Self {
            codebase_db: codebase_db.as_ref().to_path_buf(),
            architect_db: architect_db.as_ref().to_path_buf(),
            contract_db: contract_db.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl SourceStores for SqliteSourceStores {
    async fn load_symbols(&self) -> Result<Vec<SymbolDef>, StoreError> {
        let conn = Connection::open(&self.codebase_db)?;
        let mut stmt = conn.prepare("SELECT id, file_path, name, kind FROM symbols")?;
        let rows = stmt.query_map([], |row| {
            Ok(SymbolDef {
                id: row.get(0)?,
                file_path: row.get(1)?,
                name: row.get(2)?,
                kind: row.get(3)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    async fn load_dependency_edges(&self) -> Result<Vec<DependencyEdge>, StoreError> {
        let conn = Connection::open(&self.codebase_db)?;
        let mut stmt = conn.prepare("SELECT source, target FROM dependency_edges")?;
        let rows = stmt.query_map([], |row| {
            Ok(DependencyEdge {
                source: row.get(0)?,
                target: row.get(1)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    async fn load_service_map(&self) -> Result<Vec<ServiceDefinition>, StoreError> {
        let conn = Connection::open(&self.architect_db)?;
        let mut stmt = conn.prepare("SELECT service_name, description, dependencies, extra FROM services")?;
        let rows = stmt.query_map([], |row| {
            let dependencies_json: String = row.get(2)?;
            let extra_json: String = row.get(3)?;
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, dependencies_json, extra_json))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (service_name, description, dependencies_json, extra_json) = row?;
            let dependencies: Vec<String> =
                serde_json::from_str(&dependencies_json).map_err(|e| StoreError::Malformed(format!("dependencies for {service_name}: {e}")))?;
            let extra: serde_json::Value = serde_json::from_str(&extra_json).unwrap_or(serde_json::Value::Null);
            out.push(ServiceDefinition {
                service_name,
                description,
                dependencies,
                extra,
            });
        }
        Ok(out)
    }

    async fn load_domain_entities(&self) -> Result<Vec<DomainEntity>, StoreError> {
        let conn = Connection::open(&self.architect_db)?;
        let mut stmt = conn.prepare("SELECT id, name, owner_service FROM domain_entities")?;
        let rows = stmt.query_map([], |row| {
            Ok(DomainEntity {
                id: row.get(0)?,
                name: row.get(1)?,
                owner_service: row.get(2)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    async fn load_contracts(&self) -> Result<Vec<Contract>, StoreError> {
        let conn = Connection::open(&self.contract_db)?;
        let mut stmt = conn.prepare("SELECT contract_id, service_name, openapi_paths, asyncapi_channels FROM contracts")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (contract_id, service_name, openapi_json, asyncapi_json) = row?;
            out.push(Contract {
                contract_id,
                service_name,
                openapi_paths: serde_json::from_str(&openapi_json).unwrap_or(serde_json::Value::Null),
                asyncapi_channels: serde_json::from_str(&asyncapi_json).unwrap_or(serde_json::Value::Null),
            });
        }
        Ok(out)
    }
}

/// Test double: holds the loaded data directly, no I/O.
#[derive(Debug, Clone, Default)]
pub struct InMemorySourceStores {
    pub symbols: Vec<SymbolDef>,
    pub dependency_edges: Vec<DependencyEdge>,
    pub service_map: Vec<ServiceDefinition>,
    pub domain_entities: Vec<DomainEntity>,
    pub contracts: Vec<Contract>,
}

#[async_trait]
impl SourceStores for InMemorySourceStores {
    async fn load_symbols(&self) -> Result<Vec<SymbolDef>, StoreError> {
        Ok(self.symbols.clone())
    }

    async fn load_dependency_edges(&self) -> Result<Vec<DependencyEdge>, StoreError> {
        Ok(self.dependency_edges.clone())
    }

    async fn load_service_map(&self) -> Result<Vec<ServiceDefinition>, StoreError> {
        Ok(self.service_map.clone())
    }

    async fn load_domain_entities(&self) -> Result<Vec<DomainEntity>, StoreError> {
        Ok(self.domain_entities.clone())
    }

    async fn load_contracts(&self) -> Result<Vec<Contract>, StoreError> {
        Ok(self.contracts.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_store_roundtrips_service_map() {
        let store = InMemorySourceStores {
            service_map: vec![ServiceDefinition {
                service_name: "auth".to_string(),
                description: String::new(),
                dependencies: Vec::new(),
                extra: serde_json::Value::Null,
            }],
            ..Default::default()
        };
        let loaded = store.load_service_map().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].service_name, "auth");
    }

    #[tokio::test]
    async fn sqlite_store_on_missing_db_returns_unreachable_error() {
        let store = SqliteSourceStores::new(
            "/nonexistent/codebase.db",
            "/nonexistent/architect.db",
            "/nonexistent/contract.db",
        );
        let err = store.load_symbols().await.unwrap_err();
        assert!(matches!(err, StoreError::Unreachable(_)));
    }
}
