//! Artifact-reuse rollback.
//!
//! A rollback never mutates history: it creates a fresh deployment at the
//! next version whose artifact and configuration are copied from the
//! target, entering the pipeline at Built so the build phase is skipped.

use chrono::Utc;
use strata_store::{DeploymentRecord, DeploymentStatus, Store, StoreError};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum RollbackError {
    #[error("deployment {0} not found for this service")]
    DeploymentNotFound(Uuid),
    #[error("deployment {0} has no artifact to roll back to")]
    NoArtifact(Uuid),
    #[error("no previous successful deployment of {app_id}/{service_name}")]
    NoPreviousDeployment {
        app_id: String,
        service_name: String,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Roll `app_id/service_name` back to the artifact of `target_id`.
///
/// The target must belong to the service and carry a non-empty artifact.
/// Returns the newly created deployment (status Built).
pub fn rollback(
    store: &Store,
    app_id: &str,
    service_name: &str,
    target_id: Uuid,
) -> Result<DeploymentRecord, RollbackError> {
    let target = store
        .get_deployment(target_id)
        .filter(|d| d.app_id == app_id && d.service_name == service_name)
        .ok_or(RollbackError::DeploymentNotFound(target_id))?;
    if target.artifact.is_empty() {
        return Err(RollbackError::NoArtifact(target_id));
    }

    let now = Utc::now();
    let record = DeploymentRecord {
        id: Uuid::new_v4(),
        app_id: target.app_id.clone(),
        service_name: target.service_name.clone(),
        version: store.next_version(app_id, service_name),
        git_ref: target.git_ref.clone(),
        git_commit: target.git_commit.clone(),
        build_type: target.build_type,
        artifact: target.artifact.clone(),
        status: DeploymentStatus::Built,
        node_id: None,
        resource_spec: target.resource_spec.clone(),
        depends_on: target.depends_on.clone(),
        config: target.config.clone(),
        created_at: now,
        updated_at: now,
        started_at: None,
        finished_at: None,
        error_message: None,
        exit_code: None,
    };
    store.insert_deployment(record.clone());
    info!(
        app_id,
        service_name,
        target = %target_id,
        target_version = target.version,
        new_version = record.version,
        "rollback deployment created"
    );
    Ok(record)
}

/// Roll back to the newest Running deployment with a non-empty artifact.
pub fn rollback_to_latest_successful(
    store: &Store,
    app_id: &str,
    service_name: &str,
) -> Result<DeploymentRecord, RollbackError> {
    let target = store
        .list_for_service(app_id, service_name)
        .into_iter()
        .filter(|d| d.status == DeploymentStatus::Running && !d.artifact.is_empty())
        .max_by_key(|d| d.version)
        .ok_or_else(|| RollbackError::NoPreviousDeployment {
            app_id: app_id.to_string(),
            service_name: service_name.to_string(),
        })?;
    rollback(store, app_id, service_name, target.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_proto::{BuildType, ServiceConfig};
    use strata_store::ResourceSpec;

    fn record(app: &str, service: &str, version: i64, status: DeploymentStatus) -> DeploymentRecord {
        DeploymentRecord {
            id: Uuid::new_v4(),
            app_id: app.to_string(),
            service_name: service.to_string(),
            version,
            git_ref: "main".to_string(),
            git_commit: format!("commit-{version}"),
            build_type: BuildType::Nix,
            artifact: format!("/nix/store/{service}-{version}"),
            status,
            node_id: None,
            resource_spec: Some(ResourceSpec {
                cpu: "1".to_string(),
                memory: "1Gi".to_string(),
            }),
            depends_on: vec!["db".to_string()],
            config: ServiceConfig {
                ports: vec![8080],
                ..ServiceConfig::default()
            },
            created_at: Utc::now(),
            updated_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error_message: None,
            exit_code: None,
        }
    }

    #[test]
    fn rollback_copies_target_and_bumps_version() {
        let store = Store::in_memory();
        let v1 = record("a", "api", 1, DeploymentStatus::Stopped);
        store.insert_deployment(v1.clone());
        store.insert_deployment(record("a", "api", 2, DeploymentStatus::Failed));

        let created = rollback(&store, "a", "api", v1.id).expect("rollback");
        assert!(created.version > v1.version);
        assert_eq!(created.version, 3);
        assert_eq!(created.artifact, v1.artifact);
        assert_eq!(created.build_type, v1.build_type);
        assert_eq!(created.git_commit, v1.git_commit);
        assert_eq!(created.resource_spec, v1.resource_spec);
        assert_eq!(created.depends_on, v1.depends_on);
        assert_eq!(created.config, v1.config);
        assert_eq!(created.status, DeploymentStatus::Built);
        assert_eq!((created.app_id.as_str(), created.service_name.as_str()), ("a", "api"));
        assert!(created.node_id.is_none());
    }

    #[test]
    fn rollback_rejects_wrong_service_target() {
        let store = Store::in_memory();
        let other = record("a", "worker", 1, DeploymentStatus::Running);
        store.insert_deployment(other.clone());

        let err = rollback(&store, "a", "api", other.id).unwrap_err();
        assert!(matches!(err, RollbackError::DeploymentNotFound(_)));

        let err = rollback(&store, "a", "api", Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, RollbackError::DeploymentNotFound(_)));
    }

    #[test]
    fn rollback_rejects_artifactless_target() {
        let store = Store::in_memory();
        let mut unbuilt = record("a", "api", 1, DeploymentStatus::Failed);
        unbuilt.artifact = String::new();
        store.insert_deployment(unbuilt.clone());

        let err = rollback(&store, "a", "api", unbuilt.id).unwrap_err();
        assert!(matches!(err, RollbackError::NoArtifact(_)));
    }

    #[test]
    fn latest_successful_targets_max_running_version() {
        let store = Store::in_memory();
        store.insert_deployment(record("a", "api", 1, DeploymentStatus::Running));
        let v2 = record("a", "api", 2, DeploymentStatus::Running);
        store.insert_deployment(v2.clone());
        store.insert_deployment(record("a", "api", 3, DeploymentStatus::Failed));

        let created = rollback_to_latest_successful(&store, "a", "api").expect("rollback");
        assert_eq!(created.artifact, v2.artifact);
        assert_eq!(created.version, 4);
    }

    #[test]
    fn latest_successful_requires_a_running_candidate() {
        let store = Store::in_memory();
        store.insert_deployment(record("a", "api", 1, DeploymentStatus::Failed));
        let mut running_no_artifact = record("a", "api", 2, DeploymentStatus::Running);
        running_no_artifact.artifact = String::new();
        store.insert_deployment(running_no_artifact);

        let err = rollback_to_latest_successful(&store, "a", "api").unwrap_err();
        assert!(matches!(err, RollbackError::NoPreviousDeployment { .. }));
    }
}
