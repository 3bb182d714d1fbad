//! Dependency-ordered recovery procedures.
//!
//! A procedure is a named async step (often "restore backup X", sometimes
//! "restart service Y") that may depend on other procedures having completed.
//! Executions are serialized through one run lock.

use crate::utils::errors::{RecoveryError, Result};
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{error, info};

pub const DEFAULT_PROCEDURE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcedureStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl fmt::Display for ProcedureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcedureStatus::Pending => "pending",
            ProcedureStatus::InProgress => "in_progress",
            ProcedureStatus::Completed => "completed",
            ProcedureStatus::Failed => "failed",
        };
        f.pad(s)
    }
}

type Handler = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct Procedure {
    name: String,
    handler: Handler,
    dependencies: Vec<String>,
    timeout: Duration,
    status: ProcedureStatus,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    error: Option<String>,
}

/// Read-only view of a registered procedure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcedureInfo {
    pub name: String,
    pub dependencies: Vec<String>,
    pub status: ProcedureStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl From<&Procedure> for ProcedureInfo {
    fn from(p: &Procedure) -> Self {
        Self {
            name: p.name.clone(),
            dependencies: p.dependencies.clone(),
            status: p.status,
            started_at: p.started_at,
            finished_at: p.finished_at,
            error: p.error.clone(),
        }
    }
}

#[derive(Default)]
pub struct RecoveryManager {
    /// Registration order is the tie-break for independent procedures
    procedures: Mutex<Vec<Procedure>>,
    run_lock: tokio::sync::Mutex<()>,
}

impl RecoveryManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn procedures(&self) -> MutexGuard<'_, Vec<Procedure>> {
        // A panic while holding the lock cannot leave the list half-updated
        self.procedures.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register_procedure<F, Fut>(
        &self,
        name: &str,
        handler: F,
        dependencies: &[&str],
        timeout: Duration,
    ) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if name.is_empty() {
            return Err(RecoveryError::Validation("procedure name must not be empty".to_string()));
        }

        let mut procedures = self.procedures();
        if procedures.iter().any(|p| p.name == name) {
            return Err(RecoveryError::Validation(format!(
                "procedure {} already registered",
                name
            )));
        }

        procedures.push(Procedure {
            name: name.to_string(),
            handler: Arc::new(move || -> BoxFuture<'static, anyhow::Result<()>> {
                Box::pin(handler())
            }),
            dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
            timeout,
            status: ProcedureStatus::Pending,
            started_at: None,
            finished_at: None,
            error: None,
        });
        Ok(())
    }

    /// Run one procedure. Its dependencies must already be completed.
    ///
    /// Returns `Ok(false)` when the handler fails or times out.
    pub async fn execute_procedure(&self, name: &str) -> Result<bool> {
        let _run = self.run_lock.lock().await;

        let (handler, timeout) = {
            let mut procedures = self.procedures();
            let procedure = procedures
                .iter()
                .find(|p| p.name == name)
                .ok_or_else(|| RecoveryError::NotFound(format!("procedure {} not found", name)))?;

            for dep in &procedure.dependencies {
                match procedures.iter().find(|p| &p.name == dep) {
                    None => {
                        return Err(RecoveryError::Validation(format!(
                            "dependency {} of {} not found",
                            dep, name
                        )))
                    }
                    Some(p) if p.status != ProcedureStatus::Completed => {
                        return Err(RecoveryError::Validation(format!(
                            "dependency {} of {} not completed",
                            dep, name
                        )))
                    }
                    Some(_) => {}
                }
            }

            let procedure = procedures
                .iter_mut()
                .find(|p| p.name == name)
                .ok_or_else(|| RecoveryError::NotFound(format!("procedure {} not found", name)))?;
            procedure.status = ProcedureStatus::InProgress;
            procedure.started_at = Some(Utc::now());
            procedure.finished_at = None;
            procedure.error = None;
            (procedure.handler.clone(), procedure.timeout)
        };

        info!(procedure = %name, "Running recovery procedure");
        let run = AssertUnwindSafe(async move { handler().await }).catch_unwind();
        let outcome = match tokio::time::timeout(timeout, run).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(e.to_string()),
            Ok(Err(panic)) => Err(format!("procedure panicked: {}", panic_message(&*panic))),
            Err(_) => Err(format!("procedure timed out after {:?}", timeout)),
        };

        let mut procedures = self.procedures();
        let Some(procedure) = procedures.iter_mut().find(|p| p.name == name) else {
            return Err(RecoveryError::NotFound(format!("procedure {} not found", name)));
        };
        procedure.finished_at = Some(Utc::now());
        match outcome {
            Ok(()) => {
                procedure.status = ProcedureStatus::Completed;
                info!(procedure = %name, "Recovery procedure completed");
                Ok(true)
            }
            Err(message) => {
                error!(procedure = %name, error = %message, "Recovery procedure failed");
                procedure.status = ProcedureStatus::Failed;
                procedure.error = Some(message);
                Ok(false)
            }
        }
    }

    /// Names in an order where every procedure follows its dependencies.
    pub fn execution_order(&self) -> Result<Vec<String>> {
        let procedures = self.procedures();
        let names: Vec<&str> = procedures.iter().map(|p| p.name.as_str()).collect();

        fn visit<'a>(
            name: &'a str,
            procedures: &'a [Procedure],
            visiting: &mut HashSet<&'a str>,
            visited: &mut HashSet<&'a str>,
            order: &mut Vec<String>,
        ) -> Result<()> {
            if visited.contains(name) {
                return Ok(());
            }
            if !visiting.insert(name) {
                return Err(RecoveryError::Validation("circular dependency detected".to_string()));
            }
            // Unknown dependencies surface when the dependent procedure runs
            if let Some(procedure) = procedures.iter().find(|p| p.name == name) {
                for dep in &procedure.dependencies {
                    visit(dep, procedures, visiting, visited, order)?;
                }
            }
            visiting.remove(name);
            visited.insert(name);
            if procedures.iter().any(|p| p.name == name) {
                order.push(name.to_string());
            }
            Ok(())
        }

        let mut visiting = HashSet::new();
        let mut visited = HashSet::new();
        let mut order = Vec::with_capacity(names.len());
        for name in names {
            visit(name, &procedures, &mut visiting, &mut visited, &mut order)?;
        }
        Ok(order)
    }

    /// Run every procedure in dependency order, stopping at the first failure.
    pub async fn execute_all(&self) -> Result<bool> {
        let order = self.execution_order()?;
        for name in order {
            if !self.execute_procedure(&name).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn procedure_status(&self, name: &str) -> Result<ProcedureStatus> {
        self.procedures()
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.status)
            .ok_or_else(|| RecoveryError::NotFound(format!("procedure {} not found", name)))
    }

    pub fn procedure(&self, name: &str) -> Option<ProcedureInfo> {
        self.procedures()
            .iter()
            .find(|p| p.name == name)
            .map(ProcedureInfo::from)
    }

    /// Every registered procedure, in registration order
    pub fn list_procedures(&self) -> Vec<ProcedureInfo> {
        self.procedures().iter().map(ProcedureInfo::from).collect()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn ok() -> anyhow::Result<()> {
        Ok(())
    }

    async fn explode() -> anyhow::Result<()> {
        panic!("disk on fire")
    }

    #[tokio::test]
    async fn test_procedure_registration() -> Result<()> {
        let manager = RecoveryManager::new();
        manager.register_procedure("test_procedure", ok, &[], DEFAULT_PROCEDURE_TIMEOUT)?;

        assert_eq!(manager.procedure_status("test_procedure")?, ProcedureStatus::Pending);
        assert!(manager
            .register_procedure("test_procedure", ok, &[], DEFAULT_PROCEDURE_TIMEOUT)
            .unwrap_err()
            .is_validation());
        Ok(())
    }

    #[tokio::test]
    async fn test_panicking_procedure_is_marked_failed() -> Result<()> {
        let manager = RecoveryManager::new();
        manager.register_procedure("explodes", explode, &[], DEFAULT_PROCEDURE_TIMEOUT)?;

        assert!(!manager.execute_procedure("explodes").await?);

        let info = manager.procedure("explodes").unwrap();
        assert_eq!(info.status, ProcedureStatus::Failed);
        assert!(info.finished_at.is_some());
        let error = info.error.unwrap();
        assert!(error.contains("disk on fire"), "{error}");
        Ok(())
    }

    #[tokio::test]
    async fn test_procedure_execution() -> Result<()> {
        let manager = RecoveryManager::new();
        manager.register_procedure("test_procedure", ok, &[], DEFAULT_PROCEDURE_TIMEOUT)?;

        assert!(manager.execute_procedure("test_procedure").await?);
        assert_eq!(manager.procedure_status("test_procedure")?, ProcedureStatus::Completed);

        let info = manager.procedure("test_procedure").unwrap();
        assert!(info.started_at.is_some());
        assert!(info.finished_at.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_procedure_is_not_found() {
        let manager = RecoveryManager::new();
        assert!(manager.execute_procedure("missing").await.unwrap_err().is_not_found());
        assert!(manager.procedure_status("missing").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_procedure_dependencies() -> Result<()> {
        let manager = RecoveryManager::new();
        let runs = Arc::new(Mutex::new(Vec::new()));

        let log = runs.clone();
        manager.register_procedure(
            "proc_b",
            move || {
                let log = log.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    log.lock().unwrap().push("proc_b");
                    Ok::<(), anyhow::Error>(())
                }
            },
            &["proc_a"],
            DEFAULT_PROCEDURE_TIMEOUT,
        )?;
        let log = runs.clone();
        manager.register_procedure(
            "proc_a",
            move || {
                let log = log.clone();
                async move {
                    log.lock().unwrap().push("proc_a");
                    Ok::<(), anyhow::Error>(())
                }
            },
            &[],
            DEFAULT_PROCEDURE_TIMEOUT,
        )?;

        // proc_b cannot run before proc_a completed
        assert!(manager.execute_procedure("proc_b").await.unwrap_err().is_validation());

        assert!(manager.execute_all().await?);
        assert_eq!(*runs.lock().unwrap(), vec!["proc_a", "proc_b"]);
        assert_eq!(manager.procedure_status("proc_a")?, ProcedureStatus::Completed);
        assert_eq!(manager.procedure_status("proc_b")?, ProcedureStatus::Completed);
        Ok(())
    }

    #[tokio::test]
    async fn test_procedure_timeout() -> Result<()> {
        let manager = RecoveryManager::new();
        manager.register_procedure(
            "slow_proc",
            || async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                Ok::<(), anyhow::Error>(())
            },
            &[],
            Duration::from_millis(50),
        )?;

        assert!(!manager.execute_procedure("slow_proc").await?);
        assert_eq!(manager.procedure_status("slow_proc")?, ProcedureStatus::Failed);
        let error = manager.procedure("slow_proc").unwrap().error.unwrap();
        assert!(error.contains("timed out"));
        Ok(())
    }

    #[tokio::test]
    async fn test_circular_dependencies() -> Result<()> {
        let manager = RecoveryManager::new();
        manager.register_procedure("proc_a", ok, &["proc_b"], DEFAULT_PROCEDURE_TIMEOUT)?;
        manager.register_procedure("proc_b", ok, &["proc_a"], DEFAULT_PROCEDURE_TIMEOUT)?;

        let err = manager.execute_all().await.unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("circular dependency detected"));
        Ok(())
    }

    #[tokio::test]
    async fn test_execute_all_stops_at_first_failure() -> Result<()> {
        let manager = RecoveryManager::new();
        let later = Arc::new(AtomicUsize::new(0));

        manager.register_procedure(
            "restore_state",
            || async { Err::<(), _>(anyhow::anyhow!("state adapter unavailable")) },
            &[],
            DEFAULT_PROCEDURE_TIMEOUT,
        )?;
        let counter = later.clone();
        manager.register_procedure(
            "restart",
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), anyhow::Error>(())
                }
            },
            &[],
            DEFAULT_PROCEDURE_TIMEOUT,
        )?;

        assert!(!manager.execute_all().await?);
        assert_eq!(later.load(Ordering::SeqCst), 0);

        let listed = manager.list_procedures();
        assert_eq!(listed[0].status, ProcedureStatus::Failed);
        assert_eq!(listed[0].error.as_deref(), Some("state adapter unavailable"));
        assert_eq!(listed[1].status, ProcedureStatus::Pending);
        Ok(())
    }
}
