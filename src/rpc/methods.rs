//! RPC method handlers.
//!
//! Dispatches JSON-RPC method calls to the orchestrator.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use crate::context::AppContext;
use crate::core::models::{DrTestParameters, JobStatus, JobType, RestoreOptions};
use crate::core::{Client, JobPhase, ProvisionAction};
use crate::db::{JobFilter, Page};
use crate::error::OrchestratorError;

use super::protocol::{Request, Response, RpcError};

const DEFAULT_PAGE_SIZE: u32 = 20;

/// Handles RPC method dispatch and execution.
pub struct MethodHandler {
    ctx: AppContext,
    start_time: Instant,
}

#[derive(Deserialize)]
struct ById {
    id: String,
}

#[derive(Deserialize)]
struct ClientId {
    client_id: String,
}

#[derive(Deserialize)]
struct ClientPage {
    client_id: String,
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    limit: Option<u32>,
}

impl ClientPage {
    fn page(&self) -> Page {
        Page::new(self.page.unwrap_or(1), self.limit.unwrap_or(DEFAULT_PAGE_SIZE))
    }
}

/// Decode params. A missing params member decodes like an empty object.
fn parse<T: DeserializeOwned>(id: &Value, params: Value) -> Result<T, Response> {
    let params = match params {
        Value::Null => Value::Object(Default::default()),
        other => other,
    };
    serde_json::from_value(params).map_err(|e| Response::invalid_params(id.clone(), e.to_string()))
}

fn respond<T: Serialize>(id: Value, result: Result<T, OrchestratorError>) -> Response {
    match result {
        Ok(value) => Response::success(id, value),
        Err(e) => Response::failure(id, RpcError::from(&e)),
    }
}

macro_rules! params {
    ($id:expr, $params:expr) => {
        match parse(&$id, $params) {
            Ok(p) => p,
            Err(response) => return response,
        }
    };
}

impl MethodHandler {
    pub fn new(ctx: AppContext) -> Self {
        Self {
            ctx,
            start_time: Instant::now(),
        }
    }

    /// Handle an RPC request and return a response.
    pub async fn handle(&self, request: Request) -> Response {
        let id = request.id.clone().unwrap_or(Value::Null);
        let params = request.params.unwrap_or(Value::Null);

        match request.method.as_str() {
            "daemon.status" => self.daemon_status(id).await,
            "jobs.get" => self.jobs_get(id, params).await,
            "jobs.list" => self.jobs_list(id, params).await,
            "jobs.cancel" => self.jobs_cancel(id, params).await,
            "jobs.counts" => self.jobs_counts(id, params).await,
            "backup.start" => self.backup_start(id, params).await,
            "restore.start" => self.restore_start(id, params).await,
            "restore.cancel" => self.restore_cancel(id, params).await,
            "restore.history" => self.restore_history(id, params).await,
            "drtest.start" => self.drtest_start(id, params).await,
            "drtest.result" => self.drtest_result(id, params).await,
            "drtest.compliance" => self.drtest_compliance(id, params).await,
            "drtest.history" => self.drtest_history(id, params).await,
            "drtest.sweep" => respond(id, self.ctx.scheduler.schedule_periodic_dr_tests().await),
            "provision.init" => self.provision(id, params, ProvisionAction::Init).await,
            "provision.update" => self.provision(id, params, ProvisionAction::Update).await,
            "provision.destroy" => self.provision(id, params, ProvisionAction::Destroy).await,
            "provision.restore" => self.provision_restore(id, params).await,
            "progress.active" => self.progress_active(id).await,
            "clients.upsert" => self.clients_upsert(id, params).await,
            "clients.get" => self.clients_get(id, params).await,
            _ => Response::method_not_found(id, &request.method),
        }
    }

    /// Get daemon status/health information.
    async fn daemon_status(&self, id: Value) -> Response {
        #[derive(Serialize)]
        struct DaemonStatus {
            version: &'static str,
            uptime_secs: u64,
            active_jobs: usize,
            rpc_bind: String,
            simulation: bool,
        }

        Response::success(
            id,
            DaemonStatus {
                version: env!("CARGO_PKG_VERSION"),
                uptime_secs: self.start_time.elapsed().as_secs(),
                active_jobs: self.ctx.orchestrator.active_jobs(),
                rpc_bind: self.ctx.config.rpc_bind.clone(),
                simulation: self.ctx.config.simulation,
            },
        )
    }

    async fn jobs_get(&self, id: Value, params: Value) -> Response {
        let params: ById = params!(id, params);
        respond(id, self.ctx.orchestrator.get_status(&params.id).await)
    }

    /// List jobs with optional filtering and pagination.
    async fn jobs_list(&self, id: Value, params: Value) -> Response {
        #[derive(Deserialize)]
        struct Params {
            #[serde(default)]
            client_id: Option<String>,
            #[serde(default)]
            job_type: Option<String>,
            #[serde(default)]
            status: Option<String>,
            #[serde(default)]
            page: Option<u32>,
            #[serde(default)]
            limit: Option<u32>,
        }

        let params: Params = params!(id, params);

        let mut filter = JobFilter {
            client_id: params.client_id,
            ..Default::default()
        };
        if let Some(raw) = params.job_type.as_deref() {
            match JobType::parse(raw) {
                Some(job_type) => filter = filter.of_type(job_type),
                None => return Response::invalid_params(id, format!("Unknown job type: {}", raw)),
            }
        }
        if let Some(raw) = params.status.as_deref() {
            match JobStatus::parse(raw) {
                Some(status) => filter = filter.with_status(status),
                None => return Response::invalid_params(id, format!("Unknown status: {}", raw)),
            }
        }

        let page = Page::new(params.page.unwrap_or(1), params.limit.unwrap_or(DEFAULT_PAGE_SIZE));
        respond(id, self.ctx.orchestrator.list_jobs(&filter, page).await)
    }

    async fn jobs_cancel(&self, id: Value, params: Value) -> Response {
        #[derive(Deserialize)]
        struct Params {
            id: String,
            #[serde(default)]
            reason: Option<String>,
        }

        let params: Params = params!(id, params);
        respond(
            id,
            self.ctx
                .orchestrator
                .cancel_job(&params.id, params.reason.as_deref())
                .await,
        )
    }

    async fn jobs_counts(&self, id: Value, params: Value) -> Response {
        #[derive(Deserialize)]
        struct Params {
            #[serde(default)]
            client_id: Option<String>,
        }

        let params: Params = params!(id, params);
        let counts = self
            .ctx
            .orchestrator
            .count_by_status(params.client_id.as_deref())
            .await
            .map(|counts| {
                counts
                    .into_iter()
                    .map(|(status, n)| (status.as_str(), n))
                    .collect::<BTreeMap<_, _>>()
            });
        respond(id, counts)
    }

    async fn backup_start(&self, id: Value, params: Value) -> Response {
        let params: ClientId = params!(id, params);
        respond(id, self.ctx.orchestrator.start_backup(&params.client_id).await)
    }

    async fn restore_start(&self, id: Value, params: Value) -> Response {
        #[derive(Deserialize)]
        struct Params {
            client_id: String,
            #[serde(default)]
            backup_id: Option<String>,
            #[serde(default)]
            options: RestoreOptions,
        }

        let params: Params = params!(id, params);
        respond(
            id,
            self.ctx
                .orchestrator
                .start_restore(&params.client_id, params.backup_id.as_deref(), params.options)
                .await,
        )
    }

    async fn restore_cancel(&self, id: Value, params: Value) -> Response {
        let params: ById = params!(id, params);
        respond(id, self.ctx.orchestrator.cancel_restore(&params.id).await)
    }

    async fn restore_history(&self, id: Value, params: Value) -> Response {
        let params: ClientPage = params!(id, params);
        respond(
            id,
            self.ctx
                .orchestrator
                .restore_history(&params.client_id, params.page())
                .await,
        )
    }

    async fn drtest_start(&self, id: Value, params: Value) -> Response {
        #[derive(Deserialize)]
        struct Params {
            client_id: String,
            #[serde(default)]
            backup_id: Option<String>,
            #[serde(default)]
            parameters: DrTestParameters,
        }

        let params: Params = params!(id, params);
        respond(
            id,
            self.ctx
                .orchestrator
                .start_dr_test(&params.client_id, params.backup_id.as_deref(), params.parameters)
                .await,
        )
    }

    async fn drtest_result(&self, id: Value, params: Value) -> Response {
        let params: ById = params!(id, params);
        respond(id, self.ctx.orchestrator.dr_test_result(&params.id).await)
    }

    async fn drtest_compliance(&self, id: Value, params: Value) -> Response {
        let params: ClientId = params!(id, params);
        respond(
            id,
            self.ctx
                .orchestrator
                .dr_compliance_report(&params.client_id)
                .await,
        )
    }

    async fn drtest_history(&self, id: Value, params: Value) -> Response {
        let params: ClientPage = params!(id, params);
        respond(
            id,
            self.ctx
                .orchestrator
                .dr_test_history(&params.client_id, params.page())
                .await,
        )
    }

    async fn provision(&self, id: Value, params: Value, action: ProvisionAction) -> Response {
        let params: ClientId = params!(id, params);
        respond(
            id,
            self.ctx
                .orchestrator
                .start_provisioning(&params.client_id, action)
                .await,
        )
    }

    async fn provision_restore(&self, id: Value, params: Value) -> Response {
        #[derive(Deserialize)]
        struct Params {
            client_id: String,
            #[serde(default)]
            backup_id: Option<String>,
        }

        let params: Params = params!(id, params);
        let action = ProvisionAction::Restore {
            backup_id: params.backup_id,
        };
        respond(
            id,
            self.ctx
                .orchestrator
                .start_provisioning(&params.client_id, action)
                .await,
        )
    }

    /// Phases of every job with a live body.
    async fn progress_active(&self, id: Value) -> Response {
        #[derive(Serialize)]
        struct ActiveProgress {
            jobs: HashMap<String, JobPhase>,
            count: usize,
        }

        let jobs = self.ctx.progress.get_all().await;
        let count = jobs.len();
        Response::success(id, ActiveProgress { jobs, count })
    }

    async fn clients_upsert(&self, id: Value, params: Value) -> Response {
        #[derive(Deserialize)]
        struct Params {
            client: Client,
        }

        let params: Params = params!(id, params);
        let result = self.ctx.orchestrator.save_client(&params.client).await;
        respond(id, result.map(|()| params.client))
    }

    async fn clients_get(&self, id: Value, params: Value) -> Response {
        let params: ById = params!(id, params);
        let result = match self.ctx.orchestrator.clients().get(&params.id).await {
            Ok(Some(client)) => Ok(client),
            Ok(None) => Err(OrchestratorError::not_found(format!(
                "Client {} not found",
                params.id
            ))),
            Err(e) => Err(e.into()),
        };
        respond(id, result)
    }
}
