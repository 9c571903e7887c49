use thiserror::Error;
use tracing::{error, info, instrument};

use crate::auth::{AuthError, TokenProvider};
use crate::heartbeat::{HeartbeatWorkflow, WorkflowError};
use crate::model::HeartbeatReport;
use crate::notify::{Delivery, Notifier, Outcome};

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
}

#[derive(Debug)]
pub struct RunSummary {
    pub exit_code: i32,
    /// Present only when every workflow step succeeded.
    pub report: Option<HeartbeatReport>,
    pub error: Option<RunError>,
    pub delivery: Delivery,
}

impl RunSummary {
    pub fn succeeded(&self) -> bool {
        self.exit_code == EXIT_SUCCESS
    }
}

/// Token, then workflow, then one notification. The notification outcome
/// never changes the exit code.
#[instrument(skip_all)]
pub async fn run(
    provider: &dyn TokenProvider,
    workflow: &HeartbeatWorkflow<'_>,
    notifier: &Notifier,
) -> RunSummary {
    match heartbeat(provider, workflow).await {
        Ok(report) => {
            info!(file = %report.uploaded_file_name, "heartbeat completed");
            let delivery = notifier.notify(Outcome::Success(&report)).await;
            RunSummary {
                exit_code: EXIT_SUCCESS,
                report: Some(report),
                error: None,
                delivery,
            }
        }
        Err(err) => {
            error!(%err, "heartbeat failed");
            let message = err.to_string();
            let delivery = notifier.notify(Outcome::Failure(&message)).await;
            RunSummary {
                exit_code: EXIT_FAILURE,
                report: None,
                error: Some(err),
                delivery,
            }
        }
    }
}

async fn heartbeat(
    provider: &dyn TokenProvider,
    workflow: &HeartbeatWorkflow<'_>,
) -> Result<HeartbeatReport, RunError> {
    info!("acquiring Graph access token (device code sign-in)");
    let credential = provider.acquire_token().await?;
    info!(upn = %workflow.target_identity(), "token acquired; calling Graph");
    Ok(workflow.run(&credential).await?)
}
