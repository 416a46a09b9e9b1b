//! `upload-artifact` action
//!
//! Declares files as outputs of the step so the artifact publisher can pick
//! them up once the run succeeds. Parameter `path` takes a glob or a list of
//! globs relative to the working directory. Persisting the files is left to
//! the publisher and its storage collaborator.

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use super::{Action, ActionInvocation, ActionOutcome, resolve_outputs};

pub const UPLOAD_ARTIFACT: &str = "upload-artifact";

#[derive(Default)]
pub struct UploadArtifactAction {}

impl UploadArtifactAction {
    pub fn new() -> Self {
        Self {}
    }
}

#[async_trait]
impl Action for UploadArtifactAction {
    fn name(&self) -> &str {
        UPLOAD_ARTIFACT
    }

    async fn run(&self, invocation: ActionInvocation) -> Result<ActionOutcome> {
        let patterns = invocation.string_list_param("path")?;
        if patterns.is_empty() {
            anyhow::bail!("upload-artifact requires a 'path' parameter");
        }

        let outputs = resolve_outputs(
            &patterns,
            &invocation.working_directory,
            &invocation.workspace,
        )?;

        if outputs.is_empty() {
            warn!(
                "Step '{}': no files found for {}",
                invocation.step_name,
                patterns.join(", ")
            );
        } else {
            info!(
                "Step '{}': declared {} output file(s)",
                invocation.step_name,
                outputs.len()
            );
        }

        Ok(ActionOutcome::success_with_outputs(outputs))
    }
}
