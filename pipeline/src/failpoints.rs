use fail::fail_point;

use crate::bail;
use crate::error::{ErrorKind, PipelineResult};

pub const TASKS_RUNNER_BEFORE_START: &str = "tasks_runner.before_start";
pub const IMPORTER_BEFORE_ACK: &str = "importer.before_ack";
pub const PROGRESS_PERSISTER_BEFORE_PERSIST: &str = "progress_persister.before_persist";

pub fn pipeline_fail_point(name: &str) -> PipelineResult<()> {
    fail_point!(name, |parameter| {
        let mut error_kind = ErrorKind::Injected;
        if let Some(parameter) = parameter {
            error_kind = match parameter.as_str() {
                "source_io" => ErrorKind::SourceIoError,
                "sink" => ErrorKind::SinkError,
                _ => ErrorKind::Injected,
            }
        }

        bail!(
            error_kind,
            "An error occurred in a fail point",
            format!("The failpoint '{name}' returned an error")
        );
    });

    Ok(())
}
