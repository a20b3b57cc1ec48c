//! CLI command implementations.
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `run`    | `Run`, `Resume`  |
//! | `status` | `Status`         |

pub mod run;
pub mod status;

pub use run::{cmd_resume, cmd_run};
pub use status::cmd_status;

use std::path::{Path, PathBuf};

use sysrev::config::DEFAULT_DATA_DIR;
use sysrev::errors::EngineError;
use sysrev_common::WorkflowId;

/// Directory under the data dir that receives the rolling log file.
pub const LOG_DIR: &str = "logs";

/// 2 for configuration problems, 1 for any other failure.
pub fn exit_code(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<EngineError>()
        .map(EngineError::exit_code)
        .unwrap_or(1)
}

/// Absolute form of `path`, resolved against the current directory.
pub fn absolute_dir(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// The command that continues `workflow_id`, runnable from any directory.
///
/// `--data-dir` is left out only when `data_dir` is the default for the
/// current directory, where `resume` would look anyway.
pub fn resume_command(data_dir: &Path, workflow_id: &WorkflowId) -> String {
    let data_dir = absolute_dir(data_dir);
    if data_dir == absolute_dir(Path::new(DEFAULT_DATA_DIR)) {
        return format!("sysrev resume --workflow-id {}", workflow_id);
    }
    let shown = data_dir.display().to_string();
    let shown = if shown.contains(char::is_whitespace) {
        format!("'{}'", shown)
    } else {
        shown
    };
    format!("sysrev --data-dir {} resume --workflow-id {}", shown, workflow_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sysrev::errors::ConfigError;

    #[test]
    fn resume_command_names_non_default_data_dir() {
        let id = WorkflowId::from("wf-1");
        let default = std::env::current_dir().unwrap().join(DEFAULT_DATA_DIR);
        assert_eq!(resume_command(&default, &id), "sysrev resume --workflow-id wf-1");
        assert_eq!(
            resume_command(Path::new(DEFAULT_DATA_DIR), &id),
            "sysrev resume --workflow-id wf-1"
        );

        let elsewhere = std::env::temp_dir().join("proj").join(DEFAULT_DATA_DIR);
        assert_eq!(
            resume_command(&elsewhere, &id),
            format!("sysrev --data-dir {} resume --workflow-id wf-1", elsewhere.display())
        );

        let relative = resume_command(Path::new("data"), &id);
        let expected = std::env::current_dir().unwrap().join("data");
        assert!(relative.contains(&expected.display().to_string()), "{relative}");
    }

    #[test]
    fn exit_code_follows_engine_error() {
        let config: anyhow::Error = EngineError::from(ConfigError::invalid("topic", "empty")).into();
        assert_eq!(exit_code(&config), 2);

        let aborted: anyhow::Error = EngineError::Aborted.into();
        assert_eq!(exit_code(&aborted), 1);

        assert_eq!(exit_code(&anyhow::anyhow!("anything else")), 1);
    }
}
