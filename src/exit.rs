use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success,
    NodeFailures,
    InvalidArgs,
    RunFailed,
    ExternalCommandFailed,
    Interrupted,
}

impl ExitCode {
    pub const fn as_i32(self) -> i32 {
        match self {
            ExitCode::Success => 0,
            ExitCode::NodeFailures => 1,
            ExitCode::InvalidArgs => 2,
            ExitCode::RunFailed => 10,
            ExitCode::ExternalCommandFailed => 20,
            ExitCode::Interrupted => 130,
        }
    }
}

#[derive(Debug)]
pub struct ExitError {
    pub code: ExitCode,
    pub err: anyhow::Error,
}

impl ExitError {
    pub fn new(code: ExitCode, err: anyhow::Error) -> Self {
        Self { code, err }
    }
}

impl fmt::Display for ExitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.err.fmt(f)
    }
}

impl std::error::Error for ExitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.err.as_ref())
    }
}

pub fn exit_code(err: &anyhow::Error) -> i32 {
    if let Some(exit) = err.downcast_ref::<ExitError>() {
        return exit.code.as_i32();
    }
    ExitCode::RunFailed.as_i32()
}

pub fn invalid_args(message: impl Into<String>) -> anyhow::Error {
    ExitError::new(ExitCode::InvalidArgs, anyhow::anyhow!(message.into())).into()
}

pub fn invalid_args_err(err: anyhow::Error) -> anyhow::Error {
    ExitError::new(ExitCode::InvalidArgs, err).into()
}

pub fn external_cmd(message: impl Into<String>) -> anyhow::Error {
    ExitError::new(
        ExitCode::ExternalCommandFailed,
        anyhow::anyhow!(message.into()),
    )
    .into()
}

pub fn node_failures(message: impl Into<String>) -> anyhow::Error {
    ExitError::new(ExitCode::NodeFailures, anyhow::anyhow!(message.into())).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_errors_map_to_run_failed() {
        assert_eq!(exit_code(&anyhow::anyhow!("io")), 10);
    }

    #[test]
    fn tagged_errors_keep_their_code() {
        assert_eq!(exit_code(&invalid_args("bad")), 2);
        assert_eq!(exit_code(&node_failures("1 node failed")), 1);
        assert_eq!(exit_code(&external_cmd("powershell")), 20);
        assert_eq!(ExitCode::Interrupted.as_i32(), 130);
    }

    #[test]
    fn context_does_not_hide_the_code() {
        let err = invalid_args("bad").context("while loading");
        assert_eq!(exit_code(&err), 2);
    }
}
