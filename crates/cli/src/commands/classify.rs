//! Show how a raw provider error would be handled

use anyhow::Result;
use clap::{Args, ValueEnum};
use serde::Serialize;
use vcloud_common::ProviderError;
use vcloud_provider::classifier::{self, Phase};
use vcloud_provider::PluginConfig;

use crate::output::{print_info, print_list, OutputFormat, TableDisplay};

/// Provider exception type
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ErrorType {
    EntityNotFound,
    NotFound,
    BadRequest,
    AccessForbidden,
    MissingLink,
    InternalServer,
    TaskFailed,
    Sdk,
    InvalidResponse,
}

#[derive(Args)]
pub struct ClassifyArgs {
    /// Error message as the provider reported it
    pub message: String,

    /// Exception type
    #[arg(long, value_enum, default_value = "bad-request")]
    pub kind: ErrorType,

    /// Minor error code of a bad request
    #[arg(long)]
    pub minor_code: Option<String>,

    /// Operation verb the error surfaced in
    #[arg(long, default_value = "create")]
    pub operation: String,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct Classification {
    pub phase: String,
    pub kind: String,
    pub policy: String,
}

impl TableDisplay for Classification {
    fn headers() -> Vec<&'static str> {
        vec!["Phase", "Kind", "Policy"]
    }

    fn row(&self) -> Vec<String> {
        vec![self.phase.clone(), self.kind.clone(), self.policy.clone()]
    }
}

pub fn build_error(kind: ErrorType, message: String, minor_code: Option<String>) -> ProviderError {
    match kind {
        ErrorType::EntityNotFound => ProviderError::EntityNotFound(message),
        ErrorType::NotFound => ProviderError::NotFound(message),
        ErrorType::BadRequest => ProviderError::BadRequest {
            minor_code,
            message: Some(message).filter(|m| !m.is_empty()),
        },
        ErrorType::AccessForbidden => ProviderError::AccessForbidden(message),
        ErrorType::MissingLink => ProviderError::MissingLink(message),
        ErrorType::InternalServer => ProviderError::InternalServer(message),
        ErrorType::TaskFailed => ProviderError::TaskFailed(message),
        ErrorType::Sdk => ProviderError::Sdk(message),
        ErrorType::InvalidResponse => ProviderError::InvalidResponse(message),
    }
}

/// Kind and policy of `err` in every phase of an operation
pub fn classify_all(err: &ProviderError, verb: &str, config: &PluginConfig) -> Vec<Classification> {
    [Phase::Probe, Phase::Adopt, Phase::Poll]
        .into_iter()
        .map(|phase| {
            let kind = classifier::classify(err, phase);
            Classification {
                phase: format!("{:?}", phase),
                kind: format!("{:?}", kind),
                policy: format!("{:?}", classifier::policy(kind, verb, &config.not_found_ok)),
            }
        })
        .collect()
}

pub fn execute(args: ClassifyArgs, format: OutputFormat) -> Result<()> {
    let err = build_error(args.kind, args.message, args.minor_code);
    let config = PluginConfig::default();

    if matches!(format, OutputFormat::Table) {
        print_info(&format!("{}", err));
        let matched = classifier::matching_predicates(&err);
        if !matched.is_empty() {
            print_info(&format!("Matches: {}", matched.join(", ")));
        }
    }
    print_list(&classify_all(&err, &args.operation, &config), format);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_bad_request_is_ambiguous() {
        let err = build_error(ErrorType::BadRequest, String::new(), None);
        assert_eq!(err.to_string(), "Status code: 400/None, None");

        let rows = classify_all(&err, "create", &PluginConfig::default());
        assert_eq!(rows[0].kind, "Transient");
        assert_eq!(rows[0].policy, "Retry { sticky: true }");
    }

    #[test]
    fn test_not_found_depends_on_verb() {
        let err = build_error(ErrorType::EntityNotFound, "vm web-1".into(), None);
        let config = PluginConfig::default();

        assert_eq!(classify_all(&err, "delete", &config)[0].policy, "Ignore");
        assert_eq!(classify_all(&err, "start", &config)[0].policy, "Fatal");
    }

    #[test]
    fn test_task_failure_in_poll() {
        let err = build_error(
            ErrorType::TaskFailed,
            "Unable to perform this action. Contact your cloud administrator.".into(),
            None,
        );
        let rows = classify_all(&err, "create", &PluginConfig::default());
        assert!(rows.iter().all(|row| row.kind == "Blocked"));
    }
}
