//! Provider error classification
//!
//! Pure predicates over raw provider errors, and the table that turns an
//! error into an [`ErrorKind`] and then into a [`Policy`]. Task functions may
//! consult the predicates, but the retry/fatal decision is only ever made here.

use vcloud_common::ProviderError;

pub const BUSY: &[&str] = &[
    "is busy, cannot proceed with the operation",
    "cannot be deleted, because it is in use",
];
pub const UNCLEAR: &[&str] = &["Status code: 400/None, None"];
pub const ALREADY_EXISTS: &[&str] = &["DUPLICATE_NAME"];
pub const UNRESOLVED: &[&str] = &["Unresolved"];
pub const CANNOT_DEPLOY: &[&str] = &["Cannot deploy organization VDC network"];
pub const ADMIN_BLOCKED: &[&str] =
    &["Unable to perform this action. Contact your cloud administrator"];
pub const CANNOT_POWER_OFF: &[&str] = &[
    "Current state of vm: Powered off",
    "RelationType.POWER_OFF",
    "is not powered on",
];
pub const INVALID_TARGET: &[&str] = &["target entity is invalid"];
pub const BAD_VM_NAME: &[&str] = &["Computer name can only contain"];
pub const UNINITIALIZED: &[&str] = &["has not been initialized"];
pub const NO_POWERED_ON_VMS: &[&str] = &["not have any powered on VMs"];

fn message_matches(err: &ProviderError, patterns: &[&str]) -> bool {
    let message = err.to_string();
    patterns.iter().any(|pattern| message.contains(pattern))
}

pub fn vcd_busy(err: &ProviderError) -> bool {
    message_matches(err, BUSY)
}

pub fn vcd_unclear(err: &ProviderError) -> bool {
    message_matches(err, UNCLEAR) || matches!(err, ProviderError::AccessForbidden(_))
}

pub fn already_exists(err: &ProviderError) -> bool {
    message_matches(err, ALREADY_EXISTS)
}

pub fn unresolved(err: &ProviderError) -> bool {
    message_matches(err, UNRESOLVED)
}

pub fn cannot_deploy(err: &ProviderError) -> bool {
    message_matches(err, CANNOT_DEPLOY)
}

pub fn admin_blocked(err: &ProviderError) -> bool {
    message_matches(err, ADMIN_BLOCKED)
}

pub fn cannot_power_off(err: &ProviderError) -> bool {
    message_matches(err, CANNOT_POWER_OFF)
}

pub fn invalid_target(err: &ProviderError) -> bool {
    message_matches(err, INVALID_TARGET)
}

pub fn bad_vm_name(err: &ProviderError) -> bool {
    message_matches(err, BAD_VM_NAME)
}

pub fn uninitialized(err: &ProviderError) -> bool {
    message_matches(err, UNINITIALIZED)
}

pub fn no_powered_on_vms(err: &ProviderError) -> bool {
    message_matches(err, NO_POWERED_ON_VMS)
}

/// Every predicate by name, in evaluation order
pub const PREDICATES: &[(&str, fn(&ProviderError) -> bool)] = &[
    ("busy", vcd_busy),
    ("unclear", vcd_unclear),
    ("already_exists", already_exists),
    ("unresolved", unresolved),
    ("cannot_deploy", cannot_deploy),
    ("admin_blocked", admin_blocked),
    ("cannot_power_off", cannot_power_off),
    ("invalid_target", invalid_target),
    ("bad_vm_name", bad_vm_name),
    ("uninitialized", uninitialized),
    ("no_powered_on_vms", no_powered_on_vms),
];

/// Names of the predicates an error matches
pub fn matching_predicates(err: &ProviderError) -> Vec<&'static str> {
    PREDICATES
        .iter()
        .filter(|(_, predicate)| predicate(err))
        .map(|(name, _)| *name)
        .collect()
}

/// Where in the operation the error surfaced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Managed call with `external = false`
    Probe,
    /// Lookup with `external = true`
    Adopt,
    /// Waiting on the last task
    Poll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Transient,
    AlreadyExists,
    /// Deploy blocked, admin blocked or an unusable VM name
    Blocked,
    /// Access forbidden because the lookup target is not that kind of entity
    InvalidTarget,
    /// Access forbidden for an unclear reason
    Forbidden,
    /// A task validation failure no predicate claims
    TaskValidation,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Log and carry on as if the call had been a no-op
    Ignore,
    /// Ask the orchestrator to re-invoke; `sticky` persists the transient flag
    Retry { sticky: bool },
    Fatal,
    /// Re-raise the original error unchanged
    Propagate,
}

fn is_transient(err: &ProviderError) -> bool {
    vcd_busy(err) || message_matches(err, UNCLEAR) || uninitialized(err)
}

/// Compute the kind of an error once, from its type, message and phase.
pub fn classify(err: &ProviderError, phase: Phase) -> ErrorKind {
    if cannot_deploy(err) || admin_blocked(err) || bad_vm_name(err) {
        return ErrorKind::Blocked;
    }

    match phase {
        Phase::Probe => match err {
            ProviderError::EntityNotFound(_)
            | ProviderError::NotFound(_)
            | ProviderError::InternalServer(_)
            | ProviderError::InvalidResponse(_)
            | ProviderError::AccessForbidden(_) => ErrorKind::NotFound,
            ProviderError::BadRequest { .. } => {
                if already_exists(err) {
                    ErrorKind::AlreadyExists
                } else if is_transient(err) {
                    ErrorKind::Transient
                } else {
                    ErrorKind::NotFound
                }
            }
            // Unclassified link and SDK failures are retried
            ProviderError::MissingLink(_) | ProviderError::Sdk(_) => ErrorKind::Transient,
            ProviderError::TaskFailed(_) => ErrorKind::TaskValidation,
        },
        Phase::Adopt => match err {
            ProviderError::EntityNotFound(_)
            | ProviderError::NotFound(_)
            | ProviderError::InvalidResponse(_) => ErrorKind::NotFound,
            ProviderError::AccessForbidden(_) if invalid_target(err) => ErrorKind::InvalidTarget,
            ProviderError::AccessForbidden(_) => ErrorKind::Forbidden,
            _ if is_transient(err) => ErrorKind::Transient,
            _ => ErrorKind::Unknown,
        },
        Phase::Poll => match err {
            ProviderError::TaskFailed(_) => ErrorKind::TaskValidation,
            _ if is_transient(err) => ErrorKind::Transient,
            _ => ErrorKind::Unknown,
        },
    }
}

/// What to do about an error kind for a verb
pub fn policy(kind: ErrorKind, verb: &str, not_found_ok: &[String]) -> Policy {
    match kind {
        ErrorKind::NotFound if not_found_ok.iter().any(|v| v == verb) => Policy::Ignore,
        ErrorKind::NotFound => Policy::Fatal,
        ErrorKind::Transient => Policy::Retry { sticky: true },
        ErrorKind::AlreadyExists => Policy::Propagate,
        ErrorKind::Blocked => Policy::Fatal,
        ErrorKind::InvalidTarget => Policy::Ignore,
        ErrorKind::Forbidden => Policy::Retry { sticky: false },
        ErrorKind::TaskValidation => Policy::Retry { sticky: false },
        ErrorKind::Unknown => Policy::Propagate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn not_found_ok() -> Vec<String> {
        vec!["unlink".into(), "delete".into(), "stop".into()]
    }

    fn sdk(message: &str) -> ProviderError {
        ProviderError::Sdk(message.to_string())
    }

    #[test_case("VApp web is busy, cannot proceed with the operation." => true)]
    #[test_case("Network net1 cannot be deleted, because it is in use." => true)]
    #[test_case("Network net1 was deleted." => false)]
    fn test_busy(message: &str) -> bool {
        vcd_busy(&sdk(message))
    }

    #[test_case("Current state of vm: Powered off" => true)]
    #[test_case("RelationType.POWER_OFF link missing" => true)]
    #[test_case("VM web-1 is not powered on" => true)]
    #[test_case("VM web-1 is suspended" => false)]
    fn test_cannot_power_off(message: &str) -> bool {
        cannot_power_off(&sdk(message))
    }

    #[test]
    fn test_unclear() {
        assert!(vcd_unclear(&ProviderError::empty_bad_request()));
        assert!(vcd_unclear(&ProviderError::AccessForbidden("no".into())));
        assert!(!vcd_unclear(&ProviderError::bad_request("X", "Y")));
    }

    #[test]
    fn test_matching_predicates() {
        let err = ProviderError::bad_request("DUPLICATE_NAME", "The VCD entity web already exists.");
        assert_eq!(matching_predicates(&err), vec!["already_exists"]);

        let err = sdk("Network net1 has not been initialized.");
        assert_eq!(matching_predicates(&err), vec!["uninitialized"]);
    }

    #[test_case(ProviderError::EntityNotFound("vm".into()), ErrorKind::NotFound)]
    #[test_case(ProviderError::AccessForbidden("who".into()), ErrorKind::NotFound)]
    #[test_case(ProviderError::InternalServer("boom".into()), ErrorKind::NotFound)]
    #[test_case(ProviderError::bad_request("BAD", "nope"), ErrorKind::NotFound)]
    #[test_case(ProviderError::empty_bad_request(), ErrorKind::Transient)]
    #[test_case(ProviderError::bad_request("BUSY_ENTITY", "VM x is busy, cannot proceed with the operation"), ErrorKind::Transient)]
    #[test_case(ProviderError::bad_request("DUPLICATE_NAME", "exists"), ErrorKind::AlreadyExists)]
    #[test_case(ProviderError::MissingLink("edit".into()), ErrorKind::Transient)]
    #[test_case(ProviderError::bad_request("BAD", "Computer name can only contain letters"), ErrorKind::Blocked)]
    fn test_probe_kinds(err: ProviderError, expected: ErrorKind) {
        assert_eq!(classify(&err, Phase::Probe), expected);
    }

    #[test_case(ProviderError::EntityNotFound("vm".into()), ErrorKind::NotFound)]
    #[test_case(ProviderError::AccessForbidden("The target entity is invalid".into()), ErrorKind::InvalidTarget)]
    #[test_case(ProviderError::AccessForbidden("denied".into()), ErrorKind::Forbidden)]
    #[test_case(ProviderError::InternalServer("boom".into()), ErrorKind::Unknown)]
    fn test_adopt_kinds(err: ProviderError, expected: ErrorKind) {
        assert_eq!(classify(&err, Phase::Adopt), expected);
    }

    #[test_case("Cannot deploy organization VDC network net1" => ErrorKind::Blocked)]
    #[test_case("Unable to perform this action. Contact your cloud administrator." => ErrorKind::Blocked)]
    #[test_case("Timed out waiting for guest customization" => ErrorKind::TaskValidation)]
    fn test_poll_kinds(message: &str) -> ErrorKind {
        classify(&ProviderError::TaskFailed(message.to_string()), Phase::Poll)
    }

    #[test_case(ErrorKind::NotFound, "delete" => Policy::Ignore)]
    #[test_case(ErrorKind::NotFound, "stop" => Policy::Ignore)]
    #[test_case(ErrorKind::NotFound, "unlink" => Policy::Ignore)]
    #[test_case(ErrorKind::NotFound, "create" => Policy::Fatal)]
    #[test_case(ErrorKind::NotFound, "foo" => Policy::Fatal)]
    #[test_case(ErrorKind::Transient, "delete" => Policy::Retry { sticky: true })]
    #[test_case(ErrorKind::Forbidden, "create" => Policy::Retry { sticky: false })]
    #[test_case(ErrorKind::TaskValidation, "create" => Policy::Retry { sticky: false })]
    #[test_case(ErrorKind::Blocked, "delete" => Policy::Fatal)]
    #[test_case(ErrorKind::Unknown, "create" => Policy::Propagate)]
    fn test_policy(kind: ErrorKind, verb: &str) -> Policy {
        policy(kind, verb, &not_found_ok())
    }
}
