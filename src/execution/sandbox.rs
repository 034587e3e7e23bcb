use super::limits::{ResourceLimits, SecurityPolicy};
use super::stats::ExecutionStats;
use crate::agent::Requirements;

/// Outcome of checking an execution against its policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyReport {
    /// Whether the execution may proceed
    pub is_allowed: bool,
    /// Things that are allowed but cannot be enforced
    pub warnings: Vec<String>,
    /// Violations (block execution)
    pub errors: Vec<String>,
}

impl PolicyReport {
    pub fn ok() -> Self {
        Self {
            is_allowed: true,
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn with_warning(mut self, msg: impl Into<String>) -> Self {
        self.warnings.push(msg.into());
        self
    }

    pub fn with_error(mut self, msg: impl Into<String>) -> Self {
        self.is_allowed = false;
        self.errors.push(msg.into());
        self
    }

    pub fn merge(mut self, other: PolicyReport) -> Self {
        self.is_allowed = self.is_allowed && other.is_allowed;
        self.warnings.extend(other.warnings);
        self.errors.extend(other.errors);
        self
    }

    /// All violations joined into one message
    pub fn violation(&self) -> Option<String> {
        if self.is_allowed {
            None
        } else {
            Some(self.errors.join("; "))
        }
    }
}

/// Enforcement backend for an execution.
///
/// `check` runs before the agent is invoked; a report with errors fails
/// the execution with a policy violation. `measure` lets platform
/// specific backends fill in resource usage once the agent returns.
pub trait Sandbox: Send + Sync {
    fn check(
        &self,
        requirements: &Requirements,
        limits: &ResourceLimits,
        policy: &SecurityPolicy,
    ) -> PolicyReport;

    fn measure(&self, _stats: &mut ExecutionStats) {}
}

/// Portable sandbox: checks declared requirements against the allow-list.
/// Resource ceilings are advisory because nothing is measured.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicySandbox;

impl PolicySandbox {
    fn check_access(requirements: &Requirements, policy: &SecurityPolicy) -> PolicyReport {
        let mut report = PolicyReport::ok();
        if requirements.network && !policy.allow_network {
            report = report.with_error("network access is not allowed");
        }
        if requirements.filesystem && !policy.allow_filesystem {
            report = report.with_error("filesystem access is not allowed");
        }
        for module in &requirements.modules {
            if !policy.allows_module(module) {
                report = report.with_error(format!("module '{}' is not allowed", module));
            }
        }
        for syscall in &requirements.syscalls {
            if !policy.allows_syscall(syscall) {
                report = report.with_error(format!("system call '{}' is not allowed", syscall));
            }
        }
        report
    }

    fn check_resources(requirements: &Requirements, limits: &ResourceLimits) -> PolicyReport {
        let mut report = PolicyReport::ok();
        if requirements.subprocesses > limits.max_subprocesses {
            report = report.with_error(format!(
                "{} subprocesses requested, limit is {}",
                requirements.subprocesses, limits.max_subprocesses
            ));
        }
        match (requirements.memory_mb, limits.memory_ceiling_mb) {
            (Some(wanted), Some(ceiling)) if wanted > ceiling => {
                report = report.with_error(format!(
                    "{} MB of memory requested, ceiling is {} MB",
                    wanted, ceiling
                ));
            }
            (_, Some(_)) => {
                report = report.with_warning("memory ceiling is not enforced by this sandbox");
            }
            _ => {}
        }
        if limits.cpu_time.is_some() {
            report = report.with_warning("cpu time ceiling is not enforced by this sandbox");
        }
        report
    }
}

impl Sandbox for PolicySandbox {
    fn check(
        &self,
        requirements: &Requirements,
        limits: &ResourceLimits,
        policy: &SecurityPolicy,
    ) -> PolicyReport {
        Self::check_access(requirements, policy).merge(Self::check_resources(requirements, limits))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_builders() {
        let report = PolicyReport::ok().with_warning("careful");
        assert!(report.is_allowed);
        assert_eq!(report.violation(), None);

        let report = report.merge(PolicyReport::ok().with_error("a").with_error("b"));
        assert!(!report.is_allowed);
        assert_eq!(report.warnings, vec!["careful"]);
        assert_eq!(report.violation().as_deref(), Some("a; b"));
    }

    #[test]
    fn test_default_requirements_pass() {
        let report = PolicySandbox.check(
            &Requirements::default(),
            &ResourceLimits::default(),
            &SecurityPolicy::default(),
        );
        assert!(report.is_allowed);
        assert_eq!(report.warnings.len(), 2);
    }

    #[test]
    fn test_network_requires_permission() {
        let needs_network = Requirements {
            network: true,
            ..Requirements::default()
        };
        let limits = ResourceLimits::default();

        let denied = PolicySandbox.check(&needs_network, &limits, &SecurityPolicy::default());
        assert!(!denied.is_allowed);
        assert!(denied.errors[0].contains("network"));

        let allowed = PolicySandbox.check(&needs_network, &limits, &SecurityPolicy::permissive());
        assert!(allowed.is_allowed);
    }

    #[test]
    fn test_modules_and_syscalls_checked_against_allow_list() {
        let requirements = Requirements {
            modules: vec!["json".into(), "socket".into()],
            syscalls: vec!["fork".into()],
            ..Requirements::default()
        };
        let mut policy = SecurityPolicy::default();
        policy.allowed_modules.insert("json".into());

        let report = PolicySandbox.check(&requirements, &ResourceLimits::default(), &policy);
        assert_eq!(
            report.errors,
            vec![
                "module 'socket' is not allowed".to_string(),
                "system call 'fork' is not allowed".to_string(),
            ]
        );
    }

    #[test]
    fn test_resource_ceilings() {
        let requirements = Requirements {
            subprocesses: 8,
            memory_mb: Some(2048),
            ..Requirements::default()
        };
        let report = PolicySandbox.check(
            &requirements,
            &ResourceLimits::default(),
            &SecurityPolicy::default(),
        );
        assert_eq!(report.errors.len(), 2);

        let unlimited = ResourceLimits {
            cpu_time: None,
            memory_ceiling_mb: None,
            max_subprocesses: 8,
            ..ResourceLimits::default()
        };
        let report = PolicySandbox.check(&requirements, &unlimited, &SecurityPolicy::default());
        assert!(report.is_allowed);
        assert!(report.warnings.is_empty());
    }
}
