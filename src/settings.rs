// Agent settings - JSON file merged with command-line flags

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use election::{CandidateId, ElectionConfig, LeaseKey};
use serde::Deserialize;

use crate::cli::RunArgs;

pub const LOCK_SUFFIX: &str = "-lock";
pub const DEFAULT_WORKLOAD: &str = "idle";

/// Contents of the optional `--config` file. Every field may be omitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileSettings {
    pub identity: Option<String>,
    pub lease_name: Option<String>,
    pub scope: Option<String>,
    pub lease_duration_secs: Option<u64>,
    pub renew_deadline_secs: Option<u64>,
    pub retry_period_secs: Option<u64>,
    pub release_on_cancel: Option<bool>,
    pub workload: Option<String>,
    pub start_delay_secs: Option<u64>,
}

impl FileSettings {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).with_context(|| format!("reading settings file {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("parsing settings file {}", path.display()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Everything `baton run` needs, validated.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub election: ElectionConfig,
    pub workload: String,
    pub start_delay: Duration,
}

impl AgentSettings {
    /// Reads the settings file named by `--config`, if any, then merges.
    pub fn from_args(args: &RunArgs) -> Result<Self> {
        let file = match &args.config {
            Some(path) => FileSettings::load(path)?,
            None => FileSettings::default(),
        };
        Self::merge(args, file)
    }

    /// Flags win over the file; the file wins over built-in defaults.
    pub fn merge(args: &RunArgs, file: FileSettings) -> Result<Self> {
        let identity = args.identity.clone().or(file.identity).unwrap_or_default();
        let identity = CandidateId::new(identity).context("no identity: pass --identity or set HOSTNAME")?;

        let name = args
            .lease_name
            .clone()
            .or(file.lease_name)
            .context("no lease name: pass --lease-name or set BATON_LEASE_NAME")?;
        let scope = args
            .scope
            .clone()
            .or(file.scope)
            .context("no lease scope: pass --scope or set BATON_LEASE_SCOPE")?;

        let mut election = ElectionConfig::new(LeaseKey::new(lock_name(&name), scope), identity);
        if let Some(secs) = args.lease_duration.or(file.lease_duration_secs) {
            election = election.with_lease_duration(Duration::from_secs(secs));
        }
        if let Some(secs) = args.renew_deadline.or(file.renew_deadline_secs) {
            election = election.with_renew_deadline(Duration::from_secs(secs));
        }
        if let Some(secs) = args.retry_period.or(file.retry_period_secs) {
            election = election.with_retry_period(Duration::from_secs(secs));
        }
        let release_on_cancel = !args.no_release_on_cancel && file.release_on_cancel.unwrap_or(true);
        election = election.with_release_on_cancel(release_on_cancel);
        election.validate().context("invalid election settings")?;

        Ok(Self {
            election,
            workload: args
                .workload
                .clone()
                .or(file.workload)
                .unwrap_or_else(|| DEFAULT_WORKLOAD.to_string()),
            start_delay: Duration::from_secs(args.start_delay.or(file.start_delay_secs).unwrap_or(0)),
        })
    }
}

/// Record name for a lease: `<name>-lock`.
pub fn lock_name(name: &str) -> String {
    if name.ends_with(LOCK_SUFFIX) {
        name.to_string()
    } else {
        format!("{name}{LOCK_SUFFIX}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use election::Error;

    fn args() -> RunArgs {
        RunArgs {
            identity: Some("pod-a".into()),
            lease_name: Some("proxysql-agent".into()),
            scope: Some("proxysql".into()),
            config: None,
            lease_duration: None,
            renew_deadline: None,
            retry_period: None,
            no_release_on_cancel: false,
            workload: None,
            start_delay: None,
        }
    }

    #[test]
    fn test_defaults() {
        let settings = AgentSettings::merge(&args(), FileSettings::default()).unwrap();
        assert_eq!(settings.election.lease, LeaseKey::new("proxysql-agent-lock", "proxysql"));
        assert_eq!(settings.election.lease_duration, Duration::from_secs(60));
        assert_eq!(settings.election.renew_deadline, Duration::from_secs(15));
        assert_eq!(settings.election.retry_period, Duration::from_secs(5));
        assert!(settings.election.release_on_cancel);
        assert_eq!(settings.workload, "idle");
        assert_eq!(settings.start_delay, Duration::ZERO);
    }

    #[test]
    fn test_flags_override_file() {
        let file = FileSettings::from_json(
            r#"{
                "identity": "from-file",
                "lease_duration_secs": 30,
                "renew_deadline_secs": 10,
                "retry_period_secs": 2,
                "release_on_cancel": false,
                "workload": "heartbeat"
            }"#,
        )
        .unwrap();
        let mut args = args();
        args.retry_period = Some(3);

        let settings = AgentSettings::merge(&args, file).unwrap();
        assert_eq!(settings.election.identity.as_str(), "pod-a");
        assert_eq!(settings.election.lease_duration, Duration::from_secs(30));
        assert_eq!(settings.election.retry_period, Duration::from_secs(3));
        assert!(!settings.election.release_on_cancel);
        assert_eq!(settings.workload, "heartbeat");
    }

    #[test]
    fn test_unknown_file_keys_rejected() {
        assert!(FileSettings::from_json(r#"{"lease_durration_secs": 30}"#).is_err());
    }

    #[test]
    fn test_missing_identity_is_reported() {
        let mut args = args();
        args.identity = None;
        let err = AgentSettings::merge(&args, FileSettings::default()).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::MissingIdentity)));
    }

    #[test]
    fn test_bad_timing_rejected() {
        let mut args = args();
        args.renew_deadline = Some(60);
        let err = AgentSettings::merge(&args, FileSettings::default()).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::InvalidTiming(_))));
    }

    #[test]
    fn test_lock_name_suffix_added_once() {
        assert_eq!(lock_name("agent"), "agent-lock");
        assert_eq!(lock_name("agent-lock"), "agent-lock");
    }
}
