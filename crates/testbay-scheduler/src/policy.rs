//! Per-device validity, authorisation and capability checks.
//!
//! The scheduler consults a [`DevicePolicy`] and never looks at device
//! configuration itself. [`DictionaryPolicy`] answers from YAML device
//! dictionaries and health-check bodies kept in memory, so the scheduling
//! pass performs no file I/O; the daemon reloads them between ticks.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use parking_lot::RwLock;
use serde_yaml::Value;

use crate::definition::JobDefinition;
use crate::error::SchedulerResult;
use crate::model::{Device, DeviceHealth, TestJob};

/// Device checks consumed by the scheduler.
pub trait DevicePolicy: Send + Sync {
    /// Returns true when the device configuration is usable.
    fn is_valid(&self, device: &Device) -> bool;

    /// Health-check job body for the device, if one is defined.
    fn health_check(&self, device: &Device) -> Option<String>;

    /// Returns true when the job's submitter may use the device.
    fn can_submit(&self, job: &TestJob, device: &Device) -> bool;

    /// Returns true when the device offers the network interfaces the
    /// definition's VLAN requests need.
    fn match_protocol_interface(&self, device: &Device, definition: &JobDefinition) -> bool;
}

/// Policy backed by device dictionaries and health-check bodies.
///
/// A device dictionary is a YAML mapping. The keys read here are:
///
/// - `extends`: template name used to pick the health check, e.g. `panda.jinja2`
/// - `submitters`: optional list of users allowed to submit to the device
/// - `parameters.interfaces.<name>.tags`: tags offered by each interface
#[derive(Debug)]
pub struct DictionaryPolicy {
    health_check_submitter: String,
    // `None` marks a dictionary that failed to parse.
    dictionaries: RwLock<HashMap<String, Option<Value>>>,
    health_checks: RwLock<HashMap<String, String>>,
}

impl DictionaryPolicy {
    /// Creates an empty policy. Jobs from `health_check_submitter` may use
    /// any non-retired device.
    #[must_use]
    pub fn new(health_check_submitter: impl Into<String>) -> Self {
        Self {
            health_check_submitter: health_check_submitter.into(),
            dictionaries: RwLock::new(HashMap::new()),
            health_checks: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a device dictionary.
    #[must_use]
    pub fn with_dictionary(self, hostname: &str, text: &str) -> Self {
        self.set_dictionary(hostname, text);
        self
    }

    /// Registers a health-check body for a device type or template.
    #[must_use]
    pub fn with_health_check(self, name: &str, body: &str) -> Self {
        self.set_health_check(name, body);
        self
    }

    /// Registers or replaces a device dictionary.
    pub fn set_dictionary(&self, hostname: &str, text: &str) {
        let parsed = serde_yaml::from_str::<Value>(text)
            .ok()
            .filter(Value::is_mapping);
        if parsed.is_none() {
            tracing::warn!(device = %hostname, "device dictionary is not a YAML mapping");
        }
        self.dictionaries.write().insert(hostname.to_owned(), parsed);
    }

    /// Registers or replaces a health-check body.
    pub fn set_health_check(&self, name: &str, body: &str) {
        self.health_checks
            .write()
            .insert(name.to_owned(), body.to_owned());
    }

    /// Replaces all dictionaries and health checks with the contents of two
    /// directories: `<hostname>.yaml` device dictionaries and
    /// `<name>.yaml`/`<name>.yml` health-check bodies.
    pub fn reload(&self, devices_dir: &Path, health_checks_dir: &Path) -> SchedulerResult<()> {
        let dictionaries = read_yaml_dir(devices_dir)?;
        let health_checks = read_yaml_dir(health_checks_dir)?;

        let parsed: HashMap<_, _> = dictionaries
            .into_iter()
            .map(|(hostname, text)| {
                let value = serde_yaml::from_str::<Value>(&text)
                    .ok()
                    .filter(Value::is_mapping);
                if value.is_none() {
                    tracing::warn!(device = %hostname, "device dictionary is not a YAML mapping");
                }
                (hostname, value)
            })
            .collect();

        tracing::debug!(
            dictionaries = parsed.len(),
            health_checks = health_checks.len(),
            "reloaded device policy"
        );
        *self.dictionaries.write() = parsed;
        *self.health_checks.write() = health_checks;
        Ok(())
    }

    fn dictionary(&self, hostname: &str) -> Option<Value> {
        self.dictionaries.read().get(hostname).cloned().flatten()
    }
}

fn read_yaml_dir(dir: &Path) -> SchedulerResult<HashMap<String, String>> {
    let mut files = HashMap::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e == "yaml" || e == "yml");
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if is_yaml && path.is_file() {
            files.insert(name.to_owned(), std::fs::read_to_string(&path)?);
        }
    }
    Ok(files)
}

fn template_name(extends: &str) -> &str {
    Path::new(extends)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(extends)
}

fn string_set(value: Option<&Value>) -> BTreeSet<String> {
    value
        .and_then(Value::as_sequence)
        .map(|seq| {
            seq.iter()
                .filter_map(Value::as_str)
                .map(ToOwned::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

impl DevicePolicy for DictionaryPolicy {
    fn is_valid(&self, device: &Device) -> bool {
        self.dictionary(&device.hostname).is_some()
    }

    fn health_check(&self, device: &Device) -> Option<String> {
        let extends = self
            .dictionary(&device.hostname)
            .and_then(|d| d.get("extends").and_then(Value::as_str).map(ToOwned::to_owned));
        let checks = self.health_checks.read();
        extends
            .as_deref()
            .and_then(|e| checks.get(template_name(e)))
            .or_else(|| checks.get(&device.device_type))
            .cloned()
    }

    fn can_submit(&self, job: &TestJob, device: &Device) -> bool {
        if device.health == DeviceHealth::Retired {
            return false;
        }
        if job.submitter == self.health_check_submitter {
            return true;
        }
        let Some(dictionary) = self.dictionary(&device.hostname) else {
            return true;
        };
        match dictionary.get("submitters") {
            Some(submitters) => string_set(Some(submitters)).contains(&job.submitter),
            None => true,
        }
    }

    fn match_protocol_interface(&self, device: &Device, definition: &JobDefinition) -> bool {
        let vlans = definition.vlan_requests();
        let Some(dictionary) = self.dictionary(&device.hostname) else {
            return false;
        };
        let Some(Value::Mapping(interfaces)) = dictionary
            .get("parameters")
            .and_then(|p| p.get("interfaces"))
        else {
            return false;
        };

        let mut used: BTreeSet<&str> = BTreeSet::new();
        for (vlan, wanted) in &vlans {
            let matched = interfaces.iter().find_map(|(name, spec)| {
                let name = name.as_str()?;
                let offered = string_set(spec.get("tags"));
                (!offered.is_empty() && wanted.is_subset(&offered) && !used.contains(name))
                    .then_some(name)
            });
            match matched {
                Some(name) => {
                    tracing::debug!(
                        device = %device.hostname,
                        %vlan,
                        interface = name,
                        "matched vlan"
                    );
                    used.insert(name);
                }
                None => return false,
            }
        }
        true
    }
}
