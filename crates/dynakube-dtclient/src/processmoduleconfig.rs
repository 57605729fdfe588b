//! Process-module config (`ruxitagentproc.conf`) model and merge
//!
//! The tenant serves a list of `(section, key, value)` properties. The
//! operator overrides a few of them with cluster-local settings and merges
//! the result into the `ruxitagentproc.conf` that ships with the code
//! modules: existing keys are replaced in place, missing keys are appended
//! to their section, and unknown sections are appended at the end.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

const GENERAL_SECTION: &str = "general";
const PROXY_KEY: &str = "proxy";
const NO_PROXY_KEY: &str = "noProxy";
const HOST_GROUP_KEY: &str = "hostGroup";

/// Section name to key/value pairs, ordered for deterministic output
pub type ProcessModuleMap = BTreeMap<String, BTreeMap<String, String>>;

/// One property of the process-module config
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ProcessModuleProperty {
    /// Section without brackets, e.g. `general`
    pub section: String,
    /// Property key
    pub key: String,
    /// Property value
    pub value: String,
}

/// Process-module config as served by the tenant
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ProcessModuleConfig {
    /// Config revision, used for conditional fetches
    #[serde(default)]
    pub revision: u64,
    /// Properties
    #[serde(default)]
    pub properties: Vec<ProcessModuleProperty>,
}

impl ProcessModuleConfig {
    /// Set a property, replacing an existing one; an empty value removes it
    pub fn add(&mut self, section: &str, key: &str, value: &str) -> &mut Self {
        self.properties
            .retain(|p| !(p.section == section && p.key == key));
        if !value.is_empty() {
            self.properties.push(ProcessModuleProperty {
                section: section.to_string(),
                key: key.to_string(),
                value: value.to_string(),
            });
        }
        self
    }

    /// Route the code modules through the given proxy
    pub fn add_proxy(&mut self, proxy: &str) -> &mut Self {
        self.add(GENERAL_SECTION, PROXY_KEY, proxy)
    }

    /// Hosts the code modules reach without the proxy
    pub fn add_no_proxy(&mut self, no_proxy: &str) -> &mut Self {
        self.add(GENERAL_SECTION, NO_PROXY_KEY, no_proxy)
    }

    /// Host group the injected processes report
    pub fn add_host_group(&mut self, host_group: &str) -> &mut Self {
        self.add(GENERAL_SECTION, HOST_GROUP_KEY, host_group)
    }

    /// Properties grouped by section; later duplicates win
    pub fn to_map(&self) -> ProcessModuleMap {
        let mut map = ProcessModuleMap::new();
        for p in &self.properties {
            map.entry(p.section.clone())
                .or_default()
                .insert(p.key.clone(), p.value.clone());
        }
        map
    }
}

fn section_header(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    trimmed
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
}

fn drain_section(section: &str, map: &mut ProcessModuleMap, out: &mut Vec<String>) {
    if let Some(props) = map.remove(section) {
        out.extend(props.into_iter().map(|(k, v)| format!("{k} {v}")));
    }
}

/// Merge properties into the text of a `ruxitagentproc.conf`.
///
/// Comments and untouched lines are kept byte for byte. The output ends
/// with a newline.
pub fn merge_conf(source: &str, config: &ProcessModuleConfig) -> String {
    let mut map = config.to_map();
    let mut out = Vec::new();
    let mut current = String::new();

    for line in source.lines() {
        if let Some(header) = section_header(line) {
            drain_section(&current, &mut map, &mut out);
            current = header.to_string();
            out.push(line.to_string());
            continue;
        }
        if line.trim_start().starts_with('#') {
            out.push(line.to_string());
            continue;
        }
        let key = line.split(' ').next().unwrap_or_default();
        match map.get_mut(&current).and_then(|props| props.remove(key)) {
            Some(value) if !key.is_empty() => out.push(format!("{key} {value}")),
            _ => out.push(line.to_string()),
        }
    }
    drain_section(&current, &mut map, &mut out);

    for (section, props) in map {
        out.push(format!("[{section}]"));
        out.extend(props.into_iter().map(|(k, v)| format!("{k} {v}")));
    }

    let mut merged = out.join("\n");
    merged.push('\n');
    merged
}
