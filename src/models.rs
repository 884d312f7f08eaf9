use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::config::PanelConfig;

/// Reserved document key holding the uplink speed sample.
pub const SPEED_KEY: &str = "INTERNET_SPEED";

const BITS_PER_MEGABYTE: f64 = 8_000_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Up,
    Down,
}

impl Status {
    pub fn is_up(self) -> bool {
        self == Status::Up
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Up => f.write_str("UP"),
            Status::Down => f.write_str("DOWN"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetStatus {
    #[serde(rename = "IP")]
    pub ip: String,
    #[serde(rename = "PORT", default)]
    pub port: String,
    #[serde(rename = "STATUS")]
    pub status: Status,
}

/// Uplink throughput in megabytes per second.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SpeedSample {
    #[serde(rename = "DOWNLOAD_SPEED")]
    pub download: f64,
    #[serde(rename = "UPLOAD_SPEED")]
    pub upload: f64,
}

impl SpeedSample {
    pub fn from_bits_per_second(download_bps: f64, upload_bps: f64) -> Self {
        Self {
            download: to_megabytes(download_bps),
            upload: to_megabytes(upload_bps),
        }
    }
}

fn to_megabytes(bits_per_second: f64) -> f64 {
    (bits_per_second / BITS_PER_MEGABYTE * 100.0).round() / 100.0
}

/// One rotatable slot of the panel.
#[derive(Debug, Clone, PartialEq)]
pub enum Entry {
    Target { name: String, target: TargetStatus },
    Speed(SpeedSample),
}

/// Latest readings for every monitored target.
///
/// The reachability gate is held apart from `entries`, so the rotation
/// sequence can never select it. `entries` keeps document order and always
/// contains exactly one [`Entry::Speed`].
#[derive(Debug, Clone, PartialEq)]
pub struct StatusDocument {
    pub gate_name: String,
    pub gate: TargetStatus,
    entries: Vec<Entry>,
}

impl StatusDocument {
    /// Every target DOWN, speed zero, services in configuration order and
    /// the speed sample last.
    pub fn default_for(config: &PanelConfig) -> Self {
        let mut entries: Vec<Entry> = config
            .services
            .iter()
            .map(|svc| Entry::Target {
                name: svc.name.clone(),
                target: TargetStatus {
                    ip: svc.address.clone(),
                    port: svc.port_label(),
                    status: Status::Down,
                },
            })
            .collect();
        entries.push(Entry::Speed(SpeedSample::default()));

        Self {
            gate_name: config.gate.name.clone(),
            gate: TargetStatus {
                ip: config.gate.address.clone(),
                port: config.gate.port_label(),
                status: Status::Down,
            },
            entries,
        }
    }

    /// Parses a persisted document, identifying the gate by `gate_name`.
    pub fn from_json(text: &str, gate_name: &str) -> anyhow::Result<Self> {
        let raw: RawDocument = serde_json::from_str(text)?;
        let mut gate = None;
        let mut entries = Vec::with_capacity(raw.0.len());
        let mut speed_entries = 0;

        for (name, value) in raw.0 {
            match value {
                RawValue::Speed(sample) => {
                    speed_entries += 1;
                    entries.push(Entry::Speed(sample));
                }
                RawValue::Target(target) if name == gate_name => gate = Some(target),
                RawValue::Target(target) => entries.push(Entry::Target { name, target }),
            }
        }

        let gate = gate.ok_or_else(|| anyhow::anyhow!("Document has no {} entry", gate_name))?;
        anyhow::ensure!(speed_entries == 1, "Document must hold exactly one {} entry", SPEED_KEY);

        Ok(Self {
            gate_name: gate_name.to_string(),
            gate,
            entries,
        })
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn link_up(&self) -> bool {
        self.gate.status.is_up()
    }

    /// Rotatable entries in display order.
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn speed(&self) -> SpeedSample {
        self.entries
            .iter()
            .find_map(|e| match e {
                Entry::Speed(s) => Some(*s),
                Entry::Target { .. } => None,
            })
            .unwrap_or_default()
    }

    pub fn target(&self, name: &str) -> Option<&TargetStatus> {
        if name == self.gate_name {
            return Some(&self.gate);
        }
        self.entries.iter().find_map(|e| match e {
            Entry::Target { name: n, target } if n == name => Some(target),
            _ => None,
        })
    }

    pub fn target_mut(&mut self, name: &str) -> Option<&mut TargetStatus> {
        if name == self.gate_name {
            return Some(&mut self.gate);
        }
        self.entries.iter_mut().find_map(|e| match e {
            Entry::Target { name: n, target } if n == name => Some(target),
            _ => None,
        })
    }

    pub fn set_speed(&mut self, sample: SpeedSample) {
        for entry in &mut self.entries {
            if let Entry::Speed(s) = entry {
                *s = sample;
            }
        }
    }

    /// True when the document tracks exactly the configured gate and services.
    pub fn matches(&self, config: &PanelConfig) -> bool {
        if self.gate_name != config.gate.name {
            return false;
        }
        let mut names: Vec<&str> = self
            .entries
            .iter()
            .filter_map(|e| match e {
                Entry::Target { name, .. } => Some(name.as_str()),
                Entry::Speed(_) => None,
            })
            .collect();
        let mut expected: Vec<&str> = config.services.iter().map(|s| s.name.as_str()).collect();
        names.sort_unstable();
        expected.sort_unstable();
        names == expected
    }

    /// Rewrites `IP`/`PORT` from the configuration, keeping statuses and order.
    pub fn refresh_addresses(&mut self, config: &PanelConfig) {
        self.gate.ip = config.gate.address.clone();
        self.gate.port = config.gate.port_label();
        for entry in &mut self.entries {
            if let Entry::Target { name, target } = entry {
                if let Some(svc) = config.service(name) {
                    target.ip = svc.address.clone();
                    target.port = svc.port_label();
                }
            }
        }
    }
}

impl Serialize for StatusDocument {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len() + 1))?;
        map.serialize_entry(&self.gate_name, &self.gate)?;
        for entry in &self.entries {
            match entry {
                Entry::Target { name, target } => map.serialize_entry(name, target)?,
                Entry::Speed(sample) => map.serialize_entry(SPEED_KEY, sample)?,
            }
        }
        map.end()
    }
}

enum RawValue {
    Target(TargetStatus),
    Speed(SpeedSample),
}

/// Document entries in file order; duplicate keys are rejected.
struct RawDocument(Vec<(String, RawValue)>);

impl<'de> Deserialize<'de> for RawDocument {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct DocumentVisitor;

        impl<'de> Visitor<'de> for DocumentVisitor {
            type Value = RawDocument;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of target names to status entries")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries: Vec<(String, RawValue)> = Vec::new();
                while let Some(key) = access.next_key::<String>()? {
                    if entries.iter().any(|(k, _)| *k == key) {
                        return Err(de::Error::custom(format!("duplicate entry {key}")));
                    }
                    let value = if key == SPEED_KEY {
                        RawValue::Speed(access.next_value()?)
                    } else {
                        RawValue::Target(access.next_value()?)
                    };
                    entries.push((key, value));
                }
                Ok(RawDocument(entries))
            }
        }

        deserializer.deserialize_map(DocumentVisitor)
    }
}

/// Results of one probe cycle, applied to the store in a single update.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleOutcome {
    pub gate: Status,
    pub services: Vec<(String, Status)>,
    pub speed: Option<SpeedSample>,
}

/// A status flip observed while applying a cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub name: String,
    pub old: Status,
    pub new: Status,
}

impl CycleOutcome {
    /// Writes every reading into `doc`. A missing speed sample leaves the
    /// previous one untouched.
    pub fn apply_to(&self, doc: &mut StatusDocument) -> Vec<StatusChange> {
        let mut changes = Vec::new();
        let gate_name = doc.gate_name.clone();
        let readings = std::iter::once((gate_name.as_str(), self.gate))
            .chain(self.services.iter().map(|(n, s)| (n.as_str(), *s)));

        for (name, status) in readings {
            if let Some(target) = doc.target_mut(name) {
                if target.status != status {
                    changes.push(StatusChange {
                        name: name.to_string(),
                        old: target.status,
                        new: status,
                    });
                }
                target.status = status;
            }
        }
        if let Some(sample) = self.speed {
            doc.set_speed(sample);
        }
        changes
    }
}
