use super::*;

use serde::de::{self, Deserializer};
use std::collections::HashSet;

#[derive(Deserialize)]
pub struct PerfConfig {
    #[serde(default = "enabled")]
    enabled: bool,

    #[serde(flatten)]
    events: PerfEvents,
}

impl Default for PerfConfig {
    fn default() -> Self {
        Self {
            enabled: enabled(),
            events: PerfEvents::default(),
        }
    }
}

impl PerfConfig {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn events(&self) -> &PerfEvents {
        &self.events
    }

    pub(super) fn set_events(&mut self, events: PerfEvents) {
        self.events = events;
    }
}

/// The perf events to count for every container.
///
/// The same shape is accepted from the `[perf]` section of the TOML config and
/// from a standalone JSON events file:
///
/// ```json
/// {
///   "core": {
///     "events": [["cycles", "instructions"], "cache-misses"],
///     "custom_events": [{"type": 4, "config": ["0x5300c2"], "name": "uops"}]
///   }
/// }
/// ```
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct PerfEvents {
    #[serde(default)]
    pub core: EventSet,
}

impl PerfEvents {
    pub fn load_json(path: &dyn AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let events: PerfEvents =
            serde_json::from_str(&content).map_err(|source| ConfigError::Json {
                path: path.to_path_buf(),
                source,
            })?;

        events.check()?;

        Ok(events)
    }

    pub fn check(&self) -> Result<(), ConfigError> {
        self.core.check()
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct EventSet {
    /// Groups of events that are scheduled onto the PMU together. The first
    /// event of each group is its leader.
    #[serde(default)]
    pub events: Vec<Group>,

    /// Events given as raw type and config words rather than by name.
    #[serde(default)]
    pub custom_events: Vec<CustomEvent>,
}

impl EventSet {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn custom_event(&self, name: &str) -> Option<&CustomEvent> {
        self.custom_events.iter().find(|e| e.name == name)
    }

    pub fn check(&self) -> Result<(), ConfigError> {
        for (index, group) in self.events.iter().enumerate() {
            if group.events.is_empty() {
                return Err(ConfigError::EmptyGroup { group: index });
            }

            let mut seen = HashSet::new();

            for event in &group.events {
                if !seen.insert(event.as_str()) {
                    return Err(ConfigError::DuplicateEvent {
                        event: event.clone(),
                        group: index,
                    });
                }
            }
        }

        for event in &self.custom_events {
            if event.config.is_empty() || event.config.len() > 3 {
                return Err(ConfigError::CustomEventConfig {
                    name: event.name.clone(),
                    count: event.config.len(),
                });
            }
        }

        Ok(())
    }
}

/// An ordered list of event names, written either as a single name or as an
/// array of names.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(from = "GroupDef")]
pub struct Group {
    pub events: Vec<String>,
}

impl Group {
    pub fn leader(&self) -> Option<&str> {
        self.events.first().map(String::as_str)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum GroupDef {
    Single(String),
    Many(Vec<String>),
}

impl From<GroupDef> for Group {
    fn from(def: GroupDef) -> Self {
        match def {
            GroupDef::Single(event) => Group {
                events: vec![event],
            },
            GroupDef::Many(events) => Group { events },
        }
    }
}

/// A raw event: a PMU type and up to three config words which are written to
/// `config`, `config1` and `config2` of the perf event attributes.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct CustomEvent {
    #[serde(rename = "type")]
    pub type_: u32,
    #[serde(deserialize_with = "config_words")]
    pub config: Vec<u64>,
    pub name: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ConfigWord {
    Number(u64),
    Text(String),
}

fn config_words<'de, D>(deserializer: D) -> Result<Vec<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let words: Vec<ConfigWord> = Vec::deserialize(deserializer)?;

    words
        .into_iter()
        .map(|word| match word {
            ConfigWord::Number(value) => Ok(value),
            ConfigWord::Text(text) => parse_word(&text)
                .ok_or_else(|| de::Error::custom(format!("invalid config word: {text:?}"))),
        })
        .collect()
}

fn parse_word(text: &str) -> Option<u64> {
    let text = text.trim();

    if let Some(hex) = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
    {
        u64::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}
