//! Persisted output layout
//!
//! Remembers where outputs were placed so a monitor that is unplugged and
//! replugged comes back where the user left it. Layouts are keyed by a
//! stable hash over the identities of every connected output, so the same
//! combination of monitors always resolves to the same record while a
//! different combination starts fresh.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{VesperError, VesperResult};
use crate::geometry::{Point, Transform};
use crate::output::{Output, RgbRange};
use crate::render_loop::VrrPolicy;

/// Persisted mode selection; matched against the output's mode list by
/// size and refresh rate, never by index (indices are not stable across
/// driver updates)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeRecord {
    pub width: i32,
    pub height: i32,
    pub refresh_mhz: u32,
}

/// Persisted configuration of one output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputRecord {
    pub identity: String,
    pub position: Point,
    pub scale: f64,
    #[serde(default)]
    pub transform: Transform,
    #[serde(default)]
    pub mode: Option<ModeRecord>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub overscan: u32,
    #[serde(default)]
    pub vrr: VrrPolicy,
    #[serde(default)]
    pub rgb_range: RgbRange,
}

fn default_enabled() -> bool {
    true
}

/// One remembered arrangement of a specific combination of outputs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LayoutRecord {
    pub outputs: Vec<OutputRecord>,
    /// Identity of the primary output, when one was chosen
    #[serde(default)]
    pub primary: Option<String>,
}

impl LayoutRecord {
    /// Snapshot the current state of a set of outputs
    pub fn capture<'a>(outputs: impl Iterator<Item = &'a Output>, primary: Option<&str>) -> Self {
        let outputs = outputs
            .map(|output| OutputRecord {
                identity: output.identity().to_string(),
                position: output.position(),
                scale: output.scale(),
                transform: output.transform(),
                mode: Some(ModeRecord {
                    width: output.current_mode().size.w,
                    height: output.current_mode().size.h,
                    refresh_mhz: output.current_mode().refresh_mhz,
                }),
                enabled: output.is_enabled(),
                overscan: 0,
                vrr: VrrPolicy::default(),
                rgb_range: RgbRange::default(),
            })
            .collect();
        Self {
            outputs,
            primary: primary.map(str::to_string),
        }
    }

    pub fn record_for(&self, identity: &str) -> Option<&OutputRecord> {
        self.outputs.iter().find(|r| r.identity == identity)
    }

    /// A record is applicable only if it leaves at least one output
    /// enabled, and does not disable the primary it names itself
    pub fn validate(&self) -> VesperResult<()> {
        if !self.outputs.is_empty() && self.outputs.iter().all(|r| !r.enabled) {
            return Err(VesperError::Validation(
                "layout disables every output".into(),
            ));
        }
        if let Some(primary) = &self.primary {
            let disabled = self
                .outputs
                .iter()
                .any(|r| &r.identity == primary && !r.enabled);
            if disabled {
                return Err(VesperError::Validation(format!(
                    "layout disables its own primary output {primary}"
                )));
            }
        }
        Ok(())
    }
}

/// Stable key for a combination of outputs, independent of connection
/// order
pub fn setup_key<'a>(identities: impl Iterator<Item = &'a str>) -> String {
    let mut sorted: Vec<&str> = identities.collect();
    sorted.sort_unstable();
    sorted.dedup();
    let mut hasher = DefaultHasher::new();
    for identity in sorted {
        identity.hash(&mut hasher);
    }
    format!("{:016x}", hasher.finish())
}

/// All remembered layouts, persisted as one JSON document
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct LayoutStore {
    layouts: HashMap<String, LayoutRecord>,
}

impl LayoutStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the store from disk; a missing file is an empty store, a
    /// corrupt file is an error
    pub fn load(path: &Path) -> VesperResult<Self> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let store = serde_json::from_str(&contents)?;
                Ok(store)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No layout store at {}, starting empty", path.display());
                Ok(Self::default())
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn save(&self, path: &Path) -> VesperResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn lookup(&self, key: &str) -> Option<&LayoutRecord> {
        self.layouts.get(key)
    }

    /// Store a record, rejecting invalid ones rather than persisting a
    /// configuration that could never be applied
    pub fn remember(&mut self, key: String, record: LayoutRecord) -> VesperResult<()> {
        record.validate()?;
        self.layouts.insert(key, record);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.layouts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layouts.is_empty()
    }
}

/// Apply a remembered record to a set of outputs.
///
/// Recorded outputs get their remembered position, scale and transform;
/// modes are matched by size and refresh. Outputs the record does not
/// know are appended left-to-right after the placed ones. Enable state is
/// reported back rather than applied, since disabling goes through the
/// pipeline's test-then-commit protocol.
pub fn apply_layout(
    record: &LayoutRecord,
    outputs: &mut [&mut Output],
) -> VesperResult<Vec<(crate::output::OutputId, bool)>> {
    record.validate()?;

    let mut enable_changes = Vec::new();
    let mut placed_right_edge = 0;

    for output in outputs.iter_mut() {
        let Some(rec) = record.record_for(output.identity()) else {
            continue;
        };
        output.set_position(rec.position);
        if rec.scale > 0.0 {
            output.set_scale(rec.scale);
        }
        output.set_transform(rec.transform);
        if let Some(mode) = rec.mode {
            let found = output.modes().iter().position(|m| {
                m.size.w == mode.width && m.size.h == mode.height && m.refresh_mhz == mode.refresh_mhz
            });
            match found {
                Some(index) => {
                    output.set_current_mode(index);
                }
                None => tracing::warn!(
                    "Output {}: remembered mode {}x{}@{} no longer offered",
                    output.name(),
                    mode.width,
                    mode.height,
                    mode.refresh_mhz
                ),
            }
        }
        if rec.enabled != output.is_enabled() {
            enable_changes.push((output.id(), rec.enabled));
        }
        placed_right_edge = placed_right_edge.max(output.geometry().right());
    }

    // unknown outputs line up after the placed ones
    for output in outputs.iter_mut() {
        if record.record_for(output.identity()).is_some() {
            continue;
        }
        output.set_position(Point::new(placed_right_edge, 0));
        placed_right_edge += output.logical_size().w;
    }

    Ok(enable_changes)
}

/// Default arrangement when nothing is remembered: left to right at y=0,
/// ordered by connector name for determinism
pub fn default_layout(outputs: &mut [&mut Output]) {
    let mut order: Vec<usize> = (0..outputs.len()).collect();
    order.sort_by(|&a, &b| outputs[a].name().cmp(outputs[b].name()));
    let mut x = 0;
    for index in order {
        let output = &mut outputs[index];
        output.set_position(Point::new(x, 0));
        x += output.logical_size().w;
    }
}
