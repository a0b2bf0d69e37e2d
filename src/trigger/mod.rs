//! Trigger Engine (§4.7): parses a trigger file, builds a per-packet
//! dispatch table, and runs the five-step event loop on every cycle.
//! Grounded on `original_source/include/lib/trigger/trigger.h`'s
//! `arg_t`/`trigger_handle`/`trigger_t`/`parse_trigger_file` shapes.

pub mod registry;

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{GswError, Outcome};
use crate::vcm::Vcm;
use crate::viewer::{UpdateMode, Viewer};
use crate::writer::Writer;

use registry::{lookup, TriggerOutcome};

pub struct Trigger {
    pub source_measurement: String,
    pub function_name: String,
    pub unique_id: usize,
    pub args: Vec<String>,
    source_packets: Vec<usize>,
}

pub struct TriggerEngine {
    vcm: Arc<Vcm>,
    triggers: Vec<Trigger>,
    /// packet index -> ordered trigger indices armed by that packet
    /// (insertion order is the tie-break for determinism, §4.7).
    packet_triggers: Vec<Vec<usize>>,
    subscribed_packets: Vec<usize>,
}

impl TriggerEngine {
    /// Parses the trigger file named in `vcm.trigger_file`, relative to
    /// `config_dir`. Returns `Failure` if the file doesn't exist or is
    /// malformed, per §4.1's "FILENOTFOUND"/"FAILURE" contract.
    pub fn load(vcm: Arc<Vcm>, config_dir: &Path) -> Result<Self, GswError> {
        let Some(file) = &vcm.trigger_file else {
            return Ok(Self {
                vcm,
                triggers: Vec::new(),
                packet_triggers: Vec::new(),
                subscribed_packets: Vec::new(),
            });
        };
        let path = config_dir.join(file);
        let text = fs::read_to_string(&path)
            .map_err(|e| GswError::failure("Trigger", "load", format!("trigger file '{}' not found: {e}", path.display())))?;

        let mut triggers = Vec::new();
        for (n, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let toks: Vec<&str> = line.split_whitespace().collect();
            if toks.len() < 2 {
                return Err(GswError::failure("Trigger", "load", format!("malformed trigger at line {}", n + 1)));
            }
            let source_measurement = toks[0].to_string();
            let function_name = toks[1].to_string();
            let args: Vec<String> = toks[2..].iter().map(|s| s.to_string()).collect();

            if lookup(&function_name).is_none() {
                return Err(GswError::failure("Trigger", "load", format!("unknown trigger function '{function_name}'")));
            }
            for name in std::iter::once(&source_measurement).chain(args.iter()) {
                if vcm.get_info(name).is_none() {
                    return Err(GswError::failure("Trigger", "load", format!("undeclared measurement '{name}' in trigger file")));
                }
            }

            let source_packets: Vec<usize> = vcm
                .get_info(&source_measurement)
                .map(|m| m.locations.iter().map(|l| l.packet_index).collect())
                .unwrap_or_default();

            triggers.push(Trigger {
                source_measurement,
                function_name,
                unique_id: triggers.len(),
                args,
                source_packets,
            });
        }

        let mut packet_triggers = vec![Vec::new(); vcm.num_packets()];
        let mut subscribed: HashSet<usize> = HashSet::new();
        for (idx, trigger) in triggers.iter().enumerate() {
            for &p in &trigger.source_packets {
                packet_triggers[p].push(idx);
                subscribed.insert(p);
            }
            for arg in &trigger.args {
                if let Some(m) = vcm.get_info(arg) {
                    for loc in &m.locations {
                        subscribed.insert(loc.packet_index);
                    }
                }
            }
        }
        let mut subscribed_packets: Vec<usize> = subscribed.into_iter().collect();
        subscribed_packets.sort_unstable();

        info!(triggers = triggers.len(), "trigger engine loaded");
        Ok(Self {
            vcm,
            triggers,
            packet_triggers,
            subscribed_packets,
        })
    }

    pub fn build_viewer(&self, viewer: &mut Viewer) {
        viewer.set_update_mode(UpdateMode::Blocking);
        for &p in &self.subscribed_packets {
            viewer.add_packet(p);
        }
    }

    /// Runs one cycle of the event loop (§4.7 steps 2-5); step 1
    /// (`viewer.update()`) is the caller's responsibility since it owns the
    /// blocking-timeout policy.
    pub fn run_cycle(&self, viewer: &Viewer, writer: &mut Writer) -> Result<bool, GswError> {
        writer.lock(false)?;

        let mut fired: HashSet<usize> = HashSet::new();
        let mut any_success = false;

        for (packet_index, trigger_indices) in self.packet_triggers.iter().enumerate() {
            if trigger_indices.is_empty() {
                continue;
            }
            if !viewer.packet_updated(packet_index) {
                continue;
            }

            for &idx in trigger_indices {
                if !fired.insert(idx) {
                    continue;
                }
                let trigger = &self.triggers[idx];
                let Some(func) = lookup(&trigger.function_name) else {
                    warn!(function = %trigger.function_name, "trigger function vanished from registry");
                    continue;
                };
                match func(viewer, writer, &trigger.args) {
                    TriggerOutcome::Success => {
                        any_success = true;
                        debug!(trigger = trigger.unique_id, function = %trigger.function_name, "trigger fired");
                    }
                    TriggerOutcome::NoChange => {}
                    TriggerOutcome::Failure => {
                        warn!(trigger = trigger.unique_id, function = %trigger.function_name, "trigger failed");
                    }
                }
            }
        }

        if any_success {
            writer.flush()?;
        }
        writer.unlock()?;
        Ok(any_success)
    }

    pub fn update_timeout(&self) -> Option<Duration> {
        None
    }
}
