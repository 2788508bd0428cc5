//! Input wire decoding and routing
//!
//! The host feeds the process line-delimited JSON: sensor update records and
//! manual reset actions. Each line is decoded here, unavailable states are
//! filtered out at this boundary, and valid events fan out to the channels of
//! every instance watching that entity id. Malformed lines are logged and
//! skipped; nothing on this wire can take the process down.

use {
    crate::aggregate::current_timestamp,
    crate::coordinator::Event,
    serde::Deserialize,
    serde_json::Value,
    std::collections::{HashMap, HashSet},
    tokio::io::{AsyncBufRead, AsyncBufReadExt},
    tokio::sync::mpsc,
};

/// One line of the input wire
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum WireRecord {
    /// `{"action": "reset", "name": "..."}`; with no name, every instance resets
    Action {
        action: String,
        #[serde(default)]
        name: Option<String>,
    },
    /// `{"entity_id": "...", "state": ..., "unit": "..."}`
    Update {
        entity_id: String,
        state: Value,
        #[serde(default)]
        unit: Option<String>,
    },
}

/// Extract a usable sample from a reported state.
///
/// Numbers and numeric strings pass through; "unknown", "unavailable", null
/// and anything non-numeric read as no sample. NaN/infinite values are
/// rejected the same way.
pub fn parse_state(state: &Value) -> Option<f64> {
    match state {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        Value::String(s) => {
            let s = s.trim();
            if s.eq_ignore_ascii_case("unknown") || s.eq_ignore_ascii_case("unavailable") {
                return None;
            }
            s.parse::<f64>().ok().filter(|v| v.is_finite())
        }
        _ => None,
    }
}

/// Maps wire records onto per-instance event channels
#[derive(Default)]
pub struct Router {
    by_source: HashMap<String, Vec<mpsc::Sender<Event>>>,
    by_name: HashMap<String, mpsc::Sender<Event>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one instance's channel under its name and every entity id it
    /// watches.
    pub fn register(&mut self, name: &str, entity_ids: &HashSet<String>, tx: mpsc::Sender<Event>) {
        for entity_id in entity_ids {
            self.by_source
                .entry(entity_id.clone())
                .or_default()
                .push(tx.clone());
        }
        self.by_name.insert(name.to_string(), tx);
    }

    pub fn instance_count(&self) -> usize {
        self.by_name.len()
    }

    /// Decode one input line and deliver the resulting events.
    pub async fn dispatch(&self, line: &str) {
        let record: WireRecord = match serde_json::from_str(line) {
            Ok(record) => record,
            Err(e) => {
                log::warn!("Skipping malformed input line ({}): {}", e, line);
                return;
            }
        };

        match record {
            WireRecord::Update {
                entity_id,
                state,
                unit,
            } => {
                let Some(value) = parse_state(&state) else {
                    log::debug!("Unavailable state from {}, no sample", entity_id);
                    return;
                };

                let Some(watchers) = self.by_source.get(&entity_id) else {
                    log::debug!("No instance watches {}", entity_id);
                    return;
                };

                for tx in watchers {
                    let event = Event::Sample {
                        source_id: entity_id.clone(),
                        value,
                        unit: unit.clone(),
                    };
                    if tx.send(event).await.is_err() {
                        log::debug!("Instance channel closed, dropping sample");
                    }
                }
            }
            WireRecord::Action { action, name } => {
                if action != "reset" {
                    log::warn!("Unknown action '{}' on input wire", action);
                    return;
                }

                let at = current_timestamp();
                match name {
                    Some(name) => match self.by_name.get(&name) {
                        Some(tx) => {
                            if tx.send(Event::ManualReset { at }).await.is_err() {
                                log::debug!("Instance channel closed, dropping reset");
                            }
                        }
                        None => log::warn!("Reset for unknown instance '{}'", name),
                    },
                    None => {
                        for tx in self.by_name.values() {
                            let _ = tx.send(Event::ManualReset { at }).await;
                        }
                    }
                }
            }
        }
    }
}

/// Consume the input stream until it closes.
pub async fn input_task<R: AsyncBufRead + Unpin>(reader: R, router: Router) {
    let mut lines = reader.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                router.dispatch(&line).await;
            }
            Ok(None) => break,
            Err(e) => {
                log::warn!("Input read error: {}", e);
                break;
            }
        }
    }
    log::info!("Input stream closed");
}
