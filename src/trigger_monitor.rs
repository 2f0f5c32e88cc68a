use crate::command_map::ChannelIndex;
use crate::config::ScopeContext;
use crate::poll_cycle::{ElapsedTimeLedger, Stage};
use crate::transport::TransportError;
use crate::value_store::{PublishMode, Value, ValueKind};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::{Instant, SystemTime};

/// Read together on every tick, in this order.
const MONITOR_HEADERS: [&str; 5] = [
    "TRIG:STATE",
    "ACQ:NUMAC",
    "HOR:RECO",
    "HOR:SCA",
    "DAT:SOU:AVAIL",
];

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("{occurrences} consecutive `{signature}` failures talking to the scope: {source}")]
    Escalated {
        signature: String,
        occurrences: u32,
        #[source]
        source: TransportError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// The counter moved forward; the triggered channels are ready to read.
    Detected,
    NoEvent,
    /// The counter did not move since the previous tick.
    Stalled,
    /// The counter went backwards or to zero.
    CounterReset,
    /// The tick's reply could not be used.
    Skipped,
}

impl TriggerOutcome {
    pub fn is_event(self) -> bool {
        self == Self::Detected
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TriggerEpoch {
    pub acquisition_counter: u64,
    pub lost_count: u64,
    pub triggered_channels: Vec<ChannelIndex>,
    /// Wall-clock time the latest event was seen.
    pub event_time: Option<SystemTime>,
}

impl TriggerEpoch {
    /// Account for a newly read acquisition counter.
    ///
    /// A zero on either side restarts the lost count, so an instrument that
    /// reset its counter and then acquired once looks like a fresh start.
    pub fn advance(&mut self, n: u64) -> TriggerOutcome {
        let prev = self.acquisition_counter;
        if prev == 0 || n == 0 {
            self.lost_count = 0;
        } else {
            let missed = n.saturating_sub(prev).saturating_sub(1);
            self.lost_count = self.lost_count.saturating_add(missed);
        }
        self.acquisition_counter = n;

        match n.cmp(&prev) {
            Ordering::Greater => TriggerOutcome::Detected,
            Ordering::Equal if n == 0 => TriggerOutcome::NoEvent,
            Ordering::Equal => TriggerOutcome::Stalled,
            Ordering::Less => TriggerOutcome::CounterReset,
        }
    }
}

/// Channels named in a `DAT:SOU:AVAIL?` reply, limited to analog inputs.
fn available_channels(reply: &str, channels: ChannelIndex) -> Vec<ChannelIndex> {
    reply
        .split(',')
        .filter_map(|source| source.trim().strip_prefix("CH")?.parse().ok())
        .filter(|ch| (1..=channels).contains(ch))
        .collect()
}

#[derive(Debug)]
pub struct TriggerMonitor {
    epoch: TriggerEpoch,
    /// Consecutive failures per error signature since the last success.
    streaks: HashMap<String, u32>,
    threshold: u32,
}

impl TriggerMonitor {
    pub fn new(threshold: u32) -> Self {
        Self {
            epoch: TriggerEpoch::default(),
            streaks: HashMap::new(),
            threshold: threshold.max(1),
        }
    }

    pub fn epoch(&self) -> &TriggerEpoch {
        &self.epoch
    }

    #[tracing::instrument(skip_all)]
    pub fn tick(
        &mut self,
        ctx: &ScopeContext,
        ledger: &mut ElapsedTimeLedger,
    ) -> Result<TriggerOutcome, MonitorError> {
        let started = Instant::now();
        let fields = match ctx.transport.query_fields(&MONITOR_HEADERS) {
            Ok(fields) => {
                self.streaks.clear();
                fields
            }
            Err(e) => return self.record_failure(e),
        };
        ledger.record(Stage::TriggerQuery, started.elapsed());

        let [state, count, record, scale, available] = fields.as_slice() else {
            log::warn!(
                "Trigger poll returned {} fields instead of {}",
                fields.len(),
                MONITOR_HEADERS.len()
            );
            return Ok(TriggerOutcome::Skipped);
        };
        let Some(n) = ValueKind::Int
            .parse(count)
            .and_then(|v| v.as_i64())
            .and_then(|n| u64::try_from(n).ok())
        else {
            log::warn!("Unreadable acquisition counter {count:?}");
            return Ok(TriggerOutcome::Skipped);
        };

        let prev = self.epoch.acquisition_counter;
        let outcome = self.epoch.advance(n);
        match outcome {
            TriggerOutcome::Detected => {
                let now = SystemTime::now();
                self.epoch.event_time = Some(now);
                self.epoch.triggered_channels =
                    available_channels(available, ctx.commands.channels());
                log::debug!(
                    "Acquisition {n} on {:?} ({} lost so far)",
                    self.epoch.triggered_channels,
                    self.epoch.lost_count
                );
                publish_parsed(ctx, "recLengthR", ValueKind::Float, record, now);
                publish_parsed(ctx, "timePerDiv", ValueKind::Float, scale, now);
                publish_parsed(ctx, "trigState", ValueKind::Text, state, now);
            }
            TriggerOutcome::Stalled => {
                log::warn!("Acquisition counter stuck at {n}, trigger state {state}");
                ctx.store.publish(
                    "status",
                    Value::Text(format!("No new acquisition since #{n}")),
                    PublishMode::IfChanged,
                    None,
                );
            }
            TriggerOutcome::CounterReset => {
                log::info!("Acquisition counter went from {prev} to {n}");
            }
            TriggerOutcome::NoEvent | TriggerOutcome::Skipped => {}
        }
        Ok(outcome)
    }

    fn record_failure(&mut self, error: TransportError) -> Result<TriggerOutcome, MonitorError> {
        let signature = error.signature();
        let occurrences = self.streaks.entry(signature.clone()).or_insert(0);
        *occurrences += 1;
        let occurrences = *occurrences;

        if occurrences >= self.threshold {
            log::error!("Giving up after {occurrences} `{signature}` failures: {error}");
            return Err(MonitorError::Escalated {
                signature,
                occurrences,
                source: error,
            });
        }
        log::warn!("Trigger poll failed ({occurrences}/{}): {error}", self.threshold);
        Ok(TriggerOutcome::NoEvent)
    }
}

fn publish_parsed(ctx: &ScopeContext, name: &str, kind: ValueKind, token: &str, when: SystemTime) {
    match kind.parse(token) {
        Some(value) => {
            ctx.store
                .publish(name, value, PublishMode::IfChanged, Some(when));
        }
        None => log::warn!("Ignoring {name} = {token:?}"),
    }
}
