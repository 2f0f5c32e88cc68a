//! Keeps the named values in step with the instrument's configuration.
//!
//! [`SettingsSynchronizer::reconcile`] reads the whole command table in one
//! combined query. Its reply is attributed to names purely by position, so a
//! reply that does not line up field for field is rejected as a whole and the
//! local cache is left exactly as it was.

use crate::command_map::{channel_name, trigger_level_command, ChannelIndex};
use crate::config::ScopeContext;
use crate::transport::{split_fields, TransportError};
use crate::value_store::{PublishMode, Value, ValueKind};
use std::collections::{BTreeMap, HashMap};

/// Names whose value changed in one synchronization, with their new value.
pub type Changes = BTreeMap<String, Value>;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Reply has {received} fields for {expected} names (first name without a value: {missing:?})")]
    Arity {
        expected: usize,
        received: usize,
        missing: Option<String>,
    },

    #[error("Cannot read {token:?} as the value of {name}")]
    Coercion { name: String, token: String },
}

impl SyncError {
    /// Misaligned or mistyped replies cannot be attributed safely.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Transport(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HorizontalCalibration {
    /// Time of the first sample relative to the trigger, in seconds.
    pub origin: f64,
    /// Time between samples, in seconds.
    pub increment: f64,
    pub points: usize,
}

impl HorizontalCalibration {
    pub fn time_axis(&self) -> Vec<f64> {
        (0..self.points)
            .map(|i| self.origin + i as f64 * self.increment)
            .collect()
    }
}

/// `volts = raw * scale + zero`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VerticalCalibration {
    pub scale: f64,
    pub zero: f64,
    /// Digitizer offset in raw levels, already folded into `zero`.
    pub offset: f64,
}

impl VerticalCalibration {
    /// From the scope's `YMU`, `YOF` and `YZE` preamble values.
    pub fn from_preamble(multiplier: f64, offset: f64, zero: f64) -> Self {
        Self {
            scale: multiplier,
            zero: zero - offset * multiplier,
            offset,
        }
    }
}

/// Conversion factors, refreshed on the slow cadence and stale in between.
#[derive(Debug, Clone, Default)]
pub struct ScopeCalibration {
    pub horizontal: HorizontalCalibration,
    vertical: BTreeMap<ChannelIndex, VerticalCalibration>,
}

impl ScopeCalibration {
    pub fn vertical(&self, channel: ChannelIndex) -> Option<VerticalCalibration> {
        self.vertical.get(&channel).copied()
    }

    pub fn set_vertical(&mut self, channel: ChannelIndex, calibration: VerticalCalibration) {
        self.vertical.insert(channel, calibration);
    }

    pub fn channels(&self) -> impl Iterator<Item = ChannelIndex> + '_ {
        self.vertical.keys().copied()
    }
}

const HORIZONTAL_HEADERS: [&str; 3] = ["WFMO:XIN", "WFMO:XZE", "WFMO:NR_P"];
const VERTICAL_HEADERS: [&str; 3] = ["WFMO:YMU", "WFMO:YOF", "WFMO:YZE"];
const STATUS_HEADERS: [&str; 3] = ["ACTONEV:EN", "DATE", "TIME"];

#[derive(Debug, Default)]
pub struct SettingsSynchronizer {
    cache: HashMap<String, Value>,
    /// Last horizontal preamble seen by `refresh`, verbatim.
    scope_parameters: String,
    enabled_channels: Vec<ChannelIndex>,
}

impl SettingsSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cached(&self, name: &str) -> Option<&Value> {
        self.cache.get(name)
    }

    /// Channels whose trace is on, as of the last `refresh`.
    pub fn enabled_channels(&self) -> &[ChannelIndex] {
        &self.enabled_channels
    }

    /// Forget every cached value so the next reconcile republishes all of them.
    pub fn invalidate(&mut self) {
        self.cache.clear();
        self.scope_parameters.clear();
    }

    /// Read the full command table and publish whatever changed.
    #[tracing::instrument(skip_all)]
    pub fn reconcile(&mut self, ctx: &ScopeContext) -> Result<Changes, SyncError> {
        let reply = ctx.transport.query(ctx.commands.combined_query())?;
        let tokens = split_fields(&reply);

        let expected = ctx.commands.combined_len();
        if tokens.len() != expected {
            let missing = ctx
                .commands
                .combined()
                .nth(tokens.len())
                .map(|d| d.name.clone());
            log::error!(
                "Settings reply has {} fields, expected {expected}; {missing:?} ran out",
                tokens.len()
            );
            return Err(SyncError::Arity {
                expected,
                received: tokens.len(),
                missing,
            });
        }

        let values = ctx
            .commands
            .combined()
            .zip(&tokens)
            .map(|(descriptor, token)| {
                descriptor
                    .kind
                    .parse(token)
                    .map(|value| (descriptor.name.as_str(), value))
                    .ok_or_else(|| SyncError::Coercion {
                        name: descriptor.name.clone(),
                        token: token.clone(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut changes = Changes::new();
        for (name, value) in values {
            self.update(ctx, name, value, &mut changes);
        }
        if !changes.is_empty() {
            log::debug!("{} settings changed", changes.len());
        }

        if let Err(e) = self.sync_trigger_level(ctx, &mut changes) {
            log::warn!("Trigger level not updated: {e}");
        }
        Ok(changes)
    }

    fn update(&mut self, ctx: &ScopeContext, name: &str, value: Value, changes: &mut Changes) {
        if self.cache.get(name) == Some(&value) {
            return;
        }
        ctx.store.publish(name, value.clone(), PublishMode::Always, None);
        self.cache.insert(name.to_string(), value.clone());
        changes.insert(name.to_string(), value);
    }

    fn sync_trigger_level(
        &mut self,
        ctx: &ScopeContext,
        changes: &mut Changes,
    ) -> Result<(), SyncError> {
        let Some(command) = self
            .cache
            .get("trigSource")
            .and_then(Value::as_str)
            .and_then(trigger_level_command)
        else {
            return Ok(());
        };
        let reply = ctx.transport.query(&format!("{command}?"))?;
        let value = ValueKind::Float
            .parse(&reply)
            .ok_or_else(|| SyncError::Coercion {
                name: "trigLevel".to_string(),
                token: reply,
            })?;
        self.update(ctx, "trigLevel", value, changes);
        Ok(())
    }

    /// Cheap periodic read of the horizontal preamble and channel display
    /// states. Also recomputes the enabled channel list.
    #[tracing::instrument(skip_all)]
    pub fn refresh(
        &mut self,
        ctx: &ScopeContext,
        calibration: &mut ScopeCalibration,
    ) -> Result<Changes, SyncError> {
        let channels = ctx.commands.channels();
        let mut headers: Vec<String> = HORIZONTAL_HEADERS.iter().map(ToString::to_string).collect();
        headers.push("HOR:MODE".to_string());
        headers.extend((1..=channels).map(|ch| format!("DIS:WAVEV1:CH{ch}:STATE")));

        let fields = ctx.transport.query_fields(headers.as_slice())?;
        if fields.len() != headers.len() {
            return Err(SyncError::Arity {
                expected: headers.len(),
                received: fields.len(),
                missing: headers.get(fields.len()).cloned(),
            });
        }

        let number = |i: usize| -> Result<f64, SyncError> {
            fields[i].parse().map_err(|_| SyncError::Coercion {
                name: headers[i].clone(),
                token: fields[i].clone(),
            })
        };
        let increment = number(0)?;
        let origin = number(1)?;
        let points = number(2)?;

        let mut changes = Changes::new();
        self.update(ctx, "horzMode", Value::Text(fields[3].clone()), &mut changes);

        let states = &fields[4..];
        self.enabled_channels = (1..=channels)
            .zip(states)
            .filter(|(_, state)| is_on(state))
            .map(|(ch, _)| ch)
            .collect();
        for (ch, state) in (1..=channels).zip(states) {
            let name = channel_name("c<n>OnOff", ch);
            self.update(ctx, &name, Value::Text(state.clone()), &mut changes);
        }

        let parameters = fields[..3].join(";");
        if parameters != self.scope_parameters {
            log::debug!("Horizontal parameters now {parameters}");
            calibration.horizontal = HorizontalCalibration {
                origin,
                increment,
                points: points.max(0.0) as usize,
            };
            ctx.store.publish(
                "tAxis",
                Value::Array(calibration.horizontal.time_axis()),
                PublishMode::Always,
                None,
            );
            self.update(ctx, "recLengthR", Value::Float(points), &mut changes);
            self.update(
                ctx,
                "timePerDiv",
                Value::Float(points * increment / 10.0),
                &mut changes,
            );
            if increment > 0.0 {
                self.update(ctx, "samplingRate", Value::Float(1.0 / increment), &mut changes);
            }
            self.scope_parameters = parameters;
        }
        Ok(changes)
    }

    /// Read the vertical preamble of every enabled channel.
    #[tracing::instrument(skip_all)]
    pub fn refresh_calibration(
        &self,
        ctx: &ScopeContext,
        calibration: &mut ScopeCalibration,
    ) -> Result<(), SyncError> {
        for &channel in &self.enabled_channels {
            let fields = {
                let mut session = ctx.transport.lock();
                session.write(&format!("DAT:SOU CH{channel}"))?;
                session.query_fields(&VERTICAL_HEADERS)?
            };
            let values = fields
                .iter()
                .zip(VERTICAL_HEADERS)
                .map(|(token, header)| {
                    token.parse::<f64>().map_err(|_| SyncError::Coercion {
                        name: format!("{header}:CH{channel}"),
                        token: token.clone(),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            let &[multiplier, offset, zero] = values.as_slice() else {
                return Err(SyncError::Arity {
                    expected: VERTICAL_HEADERS.len(),
                    received: values.len(),
                    missing: VERTICAL_HEADERS.get(values.len()).map(ToString::to_string),
                });
            };
            calibration.set_vertical(
                channel,
                VerticalCalibration::from_preamble(multiplier, offset, zero),
            );
        }
        Ok(())
    }

    /// Action-on-event state and the scope's clock.
    pub fn refresh_status(&mut self, ctx: &ScopeContext) -> Result<(), SyncError> {
        let fields = ctx.transport.query_fields(&STATUS_HEADERS)?;
        let [act_on_event, date, time] = &fields[..] else {
            return Err(SyncError::Arity {
                expected: STATUS_HEADERS.len(),
                received: fields.len(),
                missing: STATUS_HEADERS.get(fields.len()).map(ToString::to_string),
            });
        };
        let mut changes = Changes::new();
        self.update(ctx, "actOnEvent", Value::Text(act_on_event.clone()), &mut changes);
        let date_time = format!("{} {}", date.trim_matches('"'), time.trim_matches('"'));
        ctx.store
            .publish("dateTime", Value::Text(date_time), PublishMode::Always, None);
        Ok(())
    }
}

fn is_on(state: &str) -> bool {
    state == "1" || state.eq_ignore_ascii_case("ON")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::support::simulated_context;
    use crate::simulator::Fault;
    use crate::value_store::ValueStore;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-12 * a.abs().max(b.abs()).max(1.0)
    }

    #[test]
    fn test_reconcile_publishes_only_changes() {
        let (ctx, handle, store) = simulated_context();
        let mut sync = SettingsSynchronizer::new();

        let first = sync.reconcile(&ctx).unwrap();
        assert_eq!(first.len(), ctx.commands.combined_len() + 1);
        assert_eq!(first["c01VoltsPerDiv"], Value::Float(0.1));
        assert_eq!(first["aOE_Limit"], Value::Int(80));
        assert_eq!(first["trigLevel"], Value::Float(0.0));
        assert_eq!(store.current_value("trigSource"), Some(Value::Text("CH1".into())));

        assert!(sync.reconcile(&ctx).unwrap().is_empty());
        assert_eq!(store.updates("trigType"), 1);

        handle.set("HOR:SCA", "1.0E-6");
        let changes = sync.reconcile(&ctx).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes["timePerDiv"], Value::Float(1.0e-6));
        assert_eq!(store.current_value("timePerDiv"), Some(Value::Float(1.0e-6)));
    }

    #[test]
    fn test_trigger_level_follows_source() {
        let (ctx, handle, store) = simulated_context();
        let mut sync = SettingsSynchronizer::new();
        sync.reconcile(&ctx).unwrap();

        handle.set("TRIG:A:LEV:CH2", "5.0E-1");
        handle.set("TRIG:A:EDGE:SOU", "CH2");
        let changes = sync.reconcile(&ctx).unwrap();
        assert_eq!(changes["trigSource"], Value::Text("CH2".into()));
        assert_eq!(changes["trigLevel"], Value::Float(0.5));
        assert_eq!(store.current_value("trigLevel"), Some(Value::Float(0.5)));
        assert!(handle.received().contains(&"TRIG:A:LEV:CH2?".to_string()));
    }

    #[test]
    fn test_arity_mismatch_leaves_cache_untouched() {
        let (ctx, handle, store) = simulated_context();
        let mut sync = SettingsSynchronizer::new();
        sync.reconcile(&ctx).unwrap();

        handle.set("CH1:SCA", "2.0E+0");
        handle.forget("HOR:SCA");
        let err = sync.reconcile(&ctx).unwrap_err();
        assert!(err.is_fatal());
        let SyncError::Arity {
            expected,
            received,
            missing,
        } = err
        else {
            panic!("expected arity error, got {err:?}");
        };
        assert_eq!(expected, ctx.commands.combined_len());
        assert_eq!(received, expected - 1);
        assert_eq!(missing.as_deref(), Some("c04Termination"));
        assert_eq!(sync.cached("c01VoltsPerDiv"), Some(&Value::Float(0.1)));
        assert_eq!(store.current_value("c01VoltsPerDiv"), Some(Value::Float(0.1)));

        handle.set("HOR:SCA", "8.0E-8");
        let changes = sync.reconcile(&ctx).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes["c01VoltsPerDiv"], Value::Float(2.0));
    }

    #[test]
    fn test_coercion_failure_is_fatal() {
        let (ctx, handle, _store) = simulated_context();
        let mut sync = SettingsSynchronizer::new();
        handle.set("HOR:RECO", "LOTS");
        match sync.reconcile(&ctx) {
            Err(e @ SyncError::Coercion { .. }) => {
                assert!(e.is_fatal());
                assert!(e.to_string().contains("recLengthS"));
            }
            other => panic!("expected coercion error, got {other:?}"),
        }
        assert!(sync.cached("trigType").is_none());
    }

    #[test]
    fn test_transport_failure_is_not_fatal() {
        let (ctx, handle, _store) = simulated_context();
        let mut sync = SettingsSynchronizer::new();
        handle.inject("ACQ:NUMAC", Fault::NoReply);
        let err = sync.reconcile(&ctx).unwrap_err();
        assert!(matches!(err, SyncError::Transport(_)));
        assert!(!err.is_fatal());
        assert!(sync.reconcile(&ctx).is_ok());
    }

    #[test]
    fn test_refresh_horizontal_axis_and_channels() {
        let (ctx, handle, store) = simulated_context();
        let mut sync = SettingsSynchronizer::new();
        let mut calibration = ScopeCalibration::default();

        let changes = sync.refresh(&ctx, &mut calibration).unwrap();
        assert_eq!(sync.enabled_channels(), &[1, 2]);
        assert_eq!(calibration.horizontal.points, 1000);
        assert_eq!(changes["c03OnOff"], Value::Text("0".into()));
        assert!(close(changes["samplingRate"].as_f64().unwrap(), 1.25e9));
        assert!(close(changes["timePerDiv"].as_f64().unwrap(), 8.0e-8));

        let Some(Value::Array(axis)) = store.current_value("tAxis") else {
            panic!("no time axis");
        };
        assert_eq!(axis.len(), 1000);
        assert!(close(axis[0], -4.0e-7));
        assert!(close(axis[1] - axis[0], 8.0e-10));

        assert!(sync.refresh(&ctx, &mut calibration).unwrap().is_empty());

        handle.set("DIS:WAVEV1:CH3:STATE", "1");
        let changes = sync.refresh(&ctx, &mut calibration).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(sync.enabled_channels(), &[1, 2, 3]);
    }

    #[test]
    fn test_refresh_rejects_misaligned_channel_states() {
        let (ctx, handle, store) = simulated_context();
        let mut sync = SettingsSynchronizer::new();
        let mut calibration = ScopeCalibration::default();
        sync.refresh(&ctx, &mut calibration).unwrap();
        assert_eq!(sync.enabled_channels(), &[1, 2]);
        let on_off_updates = store.updates("c01OnOff");

        handle.forget("DIS:WAVEV1:CH1:STATE");
        match sync.refresh(&ctx, &mut calibration) {
            Err(e @ SyncError::Arity {
                expected: 8,
                received: 7,
                ..
            }) => assert!(e.is_fatal()),
            other => panic!("expected an arity error, got {other:?}"),
        }
        assert_eq!(sync.enabled_channels(), &[1, 2]);
        assert_eq!(store.updates("c01OnOff"), on_off_updates);
    }

    #[test]
    fn test_refresh_rejects_unreadable_horizontal_parameters() {
        let (ctx, handle, store) = simulated_context();
        let mut sync = SettingsSynchronizer::new();
        let mut calibration = ScopeCalibration::default();
        sync.refresh(&ctx, &mut calibration).unwrap();
        let axis_updates = store.updates("tAxis");

        handle.set("WFMO:XIN", "wide");
        handle.set("DIS:WAVEV1:CH3:STATE", "1");
        assert!(matches!(
            sync.refresh(&ctx, &mut calibration),
            Err(SyncError::Coercion { .. })
        ));
        assert_eq!(sync.enabled_channels(), &[1, 2]);
        assert_eq!(store.updates("tAxis"), axis_updates);
        assert_eq!(calibration.horizontal.points, 1000);
    }

    #[test]
    fn test_refresh_calibration_reads_enabled_channels() {
        let (ctx, handle, _store) = simulated_context();
        let mut sync = SettingsSynchronizer::new();
        let mut calibration = ScopeCalibration::default();
        handle.set("WFMO:YOF:CH2", "1.0E+2");
        handle.set("WFMO:YZE:CH2", "1.0E-3");

        sync.refresh(&ctx, &mut calibration).unwrap();
        sync.refresh_calibration(&ctx, &mut calibration).unwrap();

        assert_eq!(calibration.channels().collect::<Vec<_>>(), vec![1, 2]);
        let ch1 = calibration.vertical(1).unwrap();
        assert!(close(ch1.scale, 4.0e-6));
        assert!(close(ch1.zero, 0.0));
        let ch2 = calibration.vertical(2).unwrap();
        assert!(close(ch2.zero, 1.0e-3 - 1.0e2 * 4.0e-6));
        assert!(calibration.vertical(3).is_none());
        assert!(handle.received().contains(&"DAT:SOU CH2".to_string()));
    }

    #[test]
    fn test_refresh_status() {
        let (ctx, _handle, store) = simulated_context();
        let mut sync = SettingsSynchronizer::new();
        sync.refresh_status(&ctx).unwrap();
        assert_eq!(
            store.current_value("dateTime"),
            Some(Value::Text("2026-10-18 12:00:00".into()))
        );
        assert_eq!(store.current_value("actOnEvent"), Some(Value::Text("0".into())));
    }
}
