use crate::command_map::{channel_name, ChannelIndex};
use crate::config::ScopeContext;
use crate::poll_cycle::{ElapsedTimeLedger, Stage};
use crate::settings::{ScopeCalibration, VerticalCalibration};
use crate::trigger_monitor::TriggerEpoch;
use crate::transport::TransportError;
use crate::value_store::{PublishMode, Value};
use polars::prelude::*;
use std::time::Instant;

const RAW_COLUMN_NAME: &str = "raw";
const VALUE_COLUMN_NAME: &str = "value";

/// Sample byte order the scope is told to use for curve transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    #[default]
    Lsb,
    Msb,
}

impl ByteOrder {
    pub const fn as_scpi(self) -> &'static str {
        match self {
            Self::Lsb => "LSB",
            Self::Msb => "MSB",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WaveformError {
    #[error("Curve payload has an odd length of {len} bytes")]
    OddPayload { len: usize },

    #[error("Curve payload is empty")]
    Empty,

    #[error("No vertical calibration for channel {channel}")]
    MissingCalibration { channel: ChannelIndex },

    #[error("Unusable vertical scale for channel {channel}: {value:?}")]
    VerticalScale {
        channel: ChannelIndex,
        value: Option<f64>,
    },

    #[error("Polars error: {0}")]
    Polars(#[from] PolarsError),
}

#[derive(Debug, thiserror::Error)]
pub enum AcquireError {
    /// A broken block header leaves unread bytes of unknown length behind,
    /// so nothing read afterwards can be trusted.
    #[error("Waveform transfer for channel {channel} lost framing: {source}")]
    Desynchronized {
        channel: ChannelIndex,
        #[source]
        source: TransportError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaveformStats {
    pub mean: f64,
    pub peak_to_peak: f64,
    pub rms: f64,
}

/// Split a curve payload into signed 16-bit samples.
pub fn decode_samples(payload: &[u8], order: ByteOrder) -> Result<Vec<i16>, WaveformError> {
    if payload.len() % 2 != 0 {
        return Err(WaveformError::OddPayload { len: payload.len() });
    }
    Ok(payload
        .chunks_exact(2)
        .map(|pair| {
            let bytes = [pair[0], pair[1]];
            match order {
                ByteOrder::Lsb => i16::from_le_bytes(bytes),
                ByteOrder::Msb => i16::from_be_bytes(bytes),
            }
        })
        .collect())
}

/// Scale raw samples to volts (or divisions, when `volts_per_div` is given)
/// and compute their statistics.
pub fn to_engineering_units(
    raw: &[i16],
    calibration: VerticalCalibration,
    volts_per_div: Option<f64>,
) -> Result<(Vec<f64>, WaveformStats), WaveformError> {
    if raw.is_empty() {
        return Err(WaveformError::Empty);
    }

    let raw: Vec<i32> = raw.iter().map(|&s| i32::from(s)).collect();
    let column: Column = Series::new(RAW_COLUMN_NAME.into(), raw).into();
    let mut value = col(RAW_COLUMN_NAME).cast(DataType::Float64) * lit(calibration.scale)
        + lit(calibration.zero);
    if let Some(per_div) = volts_per_div {
        value = value / lit(per_div);
    }

    let df = DataFrame::new(vec![column])?
        .lazy()
        .select([value.alias(VALUE_COLUMN_NAME)])
        .collect()?;
    let values: Vec<f64> = df
        .column(VALUE_COLUMN_NAME)?
        .f64()?
        .into_no_null_iter()
        .collect();

    let stats = df
        .lazy()
        .select([
            col(VALUE_COLUMN_NAME).mean().alias("mean"),
            (col(VALUE_COLUMN_NAME).max() - col(VALUE_COLUMN_NAME).min()).alias("p2p"),
            (col(VALUE_COLUMN_NAME) * col(VALUE_COLUMN_NAME))
                .mean()
                .alias("mean_square"),
        ])
        .collect()?;
    let scalar = |name: &str| -> Result<f64, WaveformError> {
        Ok(stats.column(name)?.f64()?.get(0).unwrap_or(f64::NAN))
    };

    Ok((
        values,
        WaveformStats {
            mean: scalar("mean")?,
            peak_to_peak: scalar("p2p")?,
            rms: scalar("mean_square")?.sqrt(),
        },
    ))
}

/// What happened to each triggered channel during one acquisition.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AcquisitionReport {
    pub published: Vec<ChannelIndex>,
    pub skipped: Vec<ChannelIndex>,
    /// Channel whose transfer failed and stopped the remaining ones.
    pub aborted: Option<ChannelIndex>,
}

#[derive(Debug, Clone, Copy)]
pub struct WaveformAcquirer {
    byte_order: ByteOrder,
    normalize: bool,
}

impl WaveformAcquirer {
    pub fn new(byte_order: ByteOrder, normalize: bool) -> Self {
        Self {
            byte_order,
            normalize,
        }
    }

    /// Fetch, scale and publish the curve of every triggered channel, one
    /// channel at a time.
    #[tracing::instrument(skip_all, fields(channels = ?epoch.triggered_channels))]
    pub fn acquire(
        &self,
        ctx: &ScopeContext,
        epoch: &TriggerEpoch,
        calibration: &ScopeCalibration,
        ledger: &mut ElapsedTimeLedger,
    ) -> Result<AcquisitionReport, AcquireError> {
        let started = Instant::now();
        let mut report = AcquisitionReport::default();
        count_acquisition(ctx, epoch);

        for &channel in &epoch.triggered_channels {
            let Some(vertical) = calibration.vertical(channel) else {
                log::warn!("{}", WaveformError::MissingCalibration { channel });
                report.skipped.push(channel);
                continue;
            };

            let payload = {
                let mut session = ctx.transport.lock();
                session
                    .write(&format!("DAT:SOU CH{channel}"))
                    .and_then(|()| session.query_binary_block("CURV?"))
            };
            let payload = match payload {
                Ok(payload) => payload,
                Err(source @ TransportError::Decode { .. }) => {
                    log::error!("Curve of channel {channel} is unreadable: {source}");
                    return Err(AcquireError::Desynchronized { channel, source });
                }
                Err(e) => {
                    log::error!("Waveform transfer aborted at channel {channel}: {e}");
                    report.aborted = Some(channel);
                    break;
                }
            };

            match self.convert(ctx, channel, &payload, vertical) {
                Ok((values, stats)) => {
                    publish_waveform(ctx, channel, values, stats, epoch);
                    report.published.push(channel);
                }
                Err(e) => {
                    log::warn!("Skipping waveform of channel {channel}: {e}");
                    report.skipped.push(channel);
                }
            }
        }

        ledger.record(Stage::Acquisition, started.elapsed());
        Ok(report)
    }

    fn convert(
        &self,
        ctx: &ScopeContext,
        channel: ChannelIndex,
        payload: &[u8],
        vertical: VerticalCalibration,
    ) -> Result<(Vec<f64>, WaveformStats), WaveformError> {
        let raw = decode_samples(payload, self.byte_order)?;
        let volts_per_div = if self.normalize {
            let value = ctx
                .store
                .current_value(&channel_name("c<n>VoltsPerDiv", channel))
                .and_then(|v| v.as_f64());
            match value {
                Some(v) if v.is_finite() && v > 0.0 => Some(v),
                _ => return Err(WaveformError::VerticalScale { channel, value }),
            }
        } else {
            None
        };
        to_engineering_units(&raw, vertical, volts_per_div)
    }
}

fn count_acquisition(ctx: &ScopeContext, epoch: &TriggerEpoch) {
    let count = ctx
        .store
        .current_value("acqCount")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    ctx.store.publish(
        "acqCount",
        Value::Int(count + 1),
        PublishMode::Always,
        epoch.event_time,
    );
}

fn publish_waveform(
    ctx: &ScopeContext,
    channel: ChannelIndex,
    values: Vec<f64>,
    stats: WaveformStats,
    epoch: &TriggerEpoch,
) {
    let when = epoch.event_time;
    let name = |suffix: &str| channel_name(&format!("c<n>{suffix}"), channel);
    log::debug!(
        "Channel {channel}: {} points, mean {:.4}, p2p {:.4}, rms {:.4}",
        values.len(),
        stats.mean,
        stats.peak_to_peak,
        stats.rms
    );
    let store = &ctx.store;
    store.publish(&name("Waveform"), Value::Array(values), PublishMode::Always, when);
    store.publish(&name("Mean"), stats.mean.into(), PublishMode::Always, when);
    store.publish(&name("Peak2Peak"), stats.peak_to_peak.into(), PublishMode::Always, when);
    store.publish(&name("Rms"), stats.rms.into(), PublishMode::Always, when);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::SettingsSynchronizer;
    use crate::simulator::support::simulated_context;
    use crate::simulator::Fault;
    use crate::value_store::ValueStore;
    use std::time::{Duration, SystemTime};

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    fn calibrated(ctx: &ScopeContext) -> ScopeCalibration {
        let mut sync = SettingsSynchronizer::new();
        sync.reconcile(ctx).unwrap();
        let mut calibration = ScopeCalibration::default();
        sync.refresh(ctx, &mut calibration).unwrap();
        for channel in 1..=3 {
            calibration.set_vertical(
                channel,
                VerticalCalibration {
                    scale: 0.01,
                    zero: 0.0,
                    offset: 0.0,
                },
            );
        }
        calibration
    }

    fn epoch(channels: Vec<ChannelIndex>) -> TriggerEpoch {
        TriggerEpoch {
            acquisition_counter: 7,
            lost_count: 0,
            triggered_channels: channels,
            event_time: Some(SystemTime::UNIX_EPOCH + Duration::from_secs(1_000)),
        }
    }

    #[test]
    fn test_decode_samples_byte_order() {
        let payload = [0x01, 0x02, 0xFF, 0xFF];
        assert_eq!(decode_samples(&payload, ByteOrder::Lsb).unwrap(), vec![0x0201, -1]);
        assert_eq!(decode_samples(&payload, ByteOrder::Msb).unwrap(), vec![0x0102, -1]);
        assert!(matches!(
            decode_samples(&payload[..3], ByteOrder::Lsb),
            Err(WaveformError::OddPayload { len: 3 })
        ));
    }

    #[test]
    fn test_engineering_units_and_stats() {
        let vertical = VerticalCalibration {
            scale: 0.01,
            zero: 0.0,
            offset: 0.0,
        };
        let (values, _) = to_engineering_units(&[100], vertical, None).unwrap();
        assert!(close(values[0], 1.0));

        let (values, stats) = to_engineering_units(&[100, -100, 100, -100], vertical, None).unwrap();
        assert_eq!(values.len(), 4);
        assert!(close(stats.mean, 0.0));
        assert!(close(stats.peak_to_peak, 2.0));
        assert!(close(stats.rms, 1.0));

        let (values, stats) = to_engineering_units(&[100, -100], vertical, Some(0.5)).unwrap();
        assert!(close(values[0], 2.0));
        assert!(close(stats.peak_to_peak, 4.0));

        assert!(matches!(
            to_engineering_units(&[], vertical, None),
            Err(WaveformError::Empty)
        ));
    }

    #[test]
    fn test_acquire_publishes_with_event_time() {
        let (ctx, handle, store) = simulated_context();
        let calibration = calibrated(&ctx);
        handle.set_waveform(1, vec![100, -100, 100, -100]);
        let mut ledger = ElapsedTimeLedger::default();

        let acquirer = WaveformAcquirer::new(ByteOrder::Lsb, false);
        let epoch = epoch(vec![1]);
        let report = acquirer.acquire(&ctx, &epoch, &calibration, &mut ledger).unwrap();
        assert_eq!(report.published, vec![1]);

        let waveform = store.entry("c01Waveform").unwrap();
        assert_eq!(waveform.value, Value::Array(vec![1.0, -1.0, 1.0, -1.0]));
        assert_eq!(Some(waveform.timestamp), epoch.event_time);
        assert_eq!(store.current_value("c01Peak2Peak"), Some(Value::Float(2.0)));
        assert_eq!(store.current_value("acqCount"), Some(Value::Int(1)));
        assert!(handle.received().contains(&"DAT:SOU CH1".to_string()));
    }

    #[test]
    fn test_normalize_by_volts_per_div() {
        let (ctx, handle, store) = simulated_context();
        let calibration = calibrated(&ctx);
        handle.set_waveform(1, vec![100, -100]);

        let acquirer = WaveformAcquirer::new(ByteOrder::Lsb, true);
        acquirer
            .acquire(&ctx, &epoch(vec![1]), &calibration, &mut ElapsedTimeLedger::default())
            .unwrap();
        // c01VoltsPerDiv is 0.1 in the simulator
        assert_eq!(store.current_value("c01Peak2Peak"), Some(Value::Float(20.0)));
    }

    #[test]
    fn test_decode_error_skips_only_that_channel() {
        let (ctx, handle, store) = simulated_context();
        let calibration = calibrated(&ctx);
        handle.inject_curve(2, Fault::OddPayload);

        let acquirer = WaveformAcquirer::new(ByteOrder::Lsb, false);
        let report = acquirer
            .acquire(&ctx, &epoch(vec![1, 2, 3]), &calibration, &mut ElapsedTimeLedger::default())
            .unwrap();

        assert_eq!(report.published, vec![1, 3]);
        assert_eq!(report.skipped, vec![2]);
        assert!(store.current_value("c01Waveform").is_some());
        assert!(store.current_value("c02Waveform").is_none());
        assert!(store.current_value("c03Waveform").is_some());
    }

    #[test]
    fn test_transport_error_aborts_remaining_channels() {
        let (ctx, handle, store) = simulated_context();
        let calibration = calibrated(&ctx);
        handle.inject_curve(2, Fault::NoReply);

        let acquirer = WaveformAcquirer::new(ByteOrder::Lsb, false);
        let report = acquirer
            .acquire(&ctx, &epoch(vec![1, 2, 3]), &calibration, &mut ElapsedTimeLedger::default())
            .unwrap();

        assert_eq!(report.published, vec![1]);
        assert_eq!(report.aborted, Some(2));
        assert!(store.current_value("c03Waveform").is_none());
        assert!(!handle.received().contains(&"DAT:SOU CH3".to_string()));
    }

    #[test]
    fn test_stall_inside_curve_aborts_without_desync() {
        let (ctx, handle, store) = simulated_context();
        let calibration = calibrated(&ctx);
        handle.inject_curve(1, Fault::Stall);

        let acquirer = WaveformAcquirer::new(ByteOrder::Lsb, false);
        let report = acquirer
            .acquire(&ctx, &epoch(vec![1, 2]), &calibration, &mut ElapsedTimeLedger::default())
            .unwrap();

        assert!(report.published.is_empty());
        assert_eq!(report.aborted, Some(1));
        assert!(store.current_value("c01Waveform").is_none());
        assert_eq!(ctx.transport.query("HOR:RECO?").unwrap(), "1000");
    }

    #[test]
    fn test_corrupt_header_is_fatal() {
        let (ctx, handle, _store) = simulated_context();
        let calibration = calibrated(&ctx);
        handle.inject_curve(1, Fault::CorruptHeader);

        let acquirer = WaveformAcquirer::new(ByteOrder::Lsb, false);
        let result =
            acquirer.acquire(&ctx, &epoch(vec![1, 2]), &calibration, &mut ElapsedTimeLedger::default());
        assert!(matches!(
            result,
            Err(AcquireError::Desynchronized { channel: 1, .. })
        ));
    }

    #[test]
    fn test_missing_calibration_skips_channel() {
        let (ctx, _handle, store) = simulated_context();
        let acquirer = WaveformAcquirer::new(ByteOrder::Lsb, false);
        let report = acquirer
            .acquire(
                &ctx,
                &epoch(vec![4]),
                &ScopeCalibration::default(),
                &mut ElapsedTimeLedger::default(),
            )
            .unwrap();
        assert_eq!(report.skipped, vec![4]);
        assert!(store.current_value("c04Waveform").is_none());
    }
}
