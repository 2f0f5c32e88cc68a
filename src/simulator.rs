//! In-process stand-in for a Tektronix MSO.
//!
//! Speaks the same ASCII dialect the real scope does: chained commands with
//! `;`, one combined reply per line, definite-length blocks for `CURVe?`. It
//! keeps a settings table, an acquisition counter and synthetic waveforms, and
//! lets a [`SimHandle`] inject faults so failure paths can be driven over the
//! real framing code.

use crate::command_map::{short_form, ChannelIndex};
use crate::transport::Link;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::f64::consts::TAU;
use std::io::{self, Read, Write};
use std::sync::Arc;

/// Lines kept for [`SimHandle::received`].
const RECEIVED_LOG_LEN: usize = 256;

/// Misbehaviour to apply to the next matching query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Stay silent, so the reader times out.
    NoReply,
    /// Send a block whose header does not start with `#`.
    CorruptHeader,
    /// Send a block with an odd number of payload bytes.
    OddPayload,
    /// Send the block header and half the payload, then go silent.
    Stall,
    /// Fail the next write of this header with a connection reset.
    Reset,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FaultTarget {
    Header(String),
    Curve(ChannelIndex),
}

#[derive(Debug)]
struct SimState {
    model: String,
    channels: ChannelIndex,
    settings: HashMap<String, String>,
    acquisitions: u64,
    auto_acquire: bool,
    data_source: ChannelIndex,
    waveforms: HashMap<ChannelIndex, Vec<i16>>,
    faults: Vec<(FaultTarget, Fault)>,
    received: VecDeque<String>,
}

impl SimState {
    fn new(model: &str, channels: ChannelIndex) -> Self {
        let mut settings: HashMap<String, String> = [
            ("HOR:MODE", "AUTO"),
            ("HOR:RECO", "1000"),
            ("HOR:SAMPLER", "1.25E+9"),
            ("HOR:SCA", "8.0E-8"),
            ("HOR:DEL:TIM", "0.0E+0"),
            ("TRIG:A:TYPE", "EDGE"),
            ("TRIG:A:EDGE:COUP", "DC"),
            ("TRIG:STATE", "READY"),
            ("TRIG:A:MOD", "AUTO"),
            ("TRIG:A:EDGE:SOU", "CH1"),
            ("TRIG:A:EDGE:SLO", "RISE"),
            ("ACTONEV:EN", "0"),
            ("ACTONEV:LIMITC", "80"),
            ("WFMO:BYT_O", "LSB"),
            ("WFMO:XIN", "8.0E-10"),
            ("WFMO:XZE", "-4.0E-7"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        for ch in 1..=channels {
            let state = if ch <= 2 { "1" } else { "0" };
            for (key, value) in [
                (format!("DIS:WAVEV1:CH{ch}:STATE"), state),
                (format!("CH{ch}:COUP"), "DC"),
                (format!("CH{ch}:SCA"), "1.0E-1"),
                (format!("CH{ch}:OFFS"), "0.0E+0"),
                (format!("CH{ch}:TER"), "1.0E+6"),
                (format!("TRIG:A:LEV:CH{ch}"), "0.0E+0"),
                (format!("WFMO:YMU:CH{ch}"), "4.0E-6"),
                (format!("WFMO:YOF:CH{ch}"), "0.0E+0"),
                (format!("WFMO:YZE:CH{ch}"), "0.0E+0"),
            ] {
                settings.insert(key, value.to_string());
            }
        }

        Self {
            model: model.to_string(),
            channels,
            settings,
            acquisitions: 0,
            auto_acquire: false,
            data_source: 1,
            waveforms: HashMap::new(),
            faults: Vec::new(),
            received: VecDeque::new(),
        }
    }

    /// Remove the first fault aimed at `header`; writes only see `Reset`.
    fn take_fault(&mut self, header: &str, on_write: bool) -> Option<Fault> {
        let position = self.faults.iter().position(|(target, fault)| {
            let hit = match target {
                FaultTarget::Header(h) => h == header,
                FaultTarget::Curve(ch) => header == "CURV" && *ch == self.data_source,
            };
            hit && (*fault == Fault::Reset) == on_write
        })?;
        Some(self.faults.remove(position).1)
    }

    fn enabled_channels(&self) -> Vec<ChannelIndex> {
        (1..=self.channels)
            .filter(|ch| {
                self.settings
                    .get(&format!("DIS:WAVEV1:CH{ch}:STATE"))
                    .is_some_and(|s| s == "1")
            })
            .collect()
    }

    fn answer(&mut self, header: &str) -> Option<String> {
        let ch = self.data_source;
        match header {
            "*IDN" => Some(format!(
                "TEKTRONIX,{},SIM000001,CF:91.1CT FV:2.2.0",
                self.model
            )),
            "*OPC" => Some("1".to_string()),
            "*ESR" | "*STB" => Some("0".to_string()),
            "ACQ:NUMAC" => {
                if self.auto_acquire {
                    self.acquisitions += 1;
                }
                Some(self.acquisitions.to_string())
            }
            "DAT:SOU" => Some(format!("CH{ch}")),
            "DAT:SOU:AVAIL" => {
                let enabled = self.enabled_channels();
                if enabled.is_empty() {
                    Some("NONE".to_string())
                } else {
                    let names: Vec<String> = enabled.iter().map(|c| format!("CH{c}")).collect();
                    Some(names.join(","))
                }
            }
            "WFMO:YMU" | "WFMO:YOF" | "WFMO:YZE" => {
                self.settings.get(&format!("{header}:CH{ch}")).cloned()
            }
            "WFMO:NR_P" => self.settings.get("HOR:RECO").cloned(),
            "DATE" => Some("\"2026-10-18\"".to_string()),
            "TIME" => Some("\"12:00:00\"".to_string()),
            _ => self.settings.get(header).cloned(),
        }
    }

    fn apply(&mut self, header: &str, value: &str) {
        match header {
            "DAT:SOU" => {
                if let Some(ch) = value
                    .to_uppercase()
                    .strip_prefix("CH")
                    .and_then(|n| n.parse().ok())
                {
                    self.data_source = ch;
                }
            }
            "TRIG" if value.to_uppercase().starts_with("FORC") => self.acquisitions += 1,
            "*CLS" | "*RST" | "*OPC" | "SAVE:SETUP" | "RECA:SETUP" => {}
            _ => {
                self.settings.insert(header.to_string(), value.to_string());
            }
        }
    }

    fn curve_block(&self, fault: Option<Fault>) -> Vec<u8> {
        let ch = self.data_source;
        let samples = self.waveforms.get(&ch).cloned().unwrap_or_else(|| {
            let points: usize = self
                .settings
                .get("HOR:RECO")
                .and_then(|n| n.parse().ok())
                .unwrap_or(1000);
            synthetic_waveform(ch, points)
        });
        let big_endian = self.settings.get("WFMO:BYT_O").is_some_and(|o| o == "MSB");

        let mut payload: Vec<u8> = samples
            .iter()
            .flat_map(|s| if big_endian { s.to_be_bytes() } else { s.to_le_bytes() })
            .collect();
        if fault == Some(Fault::OddPayload) {
            payload.pop();
        }

        let length = payload.len().to_string();
        let mut frame = format!("#{}{}", length.len(), length).into_bytes();
        if fault == Some(Fault::CorruptHeader) {
            frame[0] = b'%';
        }
        if fault == Some(Fault::Stall) {
            frame.extend(&payload[..payload.len() / 2]);
            return frame;
        }
        frame.extend(payload);
        frame.push(b'\n');
        frame
    }
}

fn synthetic_waveform(channel: ChannelIndex, points: usize) -> Vec<i16> {
    (0..points)
        .map(|i| {
            let phase = i as f64 / points as f64 * TAU * f64::from(channel);
            (phase.sin() * 8000.0) as i16
        })
        .collect()
}

/// The instrument end of the link.
pub struct SimulatedScope {
    state: Arc<Mutex<SimState>>,
    incoming: Vec<u8>,
    outgoing: VecDeque<u8>,
}

/// Test and control handle sharing state with a [`SimulatedScope`].
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedScope {
    pub fn new(model: &str, channels: ChannelIndex) -> (Self, SimHandle) {
        let state = Arc::new(Mutex::new(SimState::new(model, channels)));
        let scope = Self {
            state: Arc::clone(&state),
            incoming: Vec::new(),
            outgoing: VecDeque::new(),
        };
        (scope, SimHandle { state })
    }

    fn process(&mut self, line: &str) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.received.len() == RECEIVED_LOG_LEN {
            state.received.pop_front();
        }
        state.received.push_back(line.to_string());

        let mut fields = Vec::new();
        for part in line.split(';') {
            let part = part.trim().trim_start_matches(':');
            if part.is_empty() {
                continue;
            }
            if let Some(header) = part.strip_suffix('?') {
                let header = short_form(header);
                let fault = state.take_fault(&header, false);
                if fault == Some(Fault::NoReply) {
                    return Ok(());
                }
                if header == "CURV" {
                    let block = state.curve_block(fault);
                    self.outgoing.extend(block);
                    return Ok(());
                }
                match state.answer(&header) {
                    Some(value) => fields.push(value),
                    None => log::trace!("Simulator has no answer for {header}?"),
                }
            } else {
                let (header, value) = part
                    .split_once(char::is_whitespace)
                    .map_or((part, ""), |(h, v)| (h, v.trim()));
                let header = short_form(header);
                if state.take_fault(&header, true).is_some() {
                    return Err(io::ErrorKind::ConnectionReset.into());
                }
                state.apply(&header, value);
            }
        }

        if !fields.is_empty() {
            self.outgoing.extend(fields.join(";").into_bytes());
            self.outgoing.push_back(b'\n');
        }
        Ok(())
    }
}

impl Write for SimulatedScope {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.incoming.extend_from_slice(buf);
        while let Some(end) = self.incoming.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.incoming.drain(..=end).collect();
            let line = String::from_utf8_lossy(&line[..end]).into_owned();
            self.process(&line)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for SimulatedScope {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.outgoing.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "simulated read timeout",
            ));
        }
        let n = buf.len().min(self.outgoing.len());
        for (slot, byte) in buf.iter_mut().zip(self.outgoing.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Link for SimulatedScope {
    fn clear_input(&mut self) -> io::Result<()> {
        self.outgoing.clear();
        Ok(())
    }
}

impl SimHandle {
    /// Set a value as the scope would report it, keyed by short-form header.
    pub fn set(&self, header: &str, value: &str) {
        self.state
            .lock()
            .settings
            .insert(short_form(header), value.to_string());
    }

    /// Make the scope stop answering `header`, so it drops out of combined replies.
    pub fn forget(&self, header: &str) {
        self.state.lock().settings.remove(&short_form(header));
    }

    pub fn get(&self, header: &str) -> Option<String> {
        self.state.lock().settings.get(&short_form(header)).cloned()
    }

    pub fn set_acquisitions(&self, count: u64) {
        self.state.lock().acquisitions = count;
    }

    pub fn acquisitions(&self) -> u64 {
        self.state.lock().acquisitions
    }

    /// Register one more completed acquisition.
    pub fn trigger(&self) {
        self.state.lock().acquisitions += 1;
    }

    /// Count one acquisition every time the counter is read.
    pub fn set_auto_acquire(&self, enabled: bool) {
        self.state.lock().auto_acquire = enabled;
    }

    pub fn set_waveform(&self, channel: ChannelIndex, samples: Vec<i16>) {
        self.state.lock().waveforms.insert(channel, samples);
    }

    /// Apply `fault` to the next query with this header, or to the next
    /// write of it for [`Fault::Reset`].
    pub fn inject(&self, header: &str, fault: Fault) {
        self.state
            .lock()
            .faults
            .push((FaultTarget::Header(short_form(header)), fault));
    }

    /// Apply `fault` to the next curve read while `channel` is the data source.
    pub fn inject_curve(&self, channel: ChannelIndex, fault: Fault) {
        self.state
            .lock()
            .faults
            .push((FaultTarget::Curve(channel), fault));
    }

    /// The most recent lines the scope received, oldest first.
    pub fn received(&self) -> Vec<String> {
        self.state.lock().received.iter().cloned().collect()
    }

    pub fn clear_received(&self) {
        self.state.lock().received.clear();
    }
}

#[cfg(test)]
pub(crate) mod support {
    use super::{SimHandle, SimulatedScope};
    use crate::config::{ScopeConfig, ScopeContext};
    use crate::connector;
    use crate::transport::Transport;
    use crate::value_store::{MemoryStore, ValueStore};
    use std::sync::Arc;

    /// A validated context over a fresh four-channel simulator.
    pub fn simulated_context() -> (ScopeContext, SimHandle, Arc<MemoryStore>) {
        let (scope, handle) = SimulatedScope::new("MSO58", 4);
        let store = Arc::new(MemoryStore::new());
        let dyn_store: Arc<dyn ValueStore> = store.clone();
        let config = ScopeConfig::default().with_resource("SIM::MSO58").with_channels(4);
        let ctx = connector::establish(config, Transport::new(Box::new(scope)), dyn_store)
            .expect("simulator accepts the command table");
        handle.clear_received();
        (ctx, handle, store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange(scope: &mut SimulatedScope, line: &str) -> String {
        scope.write_all(format!("{line}\n").as_bytes()).unwrap();
        let mut reply = Vec::new();
        let mut buf = [0u8; 256];
        while let Ok(n) = scope.read(&mut buf) {
            reply.extend_from_slice(&buf[..n]);
        }
        String::from_utf8_lossy(&reply).into_owned()
    }

    #[test]
    fn test_long_form_commands_are_understood() {
        let (mut scope, handle) = SimulatedScope::new("MSO58", 4);
        exchange(&mut scope, "HORizontal:RECOrdlength 5000");
        assert_eq!(handle.get("HOR:RECO").as_deref(), Some("5000"));
        assert_eq!(exchange(&mut scope, ":HORizontal:RECOrdlength?"), "5000\n");
    }

    #[test]
    fn test_combined_reply_and_unknown_headers() {
        let (mut scope, _handle) = SimulatedScope::new("MSO58", 4);
        assert_eq!(
            exchange(&mut scope, "TRIG:STATE?;:ACQ:NUMAC?;:DAT:SOU:AVAIL?"),
            "READY;0;CH1,CH2\n"
        );
        // unknown queries are left out of the reply, like the real scope does
        assert_eq!(exchange(&mut scope, "HOR:RECO?;:BOGUS?"), "1000\n");
        assert_eq!(exchange(&mut scope, "BOGUS?"), "");
    }

    #[test]
    fn test_force_trigger_and_auto_acquire() {
        let (mut scope, handle) = SimulatedScope::new("MSO58", 4);
        exchange(&mut scope, "TRIGger FORCe");
        assert_eq!(handle.acquisitions(), 1);

        handle.set_auto_acquire(true);
        assert_eq!(exchange(&mut scope, "ACQ:NUMAC?"), "2\n");
        assert_eq!(exchange(&mut scope, "ACQ:NUMAC?"), "3\n");
    }

    #[test]
    fn test_curve_follows_data_source_and_byte_order() {
        let (mut scope, handle) = SimulatedScope::new("MSO58", 4);
        handle.set_waveform(3, vec![0x0102]);
        handle.set("WFMO:BYT_O", "MSB");
        scope.write_all(b"DAT:SOU CH3\nCURV?\n").unwrap();

        let mut frame = [0u8; 16];
        let n = scope.read(&mut frame).unwrap();
        assert_eq!(&frame[..n], b"#12\x01\x02\n");
    }

    #[test]
    fn test_faults_are_consumed_once() {
        let (mut scope, handle) = SimulatedScope::new("MSO58", 4);
        handle.inject("HOR:RECO", Fault::NoReply);
        assert_eq!(exchange(&mut scope, "HOR:RECO?"), "");
        assert_eq!(exchange(&mut scope, "HOR:RECO?"), "1000\n");
    }

    #[test]
    fn test_received_log_keeps_only_recent_lines() {
        let (mut scope, handle) = SimulatedScope::new("MSO58", 4);
        for n in 0..RECEIVED_LOG_LEN + 10 {
            exchange(&mut scope, &format!("HOR:RECO {n}"));
        }
        let received = handle.received();
        assert_eq!(received.len(), RECEIVED_LOG_LEN);
        assert_eq!(received.first().map(String::as_str), Some("HOR:RECO 10"));
        assert_eq!(
            received.last().map(String::as_str),
            Some(format!("HOR:RECO {}", RECEIVED_LOG_LEN + 9).as_str())
        );
    }
}
