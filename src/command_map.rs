//! The table of named values the bridge exposes and the SCPI behind each.
//!
//! Templates are written in long form (`HORizontal:RECOrdlength`) and sent in
//! short form (`HOR:RECO`), which is the template with its lowercase letters
//! removed. Channel templates carry a `<n>` placeholder in both the name and
//! the command; names get a two-digit index (`c01VoltsPerDiv`), commands the
//! bare channel number (`CH1:SCA`).

use crate::transport::{combined_query, Transport, TransportError, QUERY_MARKER};
use crate::value_store::ValueKind;
use std::collections::HashMap;

/// Instrument input channel, counted from 1.
pub type ChannelIndex = u8;

pub const CHANNEL_PLACEHOLDER: &str = "<n>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl Mode {
    pub const fn is_readable(self) -> bool {
        matches!(self, Self::ReadOnly | Self::ReadWrite)
    }

    pub const fn is_writable(self) -> bool {
        matches!(self, Self::WriteOnly | Self::ReadWrite)
    }
}

/// What happens when a value is written from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setter {
    /// Pass the value straight to the instrument command.
    Scpi,
    /// Save or recall an instrument setup file.
    Setup,
    /// Force a trigger event.
    ForceTrigger,
    /// Trigger level of whichever channel is the trigger source.
    TriggerLevel,
    /// Raw command typed by an operator; the reply goes to `instrCmdR`.
    InstrumentCommand,
}

struct TableEntry {
    name: &'static str,
    template: Option<&'static str>,
    kind: ValueKind,
    setter: Option<Setter>,
}

const fn entry(
    name: &'static str,
    template: Option<&'static str>,
    kind: ValueKind,
    setter: Option<Setter>,
) -> TableEntry {
    TableEntry {
        name,
        template,
        kind,
        setter,
    }
}

use Setter::{ForceTrigger, InstrumentCommand, Scpi, Setup, TriggerLevel};
use ValueKind::{Float, Int, Text};

const SCOPE_TABLE: &[TableEntry] = &[
    entry("setup", None, Text, Some(Setup)),
    entry("scopeAcqCount", Some("ACQuire:NUMACq"), Int, None),
    entry("instrCmdS", None, Text, Some(InstrumentCommand)),
    entry("actOnEvent", Some("ACTONEVent:ENable"), Text, Some(Scpi)),
    entry("aOE_Limit", Some("ACTONEVent:LIMITCount"), Int, Some(Scpi)),
    entry("horzMode", Some("HORizontal:MODE"), Text, Some(Scpi)),
    entry("recLengthS", Some("HORizontal:RECOrdlength"), Float, Some(Scpi)),
    entry("recLengthR", Some("HORizontal:RECOrdlength"), Float, None),
    entry("samplingRate", Some("HORizontal:SAMPLERate"), Float, None),
    entry("timePerDiv", Some("HORizontal:SCAle"), Float, Some(Scpi)),
    entry("trigger", None, Text, Some(ForceTrigger)),
    entry("trigType", Some("TRIGger:A:TYPE"), Text, Some(Scpi)),
    entry("trigCoupling", Some("TRIGger:A:EDGE:COUPling"), Text, None),
    entry("trigState", Some("TRIGger:STATE"), Text, None),
    entry("trigMode", Some("TRIGger:A:MODe"), Text, Some(Scpi)),
    entry("trigDelay", Some("HORizontal:DELay:TIMe"), Float, None),
    entry("trigSource", Some("TRIGger:A:EDGE:SOUrce"), Text, Some(Scpi)),
    entry("trigSlope", Some("TRIGger:A:EDGE:SLOpe"), Text, Some(Scpi)),
    entry("trigLevel", None, Float, Some(TriggerLevel)),
];

const CHANNEL_TABLE: &[TableEntry] = &[
    entry("c<n>OnOff", Some("DISplay:WAVEView1:CH<n>:STATE"), Text, Some(Scpi)),
    entry("c<n>Coupling", Some("CH<n>:COUPling"), Text, Some(Scpi)),
    entry("c<n>VoltsPerDiv", Some("CH<n>:SCAle"), Float, Some(Scpi)),
    entry("c<n>VoltOffset", Some("CH<n>:OFFSet"), Float, Some(Scpi)),
    entry("c<n>Termination", Some("CH<n>:TERmination"), Float, Some(Scpi)),
];

/// Strip the optional lowercase part of every SCPI mnemonic.
pub fn short_form(template: &str) -> String {
    template.chars().filter(|c| !c.is_lowercase()).collect()
}

/// Name of a per-channel value, e.g. `c02Waveform`.
pub fn channel_name(template: &str, channel: ChannelIndex) -> String {
    template.replace(CHANNEL_PLACEHOLDER, &format!("{channel:02}"))
}

/// Trigger-level command for a trigger source, if the source is a channel.
pub fn trigger_level_command(source: &str) -> Option<String> {
    let source = source.trim().to_uppercase();
    let channel = source.strip_prefix("CH")?;
    if channel.is_empty() || !channel.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(format!("TRIG:A:LEV:{source}"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandDescriptor {
    pub name: String,
    /// Short-form command with the channel already substituted.
    pub command: Option<String>,
    pub mode: Mode,
    pub kind: ValueKind,
    pub setter: Option<Setter>,
    pub channel: Option<ChannelIndex>,
}

impl CommandDescriptor {
    fn from_entry(entry: &TableEntry, channel: Option<ChannelIndex>) -> Self {
        let (name, command) = match channel {
            Some(ch) => (
                channel_name(entry.name, ch),
                entry
                    .template
                    .map(|t| short_form(&t.replace(CHANNEL_PLACEHOLDER, &ch.to_string()))),
            ),
            None => (entry.name.to_string(), entry.template.map(short_form)),
        };
        let mode = match (command.is_some(), entry.setter.is_some()) {
            (true, true) => Mode::ReadWrite,
            (false, true) => Mode::WriteOnly,
            _ => Mode::ReadOnly,
        };
        Self {
            name,
            command,
            mode,
            kind: entry.kind,
            setter: entry.setter,
            channel,
        }
    }

    pub fn is_discrete(&self) -> bool {
        self.kind == ValueKind::Text
    }

    /// The query that reads this value back, if it can be read.
    pub fn read_form(&self) -> Option<String> {
        self.command
            .as_ref()
            .filter(|_| self.mode.is_readable())
            .map(|c| format!("{c}{QUERY_MARKER}"))
    }

    /// Common commands (`*IDN`) and vendor escapes (`!`) cannot be chained.
    fn is_chainable(&self) -> bool {
        self.command
            .as_deref()
            .is_some_and(|c| !c.starts_with(['*', '!']))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CommandMapError {
    #[error("Instrument rejected `{command}` for {name}: {source}")]
    Rejected {
        name: String,
        command: String,
        #[source]
        source: TransportError,
    },
}

#[derive(Debug, Clone)]
pub struct CommandMap {
    channels: ChannelIndex,
    descriptors: Vec<CommandDescriptor>,
    by_name: HashMap<String, usize>,
    combined: Vec<usize>,
    combined_query: String,
}

impl CommandMap {
    /// Expand the static table for `channels` inputs.
    pub fn build(channels: ChannelIndex) -> Self {
        let mut descriptors: Vec<CommandDescriptor> = SCOPE_TABLE
            .iter()
            .map(|e| CommandDescriptor::from_entry(e, None))
            .collect();
        for ch in 1..=channels {
            descriptors.extend(
                CHANNEL_TABLE
                    .iter()
                    .map(|e| CommandDescriptor::from_entry(e, Some(ch))),
            );
        }

        let by_name = descriptors
            .iter()
            .enumerate()
            .map(|(i, d)| (d.name.clone(), i))
            .collect();
        let combined: Vec<usize> = descriptors
            .iter()
            .enumerate()
            .filter(|(_, d)| d.mode.is_readable() && d.is_chainable())
            .map(|(i, _)| i)
            .collect();
        let headers: Vec<&str> = combined
            .iter()
            .filter_map(|&i| descriptors[i].command.as_deref())
            .collect();
        let combined_query = combined_query(&headers);
        log::debug!("Settings query: {combined_query}");

        Self {
            channels,
            descriptors,
            by_name,
            combined,
            combined_query,
        }
    }

    /// Query every readable command on its own; the first one the instrument
    /// does not answer makes the whole table unusable.
    pub fn validate(&self, transport: &Transport) -> Result<(), CommandMapError> {
        for descriptor in &self.descriptors {
            let Some(query) = descriptor.read_form() else {
                continue;
            };
            match transport.query(&query) {
                Ok(reply) => log::trace!("{}: {query} -> {reply}", descriptor.name),
                Err(source) => {
                    return Err(CommandMapError::Rejected {
                        name: descriptor.name.clone(),
                        command: query,
                        source,
                    })
                }
            }
        }
        log::debug!("Validated {} commands", self.descriptors.len());
        Ok(())
    }

    pub fn channels(&self) -> ChannelIndex {
        self.channels
    }

    pub fn descriptors(&self) -> &[CommandDescriptor] {
        &self.descriptors
    }

    pub fn descriptor(&self, name: &str) -> Option<&CommandDescriptor> {
        self.by_name.get(name).map(|&i| &self.descriptors[i])
    }

    /// Descriptors answered by [`Self::combined_query`], in reply order.
    pub fn combined(&self) -> impl Iterator<Item = &CommandDescriptor> {
        self.combined.iter().map(|&i| &self.descriptors[i])
    }

    pub fn combined_len(&self) -> usize {
        self.combined.len()
    }

    pub fn combined_query(&self) -> &str {
        &self.combined_query
    }

    /// Command a setter writes for `name`, if it is writable through SCPI.
    pub fn write_command(&self, name: &str) -> Option<&str> {
        self.descriptor(name)
            .filter(|d| d.mode.is_writable())
            .and_then(|d| d.command.as_deref())
    }
}
