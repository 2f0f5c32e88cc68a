//! Writes coming from outside the poll loop.
//!
//! Each writable name carries one [`Setter`] variant and every variant has its
//! own handler here. All of them go through the shared transport lock, and a
//! handler that needs several commands in a row holds the lock throughout.

use crate::command_map::{trigger_level_command, CommandDescriptor, Setter};
use crate::config::ScopeContext;
use crate::poll_cycle::RunState;
use crate::transport::{TransportError, QUERY_MARKER};
use crate::value_store::{PublishMode, Value, ValueKind};

const SETUP_IDLE: &str = "Setup";
const TRIGGER_IDLE: &str = "Trigger";
const FORCE_TRIGGER: &str = "Force!";

#[derive(Debug, thiserror::Error)]
pub enum SetterError {
    #[error("No value named {name}")]
    Unknown { name: String },

    #[error("{name} is read-only")]
    ReadOnly { name: String },

    #[error("{value:?} is not a valid value for {name}")]
    BadValue { name: String, value: String },

    #[error("{name} rejected: {reason}")]
    Rejected { name: String, reason: String },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SetupAction {
    Save,
    Recall,
}

/// Parse `Save latest`, `Recall oper` and friends.
fn parse_setup(value: &str) -> Option<(SetupAction, &'static str)> {
    let mut words = value.split_whitespace();
    let action = match words.next()?.to_lowercase().as_str() {
        "save" => SetupAction::Save,
        "recall" => SetupAction::Recall,
        _ => return None,
    };
    let file = match words.next()?.to_lowercase().as_str() {
        "latest" => "latest.set",
        "oper" => "oper.set",
        _ => return None,
    };
    words.next().is_none().then_some((action, file))
}

#[derive(Debug, Clone)]
pub struct SetterDispatcher {
    ctx: ScopeContext,
}

impl SetterDispatcher {
    pub fn new(ctx: ScopeContext) -> Self {
        Self { ctx }
    }

    /// Apply an external write to `name`.
    pub fn apply(&self, name: &str, value: &str) -> Result<(), SetterError> {
        let descriptor =
            self.ctx
                .commands
                .descriptor(name)
                .ok_or_else(|| SetterError::Unknown {
                    name: name.to_string(),
                })?;
        let Some(setter) = descriptor.setter else {
            return Err(SetterError::ReadOnly {
                name: name.to_string(),
            });
        };
        log::debug!("Set {name} = {value}");

        match setter {
            Setter::Scpi => self.write_scpi(descriptor, value),
            Setter::Setup => self.setup(name, value),
            Setter::ForceTrigger => self.force_trigger(name, value),
            Setter::TriggerLevel => self.trigger_level(name, value),
            Setter::InstrumentCommand => self.instrument_command(value),
        }
    }

    fn publish(&self, name: &str, value: Value) {
        self.ctx.store.publish(name, value, PublishMode::Always, None);
    }

    fn bad_value(name: &str, value: &str) -> SetterError {
        SetterError::BadValue {
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    fn write_scpi(&self, descriptor: &CommandDescriptor, value: &str) -> Result<(), SetterError> {
        let name = descriptor.name.as_str();
        let parsed = descriptor
            .kind
            .parse(value)
            .ok_or_else(|| Self::bad_value(name, value))?;
        let Some(command) = descriptor.command.as_deref() else {
            return Err(SetterError::ReadOnly {
                name: name.to_string(),
            });
        };

        // the record length only sticks in manual horizontal mode
        let line = if name == "recLengthS" {
            format!(":HOR:MODE MANUAL;:{command} {}", value.trim())
        } else {
            format!("{command} {}", value.trim())
        };
        self.ctx.transport.write(&line)?;
        self.publish(name, parsed);
        Ok(())
    }

    fn setup(&self, name: &str, value: &str) -> Result<(), SetterError> {
        let (action, file) = parse_setup(value).ok_or_else(|| Self::bad_value(name, value))?;
        let result = match action {
            SetupAction::Save => self
                .ctx
                .transport
                .write(&format!("SAVE:SETUP 'c:/{file}'"))
                .map(|()| format!("Saved setup {file}"))
                .map_err(SetterError::from),
            SetupAction::Recall if self.ctx.control.state() == RunState::Started => {
                Err(SetterError::Rejected {
                    name: name.to_string(),
                    reason: "stop the server before recalling a setup".to_string(),
                })
            }
            SetupAction::Recall => self
                .ctx
                .transport
                .write(&format!("RECA:SETUP 'c:/{file}'"))
                .map(|()| {
                    self.ctx.control.request_resync();
                    format!("Recalled setup {file}")
                })
                .map_err(SetterError::from),
        };

        let status = match &result {
            Ok(status) => status.clone(),
            Err(e) => e.to_string(),
        };
        self.publish("status", Value::Text(status));
        self.publish(name, Value::Text(SETUP_IDLE.to_string()));
        result.map(|_| ())
    }

    fn force_trigger(&self, name: &str, value: &str) -> Result<(), SetterError> {
        if value.trim() != FORCE_TRIGGER {
            return Err(Self::bad_value(name, value));
        }
        self.ctx.transport.write("TRIG FORC")?;
        self.publish(name, Value::Text(TRIGGER_IDLE.to_string()));
        Ok(())
    }

    fn trigger_level(&self, name: &str, value: &str) -> Result<(), SetterError> {
        let level = ValueKind::Float
            .parse(value)
            .ok_or_else(|| Self::bad_value(name, value))?;
        let source = self
            .ctx
            .store
            .current_value("trigSource")
            .and_then(|v| v.as_str().map(ToString::to_string))
            .unwrap_or_default();
        let Some(command) = trigger_level_command(&source) else {
            return Err(SetterError::Rejected {
                name: name.to_string(),
                reason: format!("trigger source {source:?} is not a channel"),
            });
        };

        let reply = {
            let mut session = self.ctx.transport.lock();
            session.write(&format!("{command} {level}"))?;
            session.query(&format!("{command}{QUERY_MARKER}"))?
        };
        let read_back = ValueKind::Float.parse(&reply).unwrap_or(level);
        self.publish(name, read_back);
        Ok(())
    }

    fn instrument_command(&self, command: &str) -> Result<(), SetterError> {
        let command = command.trim();
        self.publish("instrCmdS", Value::Text(command.to_string()));
        let reply = if command.ends_with(QUERY_MARKER) {
            self.ctx.transport.query(command)?
        } else {
            self.ctx.transport.write(command)?;
            String::new()
        };
        self.publish("instrCmdR", Value::Text(reply));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::support::simulated_context;
    use crate::value_store::ValueStore;

    #[test]
    fn test_parse_setup() {
        assert_eq!(
            parse_setup("Save latest"),
            Some((SetupAction::Save, "latest.set"))
        );
        assert_eq!(
            parse_setup("recall OPER"),
            Some((SetupAction::Recall, "oper.set"))
        );
        assert_eq!(parse_setup("Recall"), None);
        assert_eq!(parse_setup("Delete latest"), None);
        assert_eq!(parse_setup("Save latest now"), None);
    }

    #[test]
    fn test_scpi_setter_writes_and_publishes() {
        let (ctx, handle, store) = simulated_context();
        let setters = SetterDispatcher::new(ctx);

        setters.apply("timePerDiv", "1.0E-6").unwrap();
        assert_eq!(handle.get("HOR:SCA").as_deref(), Some("1.0E-6"));
        assert_eq!(store.current_value("timePerDiv"), Some(Value::Float(1.0e-6)));

        setters.apply("c02Coupling", "AC").unwrap();
        assert_eq!(handle.get("CH2:COUP").as_deref(), Some("AC"));
    }

    #[test]
    fn test_record_length_forces_manual_mode() {
        let (ctx, handle, _store) = simulated_context();
        let setters = SetterDispatcher::new(ctx);
        setters.apply("recLengthS", "5000").unwrap();
        assert_eq!(
            handle.received().last().map(String::as_str),
            Some(":HOR:MODE MANUAL;:HOR:RECO 5000")
        );
        assert_eq!(handle.get("HOR:MODE").as_deref(), Some("MANUAL"));
        assert_eq!(handle.get("HOR:RECO").as_deref(), Some("5000"));
    }

    #[test]
    fn test_rejected_writes() {
        let (ctx, handle, _store) = simulated_context();
        let setters = SetterDispatcher::new(ctx);
        assert!(matches!(
            setters.apply("timePerDiv", "fast"),
            Err(SetterError::BadValue { .. })
        ));
        assert!(matches!(
            setters.apply("trigState", "READY"),
            Err(SetterError::ReadOnly { .. })
        ));
        assert!(matches!(
            setters.apply("c09OnOff", "1"),
            Err(SetterError::Unknown { .. })
        ));
        assert!(handle.received().is_empty());
    }

    #[test]
    fn test_force_trigger() {
        let (ctx, handle, store) = simulated_context();
        let setters = SetterDispatcher::new(ctx);
        setters.apply("trigger", "Force!").unwrap();
        assert_eq!(handle.acquisitions(), 1);
        assert_eq!(store.current_value("trigger"), Some(Value::Text("Trigger".into())));
    }

    #[test]
    fn test_recall_refused_while_started() {
        let (ctx, handle, store) = simulated_context();
        ctx.control.set_state(RunState::Started);
        let setters = SetterDispatcher::new(ctx.clone());

        assert!(matches!(
            setters.apply("setup", "Recall latest"),
            Err(SetterError::Rejected { .. })
        ));
        assert!(handle.received().is_empty());
        assert_eq!(store.current_value("setup"), Some(Value::Text("Setup".into())));
        assert!(store
            .current_value("status")
            .and_then(|v| v.as_str().map(ToString::to_string))
            .is_some_and(|s| s.contains("stop the server")));
        assert!(!ctx.control.take_resync());
    }

    #[test]
    fn test_recall_when_stopped_requests_resync() {
        let (ctx, handle, _store) = simulated_context();
        let setters = SetterDispatcher::new(ctx.clone());
        setters.apply("setup", "Recall oper").unwrap();
        assert_eq!(handle.received(), vec!["RECA:SETUP 'c:/oper.set'".to_string()]);
        assert!(ctx.control.take_resync());

        setters.apply("setup", "Save latest").unwrap();
        assert_eq!(
            handle.received().last().map(String::as_str),
            Some("SAVE:SETUP 'c:/latest.set'")
        );
    }

    #[test]
    fn test_trigger_level_uses_trigger_source() {
        let (ctx, handle, store) = simulated_context();
        let setters = SetterDispatcher::new(ctx.clone());
        ctx.store
            .publish("trigSource", "CH2".into(), PublishMode::Always, None);

        setters.apply("trigLevel", "0.25").unwrap();
        assert_eq!(handle.get("TRIG:A:LEV:CH2").as_deref(), Some("0.25"));
        assert_eq!(store.current_value("trigLevel"), Some(Value::Float(0.25)));

        ctx.store
            .publish("trigSource", "LINE".into(), PublishMode::Always, None);
        assert!(matches!(
            setters.apply("trigLevel", "0.5"),
            Err(SetterError::Rejected { .. })
        ));
    }

    #[test]
    fn test_instrument_command() {
        let (ctx, _handle, store) = simulated_context();
        let setters = SetterDispatcher::new(ctx);
        setters.apply("instrCmdS", "HOR:RECO?").unwrap();
        assert_eq!(store.current_value("instrCmdR"), Some(Value::Text("1000".into())));
        assert_eq!(store.current_value("instrCmdS"), Some(Value::Text("HOR:RECO?".into())));
    }
}
