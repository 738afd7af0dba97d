//! The device logger: level-filtered broadcast of `#log` informs.
//!
//! Log messages are logged at a particular level and under a particular name.
//! Names use dotted notation to form a virtual hierarchy of loggers within
//! the device. Every message is first handed to the process-wide [`log`]
//! facade; messages at or above the threshold are additionally mass-informed
//! to every connected client.

use std::sync::{Mutex, Weak};

use chrono::Utc;

use crate::{
    messages::{
        common::{FromKatcpArgument, KatcpTimestamp, ToKatcpArgument},
        log::Level,
    },
    protocol::{KatcpError, Message, MessageKind},
    server::ServerState,
    utils::lock,
};

/// Builds a `#log <level> <ts_ms> <name> <message>` inform
pub(crate) fn log_msg(level: Level, msg: &str, name: &str, timestamp: KatcpTimestamp) -> Message {
    Message::new_unvalidated(MessageKind::Inform, "log", [
        level.to_argument(),
        timestamp.to_argument(),
        name.to_owned(),
        msg.to_owned(),
    ])
}

/// Sends log informs on behalf of a device server
pub struct DeviceLogger {
    server: Weak<ServerState>,
    threshold: Mutex<Level>,
    root_name: String,
}

impl DeviceLogger {
    pub(crate) fn new(server: Weak<ServerState>) -> Self {
        Self {
            server,
            threshold: Mutex::new(Level::Warn),
            root_name: "root".to_owned(),
        }
    }

    /// The current threshold level
    pub fn level(&self) -> Level {
        *lock(&self.threshold)
    }

    /// The name of the current threshold level
    pub fn level_name(&self) -> String {
        self.level().to_argument()
    }

    pub fn set_level(&self, level: Level) {
        *lock(&self.threshold) = level;
    }

    /// Sets the threshold from a level name, failing on unknown names
    pub fn set_level_by_name(&self, name: &str) -> Result<Level, KatcpError> {
        let level = Level::from_argument(name).map_err(|_| {
            KatcpError::Message(format!("Unknown logging level name {name:?}"))
        })?;
        self.set_level(level);
        Ok(level)
    }

    /// Logs a message: forwards it to the process logger, then, if `level`
    /// passes the threshold, mass-informs all clients. `name` defaults to the
    /// root logger name and `timestamp` to now.
    pub fn log(
        &self,
        level: Level,
        msg: &str,
        name: Option<&str>,
        timestamp: Option<KatcpTimestamp>,
    ) {
        let name = name.unwrap_or(&self.root_name);
        if let Some(process_level) = level.to_log_level() {
            log::log!(process_level, "{name}: {msg}");
        }
        if level >= self.level() {
            if let Some(server) = self.server.upgrade() {
                let timestamp = timestamp.unwrap_or_else(Utc::now);
                server.mass_inform(&log_msg(level, msg, name, timestamp));
            }
        }
    }

    pub fn trace(&self, msg: &str) {
        self.log(Level::Trace, msg, None, None);
    }

    pub fn debug(&self, msg: &str) {
        self.log(Level::Debug, msg, None, None);
    }

    pub fn info(&self, msg: &str) {
        self.log(Level::Info, msg, None, None);
    }

    pub fn warn(&self, msg: &str) {
        self.log(Level::Warn, msg, None, None);
    }

    pub fn error(&self, msg: &str) {
        self.log(Level::Error, msg, None, None);
    }

    pub fn fatal(&self, msg: &str) {
        self.log(Level::Fatal, msg, None, None);
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_levels() {
        let logger = DeviceLogger::new(Weak::new());
        assert_eq!(Level::Warn, logger.level());
        assert_eq!("warn", logger.level_name());
        logger.set_level_by_name("debug").unwrap();
        assert_eq!(Level::Debug, logger.level());
        assert!(logger.set_level_by_name("shouting").is_err());
        // A failed set leaves the threshold alone
        assert_eq!(Level::Debug, logger.level());
    }

    #[test]
    fn test_log_msg_shape() {
        let msg = log_msg(
            Level::Error,
            "Something may be wrong",
            "device.sub-system",
            Utc.timestamp_opt(10, 0).unwrap(),
        );
        assert_eq!(
            r"#log error 10000 device.sub-system Something\_may\_be\_wrong",
            msg.to_string()
        );
    }
}
