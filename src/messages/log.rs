//! The katcp logging [`Level`] hierarchy, shared by `?log-level` and the
//! `#log` inform.

use katcp_device_derive::KatcpDiscrete;

use crate::prelude::*;

#[derive(KatcpDiscrete, Debug, PartialEq, Eq, PartialOrd, Ord, Copy, Clone)]
/// Katcp log level, these match the typical log level hierarchy of log4j, syslog, etc.
///
/// Variants are declared in ascending order so that `level >= threshold`
/// decides whether a message passes a [`DeviceLogger`](crate::logger::DeviceLogger)
/// threshold.
pub enum Level {
    /// The lowest possible logging level, intended to turn on all logging when
    /// used as a threshold. Devices should never log messages directly to it.
    All,
    /// Extremely verbose output for detailed analysis and debugging of a device
    Trace,
    /// Verbose output used for detailed analysis and debugging of a device
    Debug,
    /// Information about workflow at a coarse-grained level
    Info,
    /// A condition was detected which may lead to functional degradation, but
    /// the device is still fully functional
    Warn,
    /// A function or operation did not complete successfully; the device can
    /// continue, potentially with degraded functionality
    Error,
    /// The device has failed and recovery is not possible
    Fatal,
    /// The highest possible logging level, intended to turn logging off when
    /// used as a threshold
    Off,
}

impl Level {
    /// Maps onto the process-wide `log` facade. `All` and `Off` are threshold
    /// markers, not levels a device should log at.
    pub(crate) fn to_log_level(self) -> Option<log::Level> {
        match self {
            Level::Trace => Some(log::Level::Trace),
            Level::Debug => Some(log::Level::Debug),
            Level::Info => Some(log::Level::Info),
            Level::Warn => Some(log::Level::Warn),
            Level::Error | Level::Fatal => Some(log::Level::Error),
            Level::All | Level::Off => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names() {
        assert_eq!("warn", Level::Warn.to_argument());
        assert_eq!(Level::Fatal, Level::from_argument("fatal").unwrap());
        assert!(Level::from_argument("loud").is_err());
    }

    #[test]
    fn test_ordering() {
        assert!(Level::All < Level::Trace);
        assert!(Level::Trace < Level::Debug);
        assert!(Level::Debug < Level::Info);
        assert!(Level::Info < Level::Warn);
        assert!(Level::Warn < Level::Error);
        assert!(Level::Error < Level::Fatal);
        assert!(Level::Fatal < Level::Off);
    }
}
