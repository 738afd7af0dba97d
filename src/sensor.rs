//! Typed sensors: validated values, statuses and observer notification.
//!
//! A [`Sensor`] pairs a [`TypeSpec`] (the sensor's type and its type-specific
//! parameters) with the current reading (timestamp, [`Status`], value). Every
//! mutation goes through [`Sensor::set`], which validates the value against
//! the spec and notifies the attached observers exactly once. Observers are
//! held as weak references; a sensor never keeps a sampling strategy alive.

use std::sync::{Arc, Mutex, Weak};

use chrono::Utc;
use katcp_device_derive::KatcpDiscrete;

use crate::{
    messages::common::{FromKatcpArgument, KatcpTimestamp, ToKatcpArgument},
    protocol::KatcpError,
    utils::lock,
};

#[derive(KatcpDiscrete, Debug, PartialEq, Eq, Copy, Clone)]
/// The katcp sensor statuses
pub enum Status {
    /// The sensor is in the process of being initialized and no value has yet
    /// been seen. Sensors should not remain in this state indefinitely.
    Unknown,
    /// The sensor reading is within the expected range of nominal operating values.
    Nominal,
    /// The sensor reading is outside the nominal operating range.
    Warn,
    /// The sensor reading indicates a critical condition for the device.
    Error,
    /// Taking a sensor reading failed and seems unlikely to succeed in future
    /// without maintenance.
    Failure,
}

#[derive(KatcpDiscrete, Debug, PartialEq, Eq, Copy, Clone)]
/// The two permitted values of an LRU sensor
pub enum Lru {
    /// The line replaceable unit is functioning
    Nominal,
    /// The line replaceable unit has failed
    Error,
}

#[derive(Debug, Clone, PartialEq)]
/// A value of one of the seven sensor types
pub enum SensorValue {
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Lru(Lru),
    Discrete(String),
    String(String),
    Timestamp(KatcpTimestamp),
}

impl SensorValue {
    /// Formats the value as specified in the sensor type formats of the
    /// katcp specification. Timestamps become integer milliseconds.
    pub fn pack(&self) -> String {
        match self {
            SensorValue::Integer(v) => v.to_argument(),
            SensorValue::Float(v) => v.to_argument(),
            SensorValue::Boolean(v) => v.to_argument(),
            SensorValue::Lru(v) => v.to_argument(),
            SensorValue::Discrete(v) => v.clone(),
            SensorValue::String(v) => v.clone(),
            SensorValue::Timestamp(v) => v.to_argument(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
/// A sensor's type along with its type-specific parameters
pub enum TypeSpec {
    /// An integer with an inclusive range
    Integer { min: i64, max: i64 },
    /// A float with an inclusive range
    Float { min: f64, max: f64 },
    Boolean,
    Lru,
    /// One of a fixed set of string values
    Discrete { values: Vec<String> },
    String,
    Timestamp,
}

impl TypeSpec {
    /// The type name used by `#sensor-list`
    pub fn name(&self) -> &'static str {
        match self {
            TypeSpec::Integer { .. } => "integer",
            TypeSpec::Float { .. } => "float",
            TypeSpec::Boolean => "boolean",
            TypeSpec::Lru => "lru",
            TypeSpec::Discrete { .. } => "discrete",
            TypeSpec::String => "string",
            TypeSpec::Timestamp => "timestamp",
        }
    }

    /// The initial value for a fresh sensor of this type. Numeric defaults are
    /// clamped into range; a discrete default is the first allowed value.
    pub fn default_value(&self) -> SensorValue {
        match self {
            TypeSpec::Integer { min, max } => {
                SensorValue::Integer(if *min <= 0 && 0 <= *max { 0 } else { *min })
            }
            TypeSpec::Float { min, max } => {
                SensorValue::Float(if *min <= 0.0 && 0.0 <= *max { 0.0 } else { *min })
            }
            TypeSpec::Boolean => SensorValue::Boolean(false),
            TypeSpec::Lru => SensorValue::Lru(Lru::Nominal),
            TypeSpec::Discrete { values } => SensorValue::Discrete(
                values.first().cloned().unwrap_or_else(|| "unknown".to_owned()),
            ),
            TypeSpec::String => SensorValue::String(String::new()),
            TypeSpec::Timestamp => SensorValue::Timestamp(KatcpTimestamp::UNIX_EPOCH),
        }
    }

    /// Rejects values that do not belong to this type's domain
    pub fn check(&self, value: &SensorValue) -> Result<(), KatcpError> {
        match (self, value) {
            (TypeSpec::Integer { min, max }, SensorValue::Integer(v)) => {
                if *min <= *v && *v <= *max {
                    Ok(())
                } else {
                    Err(KatcpError::InvalidValue(format!(
                        "value {v} is not in range [{min}, {max}]"
                    )))
                }
            }
            (TypeSpec::Float { min, max }, SensorValue::Float(v)) => {
                if *min <= *v && *v <= *max {
                    Ok(())
                } else {
                    Err(KatcpError::InvalidValue(format!(
                        "value {v} is not in range [{min}, {max}]"
                    )))
                }
            }
            (TypeSpec::Discrete { values }, SensorValue::Discrete(v)) => {
                if values.iter().any(|allowed| allowed == v) {
                    Ok(())
                } else {
                    Err(KatcpError::InvalidValue(format!(
                        "{v:?} is not an allowed discrete value"
                    )))
                }
            }
            (TypeSpec::Boolean, SensorValue::Boolean(_))
            | (TypeSpec::Lru, SensorValue::Lru(_))
            | (TypeSpec::String, SensorValue::String(_))
            | (TypeSpec::Timestamp, SensorValue::Timestamp(_)) => Ok(()),
            _ => Err(KatcpError::InvalidValue(format!(
                "value does not match sensor type {}",
                self.name()
            ))),
        }
    }

    /// Parses a wire-formatted value into a value of this type
    pub fn unpack(&self, s: &str) -> Result<SensorValue, KatcpError> {
        Ok(match self {
            TypeSpec::Integer { .. } => SensorValue::Integer(i64::from_argument(s)?),
            TypeSpec::Float { .. } => SensorValue::Float(f64::from_argument(s)?),
            TypeSpec::Boolean => SensorValue::Boolean(bool::from_argument(s)?),
            TypeSpec::Lru => SensorValue::Lru(Lru::from_argument(s)?),
            TypeSpec::Discrete { .. } => SensorValue::Discrete(s.to_owned()),
            TypeSpec::String => SensorValue::String(s.to_owned()),
            TypeSpec::Timestamp => SensorValue::Timestamp(KatcpTimestamp::from_argument(s)?),
        })
    }

    /// The type-specific parameters as sent by `#sensor-list`: the range for
    /// numeric types, the allowed values for discrete types, nothing otherwise.
    pub fn formatted_params(&self) -> Vec<String> {
        match self {
            TypeSpec::Integer { min, max } => vec![min.to_argument(), max.to_argument()],
            TypeSpec::Float { min, max } => vec![min.to_argument(), max.to_argument()],
            TypeSpec::Discrete { values } => values.clone(),
            _ => vec![],
        }
    }
}

/// Something that wants to hear about sensor mutations. The update callback
/// runs on whatever thread called [`Sensor::set`].
pub trait Observer: Send + Sync {
    fn update(&self, sensor: &Sensor);
}

#[derive(Debug, Clone)]
struct Reading {
    timestamp: KatcpTimestamp,
    status: Status,
    value: SensorValue,
}

/// A named, typed measurement with a status and a timestamp
pub struct Sensor {
    name: String,
    description: String,
    units: String,
    spec: TypeSpec,
    reading: Mutex<Reading>,
    /// Serializes whole set-then-notify rounds, so that one mutation finishes
    /// its notification round before the next may start.
    round: Mutex<()>,
    observers: Mutex<Vec<Weak<dyn Observer>>>,
}

impl Sensor {
    /// Creates a sensor holding the type's default value with status
    /// [`Status::Unknown`].
    pub fn new(
        spec: TypeSpec,
        name: impl Into<String>,
        description: impl Into<String>,
        units: impl Into<String>,
    ) -> Self {
        let value = spec.default_value();
        Self {
            name: name.into(),
            description: description.into(),
            units: units.into(),
            spec,
            reading: Mutex::new(Reading {
                timestamp: Utc::now(),
                status: Status::Unknown,
                value,
            }),
            round: Mutex::new(()),
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Creates a sensor with an explicit initial reading. The value must
    /// satisfy the spec.
    pub fn with_initial(
        spec: TypeSpec,
        name: impl Into<String>,
        description: impl Into<String>,
        units: impl Into<String>,
        timestamp: KatcpTimestamp,
        status: Status,
        value: SensorValue,
    ) -> Result<Self, KatcpError> {
        spec.check(&value)?;
        let sensor = Self::new(spec, name, description, units);
        {
            let mut reading = lock(&sensor.reading);
            *reading = Reading {
                timestamp,
                status,
                value,
            };
        }
        Ok(sensor)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn units(&self) -> &str {
        &self.units
    }

    pub fn type_spec(&self) -> &TypeSpec {
        &self.spec
    }

    /// Attach an observer to this sensor. Attaching an already attached
    /// observer is a no-op.
    pub fn attach(&self, observer: &Arc<dyn Observer>) {
        let mut observers = lock(&self.observers);
        let new = Arc::as_ptr(observer) as *const ();
        if !observers
            .iter()
            .any(|existing| existing.as_ptr() as *const () == new)
        {
            observers.push(Arc::downgrade(observer));
        }
    }

    /// Detach an observer from this sensor. Detaching twice is a no-op.
    pub fn detach(&self, observer: &Arc<dyn Observer>) {
        let mut observers = lock(&self.observers);
        let gone = Arc::as_ptr(observer) as *const ();
        observers.retain(|existing| {
            existing.strong_count() > 0 && existing.as_ptr() as *const () != gone
        });
    }

    /// Notify all observers of changes to this sensor. The observer list is
    /// snapshotted first so an update callback may attach or detach without
    /// perturbing the current round.
    fn notify(&self) {
        let snapshot: Vec<Arc<dyn Observer>> = lock(&self.observers)
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for observer in snapshot {
            observer.update(self);
        }
    }

    /// Installs a new reading and notifies every observer exactly once.
    pub fn set(
        &self,
        timestamp: KatcpTimestamp,
        status: Status,
        value: SensorValue,
    ) -> Result<(), KatcpError> {
        self.spec.check(&value)?;
        let _round = lock(&self.round);
        {
            let mut reading = lock(&self.reading);
            *reading = Reading {
                timestamp,
                status,
                value,
            };
        }
        self.notify();
        Ok(())
    }

    /// Check and then set the value of the sensor, stamped now and nominal.
    pub fn set_value(&self, value: SensorValue) -> Result<(), KatcpError> {
        self.set(Utc::now(), Status::Nominal, value)
    }

    /// Parses a wire-formatted value into a value of this sensor's type
    pub fn parse_value(&self, s: &str) -> Result<SensorValue, KatcpError> {
        self.spec.unpack(s)
    }

    /// Sets the reading from its wire-formatted triple.
    pub fn set_formatted(
        &self,
        raw_timestamp: &str,
        raw_status: &str,
        raw_value: &str,
    ) -> Result<(), KatcpError> {
        let timestamp = KatcpTimestamp::from_argument(raw_timestamp)?;
        let status = Status::from_argument(raw_status)?;
        let value = self.parse_value(raw_value)?;
        self.set(timestamp, status, value)
    }

    /// The current (timestamp, status, value) triple
    pub fn read(&self) -> (KatcpTimestamp, Status, SensorValue) {
        let reading = lock(&self.reading);
        (
            reading.timestamp,
            reading.status,
            reading.value.clone(),
        )
    }

    /// The current reading formatted for the wire: milliseconds timestamp,
    /// status name and packed value. This is the canonical inform payload.
    pub fn read_formatted(&self) -> (String, String, String) {
        let (timestamp, status, value) = self.read();
        (timestamp.to_argument(), status.to_argument(), value.pack())
    }

    /// The current value alone
    pub fn value(&self) -> SensorValue {
        self.read().2
    }
}

#[cfg(test)]
mod sensor_tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::TimeZone;

    use super::*;

    fn int_sensor() -> Sensor {
        Sensor::with_initial(
            TypeSpec::Integer { min: -4, max: 3 },
            "an.int",
            "An integer.",
            "count",
            Utc.timestamp_opt(12345, 0).unwrap(),
            Status::Nominal,
            SensorValue::Integer(3),
        )
        .unwrap()
    }

    #[test]
    fn test_range_check() {
        let sensor = int_sensor();
        assert!(sensor.set_value(SensorValue::Integer(4)).is_err());
        assert!(sensor.set_value(SensorValue::Integer(3)).is_ok());
        assert!(sensor.set_value(SensorValue::Integer(-4)).is_ok());
        assert!(sensor.set_value(SensorValue::Integer(-5)).is_err());
        // A mismatched type is rejected as well
        assert!(sensor.set_value(SensorValue::Float(1.0)).is_err());
    }

    #[test]
    fn test_discrete_check() {
        let sensor = Sensor::new(
            TypeSpec::Discrete {
                values: vec!["on".to_owned(), "off".to_owned()],
            },
            "cpu.status",
            "CPU status.",
            "",
        );
        assert_eq!(SensorValue::Discrete("on".to_owned()), sensor.value());
        assert!(sensor.set_value(SensorValue::Discrete("off".to_owned())).is_ok());
        assert!(sensor
            .set_value(SensorValue::Discrete("exploded".to_owned()))
            .is_err());
    }

    #[test]
    fn test_default_clamping() {
        let spec = TypeSpec::Integer { min: 5, max: 10 };
        assert_eq!(SensorValue::Integer(5), spec.default_value());
        let spec = TypeSpec::Float { min: -2.0, max: 2.0 };
        assert_eq!(SensorValue::Float(0.0), spec.default_value());
    }

    struct Counter {
        updates: AtomicUsize,
    }

    impl Observer for Counter {
        fn update(&self, _sensor: &Sensor) {
            self.updates.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_observer_notification() {
        let sensor = int_sensor();
        let counter = Arc::new(Counter {
            updates: AtomicUsize::new(0),
        });
        let observer: Arc<dyn Observer> = counter.clone();

        sensor.attach(&observer);
        // Attaching twice must not double-notify
        sensor.attach(&observer);

        sensor.set_value(SensorValue::Integer(1)).unwrap();
        sensor.set_value(SensorValue::Integer(2)).unwrap();
        assert_eq!(2, counter.updates.load(Ordering::SeqCst));

        sensor.detach(&observer);
        sensor.detach(&observer);
        sensor.set_value(SensorValue::Integer(0)).unwrap();
        assert_eq!(2, counter.updates.load(Ordering::SeqCst));
    }

    #[test]
    fn test_read_formatted() {
        let sensor = int_sensor();
        let (timestamp, status, value) = sensor.read_formatted();
        assert_eq!("12345000", timestamp);
        assert_eq!("nominal", status);
        assert_eq!("3", value);
    }

    #[test]
    fn test_set_formatted() {
        let sensor = int_sensor();
        sensor.set_formatted("12346000", "warn", "-2").unwrap();
        let (timestamp, status, value) = sensor.read();
        assert_eq!(Utc.timestamp_opt(12346, 0).unwrap(), timestamp);
        assert_eq!(Status::Warn, status);
        assert_eq!(SensorValue::Integer(-2), value);
        assert!(sensor.set_formatted("12346000", "warm", "-2").is_err());
        assert!(sensor.set_formatted("12346000", "warn", "2.5").is_err());
    }

    #[test]
    fn test_timestamp_sensor_wire_format() {
        let sensor = Sensor::new(TypeSpec::Timestamp, "sync.time", "Last sync.", "");
        sensor
            .set_value(SensorValue::Timestamp(
                Utc.timestamp_opt(1234, 567_000_000).unwrap(),
            ))
            .unwrap();
        let (_, _, value) = sensor.read_formatted();
        assert_eq!("1234567", value);
    }

    #[test]
    fn test_formatted_params() {
        assert_eq!(
            vec!["-4".to_owned(), "3".to_owned()],
            TypeSpec::Integer { min: -4, max: 3 }.formatted_params()
        );
        assert!(TypeSpec::Boolean.formatted_params().is_empty());
        assert_eq!(
            vec!["on".to_owned(), "off".to_owned()],
            TypeSpec::Discrete {
                values: vec!["on".to_owned(), "off".to_owned()],
            }
            .formatted_params()
        );
    }
}
