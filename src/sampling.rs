//! Per-client sampling strategies and the reactor thread that drives the
//! periodic ones.
//!
//! A strategy binds a sensor to an emission callback (the owning client's
//! writer) and decides when a `#sensor-status` inform should be produced:
//! on every update, on sufficiently large changes, on a fixed period, or not
//! at all. Each (client, sensor) pair holds at most one strategy; installing
//! a new one replaces and detaches the previous.

use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex,
    },
    thread::{self, JoinHandle},
    time::Duration as StdDuration,
};

use chrono::{Duration, Utc};
use katcp_device_derive::KatcpDiscrete;

use crate::{
    messages::common::{FromKatcpArgument, KatcpTimestamp, ToKatcpArgument},
    protocol::{KatcpError, Message, MessageKind},
    sensor::{Observer, Sensor, SensorValue, TypeSpec},
    utils::lock,
};

/// The callback a strategy emits informs through, bound to the owning
/// client's writer.
pub type EmitFn = Box<dyn Fn(Message) + Send + Sync>;

#[derive(KatcpDiscrete, Debug, PartialEq, Eq, Copy, Clone)]
/// The wire names of the sampling strategies
pub enum StrategyKind {
    /// Do not report the sensor value
    None,
    /// Report the value on every update
    Auto,
    /// Report the value whenever it changes
    Event,
    /// Report the value when it changes by at least a threshold. Only valid
    /// for integer and float sensors.
    Differential,
    /// Report the value approximately every period, regardless of updates
    Period,
}

enum Threshold {
    Integer(i64),
    Float(f64),
}

impl Threshold {
    fn format(&self) -> String {
        match self {
            Threshold::Integer(t) => t.to_argument(),
            Threshold::Float(t) => t.to_argument(),
        }
    }
}

enum Policy {
    None,
    Auto,
    Event,
    Differential {
        threshold: Threshold,
        /// The last reported value
        last: Mutex<SensorValue>,
    },
    Period {
        period: Duration,
        /// Unset until the first `periodic` call, which therefore always emits
        next: Mutex<Option<KatcpTimestamp>>,
    },
}

/// A sampling strategy for one (client, sensor) pair
pub struct SampleStrategy {
    sensor: Arc<Sensor>,
    emit: EmitFn,
    policy: Policy,
}

impl SampleStrategy {
    /// Builds a strategy from its wire name and raw parameters. Unknown kinds
    /// and ill-formed parameters fail with a user-visible reason.
    pub fn construct(
        kind: impl AsRef<str>,
        emit: EmitFn,
        sensor: Arc<Sensor>,
        params: &[String],
    ) -> Result<Arc<Self>, KatcpError> {
        let kind = StrategyKind::from_argument(kind.as_ref())
            .map_err(|_| KatcpError::Message("Unknown strategy name.".to_owned()))?;
        let policy = match kind {
            StrategyKind::None | StrategyKind::Auto | StrategyKind::Event => {
                if !params.is_empty() {
                    return Err(KatcpError::Message(format!(
                        "The {} strategy takes no parameters.",
                        kind.to_argument()
                    )));
                }
                match kind {
                    StrategyKind::None => Policy::None,
                    StrategyKind::Auto => Policy::Auto,
                    _ => Policy::Event,
                }
            }
            StrategyKind::Differential => {
                let raw = one_param(params, "differential")?;
                let threshold = match sensor.type_spec() {
                    TypeSpec::Integer { .. } => Threshold::Integer(
                        i64::from_argument(raw).map_err(|_| {
                            KatcpError::Message(format!(
                                "Differential threshold {raw:?} is not an integer."
                            ))
                        })?,
                    ),
                    TypeSpec::Float { .. } => {
                        Threshold::Float(f64::from_argument(raw).map_err(|_| {
                            KatcpError::Message(format!(
                                "Differential threshold {raw:?} is not a float."
                            ))
                        })?)
                    }
                    _ => {
                        return Err(KatcpError::Message(
                            "Differential strategies only apply to integer and float sensors."
                                .to_owned(),
                        ))
                    }
                };
                let negative = match threshold {
                    Threshold::Integer(t) => t < 0,
                    Threshold::Float(t) => !(t >= 0.0),
                };
                if negative {
                    return Err(KatcpError::Message(
                        "Differential threshold must be non-negative.".to_owned(),
                    ));
                }
                Policy::Differential {
                    threshold,
                    last: Mutex::new(sensor.value()),
                }
            }
            StrategyKind::Period => {
                let raw = one_param(params, "period")?;
                let millis: i64 = raw.parse().map_err(|_| {
                    KatcpError::Message(format!("Period {raw:?} is not an integer."))
                })?;
                if millis <= 0 {
                    return Err(KatcpError::Message(
                        "Period must be a positive number of milliseconds.".to_owned(),
                    ));
                }
                Policy::Period {
                    period: Duration::milliseconds(millis),
                    next: Mutex::new(None),
                }
            }
        };
        Ok(Arc::new(Self {
            sensor,
            emit,
            policy,
        }))
    }

    pub fn kind(&self) -> StrategyKind {
        match self.policy {
            Policy::None => StrategyKind::None,
            Policy::Auto => StrategyKind::Auto,
            Policy::Event => StrategyKind::Event,
            Policy::Differential { .. } => StrategyKind::Differential,
            Policy::Period { .. } => StrategyKind::Period,
        }
    }

    pub fn sensor(&self) -> &Arc<Sensor> {
        &self.sensor
    }

    /// Registers as an observer of the sensor and performs any first emission
    pub fn attach(self: &Arc<Self>) {
        let observer: Arc<dyn Observer> = Arc::clone(self) as Arc<dyn Observer>;
        self.sensor.attach(&observer);
        match &self.policy {
            Policy::Auto | Policy::Event => self.emit_reading(),
            Policy::Differential { last, .. } => {
                *lock(last) = self.sensor.value();
                self.emit_reading();
            }
            Policy::None | Policy::Period { .. } => {}
        }
    }

    /// Deregisters from the sensor; called when replaced or on client
    /// disconnect
    pub fn detach(self: &Arc<Self>) {
        let observer: Arc<dyn Observer> = Arc::clone(self) as Arc<dyn Observer>;
        self.sensor.detach(&observer);
    }

    /// The reactor step. Emits once the deadline has passed and returns the
    /// next deadline; strategies other than period return `None` and are
    /// never scheduled.
    pub fn periodic(&self, now: KatcpTimestamp) -> Option<KatcpTimestamp> {
        match &self.policy {
            Policy::Period { period, next } => {
                let mut next = lock(next);
                match *next {
                    Some(deadline) if now < deadline => Some(deadline),
                    _ => {
                        self.emit_reading();
                        let deadline = now + *period;
                        *next = Some(deadline);
                        Some(deadline)
                    }
                }
            }
            _ => None,
        }
    }

    /// The (kind, params) pair used by the `?sensor-sampling` query reply
    pub fn get_sampling_formatted(&self) -> (String, Vec<String>) {
        let params = match &self.policy {
            Policy::Differential { threshold, .. } => vec![threshold.format()],
            Policy::Period { period, .. } => vec![period.num_milliseconds().to_string()],
            _ => vec![],
        };
        (self.kind().to_argument(), params)
    }

    fn emit_reading(&self) {
        let (timestamp, status, value) = self.sensor.read_formatted();
        let msg = Message::new_unvalidated(MessageKind::Inform, "sensor-status", [
            timestamp,
            "1".to_owned(),
            self.sensor.name().to_owned(),
            status,
            value,
        ]);
        (self.emit)(msg);
    }
}

fn one_param<'a>(params: &'a [String], kind: &str) -> Result<&'a str, KatcpError> {
    match params {
        [single] => Ok(single),
        _ => Err(KatcpError::Message(format!(
            "The {kind} strategy takes exactly one parameter."
        ))),
    }
}

impl Observer for SampleStrategy {
    fn update(&self, sensor: &Sensor) {
        match &self.policy {
            Policy::Auto | Policy::Event => self.emit_reading(),
            Policy::Differential { threshold, last } => {
                let value = sensor.value();
                let mut last = lock(last);
                let changed = match (threshold, &*last, &value) {
                    (
                        Threshold::Integer(t),
                        SensorValue::Integer(prev),
                        SensorValue::Integer(curr),
                    ) => (curr - prev).abs() >= *t,
                    (Threshold::Float(t), SensorValue::Float(prev), SensorValue::Float(curr)) => {
                        (curr - prev).abs() >= *t
                    }
                    _ => false,
                };
                if changed {
                    *last = value;
                    drop(last);
                    self.emit_reading();
                }
            }
            Policy::None | Policy::Period { .. } => {}
        }
    }
}

struct ReactorShared {
    strategies: Mutex<Vec<Arc<SampleStrategy>>>,
    wake: Condvar,
    running: AtomicBool,
}

impl ReactorShared {
    /// How long to sleep when no periodic strategy is armed; also the bound
    /// on how long a stop request may go unnoticed.
    const IDLE_WAIT: StdDuration = StdDuration::from_millis(500);

    fn run(&self) {
        while self.running.load(Ordering::SeqCst) {
            let now = Utc::now();
            let snapshot: Vec<Arc<SampleStrategy>> = lock(&self.strategies).clone();
            let mut nearest: Option<KatcpTimestamp> = None;
            for strategy in &snapshot {
                if let Some(deadline) = strategy.periodic(now) {
                    nearest = Some(match nearest {
                        Some(t) if t < deadline => t,
                        _ => deadline,
                    });
                }
            }
            let wait = nearest
                .map(|deadline| (deadline - Utc::now()).to_std().unwrap_or(StdDuration::ZERO))
                .unwrap_or(Self::IDLE_WAIT)
                .min(Self::IDLE_WAIT);
            let guard = lock(&self.strategies);
            let _ = self.wake.wait_timeout(guard, wait);
        }
    }
}

/// The background scheduler hosting the armed sampling strategies
pub struct SampleReactor {
    shared: Arc<ReactorShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Default for SampleReactor {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleReactor {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(ReactorShared {
                strategies: Mutex::new(Vec::new()),
                wake: Condvar::new(),
                running: AtomicBool::new(false),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Spawns the reactor thread. Starting an already running reactor is a
    /// no-op.
    pub fn start(&self) -> io::Result<()> {
        let mut thread = lock(&self.thread);
        if thread.is_some() {
            return Ok(());
        }
        self.shared.running.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("sample-reactor".to_owned())
            .spawn(move || shared.run())?;
        *thread = Some(handle);
        Ok(())
    }

    /// Arms a strategy and wakes the loop. The strategy's first emission (if
    /// any) happens here, outside the strategy-set lock: it may write to a
    /// client socket, and a failing write detaches strategies, which takes
    /// the lock again.
    pub fn add_strategy(&self, strategy: Arc<SampleStrategy>) {
        {
            let mut strategies = lock(&self.shared.strategies);
            if !strategies.iter().any(|s| Arc::ptr_eq(s, &strategy)) {
                strategies.push(Arc::clone(&strategy));
            }
        }
        strategy.attach();
        self.shared.wake.notify_all();
    }

    /// Disarms and detaches a strategy and wakes the loop
    pub fn remove_strategy(&self, strategy: &Arc<SampleStrategy>) {
        {
            let mut strategies = lock(&self.shared.strategies);
            strategies.retain(|s| !Arc::ptr_eq(s, strategy));
        }
        strategy.detach();
        self.shared.wake.notify_all();
    }

    /// Signals the loop to exit and waits for the thread to finish
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.wake.notify_all();
        if let Some(handle) = lock(&self.thread).take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod sampling_tests {
    use chrono::TimeZone;

    use super::*;
    use crate::sensor::Status;

    fn test_sensor() -> Arc<Sensor> {
        Arc::new(
            Sensor::with_initial(
                TypeSpec::Integer { min: -4, max: 3 },
                "an.int",
                "An integer.",
                "count",
                Utc.timestamp_opt(12345, 0).unwrap(),
                Status::Nominal,
                SensorValue::Integer(3),
            )
            .unwrap(),
        )
    }

    fn recording_emit() -> (EmitFn, Arc<Mutex<Vec<Message>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        let emit: EmitFn = Box::new(move |msg| lock(&sink).push(msg));
        (emit, calls)
    }

    fn at(secs: i64) -> KatcpTimestamp {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_construct_validation() {
        let s = test_sensor();
        for kind in ["none", "auto", "event"] {
            assert!(SampleStrategy::construct(
                kind,
                Box::new(|_| {}),
                Arc::clone(&s),
                &["foo".to_owned()]
            )
            .is_err());
            assert!(SampleStrategy::construct(kind, Box::new(|_| {}), Arc::clone(&s), &[]).is_ok());
        }
        assert!(SampleStrategy::construct("random", Box::new(|_| {}), Arc::clone(&s), &[]).is_err());

        for bad in ["-1", "1.5", "foo"] {
            assert!(SampleStrategy::construct(
                "period",
                Box::new(|_| {}),
                Arc::clone(&s),
                &[bad.to_owned()]
            )
            .is_err());
        }
        assert!(SampleStrategy::construct(
            "period",
            Box::new(|_| {}),
            Arc::clone(&s),
            &["15".to_owned()]
        )
        .is_ok());

        for bad in ["-1", "1.5", "bar"] {
            assert!(SampleStrategy::construct(
                "differential",
                Box::new(|_| {}),
                Arc::clone(&s),
                &[bad.to_owned()]
            )
            .is_err());
        }
        assert!(SampleStrategy::construct("differential", Box::new(|_| {}), Arc::clone(&s), &[])
            .is_err());
        assert!(SampleStrategy::construct(
            "differential",
            Box::new(|_| {}),
            Arc::clone(&s),
            &["2".to_owned()]
        )
        .is_ok());

        // Differential is meaningless for non-numeric sensors
        let flag = Arc::new(Sensor::new(TypeSpec::Boolean, "a.bool", "A boolean.", ""));
        assert!(
            SampleStrategy::construct("differential", Box::new(|_| {}), flag, &["1".to_owned()])
                .is_err()
        );
    }

    #[test]
    fn test_event() {
        let sensor = test_sensor();
        let (emit, calls) = recording_emit();
        let event = SampleStrategy::construct("event", emit, Arc::clone(&sensor), &[]).unwrap();
        assert!(lock(&calls).is_empty());

        event.attach();
        assert_eq!(1, lock(&calls).len());

        sensor.set_value(SensorValue::Integer(2)).unwrap();
        assert_eq!(2, lock(&calls).len());

        event.detach();
        sensor.set_value(SensorValue::Integer(1)).unwrap();
        assert_eq!(2, lock(&calls).len());
    }

    #[test]
    fn test_emitted_message_shape() {
        let sensor = test_sensor();
        let (emit, calls) = recording_emit();
        let event = SampleStrategy::construct("event", emit, Arc::clone(&sensor), &[]).unwrap();
        event.attach();
        let msg = lock(&calls)[0].clone();
        assert_eq!(MessageKind::Inform, msg.kind());
        assert_eq!("sensor-status", msg.name());
        assert_eq!(
            &["12345000", "1", "an.int", "nominal", "3"],
            &msg.arguments()
                .iter()
                .map(String::as_str)
                .collect::<Vec<_>>()[..]
        );
    }

    #[test]
    fn test_differential() {
        let sensor = test_sensor();
        let (emit, calls) = recording_emit();
        let diff =
            SampleStrategy::construct("differential", emit, Arc::clone(&sensor), &["5".to_owned()])
                .unwrap();
        assert!(lock(&calls).is_empty());

        diff.attach();
        assert_eq!(1, lock(&calls).len());

        // |2 - 3| < 5 against the last reported value: no emission
        sensor.set_value(SensorValue::Integer(2)).unwrap();
        assert_eq!(1, lock(&calls).len());

        // |-3 - 3| >= 5: emits and moves the baseline
        sensor.set_value(SensorValue::Integer(-3)).unwrap();
        assert_eq!(2, lock(&calls).len());
    }

    #[test]
    fn test_periodic() {
        let sensor = test_sensor();
        let (emit, calls) = recording_emit();
        // 10 s period
        let period =
            SampleStrategy::construct("period", emit, Arc::clone(&sensor), &["10000".to_owned()])
                .unwrap();
        assert!(lock(&calls).is_empty());

        period.attach();
        assert!(lock(&calls).is_empty());

        period.periodic(at(1));
        assert_eq!(1, lock(&calls).len());

        period.periodic(at(11));
        assert_eq!(2, lock(&calls).len());

        period.periodic(at(12));
        assert_eq!(2, lock(&calls).len());
    }

    #[test]
    fn test_sampling_formatted() {
        let sensor = test_sensor();
        let strat =
            SampleStrategy::construct("period", Box::new(|_| {}), Arc::clone(&sensor), &[
                "500".to_owned()
            ])
            .unwrap();
        assert_eq!(
            ("period".to_owned(), vec!["500".to_owned()]),
            strat.get_sampling_formatted()
        );
        let strat = SampleStrategy::construct(
            "differential",
            Box::new(|_| {}),
            Arc::clone(&sensor),
            &["2".to_owned()],
        )
        .unwrap();
        assert_eq!(
            ("differential".to_owned(), vec!["2".to_owned()]),
            strat.get_sampling_formatted()
        );
        let strat = SampleStrategy::construct("none", Box::new(|_| {}), sensor, &[]).unwrap();
        assert_eq!(("none".to_owned(), vec![]), strat.get_sampling_formatted());
    }
}

#[cfg(test)]
mod reactor_tests {
    use super::*;
    use crate::sensor::Status;
    use chrono::TimeZone;

    #[test]
    fn test_periodic_scheduling() {
        let sensor = Arc::new(
            Sensor::with_initial(
                TypeSpec::Integer { min: -4, max: 3 },
                "an.int",
                "An integer.",
                "count",
                Utc.timestamp_opt(12345, 0).unwrap(),
                Status::Nominal,
                SensorValue::Integer(3),
            )
            .unwrap(),
        );
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        let emit: EmitFn = Box::new(move |msg| lock(&sink).push(msg));

        let reactor = SampleReactor::new();
        reactor.start().unwrap();

        let period = SampleStrategy::construct("period", emit, sensor, &["10".to_owned()]).unwrap();
        reactor.add_strategy(Arc::clone(&period));
        thread::sleep(StdDuration::from_millis(100));
        reactor.remove_strategy(&period);

        let seen = lock(&calls).len();
        reactor.stop();
        assert!(
            (10..=11).contains(&seen),
            "expected 10 to 11 informs, got {seen}"
        );
    }
}
