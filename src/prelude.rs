//! Standard set of imports for katcp-device
//!
//! This is useful to `use katcp_device::prelude::*;` to satisfy all the
//! imports for deriving `KatcpDiscrete` from the `katcp_device_derive` crate

pub use crate::{
    messages::{
        common::{FromKatcpArgument, KatcpArgument, KatcpTimestamp, RetCode, ToKatcpArgument},
        log::Level,
    },
    protocol::{KatcpError, Message, MessageKind, MessageResult},
    sensor::{Sensor, SensorValue, Status, TypeSpec},
};
