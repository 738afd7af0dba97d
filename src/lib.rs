//! This crate provides a rust implementation of a device *server* for the [KATCP](https://katcp-python.readthedocs.io/en/latest/_downloads/361189acb383a294be20d6c10c257cb4/NRF-KAT7-6.0-IFCE-002-Rev5-1.pdf)
//! monitor and control protocol, as described by the Karoo Array Telescope (KAT) project from the Square Kilometer Array (SKA) South Africa group.
//!
//! ## Description
//!
//! From the official specification:
//! > Broadly speaking, KATCP consists of newline-separated text messages sent asynchronously over a TCP/IP
//! > stream. There are three categories of messages: requests, replies and informs. Request messages expect some
//! > sort of acknowledgement. Reply messages acknowledge requests. Inform messages require no acknowledgement
//!
//! This crate hosts the *device* side of that conversation: a
//! [`DeviceServer`](server::DeviceServer) accepts any number of concurrent
//! clients, exposes a catalog of typed [`Sensor`](sensor::Sensor)s and lets
//! each client subscribe to them under independent
//! [sampling strategies](sampling::SampleStrategy) that asynchronously emit
//! `#sensor-status` informs as the underlying values evolve. Embedders
//! describe their instrument by implementing the [`Device`](server::Device)
//! trait and mutate sensors from whatever threads produce the measurements.
//!
//! ## Built-in requests
//!
//! |       Core        |       Log       |       Sensors       |   Multi-Client   |
//! |-------------------|-----------------|---------------------|------------------|
//! | `?halt`           | `?log-level`    | `?sensor-list`      | `?client-list`   |
//! | `?help`           |                 | `?sensor-value`     |                  |
//! | `?restart`        |                 | `?sensor-sampling`  |                  |
//! | `?watchdog`       |                 |                     |                  |
//!
//! Asynchronous informs emitted by the core: `#version` and `#build-state` on
//! connect, `#client-connected` on every new client, `#disconnect` before a
//! client is dropped, `#log` from the [`DeviceLogger`](logger::DeviceLogger)
//! and `#sensor-status` from sampling strategies.

pub mod logger;
pub mod messages;
pub mod prelude;
pub mod protocol;
pub mod sampling;
pub mod sensor;
pub mod server;
mod utils;
