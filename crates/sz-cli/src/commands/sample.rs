//! Sample command: print an intake batch for manual testing.

use std::io::Write;

use anyhow::Result;
use chrono::{DateTime, TimeDelta, Utc};
use sz_core::{DeviceId, Event, EventBatch};

/// Builds a batch for `devices` devices named `machine-001`, `machine-002`, ...
///
/// Device `i` gets `3 + i % 3` events spaced one second apart and ending at
/// `now`.
pub fn build(devices: usize, now: DateTime<Utc>) -> Result<EventBatch> {
    let mut events = Vec::new();
    for i in 1..=devices {
        let device = DeviceId::new(format!("machine-{i:03}"))?;
        let count = 3 + i % 3;
        for offset in (0..count).rev() {
            let offset = i64::try_from(offset)?;
            events.push(Event::new(device.clone(), now - TimeDelta::seconds(offset)));
        }
    }
    Ok(EventBatch { events })
}

pub fn run<W: Write>(writer: &mut W, devices: usize, now: DateTime<Utc>) -> Result<()> {
    let batch = build(devices, now)?;
    serde_json::to_writer_pretty(&mut *writer, &batch)?;
    writeln!(writer)?;
    Ok(())
}
