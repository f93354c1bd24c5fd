use std::io::Write;
use std::path::Path;

use anyhow::Result;
use clap::ValueEnum;
use gpslink_core::{DeviceSnapshot, TestReport};
use serde_json::json;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum OutputFormat { Text, Json, Jsonl }

fn rfc3339(t: OffsetDateTime) -> String {
    t.format(&Rfc3339).unwrap_or_else(|_| String::new())
}

fn ports(d: &DeviceSnapshot) -> String {
    d.endpoints.iter().map(|e| e.id.to_string()).collect::<Vec<_>>().join(",")
}

pub fn text_row(d: &DeviceSnapshot) -> String {
    let s = &d.statistics;
    format!(
        "{:<24} {:<20} {:<10} {:>6.2} {:>4}/{:<4} {:>6}ms  {}",
        d.address,
        d.name,
        format!("{:?}", d.state).to_lowercase(),
        d.reliability,
        s.success_count,
        s.failure_count,
        s.average_connection_time().as_millis(),
        ports(d),
    )
}

pub fn write_devices(out: &mut impl Write, devices: &[DeviceSnapshot], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            if devices.is_empty() {
                writeln!(out, "no devices")?;
            }
            for d in devices {
                writeln!(out, "{}", text_row(d))?;
            }
        }
        OutputFormat::Json => {
            let doc = json!({ "count": devices.len(), "devices": devices });
            writeln!(out, "{}", serde_json::to_string_pretty(&doc)?)?;
        }
        OutputFormat::Jsonl => {
            for d in devices {
                writeln!(out, "{}", serde_json::to_string(d)?)?;
            }
        }
    }
    Ok(())
}

pub fn write_report(out: &mut impl Write, device: &DeviceSnapshot, report: &TestReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            writeln!(out, "{} ({})", device.address, device.name)?;
            writeln!(out, "read {} lines, {} valid", report.units_read, report.valid_units)?;
            writeln!(out, "capabilities: {}", report.capabilities)?;
            writeln!(out, "{}", report.log_text())?;
        }
        OutputFormat::Json | OutputFormat::Jsonl => {
            let doc = json!({ "address": device.address, "name": device.name, "report": report });
            let s = if format == OutputFormat::Json { serde_json::to_string_pretty(&doc)? } else { serde_json::to_string(&doc)? };
            writeln!(out, "{s}")?;
        }
    }
    Ok(())
}

pub fn write_csv(path: &Path, devices: &[DeviceSnapshot]) -> Result<()> {
    let mut w = csv::Writer::from_path(path)?;
    w.write_record([
        "address", "name", "state", "reliability", "success", "failure", "last_detected", "last_connected", "avg_connect_ms", "ports",
    ])?;
    for d in devices {
        let s = &d.statistics;
        w.write_record([
            d.address.clone(),
            d.name.clone(),
            format!("{:?}", d.state).to_lowercase(),
            format!("{:.4}", d.reliability),
            s.success_count.to_string(),
            s.failure_count.to_string(),
            rfc3339(s.last_detected),
            rfc3339(s.last_connected),
            s.average_connection_time().as_millis().to_string(),
            ports(d),
        ])?;
    }
    w.flush()?;
    Ok(())
}
