//! Streaming parser for `nvidia-smi -q -x` documents
//!
//! Fields are picked out by their element path, so unknown sections and
//! sections with an unexpected shape are skipped without affecting the
//! rest of the device. Only a document that is not well-formed XML, or
//! that is not an `nvidia_smi_log`, fails the parse.

use std::borrow::Cow;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::debug;

use crate::error::{ParseError, Result};
use crate::sanitize::sanitize;
use crate::system::{
    ClockReading, DeviceReading, MemoryReading, PowerReading, SystemSnapshot, TemperatureReading,
    UtilizationReading,
};

const ROOT: &str = "nvidia_smi_log";
const GPU: &str = "gpu";

#[derive(Debug, Default)]
struct RawClocks {
    graphics: String,
    sm: String,
    memory: String,
    video: String,
}

impl RawClocks {
    fn field_mut(&mut self, name: &str) -> Option<&mut String> {
        match name {
            "graphics_clock" => Some(&mut self.graphics),
            "sm_clock" => Some(&mut self.sm),
            "mem_clock" => Some(&mut self.memory),
            "video_clock" => Some(&mut self.video),
            _ => None,
        }
    }

    fn reading(&self) -> ClockReading {
        ClockReading {
            graphics: sanitize(&self.graphics),
            sm: sanitize(&self.sm),
            memory: sanitize(&self.memory),
            video: sanitize(&self.video),
        }
    }
}

/// Text of one `<gpu>` block, before sanitizing.
#[derive(Debug, Default)]
struct RawDevice {
    product_name: String,
    uuid: String,
    pci_bus: String,
    fan_speed: String,
    memory_total: String,
    memory_used: String,
    memory_free: String,
    gpu_util: String,
    memory_util: String,
    gpu_temp: String,
    gpu_temp_max: String,
    gpu_temp_slow: String,
    power_draw: String,
    power_limit: String,
    clocks: RawClocks,
    max_clocks: RawClocks,
}

impl RawDevice {
    /// Resolves a path relative to `<gpu>` to the field it feeds.
    fn field_mut(&mut self, path: &[&str]) -> Option<&mut String> {
        match path {
            ["product_name"] => Some(&mut self.product_name),
            ["uuid"] => Some(&mut self.uuid),
            ["fan_speed"] => Some(&mut self.fan_speed),
            ["pci", "pci_bus"] => Some(&mut self.pci_bus),
            ["fb_memory_usage", "total"] => Some(&mut self.memory_total),
            ["fb_memory_usage", "used"] => Some(&mut self.memory_used),
            ["fb_memory_usage", "free"] => Some(&mut self.memory_free),
            ["utilization", "gpu_util"] => Some(&mut self.gpu_util),
            ["utilization", "memory_util"] => Some(&mut self.memory_util),
            ["temperature", "gpu_temp"] => Some(&mut self.gpu_temp),
            ["temperature", "gpu_temp_max_threshold"] => Some(&mut self.gpu_temp_max),
            ["temperature", "gpu_temp_slow_threshold"] => Some(&mut self.gpu_temp_slow),
            // R530+ drivers moved power into gpu_power_readings
            ["power_readings" | "gpu_power_readings", "power_draw"] => Some(&mut self.power_draw),
            ["power_readings" | "gpu_power_readings", "power_limit" | "current_power_limit"] => {
                Some(&mut self.power_limit)
            }
            ["clocks", name] => self.clocks.field_mut(name),
            ["max_clocks", name] => self.max_clocks.field_mut(name),
            _ => None,
        }
    }

    fn into_reading(self, index: usize) -> DeviceReading {
        DeviceReading {
            index,
            fan_speed: sanitize(&self.fan_speed),
            memory: MemoryReading {
                total: sanitize(&self.memory_total),
                used: sanitize(&self.memory_used),
                free: sanitize(&self.memory_free),
            },
            utilization: UtilizationReading {
                gpu: sanitize(&self.gpu_util),
                memory: sanitize(&self.memory_util),
            },
            temperature: TemperatureReading {
                current: sanitize(&self.gpu_temp),
                max_threshold: sanitize(&self.gpu_temp_max),
                slow_threshold: sanitize(&self.gpu_temp_slow),
            },
            power: PowerReading {
                draw: sanitize(&self.power_draw),
                limit: sanitize(&self.power_limit),
            },
            clocks: self.clocks.reading(),
            max_clocks: self.max_clocks.reading(),
            uuid: self.uuid,
            product_name: self.product_name,
            pci_bus: self.pci_bus,
        }
    }
}

#[derive(Debug, Default)]
struct SnapshotBuilder {
    path: Vec<String>,
    seen_root: bool,
    driver_version: String,
    attached_gpus: String,
    current: Option<RawDevice>,
    devices: Vec<RawDevice>,
}

impl SnapshotBuilder {
    fn in_gpu_block(&self) -> bool {
        self.path.len() == 2 && self.path[0] == ROOT && self.path[1] == GPU
    }

    /// The field fed by text at the current path, if any.
    fn target(&mut self) -> Option<&mut String> {
        let path: Vec<&str> = self.path.iter().map(String::as_str).collect();
        match path.as_slice() {
            [ROOT, "driver_version"] => Some(&mut self.driver_version),
            [ROOT, "attached_gpus"] => Some(&mut self.attached_gpus),
            [ROOT, GPU, rest @ ..] => self.current.as_mut()?.field_mut(rest),
            _ => None,
        }
    }

    fn open(&mut self, name: String) -> Result<()> {
        if self.path.is_empty() {
            if self.seen_root || name != ROOT {
                return Err(ParseError::UnexpectedRoot(name));
            }
            self.seen_root = true;
        }

        self.path.push(name);

        if self.in_gpu_block() {
            self.current = Some(RawDevice::default());
        }
        // a repeated element replaces, not appends
        if let Some(field) = self.target() {
            field.clear();
        }
        Ok(())
    }

    fn close(&mut self) {
        if self.in_gpu_block() {
            if let Some(device) = self.current.take() {
                self.devices.push(device);
            }
        }
        self.path.pop();
    }

    fn text(&mut self, text: &str) {
        if let Some(field) = self.target() {
            field.push_str(text);
        }
    }

    fn finish(self) -> Result<SystemSnapshot> {
        if let Some(open) = self.path.last() {
            return Err(ParseError::Truncated(open.clone()));
        }
        if !self.seen_root {
            return Err(ParseError::MissingRoot);
        }
        if self.driver_version.trim().is_empty() && self.attached_gpus.trim().is_empty() {
            return Err(ParseError::EmptyDocument);
        }

        let devices = self
            .devices
            .into_iter()
            .enumerate()
            .map(|(index, raw)| raw.into_reading(index))
            .collect();

        Ok(SystemSnapshot {
            attached_gpus: sanitize(&self.attached_gpus),
            driver_version: self.driver_version,
            devices,
        })
    }
}

fn local_name(element: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(element.local_name().as_ref()).into_owned()
}

/// Parses one `nvidia-smi -q -x` document into a [`SystemSnapshot`].
pub fn parse_snapshot(bytes: &[u8]) -> Result<SystemSnapshot> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);

    let mut builder = SnapshotBuilder::default();

    loop {
        match reader.read_event()? {
            Event::Start(element) => builder.open(local_name(&element))?,
            Event::Empty(element) => {
                builder.open(local_name(&element))?;
                builder.close();
            }
            Event::End(_) => builder.close(),
            Event::Text(text) => {
                let value = text
                    .unescape()
                    .map(Cow::into_owned)
                    .unwrap_or_else(|_| String::from_utf8_lossy(&text).into_owned());
                builder.text(&value);
            }
            Event::CData(data) => builder.text(&String::from_utf8_lossy(&data)),
            Event::Eof => break,
            _ => {}
        }
    }

    let snapshot = builder.finish()?;
    debug!(
        driver_version = %snapshot.driver_version,
        devices = snapshot.devices.len(),
        "Parsed nvidia-smi snapshot"
    );
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SENTINEL;

    const TWO_GPUS: &[u8] = include_bytes!("../../../test.xml");
    const R545: &[u8] = include_bytes!("../../../fixtures/single_gpu_r545.xml");

    fn gpu_block(uuid: &str, body: &str) -> String {
        format!("<gpu id=\"x\"><uuid>{uuid}</uuid>{body}</gpu>")
    }

    fn document(gpus: &[String]) -> String {
        format!(
            "<?xml version=\"1.0\" ?><nvidia_smi_log><driver_version>550.54.14</driver_version>\
             <attached_gpus>{}</attached_gpus>{}</nvidia_smi_log>",
            gpus.len(),
            gpus.concat()
        )
    }

    #[test]
    fn test_parses_two_gpu_fixture() {
        let snapshot = parse_snapshot(TWO_GPUS).unwrap();

        assert_eq!(snapshot.driver_version, "535.104.05");
        assert_eq!(snapshot.attached_gpus, 2.0);
        assert_eq!(snapshot.device_count(), 2);

        let first = &snapshot.devices[0];
        assert_eq!(first.index, 0);
        assert_eq!(first.uuid, "GPU-6a1e2b3c-4d5e-6f70-8192-a3b4c5d6e7f8");
        assert_eq!(first.product_name, "NVIDIA GeForce RTX 3090");
        assert_eq!(first.pci_bus, "01");
        assert_eq!(first.fan_speed, 45.0);
        assert_eq!(
            first.memory,
            MemoryReading { total: 24576.0, used: 11019.0, free: 13246.0 }
        );
        assert_eq!(first.utilization, UtilizationReading { gpu: 87.0, memory: 41.0 });
        assert_eq!(
            first.temperature,
            TemperatureReading { current: 71.0, max_threshold: 98.0, slow_threshold: 95.0 }
        );
        assert_eq!(first.power, PowerReading { draw: 301.52, limit: 350.0 });
        assert_eq!(
            first.clocks,
            ClockReading { graphics: 1695.0, sm: 1695.0, memory: 9501.0, video: 1530.0 }
        );
        assert_eq!(
            first.max_clocks,
            ClockReading { graphics: 2100.0, sm: 2100.0, memory: 9751.0, video: 1950.0 }
        );

        let second = &snapshot.devices[1];
        assert_eq!(second.index, 1);
        assert_eq!(second.product_name, "Tesla T4");
        assert_eq!(second.fan_speed, SENTINEL);
        assert_eq!(second.memory.used, 3.0);
    }

    #[test]
    fn test_nested_names_do_not_leak_into_fields() {
        // processes/process_info/used_memory must not overwrite fb_memory_usage/used
        let snapshot = parse_snapshot(TWO_GPUS).unwrap();
        assert_eq!(snapshot.devices[0].memory.used, 11019.0);
    }

    #[test]
    fn test_newer_power_section_and_missing_temperature() {
        let snapshot = parse_snapshot(R545).unwrap();
        assert_eq!(snapshot.driver_version, "545.23.08");
        assert_eq!(snapshot.device_count(), 1);

        let gpu = &snapshot.devices[0];
        assert_eq!(gpu.power, PowerReading { draw: 389.11, limit: 400.0 });
        assert_eq!(gpu.temperature.current, SENTINEL);
        assert_eq!(gpu.temperature.max_threshold, SENTINEL);
        assert_eq!(gpu.temperature.slow_threshold, SENTINEL);
        assert_eq!(gpu.utilization.gpu, 100.0);
        assert_eq!(gpu.max_clocks.video, 1290.0);
    }

    #[test]
    fn test_device_count_and_order_follow_document() {
        let gpus: Vec<String> = (0..5)
            .map(|i| gpu_block(&format!("GPU-{i}"), &format!("<fan_speed>{} %</fan_speed>", i * 10)))
            .collect();
        let snapshot = parse_snapshot(document(&gpus).as_bytes()).unwrap();

        assert_eq!(snapshot.device_count(), 5);
        for (i, device) in snapshot.devices.iter().enumerate() {
            assert_eq!(device.index, i);
            assert_eq!(device.uuid, format!("GPU-{i}"));
            assert_eq!(device.fan_speed, (i * 10) as f64);
        }
    }

    #[test]
    fn test_missing_field_only_affects_that_field() {
        let body = "<fb_memory_usage><total>8192 MiB</total><free>4096 MiB</free></fb_memory_usage>\
                    <utilization><gpu_util>12 %</gpu_util><memory_util>3 %</memory_util></utilization>";
        let snapshot = parse_snapshot(document(&[gpu_block("GPU-a", body)]).as_bytes()).unwrap();

        let gpu = &snapshot.devices[0];
        assert_eq!(gpu.memory.total, 8192.0);
        assert_eq!(gpu.memory.used, SENTINEL);
        assert_eq!(gpu.memory.free, 4096.0);
        assert_eq!(gpu.utilization.gpu, 12.0);
        assert_eq!(gpu.utilization.memory, 3.0);
    }

    #[test]
    fn test_misshapen_section_keeps_the_device() {
        let body = "<fb_memory_usage>2048 MiB</fb_memory_usage><fan_speed>30 %</fan_speed>\
                    <clocks><graphics_clock><value>900</value></graphics_clock><sm_clock>900 MHz</sm_clock></clocks>";
        let snapshot = parse_snapshot(document(&[gpu_block("GPU-b", body)]).as_bytes()).unwrap();

        let gpu = &snapshot.devices[0];
        assert_eq!(gpu.uuid, "GPU-b");
        assert_eq!(gpu.memory.total, SENTINEL);
        assert_eq!(gpu.fan_speed, 30.0);
        assert_eq!(gpu.clocks.graphics, SENTINEL);
        assert_eq!(gpu.clocks.sm, 900.0);
    }

    #[test]
    fn test_self_closing_fields_are_sentinel() {
        let body = "<fan_speed/><product_name/>";
        let snapshot = parse_snapshot(document(&[gpu_block("GPU-c", body)]).as_bytes()).unwrap();
        assert_eq!(snapshot.devices[0].fan_speed, SENTINEL);
        assert_eq!(snapshot.devices[0].product_name, "");
    }

    #[test]
    fn test_escaped_text_is_unescaped() {
        let body = "<product_name>Quadro RTX 8000 &amp; NVLink</product_name>";
        let snapshot = parse_snapshot(document(&[gpu_block("GPU-d", body)]).as_bytes()).unwrap();
        assert_eq!(snapshot.devices[0].product_name, "Quadro RTX 8000 & NVLink");
    }

    #[test]
    fn test_no_devices() {
        let snapshot = parse_snapshot(document(&[]).as_bytes()).unwrap();
        assert_eq!(snapshot.attached_gpus, 0.0);
        assert!(snapshot.devices.is_empty());
    }

    #[test]
    fn test_empty_output_is_rejected() {
        assert!(matches!(parse_snapshot(b""), Err(ParseError::MissingRoot)));
        assert!(matches!(
            parse_snapshot(b"NVIDIA-SMI has failed because it couldn't communicate with the driver"),
            Err(ParseError::MissingRoot)
        ));
    }

    #[test]
    fn test_empty_root_is_rejected() {
        assert!(matches!(parse_snapshot(b"<nvidia_smi_log/>"), Err(ParseError::EmptyDocument)));
        assert!(matches!(
            parse_snapshot(b"<?xml version=\"1.0\" ?><nvidia_smi_log>\n</nvidia_smi_log>"),
            Err(ParseError::EmptyDocument)
        ));
        assert!(matches!(
            parse_snapshot(b"<nvidia_smi_log><driver_version/><attached_gpus>  </attached_gpus></nvidia_smi_log>"),
            Err(ParseError::EmptyDocument)
        ));
    }

    #[test]
    fn test_wrong_root_is_rejected() {
        let result = parse_snapshot(b"<html><body>oops</body></html>");
        assert!(matches!(result, Err(ParseError::UnexpectedRoot(name)) if name == "html"));
    }

    #[test]
    fn test_malformed_document_is_rejected() {
        let mismatched = b"<nvidia_smi_log><driver_version>1</attached_gpus></nvidia_smi_log>";
        assert!(parse_snapshot(mismatched).is_err());

        let truncated = b"<nvidia_smi_log><driver_version>535</driver_version><gpu><uuid>GPU-1</uuid>";
        assert!(parse_snapshot(truncated).is_err());
    }
}
