//! Port listing.

use {
    crate::use_fancy_output,
    anyhow::Result,
    console::style,
    m5link::{DetectedPort, discover_ports, format_port_list, host::select_port},
};

/// List ports command implementation.
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let detected = discover_ports();

    if json {
        println!("{}", ports_json(&detected)?);
        return Ok(());
    }

    eprintln!("{}", style("Available serial ports").bold().underlined());

    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return Ok(());
    }

    if use_fancy_output() {
        for port in &detected {
            let device_type = if port.device.is_known() {
                format!(" [{}]", style(port.device.name()).yellow())
            } else {
                String::new()
            };
            let vid_pid = if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
                format!(" ({vid:04X}:{pid:04X})")
            } else {
                String::new()
            };
            let product = port
                .product
                .as_deref()
                .map(|p| format!(" - {}", style(p).dim()))
                .unwrap_or_default();

            println!(
                "  {} {}{device_type}{vid_pid}{product}",
                style("•").green(),
                style(&port.name).cyan(),
            );
        }
    } else {
        for line in format_port_list(&detected) {
            println!("{line}");
        }
    }

    if let Ok(auto_port) = select_port(detected) {
        eprintln!(
            "\n{} Auto-detect would use {}",
            style("→").green().bold(),
            style(&auto_port.name).cyan().bold()
        );
    }

    Ok(())
}

fn ports_json(ports: &[DetectedPort]) -> Result<String> {
    let ports: Vec<serde_json::Value> = ports
        .iter()
        .map(|p| {
            serde_json::json!({
                "name": p.name,
                "device": p.device.name(),
                "known": p.device.is_known(),
                "vid": p.vid,
                "pid": p.pid,
                "manufacturer": p.manufacturer,
                "product": p.product,
                "serial": p.serial,
            })
        })
        .collect();
    Ok(serde_json::to_string_pretty(&ports)?)
}

#[cfg(test)]
mod tests {
    use {super::*, m5link::DeviceKind};

    #[test]
    fn test_ports_json_shape() {
        let mut port = DetectedPort::plain("/dev/ttyACM0");
        port.device = DeviceKind::Espressif;
        port.vid = Some(0x303A);
        port.pid = Some(0x1001);

        let text = ports_json(&[port, DetectedPort::plain("/dev/ttyS0")]).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        let ports = value.as_array().unwrap();

        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0]["name"], "/dev/ttyACM0");
        assert_eq!(ports[0]["device"], "ESP32 USB Serial/JTAG");
        assert_eq!(ports[0]["known"], true);
        assert_eq!(ports[0]["vid"], 0x303A);
        assert_eq!(ports[1]["known"], false);
        assert!(ports[1]["vid"].is_null());
    }

    #[test]
    fn test_ports_json_empty() {
        assert_eq!(ports_json(&[]).unwrap(), "[]");
    }
}
