//! Firmware image info and port listing.

use {
    crate::{Cli, config::Config, read_context},
    anyhow::{Context, Result},
    console::style,
    rust_i18n::t,
    servolink::{DetectedPort, FirmwareImage, ScanFilter, device, sim::SimOpener},
    std::path::Path,
};

fn port_json(p: &DetectedPort) -> serde_json::Value {
    serde_json::json!({
        "name": p.name,
        "transport": p.transport.name(),
        "device": p.device.name(),
        "likely": p.is_likely_controller(),
        "vid": p.vid,
        "pid": p.pid,
        "manufacturer": p.manufacturer,
        "product": p.product,
        "serial": p.serial,
    })
}

/// List ports command implementation.
pub(crate) fn cmd_list_ports(cli: &Cli, json: bool) -> Result<()> {
    let mut detected = device::detect_ports();
    if cli.simulate {
        detected.insert(0, SimOpener::default().detected_port());
    }

    if json {
        let ports: Vec<serde_json::Value> = detected.iter().map(port_json).collect();
        let output = serde_json::json!({
            "ok": true,
            "data": { "ports": ports }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    eprintln!("{}", style(t!("list_ports.header")).bold().underlined());

    if detected.is_empty() {
        eprintln!("  {}", style(t!("list_ports.no_ports")).dim());
        return Ok(());
    }

    for port in &detected {
        let kind = if port.device.is_known() {
            format!(" [{}]", style(port.device.name()).yellow())
        } else {
            String::new()
        };
        let vid_pid = match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => format!(" ({vid:04X}:{pid:04X})"),
            _ => String::new(),
        };
        let product = port
            .product
            .as_deref()
            .map(|p| format!(" - {}", style(p).dim()))
            .unwrap_or_default();
        eprintln!(
            "  {} {}{kind}{vid_pid}{product}",
            style("•").green(),
            style(&port.name).cyan(),
        );
    }

    let likely: Vec<&DetectedPort> = detected
        .iter()
        .filter(|p| ScanFilter::Likely.accepts(p))
        .collect();
    if let [only] = likely.as_slice() {
        eprintln!(
            "\n{} {}",
            style("→").green().bold(),
            t!(
                "list_ports.auto_detected",
                port = style(&only.name).cyan().bold().to_string()
            )
        );
    }

    Ok(())
}

/// Forget port command implementation.
pub(crate) fn cmd_forget_port(cli: &Cli, config: &mut Config) -> Result<()> {
    let changed = config.forget_port()?;
    if cli.quiet {
        return Ok(());
    }
    if changed.is_empty() {
        eprintln!("{}", style(t!("list_ports.nothing_to_forget")).dim());
    }
    for path in &changed {
        eprintln!(
            "{} {}",
            style("✓").green(),
            t!("list_ports.forgotten", path = path.display())
        );
    }
    Ok(())
}

fn load_image(firmware: &Path, block_size: u16) -> Result<FirmwareImage> {
    FirmwareImage::from_file(firmware, block_size).with_context(|| read_context(firmware))
}

/// Info command implementation.
pub(crate) fn cmd_info(firmware: &Path, json: bool) -> Result<()> {
    let block_size = servolink::SessionConfig::default().block_size;
    let image = load_image(firmware, block_size)?;

    if json {
        let app = image.app_descriptor().map(|app| {
            serde_json::json!({
                "project": app.project_name,
                "version": app.version,
                "idf_version": app.idf_version,
            })
        });
        let info = serde_json::json!({
            "ok": true,
            "data": {
                "path": firmware.display().to_string(),
                "size": image.len(),
                "crc32": format!("0x{:08X}", image.crc32()),
                "block_size": image.block_size(),
                "blocks": image.block_count(),
                "app": app,
            }
        });
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    eprintln!("{}", style(t!("info.header")).bold().underlined());
    eprintln!("  {}", t!("info.path", path = firmware.display()));
    eprintln!("  {}", t!("info.size", size = image.len()));
    eprintln!(
        "  {}",
        t!("info.crc", crc = format!("{:08X}", image.crc32()))
    );
    eprintln!(
        "  {}",
        t!(
            "info.blocks",
            count = image.block_count(),
            size = image.block_size()
        )
    );

    match image.app_descriptor() {
        Some(app) => {
            eprintln!("\n{}", style(t!("info.app_header")).bold().underlined());
            eprintln!(
                "  {}",
                t!("info.project", name = style(&app.project_name).cyan().bold())
            );
            eprintln!("  {}", t!("info.version", version = app.version.as_str()));
            eprintln!("  {}", t!("info.idf", version = app.idf_version.as_str()));
        },
        None => eprintln!("  {}", style(t!("info.no_app")).dim()),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use servolink::TransportKind;

    #[test]
    fn test_port_json_fields() {
        let port = DetectedPort::bare("/dev/rfcomm0", TransportKind::Bluetooth);
        let value = port_json(&port);
        assert_eq!(value["name"], "/dev/rfcomm0");
        assert_eq!(value["transport"], TransportKind::Bluetooth.name());
        assert_eq!(value["likely"], port.is_likely_controller());
        assert!(value["vid"].is_null());
    }

    #[test]
    fn test_info_reads_plain_binary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fw.bin");
        std::fs::write(&path, vec![0x5A; 1000]).unwrap();

        assert!(cmd_info(&path, true).is_ok());
        assert!(cmd_info(&dir.path().join("missing.bin"), false).is_err());
    }
}
