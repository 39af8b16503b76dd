// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! V4L2 capture device enumeration, grouped by hardware.

use crate::error::CliError;
use clap::Args as ClapArgs;
use serde::Serialize;
use std::collections::BTreeMap;
use vincap::v4l2::{DeviceEnumerator, DeviceInfo};

#[derive(ClapArgs, Debug)]
pub struct Args {
    /// Include video nodes without a capture capability
    #[arg(long)]
    all: bool,

    /// Show bus, driver version and every frame size
    #[arg(short, long)]
    long: bool,
}

#[derive(Debug, Serialize)]
struct DevicesOutput {
    devices: Vec<DeviceGroup>,
    summary: Summary,
}

#[derive(Debug, Serialize)]
struct DeviceGroup {
    name: String,
    driver: String,
    bus: String,
    nodes: Vec<NodeOutput>,
}

#[derive(Debug, Serialize)]
struct NodeOutput {
    path: String,
    capture: bool,
    multiplanar: bool,
    streaming: bool,
    version: String,
    formats: Vec<FormatOutput>,
}

#[derive(Debug, Serialize)]
struct FormatOutput {
    fourcc: String,
    description: String,
    compressed: bool,
    emulated: bool,
    resolutions: Vec<String>,
}

#[derive(Debug, Serialize)]
struct Summary {
    total_nodes: usize,
    capture_nodes: usize,
    hardware_units: usize,
}

pub fn execute(args: Args, json: bool) -> Result<(), CliError> {
    log::debug!("Executing devices command: {:?}", args);

    let devices = if args.all {
        DeviceEnumerator::enumerate_all()
    } else {
        DeviceEnumerator::enumerate()
    }
    .map_err(|e| CliError::General(format!("Failed to enumerate V4L2 devices: {}", e)))?;

    let groups = group_by_bus(&devices);
    let output = DevicesOutput {
        summary: Summary {
            total_nodes: devices.len(),
            capture_nodes: devices.iter().filter(|d| d.is_capture()).count(),
            hardware_units: groups.len(),
        },
        devices: groups,
    };

    if json {
        let json_str = serde_json::to_string_pretty(&output)
            .map_err(|e| CliError::General(format!("JSON serialization failed: {}", e)))?;
        println!("{}", json_str);
    } else {
        print_text_output(&output, args.long);
    }

    Ok(())
}

/// Group nodes by bus_info so one camera exposing several nodes is listed once
fn group_by_bus(devices: &[DeviceInfo]) -> Vec<DeviceGroup> {
    let mut groups: BTreeMap<String, Vec<&DeviceInfo>> = BTreeMap::new();
    for device in devices {
        groups
            .entry(device.bus_info().to_string())
            .or_default()
            .push(device);
    }

    let mut result: Vec<DeviceGroup> = groups
        .into_iter()
        .filter_map(|(bus, nodes)| {
            let first = *nodes.first()?;
            Some(DeviceGroup {
                name: first.card().to_string(),
                driver: first.driver().to_string(),
                bus,
                nodes: nodes.into_iter().map(node_output).collect(),
            })
        })
        .collect();

    result.sort_by(|a, b| a.name.cmp(&b.name));
    result
}

fn node_output(device: &DeviceInfo) -> NodeOutput {
    NodeOutput {
        path: device.path_str().to_string(),
        capture: device.is_capture(),
        multiplanar: device.is_multiplanar(),
        streaming: device.supports_streaming(),
        version: device.version(),
        formats: device
            .formats()
            .iter()
            .map(|format| FormatOutput {
                fourcc: format.fourcc.to_string(),
                description: format.description.clone(),
                compressed: format.flags.contains(vincap::format::FormatFlags::COMPRESSED),
                emulated: format.flags.contains(vincap::format::FormatFlags::EMULATED),
                resolutions: format.resolutions.iter().map(|r| r.to_string()).collect(),
            })
            .collect(),
    }
}

fn print_text_output(output: &DevicesOutput, long: bool) {
    println!(
        "V4L2 Capture Devices ({} nodes, {} hardware units)\n",
        output.summary.total_nodes, output.summary.hardware_units
    );

    if output.devices.is_empty() {
        println!("  No capture devices found");
        return;
    }

    for group in &output.devices {
        let paths: Vec<&str> = group.nodes.iter().map(|n| n.path.as_str()).collect();
        if paths.len() == 1 {
            println!("  {}: {}", paths[0], group.name);
        } else {
            println!(
                "  {}: {} ({} nodes)",
                summarize_paths(&paths),
                group.name,
                paths.len()
            );
        }
        println!("    Driver: {}", group.driver);
        if long {
            println!("    Bus: {}", group.bus);
        }

        for node in &group.nodes {
            if group.nodes.len() > 1 || long {
                let kind = match (node.capture, node.multiplanar) {
                    (false, _) => "no capture",
                    (true, true) => "capture, multi-plane",
                    (true, false) => "capture",
                };
                println!("    {} ({}, version {})", node.path, kind, node.version);
            }
            if node.formats.is_empty() {
                continue;
            }
            if long {
                for format in &node.formats {
                    println!(
                        "      {} {}: {}",
                        format.fourcc,
                        format.description,
                        format.resolutions.join(" ")
                    );
                }
            } else {
                let names: Vec<&str> = node.formats.iter().map(|f| f.fourcc.as_str()).collect();
                println!("    Formats: {}", names.join(", "));
            }
        }
    }
}

/// Summarize device paths like "/dev/video0-4" or "/dev/video{11,12,14}"
fn summarize_paths(paths: &[&str]) -> String {
    let mut nums: Vec<u32> = paths
        .iter()
        .filter_map(|p| {
            p.strip_prefix("/dev/video")
                .and_then(|s| s.parse::<u32>().ok())
        })
        .collect();
    nums.sort_unstable();

    let (Some(first), Some(last)) = (nums.first(), nums.last()) else {
        return paths.join(", ");
    };
    if nums.len() != paths.len() {
        return paths.join(", ");
    }
    if nums.len() == 1 {
        return paths[0].to_string();
    }

    let is_consecutive = nums.windows(2).all(|w| w[1] == w[0] + 1);
    if is_consecutive && nums.len() > 2 {
        format!("/dev/video{}-{}", first, last)
    } else {
        format!(
            "/dev/video{{{}}}",
            nums.iter()
                .map(|n| n.to_string())
                .collect::<Vec<_>>()
                .join(",")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summarize_paths() {
        assert_eq!(summarize_paths(&["/dev/video3"]), "/dev/video3");
        assert_eq!(
            summarize_paths(&["/dev/video2", "/dev/video0", "/dev/video1"]),
            "/dev/video0-2"
        );
        assert_eq!(
            summarize_paths(&["/dev/video11", "/dev/video14"]),
            "/dev/video{11,14}"
        );
        assert_eq!(
            summarize_paths(&["/dev/cam", "/dev/video1"]),
            "/dev/cam, /dev/video1"
        );
    }
}
