//! Pins command implementation.

use super::open_datastore;
use mooring_codec::Pointer;
use serde::Serialize;
use std::path::Path;

/// One pin and what it lists.
#[derive(Debug, Serialize)]
pub struct PinInfo {
    /// Pin name.
    pub name: String,
    /// Objects pinned directly, as `Class/key`.
    pub objects: Vec<String>,
}

fn describe(pointer: &Pointer) -> String {
    format!("{}/{}", pointer.class_name, pointer.key.as_str())
}

/// Runs the pins command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let datastore = open_datastore(path)?;
    let mut pins = Vec::new();
    for name in datastore.pin_names() {
        let objects = datastore.pinned_keys(&name)?.iter().map(describe).collect();
        pins.push(PinInfo { name, objects });
    }

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&pins)?),
        _ => {
            if pins.is_empty() {
                println!("No pins.");
            }
            for pin in &pins {
                println!("{} ({} objects)", pin.name, pin.objects.len());
                for object in &pin.objects {
                    println!("  {object}");
                }
            }
        }
    }
    Ok(())
}
